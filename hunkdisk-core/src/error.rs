//! Error types for disk image handling.

use std::path::PathBuf;

use thiserror::Error;

use crate::container::MetadataTag;

/// Errors that can occur while opening, creating or using disk images.
#[derive(Error, Debug)]
pub enum DiskError {
    #[error("Invalid image format: {0}")]
    Format(String),

    #[error("Image truncated: needs {needed} bytes, storage has {actual}")]
    Truncated { needed: u64, actual: u64 },

    #[error("Storage is not writable")]
    NotWritable,

    #[error("Cannot create image: {0}")]
    Create(String),

    #[error("Parent image mismatch: {0}")]
    ParentMismatch(String),

    #[error("Metadata not found: {tag} #{index}")]
    NotFound { tag: MetadataTag, index: u32 },

    #[error("Could not mount image {}: {source}", locator.display())]
    Attach {
        locator: PathBuf,
        #[source]
        source: Box<DiskError>,
    },

    #[error("Corrupt image: {0}")]
    Corrupt(String),

    #[error("Hunk buffer is {actual} bytes, expected {expected}")]
    HunkLength { expected: usize, actual: usize },

    #[error("Invalid geometry: {0}")]
    Geometry(String),

    #[error("No image attached")]
    NotAttached,

    #[error("Sector buffer is {actual} bytes, expected {expected}")]
    SectorLength { expected: usize, actual: usize },

    #[error("Sector {sector} out of range (disk has {total} sectors)")]
    SectorOutOfRange { sector: u32, total: u32 },

    #[error("Image is closed")]
    Closed,

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Package error: {0}")]
    Package(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DiskError {
    /// Wrap an error as a terminal attach failure for `locator`.
    pub fn attach(locator: impl Into<PathBuf>, source: DiskError) -> Self {
        DiskError::Attach {
            locator: locator.into(),
            source: Box::new(source),
        }
    }
}

/// Result type for disk image operations.
pub type DiskResult<T> = Result<T, DiskError>;
