//! Hunk disk images with copy-on-write diff overlays.
//!
//! This crate provides the storage side of an emulated fixed-disk drive:
//! - Hunk-addressed containers with a metadata table
//! - Diff containers that inherit unwritten hunks from a read-only parent
//! - Overlay resolution (read-write image, or read-only image plus diff)
//! - Geometry-driven image creation and sector-level drive access
//!
//! # Architecture
//!
//! - `StorageProvider` / `StorageProxy` traits: byte storage (files or memory)
//! - `Container`: on-disk image format
//! - `OverlayResolver`: attach state machine producing a `ResolvedHandle`
//! - `HardDiskDrive`: sector I/O, attach/detach and format

pub mod config;
pub mod container;
pub mod drive;
pub mod error;
pub mod geometry;
pub mod package;
pub mod resolver;
pub mod storage;

pub use config::DiskConfig;
pub use container::{Codec, Container, HunkDescriptor, MetadataEntry, MetadataTag};
pub use drive::HardDiskDrive;
pub use error::{DiskError, DiskResult};
pub use geometry::{DiskInfo, Geometry, GeometryFormatter};
pub use package::{load_package, DiskEntry, LoadedPackage, PackageManifest};
pub use resolver::{AttachState, Locator, OverlayResolver, ResolvedHandle};
pub use storage::{FileProxy, FileStorage, MemoryProxy, MemoryStorage, StorageProvider, StorageProxy};
