//! Overlay configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DiskResult;

/// Where diff images are kept and how they are named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskConfig {
    /// Writable scratch directory for diffs.
    pub diff_directory: PathBuf,
    /// Extension given to diff images.
    pub diff_extension: String,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            diff_directory: PathBuf::from("diff"),
            diff_extension: "dif".to_string(),
        }
    }
}

impl DiskConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_path(path: &Path) -> DiskResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Diff locator for an origin: `<diff_directory>/<stem>.<diff_extension>`.
    pub fn diff_locator(&self, origin: &Path) -> PathBuf {
        let stem = origin
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| "disk".into());
        let mut name = stem;
        name.push(".");
        name.push(&self.diff_extension);
        self.diff_directory.join(name)
    }
}
