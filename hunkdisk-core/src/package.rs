//! Software packages carrying pre-built disk images.
//!
//! Packages are ZIP files containing disk images and an optional `manifest.mf`
//! JSON file that maps disk regions to image files. Images supplied this way
//! are treated as immutable media.

use std::collections::HashMap;
use std::io::{Read, Seek};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;
use zip::ZipArchive;

use crate::error::{DiskError, DiskResult};

/// Extensions recognized as disk images when a package has no manifest.
const IMAGE_EXTENSIONS: [&str; 2] = ["hkd", "chd"];

/// Disk entry in a package manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskEntry {
    /// Region name the drive asks for (e.g. "harddriv").
    pub region: String,
    /// Path of the image inside the archive.
    pub file: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Package manifest schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub disks: Vec<DiskEntry>,
}

/// Loaded package with its disk images, keyed by region.
#[derive(Debug, Clone)]
pub struct LoadedPackage {
    pub manifest: PackageManifest,
    pub images: HashMap<String, Vec<u8>>,
}

impl LoadedPackage {
    /// Image bytes for a region.
    pub fn disk(&self, region: &str) -> Option<&[u8]> {
        self.images.get(region).map(|v| v.as_slice())
    }

    /// Regions in manifest order.
    pub fn regions(&self) -> Vec<&str> {
        self.manifest.disks.iter().map(|d| d.region.as_str()).collect()
    }
}

/// Load a package from ZIP data.
pub fn load_package<R: Read + Seek>(reader: R) -> DiskResult<LoadedPackage> {
    let mut archive = ZipArchive::new(reader)?;
    let mut files: HashMap<String, Vec<u8>> = HashMap::new();
    let mut manifest: Option<PackageManifest> = None;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }

        let name = file.name().to_string();
        let upper_name = name.to_uppercase();
        let is_manifest = upper_name == "MANIFEST.MF" || upper_name.ends_with("/MANIFEST.MF");
        if !is_manifest && !is_image_name(&name) {
            continue;
        }

        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        if is_manifest {
            match serde_json::from_slice::<PackageManifest>(&content) {
                Ok(parsed) => manifest = Some(parsed),
                Err(e) => warn!("ignoring unreadable package manifest {}: {}", name, e),
            }
        } else {
            files.insert(name, content);
        }
    }

    // Without a manifest every image is its own region, named after its stem.
    let manifest = manifest.unwrap_or_else(|| {
        let mut names: Vec<&String> = files.keys().collect();
        names.sort();
        PackageManifest {
            id: None,
            name: "Unknown Package".to_string(),
            version: None,
            description: None,
            disks: names
                .into_iter()
                .map(|name| DiskEntry {
                    region: region_for(name),
                    file: name.clone(),
                    description: None,
                })
                .collect(),
        }
    });

    let mut images = HashMap::new();
    for disk in &manifest.disks {
        let data = files.get(&disk.file).ok_or_else(|| {
            DiskError::Package(format!(
                "{}: region {} names missing file {}",
                manifest.name, disk.region, disk.file
            ))
        })?;
        images.insert(disk.region.clone(), data.clone());
    }

    Ok(LoadedPackage { manifest, images })
}

fn is_image_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

fn region_for(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn create_test_zip(manifest: Option<&str>) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let mut zip = zip::ZipWriter::new(cursor);

            if let Some(manifest) = manifest {
                zip.start_file::<_, ()>("manifest.mf", Default::default())
                    .unwrap();
                zip.write_all(manifest.as_bytes()).unwrap();
            }

            zip.start_file::<_, ()>("disks/boot.hkd", Default::default())
                .unwrap();
            zip.write_all(b"boot image").unwrap();

            zip.start_file::<_, ()>("README.TXT", Default::default())
                .unwrap();
            zip.write_all(b"not a disk").unwrap();

            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_load_with_manifest() {
        let manifest = r#"{
            "id": "alto-games",
            "name": "Alto Games",
            "disks": [ { "region": "harddriv", "file": "disks/boot.hkd" } ]
        }"#;
        let pkg = load_package(Cursor::new(create_test_zip(Some(manifest)))).unwrap();

        assert_eq!(pkg.manifest.name, "Alto Games");
        assert_eq!(pkg.regions(), vec!["harddriv"]);
        assert_eq!(pkg.disk("harddriv"), Some(&b"boot image"[..]));
        assert_eq!(pkg.images.len(), 1);
    }

    #[test]
    fn test_load_without_manifest() {
        let pkg = load_package(Cursor::new(create_test_zip(None))).unwrap();
        assert_eq!(pkg.manifest.name, "Unknown Package");
        assert_eq!(pkg.disk("boot"), Some(&b"boot image"[..]));
        assert!(pkg.disk("readme").is_none());
    }

    #[test]
    fn test_manifest_names_missing_file() {
        let manifest = r#"{ "name": "Broken", "disks": [ { "region": "harddriv", "file": "gone.hkd" } ] }"#;
        assert!(matches!(
            load_package(Cursor::new(create_test_zip(Some(manifest)))),
            Err(DiskError::Package(_))
        ));
    }

    #[test]
    fn test_not_a_zip() {
        assert!(matches!(
            load_package(Cursor::new(b"plain bytes".to_vec())),
            Err(DiskError::Zip(_))
        ));
    }
}
