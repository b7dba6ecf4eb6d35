//! Filesystem-backed storage.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::proxy::{StorageProvider, StorageProxy};
use crate::error::DiskResult;

/// Storage proxy over a regular file.
#[derive(Debug)]
pub struct FileProxy {
    file: File,
    writable: bool,
}

impl FileProxy {
    pub fn new(file: File, writable: bool) -> Self {
        Self { file, writable }
    }
}

impl StorageProxy for FileProxy {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> DiskResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> DiskResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn size(&mut self) -> DiskResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_size(&mut self, len: u64) -> DiskResult<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn flush(&mut self) -> DiskResult<()> {
        if self.writable {
            self.file.flush()?;
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Storage provider for paths on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStorage;

impl FileStorage {
    pub fn new() -> Self {
        Self
    }
}

impl StorageProvider for FileStorage {
    fn open(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>> {
        let meta = fs::metadata(locator)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", locator.display()),
            )
            .into());
        }

        // Mode bits are checked first so a read-only image stays read-only
        // even for a privileged user.
        if !meta.permissions().readonly() {
            match OpenOptions::new().read(true).write(true).open(locator) {
                Ok(file) => return Ok(Box::new(FileProxy::new(file, true))),
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.open_read_only(locator)
    }

    fn open_read_only(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>> {
        let file = File::open(locator)?;
        Ok(Box::new(FileProxy::new(file, false)))
    }

    fn identity(&self, locator: &Path) -> String {
        fs::canonicalize(locator)
            .unwrap_or_else(|_| locator.to_path_buf())
            .display()
            .to_string()
    }

    fn create(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>> {
        if let Some(parent) = locator.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(locator)?;
        Ok(Box::new(FileProxy::new(file, true)))
    }

    fn exists(&self, locator: &Path) -> bool {
        locator.is_file()
    }

    fn remove(&self, locator: &Path) -> DiskResult<()> {
        fs::remove_file(locator)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/disk.hkd");

        let mut proxy = FileStorage.create(&path).unwrap();
        assert!(proxy.is_writable());
        proxy.write_at(4, b"data").unwrap();
        assert_eq!(proxy.size().unwrap(), 8);

        let mut buf = [0u8; 4];
        proxy.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"data");
        assert!(FileStorage.exists(&path));
    }

    #[test]
    fn test_short_read_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.bin");
        fs::write(&path, b"abc").unwrap();

        let mut proxy = FileStorage.open(&path).unwrap();
        let mut buf = [0u8; 8];
        assert!(proxy.read_at(0, &mut buf).is_err());
    }

    #[test]
    fn test_readonly_file_opens_read_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.bin");
        fs::write(&path, b"content").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&path, perms).unwrap();

        let proxy = FileStorage.open(&path).unwrap();
        assert!(!proxy.is_writable());
    }

    #[test]
    fn test_open_read_only_on_writable_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        fs::write(&path, b"zip").unwrap();

        assert!(FileStorage.open(&path).unwrap().is_writable());
        let mut proxy = FileStorage.open_read_only(&path).unwrap();
        assert!(!proxy.is_writable());
        assert!(proxy.write_at(0, b"x").is_err());
        assert_eq!(fs::read(&path).unwrap(), b"zip");
    }

    #[test]
    fn test_identity_resolves_relative_segments() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let path = dir.path().join("disk.hkd");
        fs::write(&path, b"").unwrap();

        let roundabout = dir.path().join("sub/../disk.hkd");
        assert_eq!(FileStorage.identity(&roundabout), FileStorage.identity(&path));
        assert_ne!(
            FileStorage.identity(&path),
            FileStorage.identity(&dir.path().join("sub"))
        );
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempdir().unwrap();
        assert!(FileStorage.open(&dir.path().join("missing.hkd")).is_err());
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.bin");
        drop(FileStorage.create(&path).unwrap());
        FileStorage.remove(&path).unwrap();
        assert!(!FileStorage.exists(&path));
    }
}
