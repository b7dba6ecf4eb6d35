//! In-memory storage implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use super::proxy::{StorageProvider, StorageProxy};
use crate::error::{DiskError, DiskResult};

type SharedBytes = Arc<RwLock<Vec<u8>>>;

/// Storage proxy over a shared in-memory buffer.
pub struct MemoryProxy {
    data: SharedBytes,
    writable: bool,
    open_handles: Arc<AtomicUsize>,
}

impl MemoryProxy {
    /// Standalone proxy over owned bytes.
    pub fn from_bytes(data: Vec<u8>, writable: bool) -> Self {
        Self::attach(
            Arc::new(RwLock::new(data)),
            writable,
            Arc::new(AtomicUsize::new(0)),
        )
    }

    fn attach(data: SharedBytes, writable: bool, open_handles: Arc<AtomicUsize>) -> Self {
        open_handles.fetch_add(1, Ordering::SeqCst);
        Self {
            data,
            writable,
            open_handles,
        }
    }
}

impl Drop for MemoryProxy {
    fn drop(&mut self) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StorageProxy for MemoryProxy {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> DiskResult<()> {
        let data = self.data.read().map_err(|_| DiskError::LockPoisoned)?;
        let start = usize::try_from(offset).map_err(|_| short_read(offset, buf.len()))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= data.len())
            .ok_or_else(|| short_read(offset, buf.len()))?;
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> DiskResult<()> {
        if !self.writable {
            return Err(DiskError::NotWritable);
        }
        let mut data = self.data.write().map_err(|_| DiskError::LockPoisoned)?;
        let start = usize::try_from(offset).map_err(|_| DiskError::NotWritable)?;
        let end = start + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn size(&mut self) -> DiskResult<u64> {
        let data = self.data.read().map_err(|_| DiskError::LockPoisoned)?;
        Ok(data.len() as u64)
    }

    fn set_size(&mut self, len: u64) -> DiskResult<()> {
        if !self.writable {
            return Err(DiskError::NotWritable);
        }
        let len = usize::try_from(len).map_err(|_| DiskError::Create("size too large".into()))?;
        let mut data = self.data.write().map_err(|_| DiskError::LockPoisoned)?;
        data.resize(len, 0);
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

fn short_read(offset: u64, len: usize) -> DiskError {
    DiskError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("read of {} bytes at {} past end of storage", len, offset),
    ))
}

#[derive(Clone)]
struct MemoryEntry {
    data: SharedBytes,
    read_only: bool,
}

#[derive(Default)]
struct MemoryStorageInner {
    entries: HashMap<PathBuf, MemoryEntry>,
    /// Locations under which `create` is refused.
    denied: Vec<PathBuf>,
}

/// In-memory storage provider.
///
/// Entries can be marked read-only and locations can refuse creation, which
/// makes permission-driven paths testable without touching the filesystem.
/// Clone is cheap (just clones the Arc).
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<MemoryStorageInner>>,
    open_handles: Arc<AtomicUsize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with initial entries.
    pub fn with_entries<I, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, Vec<u8>)>,
        P: Into<PathBuf>,
    {
        let storage = Self::new();
        for (locator, data) in entries {
            storage.insert(locator, data);
        }
        storage
    }

    /// Add or replace an entry (convenience method).
    pub fn insert(&self, locator: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.entries.insert(
                locator.into(),
                MemoryEntry {
                    data: Arc::new(RwLock::new(data.into())),
                    read_only: false,
                },
            );
        }
    }

    /// Snapshot of an entry's bytes.
    pub fn contents(&self, locator: &Path) -> Option<Vec<u8>> {
        let inner = self.inner.read().ok()?;
        let entry = inner.entries.get(locator)?;
        let data = entry.data.read().ok()?;
        Some(data.clone())
    }

    /// Mark an entry read-only (or writable again).
    pub fn set_read_only(&self, locator: &Path, read_only: bool) {
        if let Ok(mut inner) = self.inner.write() {
            if let Some(entry) = inner.entries.get_mut(locator) {
                entry.read_only = read_only;
            }
        }
    }

    /// Refuse `create` for every locator under `prefix`.
    pub fn deny_create_under(&self, prefix: impl Into<PathBuf>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.denied.push(prefix.into());
        }
    }

    /// Number of proxies handed out and not yet dropped.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    fn open_entry(&self, locator: &Path, want_write: bool) -> DiskResult<Box<dyn StorageProxy>> {
        let inner = self.inner.read().map_err(|_| DiskError::LockPoisoned)?;
        let entry = inner.entries.get(locator).ok_or_else(|| {
            DiskError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", locator.display()),
            ))
        })?;
        Ok(Box::new(MemoryProxy::attach(
            entry.data.clone(),
            want_write && !entry.read_only,
            self.open_handles.clone(),
        )))
    }
}

impl StorageProvider for MemoryStorage {
    fn open(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>> {
        self.open_entry(locator, true)
    }

    fn open_read_only(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>> {
        self.open_entry(locator, false)
    }

    fn create(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>> {
        let mut inner = self.inner.write().map_err(|_| DiskError::LockPoisoned)?;
        if inner.denied.iter().any(|prefix| locator.starts_with(prefix)) {
            return Err(DiskError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("cannot create {}", locator.display()),
            )));
        }
        let data = Arc::new(RwLock::new(Vec::new()));
        inner.entries.insert(
            locator.to_path_buf(),
            MemoryEntry {
                data: data.clone(),
                read_only: false,
            },
        );
        Ok(Box::new(MemoryProxy::attach(
            data,
            true,
            self.open_handles.clone(),
        )))
    }

    fn exists(&self, locator: &Path) -> bool {
        match self.inner.read() {
            Ok(inner) => inner.entries.contains_key(locator),
            Err(_) => false,
        }
    }

    fn remove(&self, locator: &Path) -> DiskResult<()> {
        let mut inner = self.inner.write().map_err(|_| DiskError::LockPoisoned)?;
        inner.entries.remove(locator);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_entry() {
        let storage = MemoryStorage::new();
        let mut proxy = storage.create(Path::new("a.hkd")).unwrap();
        proxy.write_at(2, &[1, 2, 3]).unwrap();

        assert_eq!(proxy.size().unwrap(), 5);
        assert_eq!(
            storage.contents(Path::new("a.hkd")),
            Some(vec![0, 0, 1, 2, 3])
        );
    }

    #[test]
    fn test_read_only_entry() {
        let storage = MemoryStorage::with_entries([("ro.hkd", vec![7u8; 4])]);
        storage.set_read_only(Path::new("ro.hkd"), true);

        let mut proxy = storage.open(Path::new("ro.hkd")).unwrap();
        assert!(!proxy.is_writable());
        assert!(matches!(
            proxy.write_at(0, &[0]),
            Err(DiskError::NotWritable)
        ));
        assert_eq!(storage.contents(Path::new("ro.hkd")), Some(vec![7u8; 4]));
    }

    #[test]
    fn test_open_read_only_on_writable_entry() {
        let storage = MemoryStorage::with_entries([("pkg.zip", vec![1u8; 4])]);

        assert!(storage.open(Path::new("pkg.zip")).unwrap().is_writable());
        let mut proxy = storage.open_read_only(Path::new("pkg.zip")).unwrap();
        assert!(!proxy.is_writable());
        assert!(matches!(proxy.write_at(0, &[0]), Err(DiskError::NotWritable)));
        assert_eq!(storage.contents(Path::new("pkg.zip")), Some(vec![1u8; 4]));
    }

    #[test]
    fn test_open_handles_tracked() {
        let storage = MemoryStorage::with_entries([("x", vec![])]);
        let first = storage.open(Path::new("x")).unwrap();
        let second = storage.open(Path::new("x")).unwrap();
        assert_eq!(storage.open_handles(), 2);

        drop(first);
        drop(second);
        assert_eq!(storage.open_handles(), 0);
    }

    #[test]
    fn test_deny_create() {
        let storage = MemoryStorage::new();
        storage.deny_create_under("locked");

        assert!(storage.create(Path::new("locked/x.dif")).is_err());
        assert!(!storage.exists(Path::new("locked/x.dif")));
        assert!(storage.create(Path::new("open/x.dif")).is_ok());
    }

    #[test]
    fn test_short_read() {
        let mut proxy = MemoryProxy::from_bytes(vec![1, 2], false);
        let mut buf = [0u8; 3];
        assert!(proxy.read_at(0, &mut buf).is_err());
    }
}
