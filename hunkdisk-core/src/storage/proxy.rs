//! StorageProxy and StorageProvider traits - the I/O seam under containers.

use std::path::Path;

use crate::error::DiskResult;

/// Byte-addressable storage a container is opened against.
///
/// A proxy is exclusively owned by one container while it is open. Dropping
/// the proxy releases the underlying handle.
pub trait StorageProxy: Send {
    /// Fill `buf` from `offset`. A short read is an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> DiskResult<()>;

    /// Write all of `data` at `offset`, extending the storage if needed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> DiskResult<()>;

    /// Current size of the storage in bytes.
    fn size(&mut self) -> DiskResult<u64>;

    /// Truncate or extend the storage to exactly `len` bytes.
    fn set_size(&mut self, len: u64) -> DiskResult<()>;

    /// Whether this proxy was granted write access.
    fn is_writable(&self) -> bool;

    /// Push buffered writes down to the backing store.
    fn flush(&mut self) -> DiskResult<()> {
        Ok(())
    }
}

/// Maps locators to storage proxies (`proxy_for(locator)`).
pub trait StorageProvider {
    /// Open existing storage with the widest access it permits: read-write
    /// when allowed, read-only otherwise.
    fn open(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>>;

    /// Open existing storage without write access, even where it is allowed.
    fn open_read_only(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>>;

    /// Stable name for the storage at `locator`, used to tie a diff to its
    /// origin. Two locators naming the same storage should agree.
    fn identity(&self, locator: &Path) -> String {
        locator.display().to_string()
    }

    /// Create (or truncate) writable storage, creating parent locations.
    fn create(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>>;

    /// Check whether storage exists at `locator`.
    fn exists(&self, locator: &Path) -> bool;

    /// Remove the storage at `locator`.
    fn remove(&self, locator: &Path) -> DiskResult<()>;
}

impl<P: StorageProvider + ?Sized> StorageProvider for &P {
    fn open(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>> {
        (**self).open(locator)
    }

    fn open_read_only(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>> {
        (**self).open_read_only(locator)
    }

    fn identity(&self, locator: &Path) -> String {
        (**self).identity(locator)
    }

    fn create(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>> {
        (**self).create(locator)
    }

    fn exists(&self, locator: &Path) -> bool {
        (**self).exists(locator)
    }

    fn remove(&self, locator: &Path) -> DiskResult<()> {
        (**self).remove(locator)
    }
}
