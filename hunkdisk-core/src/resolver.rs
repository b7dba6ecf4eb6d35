//! Overlay resolution: turning an attach request into a writable image.
//!
//! ```text
//! Idle -> Resolving -> Attached(Origin | Overlay) -> Idle
//! ```
//!
//! An image the caller may write is used directly. An image that only opens
//! read-only is reopened as the origin of a diff kept in the configured diff
//! directory; the diff is reused across attaches. Images supplied by a
//! software package are read-only media and never get a diff.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::DiskConfig;
use crate::container::{Container, MetadataTag};
use crate::error::{DiskError, DiskResult};
use crate::package::load_package;
use crate::storage::{MemoryProxy, ProxyReader, StorageProvider};

/// What the drive asked to attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// A user image file.
    Image(PathBuf),
    /// A disk region inside a software package.
    Package { package: PathBuf, region: String },
}

impl Locator {
    pub fn image(path: impl Into<PathBuf>) -> Self {
        Locator::Image(path.into())
    }

    pub fn package(package: impl Into<PathBuf>, region: impl Into<String>) -> Self {
        Locator::Package {
            package: package.into(),
            region: region.into(),
        }
    }

    /// Path of the storage this locator opens.
    pub fn path(&self) -> &Path {
        match self {
            Locator::Image(path) => path,
            Locator::Package { package, .. } => package,
        }
    }
}

/// The image a drive reads and writes through.
pub enum ResolvedHandle {
    /// The origin itself.
    Origin(Container),
    /// A diff chained to a read-only origin.
    ///
    /// Fields drop in declaration order, so the diff is always released
    /// before the origin it reads through.
    Overlay { diff: Container, origin: Container },
}

impl ResolvedHandle {
    pub fn is_overlay(&self) -> bool {
        matches!(self, ResolvedHandle::Overlay { .. })
    }

    /// The container writes land in.
    pub fn target(&self) -> &Container {
        match self {
            ResolvedHandle::Origin(origin) => origin,
            ResolvedHandle::Overlay { diff, .. } => diff,
        }
    }

    pub fn origin(&self) -> &Container {
        match self {
            ResolvedHandle::Origin(origin) => origin,
            ResolvedHandle::Overlay { origin, .. } => origin,
        }
    }

    pub fn diff(&self) -> Option<&Container> {
        match self {
            ResolvedHandle::Origin(_) => None,
            ResolvedHandle::Overlay { diff, .. } => Some(diff),
        }
    }

    pub fn hunk_size(&self) -> u32 {
        self.target().hunk_size()
    }

    pub fn logical_length(&self) -> u64 {
        self.target().logical_length()
    }

    pub fn read_hunk(&mut self, index: u32) -> DiskResult<Vec<u8>> {
        match self {
            ResolvedHandle::Origin(origin) => origin.read_hunk(index),
            ResolvedHandle::Overlay { diff, origin } => diff.read_hunk_from(index, Some(origin)),
        }
    }

    pub fn write_hunk(&mut self, index: u32, data: &[u8]) -> DiskResult<()> {
        match self {
            ResolvedHandle::Origin(origin) => origin.write_hunk(index, data),
            ResolvedHandle::Overlay { diff, .. } => diff.write_hunk(index, data),
        }
    }

    pub fn read_metadata(&self, tag: MetadataTag, index: u32) -> DiskResult<Vec<u8>> {
        self.target().read_metadata(tag, index)
    }

    /// Close the diff, then the origin. Both are closed even if the first
    /// fails; the first error is returned.
    pub fn close(&mut self) -> DiskResult<()> {
        match self {
            ResolvedHandle::Origin(origin) => origin.close(),
            ResolvedHandle::Overlay { diff, origin } => {
                let diff_result = diff.close();
                let origin_result = origin.close();
                diff_result.and(origin_result)
            }
        }
    }
}

/// Attach state of a single logical disk.
pub enum AttachState {
    Idle,
    Resolving,
    Attached(ResolvedHandle),
}

/// Resolves locators to handles through a storage provider.
pub struct OverlayResolver<P: StorageProvider> {
    provider: P,
    config: DiskConfig,
    state: AttachState,
}

impl<P: StorageProvider> OverlayResolver<P> {
    pub fn new(provider: P, config: DiskConfig) -> Self {
        Self {
            provider,
            config,
            state: AttachState::Idle,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn state(&self) -> &AttachState {
        &self.state
    }

    pub fn is_attached(&self) -> bool {
        matches!(self.state, AttachState::Attached(_))
    }

    pub fn handle(&self) -> Option<&ResolvedHandle> {
        match &self.state {
            AttachState::Attached(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn handle_mut(&mut self) -> Option<&mut ResolvedHandle> {
        match &mut self.state {
            AttachState::Attached(handle) => Some(handle),
            _ => None,
        }
    }

    /// Resolve `locator` to an attached handle.
    ///
    /// An image that is already attached is released first. Any failure
    /// leaves the resolver idle with nothing open.
    pub fn resolve(&mut self, locator: &Locator) -> DiskResult<&mut ResolvedHandle> {
        if !matches!(self.state, AttachState::Idle) {
            debug!("releasing previous image before resolving {}", locator.path().display());
            self.release();
        }

        self.state = AttachState::Resolving;
        match self.resolve_handle(locator) {
            Ok(handle) => self.state = AttachState::Attached(handle),
            Err(e) => {
                self.state = AttachState::Idle;
                return Err(DiskError::attach(locator.path(), e));
            }
        }
        self.handle_mut().ok_or(DiskError::NotAttached)
    }

    fn resolve_handle(&self, locator: &Locator) -> DiskResult<ResolvedHandle> {
        let path = match locator {
            Locator::Package { package, region } => {
                let origin = self.open_package_disk(package, region)?;
                info!(package = %package.display(), region = %region, "attached package image");
                return Ok(ResolvedHandle::Origin(origin));
            }
            Locator::Image(path) => path,
        };

        match Container::open(self.provider.open(path)?, true) {
            Ok(origin) => {
                info!(image = %path.display(), "attached image read-write");
                return Ok(ResolvedHandle::Origin(origin));
            }
            Err(DiskError::NotWritable) => {
                debug!(image = %path.display(), "image is read-only, using a diff");
            }
            Err(e) => return Err(e),
        }

        let origin = Container::open(self.provider.open_read_only(path)?, false)?;
        let diff = self.open_or_create_diff(path, &origin)?;
        Ok(ResolvedHandle::Overlay { diff, origin })
    }

    fn open_or_create_diff(&self, origin_path: &Path, origin: &Container) -> DiskResult<Container> {
        let diff_path = self.config.diff_locator(origin_path);
        let origin_id = self.provider.identity(origin_path);

        if self.provider.exists(&diff_path) {
            let diff = Container::open(self.provider.open(&diff_path)?, true)?;
            diff.check_parent(origin, &origin_id)?;
            info!(diff = %diff_path.display(), "reusing diff image");
            return Ok(diff);
        }

        let proxy = self.provider.create(&diff_path)?;
        match Container::create_diff(proxy, origin, &origin_id) {
            Ok(diff) => {
                info!(diff = %diff_path.display(), "created diff image");
                Ok(diff)
            }
            Err(e) => {
                if let Err(rm) = self.provider.remove(&diff_path) {
                    warn!("could not remove partial diff {}: {}", diff_path.display(), rm);
                }
                Err(e)
            }
        }
    }

    fn open_package_disk(&self, package: &Path, region: &str) -> DiskResult<Container> {
        let mut proxy = self.provider.open_read_only(package)?;
        let mut loaded = load_package(ProxyReader::new(proxy.as_mut())?)?;
        let image = loaded.images.remove(region).ok_or_else(|| {
            DiskError::Package(format!(
                "{} has no disk region {}",
                loaded.manifest.name, region
            ))
        })?;
        Container::open(Box::new(MemoryProxy::from_bytes(image, false)), false)
    }

    /// Close whatever is attached (diff before origin) and return to idle.
    /// Safe to call in any state, any number of times.
    pub fn release(&mut self) {
        if let AttachState::Attached(mut handle) = std::mem::replace(&mut self.state, AttachState::Idle) {
            if let Err(e) = handle.close() {
                warn!("error closing image: {}", e);
            }
            debug!("released image");
        }
    }
}

impl<P: StorageProvider> Drop for OverlayResolver<P> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Codec, HunkDescriptor};
    use crate::storage::{MemoryStorage, StorageProxy};

    const HUNK: u32 = 256;

    fn seed_image(storage: &MemoryStorage, path: &str, hunks: u32) {
        let mut c = Container::create(
            storage.create(Path::new(path)).unwrap(),
            (HUNK * hunks) as u64,
            HUNK,
            Codec::None,
        )
        .unwrap();
        c.write_hunk(0, &[0xAA; HUNK as usize]).unwrap();
        c.write_metadata(MetadataTag::HARD_DISK, 0, b"seed").unwrap();
    }

    fn resolver(storage: &MemoryStorage) -> OverlayResolver<MemoryStorage> {
        OverlayResolver::new(storage.clone(), DiskConfig::default())
    }

    #[test]
    fn test_writable_image_attaches_directly() {
        let storage = MemoryStorage::new();
        seed_image(&storage, "disk.hkd", 4);
        let mut r = resolver(&storage);

        let handle = r.resolve(&Locator::image("disk.hkd")).unwrap();
        assert!(!handle.is_overlay());
        handle.write_hunk(1, &[1; HUNK as usize]).unwrap();
        assert!(!storage.exists(Path::new("diff/disk.dif")));
    }

    #[test]
    fn test_read_only_image_gets_diff() {
        let storage = MemoryStorage::new();
        seed_image(&storage, "disk.hkd", 4);
        storage.set_read_only(Path::new("disk.hkd"), true);
        let before = storage.contents(Path::new("disk.hkd")).unwrap();
        let mut r = resolver(&storage);

        let handle = r.resolve(&Locator::image("disk.hkd")).unwrap();
        assert!(handle.is_overlay());
        assert_eq!(handle.read_hunk(0).unwrap(), vec![0xAA; HUNK as usize]);
        assert_eq!(handle.read_metadata(MetadataTag::HARD_DISK, 0).unwrap(), b"seed");

        handle.write_hunk(0, &[0x55; HUNK as usize]).unwrap();
        assert_eq!(handle.read_hunk(0).unwrap(), vec![0x55; HUNK as usize]);
        assert!(matches!(
            handle.diff().unwrap().hunk_descriptor(0),
            HunkDescriptor::Stored { .. }
        ));
        assert_eq!(handle.diff().unwrap().hunk_descriptor(1), HunkDescriptor::Parent);

        r.release();
        assert!(storage.exists(Path::new("diff/disk.dif")));
        assert_eq!(storage.contents(Path::new("disk.hkd")).unwrap(), before);
        assert_eq!(storage.open_handles(), 0);
    }

    #[test]
    fn test_corrupt_image_does_not_fall_back() {
        let storage = MemoryStorage::with_entries([("bad.hkd", vec![0u8; 200])]);
        storage.set_read_only(Path::new("bad.hkd"), true);
        let mut r = resolver(&storage);

        // Read-only is checked before the header, so corrupt read-only media
        // fails on the read-only reopen.
        assert!(matches!(
            r.resolve(&Locator::image("bad.hkd")),
            Err(DiskError::Attach { .. })
        ));
        assert!(!storage.exists(Path::new("diff/bad.dif")));

        storage.set_read_only(Path::new("bad.hkd"), false);
        let err = r.resolve(&Locator::image("bad.hkd")).err().unwrap();
        match err {
            DiskError::Attach { source, .. } => assert!(matches!(*source, DiskError::Format(_))),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!r.is_attached());
        assert_eq!(storage.open_handles(), 0);
    }

    #[test]
    fn test_missing_image() {
        let storage = MemoryStorage::new();
        let mut r = resolver(&storage);
        assert!(matches!(
            r.resolve(&Locator::image("missing.hkd")),
            Err(DiskError::Attach { .. })
        ));
        assert!(matches!(r.state(), AttachState::Idle));
        assert_eq!(storage.open_handles(), 0);
        r.release();
        r.release();
    }

    #[test]
    fn test_diff_directory_not_creatable() {
        let storage = MemoryStorage::new();
        seed_image(&storage, "disk.hkd", 2);
        storage.set_read_only(Path::new("disk.hkd"), true);
        storage.deny_create_under("diff");
        let mut r = resolver(&storage);

        assert!(matches!(
            r.resolve(&Locator::image("disk.hkd")),
            Err(DiskError::Attach { .. })
        ));
        assert!(!r.is_attached());
        assert_eq!(storage.open_handles(), 0);
    }

    #[test]
    fn test_mismatched_existing_diff() {
        let storage = MemoryStorage::new();
        seed_image(&storage, "disk.hkd", 2);
        seed_image(&storage, "other.hkd", 8);
        {
            let other = Container::open(storage.open(Path::new("other.hkd")).unwrap(), false).unwrap();
            drop(
                Container::create_diff(
                    storage.create(Path::new("diff/disk.dif")).unwrap(),
                    &other,
                    "other.hkd",
                )
                .unwrap(),
            );
        }
        storage.set_read_only(Path::new("disk.hkd"), true);
        let mut r = resolver(&storage);

        let err = r.resolve(&Locator::image("disk.hkd")).err().unwrap();
        match err {
            DiskError::Attach { source, .. } => {
                assert!(matches!(*source, DiskError::ParentMismatch(_)))
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(storage.open_handles(), 0);
    }

    #[test]
    fn test_resolve_replaces_previous_attachment() {
        let storage = MemoryStorage::new();
        seed_image(&storage, "a.hkd", 2);
        seed_image(&storage, "b.hkd", 3);
        let mut r = resolver(&storage);

        r.resolve(&Locator::image("a.hkd")).unwrap();
        let handle = r.resolve(&Locator::image("b.hkd")).unwrap();
        assert_eq!(handle.logical_length(), (HUNK * 3) as u64);
        assert_eq!(storage.open_handles(), 1);
    }

    #[test]
    fn test_release_closes_everything() {
        let storage = MemoryStorage::new();
        seed_image(&storage, "disk.hkd", 2);
        storage.set_read_only(Path::new("disk.hkd"), true);
        let mut r = resolver(&storage);

        r.resolve(&Locator::image("disk.hkd")).unwrap();
        assert_eq!(storage.open_handles(), 2);
        r.release();
        assert_eq!(storage.open_handles(), 0);
        r.release();
        assert!(matches!(r.state(), AttachState::Idle));
    }

    #[test]
    fn test_same_stem_origins_do_not_share_a_diff() {
        let storage = MemoryStorage::new();
        seed_image(&storage, "a/disk.hkd", 2);
        seed_image(&storage, "b/disk.hkd", 2);
        storage.set_read_only(Path::new("a/disk.hkd"), true);
        storage.set_read_only(Path::new("b/disk.hkd"), true);
        let mut r = resolver(&storage);

        let a = r.resolve(&Locator::image("a/disk.hkd")).unwrap();
        a.write_hunk(1, &[0xAA; HUNK as usize]).unwrap();
        r.release();

        let err = r.resolve(&Locator::image("b/disk.hkd")).err().unwrap();
        match err {
            DiskError::Attach { source, .. } => {
                assert!(matches!(*source, DiskError::ParentMismatch(_)))
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(storage.open_handles(), 0);

        let a = r.resolve(&Locator::image("a/disk.hkd")).unwrap();
        assert_eq!(a.read_hunk(1).unwrap(), vec![0xAA; HUNK as usize]);
    }

    /// Proxy whose writes fail, as on a full scratch volume.
    struct FullProxy {
        inner: Box<dyn StorageProxy>,
    }

    impl StorageProxy for FullProxy {
        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> DiskResult<()> {
            self.inner.read_at(offset, buf)
        }

        fn write_at(&mut self, _offset: u64, _data: &[u8]) -> DiskResult<()> {
            Err(DiskError::Io(std::io::Error::other("full")))
        }

        fn size(&mut self) -> DiskResult<u64> {
            self.inner.size()
        }

        fn set_size(&mut self, len: u64) -> DiskResult<()> {
            self.inner.set_size(len)
        }

        fn is_writable(&self) -> bool {
            true
        }
    }

    /// Memory storage whose newly created entries cannot be written.
    struct FullScratch {
        inner: MemoryStorage,
    }

    impl StorageProvider for FullScratch {
        fn open(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>> {
            self.inner.open(locator)
        }

        fn open_read_only(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>> {
            self.inner.open_read_only(locator)
        }

        fn create(&self, locator: &Path) -> DiskResult<Box<dyn StorageProxy>> {
            Ok(Box::new(FullProxy {
                inner: self.inner.create(locator)?,
            }))
        }

        fn exists(&self, locator: &Path) -> bool {
            self.inner.exists(locator)
        }

        fn remove(&self, locator: &Path) -> DiskResult<()> {
            self.inner.remove(locator)
        }
    }

    #[test]
    fn test_failed_diff_creation_leaves_nothing_behind() {
        let storage = MemoryStorage::new();
        seed_image(&storage, "o.hkd", 2);
        storage.set_read_only(Path::new("o.hkd"), true);
        let mut r = OverlayResolver::new(
            FullScratch {
                inner: storage.clone(),
            },
            DiskConfig::default(),
        );

        let err = r.resolve(&Locator::image("o.hkd")).err().unwrap();
        match err {
            DiskError::Attach { source, .. } => assert!(matches!(*source, DiskError::Create(_))),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!r.is_attached());
        assert!(!storage.exists(Path::new("diff/o.dif")));
        assert_eq!(storage.open_handles(), 0);
    }
}
