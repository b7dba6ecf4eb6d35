//! Hard disk drive: sector I/O over a resolved image.
//!
//! The drive owns an [`OverlayResolver`] and translates sector numbers into
//! hunk reads and read-modify-write hunk updates. Geometry comes from the
//! image's `GDDD` metadata record, which must be present for an attach to
//! succeed.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::DiskConfig;
use crate::container::MetadataTag;
use crate::error::{DiskError, DiskResult};
use crate::geometry::{DiskInfo, Geometry, GeometryFormatter};
use crate::resolver::{Locator, OverlayResolver, ResolvedHandle};
use crate::storage::StorageProvider;

/// Layout of the attached disk.
#[derive(Debug, Clone, Copy)]
struct Mounted {
    info: DiskInfo,
    total_sectors: u32,
    hunk_size: u32,
}

impl Mounted {
    fn from_handle(handle: &ResolvedHandle) -> DiskResult<Self> {
        let payload = handle.read_metadata(MetadataTag::HARD_DISK, 0)?;
        let info = DiskInfo::parse_metadata(&payload)?;
        let hunk_size = handle.hunk_size();

        if info.sector_bytes == 0 || hunk_size % info.sector_bytes != 0 {
            return Err(DiskError::Format(format!(
                "{}-byte hunks do not hold whole {}-byte sectors",
                hunk_size, info.sector_bytes
            )));
        }
        let too_large = || DiskError::Format(format!("geometry {:?} is too large", info));
        let sectors = info.total_sectors().ok_or_else(too_large)?;
        let total_sectors = u32::try_from(sectors).map_err(|_| too_large())?;
        let needed = sectors
            .checked_mul(info.sector_bytes as u64)
            .ok_or_else(too_large)?;
        if needed > handle.logical_length() {
            return Err(DiskError::Format(format!(
                "geometry needs {} bytes, image holds {}",
                needed,
                handle.logical_length()
            )));
        }

        Ok(Self {
            info,
            total_sectors,
            hunk_size,
        })
    }

    /// Hunk index and byte offset within it for `sector`.
    fn locate(&self, sector: u32) -> DiskResult<(u32, usize)> {
        if sector >= self.total_sectors {
            return Err(DiskError::SectorOutOfRange {
                sector,
                total: self.total_sectors,
            });
        }
        let byte = sector as u64 * self.info.sector_bytes as u64;
        let hunk = (byte / self.hunk_size as u64) as u32;
        let offset = (byte % self.hunk_size as u64) as usize;
        Ok((hunk, offset))
    }
}

/// A fixed-disk drive backed by a hunk container.
pub struct HardDiskDrive<P: StorageProvider> {
    resolver: OverlayResolver<P>,
    mounted: Option<Mounted>,
}

impl<P: StorageProvider> HardDiskDrive<P> {
    pub fn new(provider: P, config: DiskConfig) -> Self {
        Self {
            resolver: OverlayResolver::new(provider, config),
            mounted: None,
        }
    }

    /// Attach an image. Whatever was attached before is detached first; a
    /// failed attach leaves the drive empty.
    pub fn attach(&mut self, locator: &Locator) -> DiskResult<()> {
        self.detach();

        let handle = self.resolver.resolve(locator)?;
        match Mounted::from_handle(handle) {
            Ok(mounted) => {
                info!(
                    image = %locator.path().display(),
                    cylinders = mounted.info.cylinders,
                    heads = mounted.info.heads,
                    sectors = mounted.info.sectors,
                    sector_bytes = mounted.info.sector_bytes,
                    overlay = handle.is_overlay(),
                    "hard disk attached"
                );
                self.mounted = Some(mounted);
                Ok(())
            }
            Err(e) => {
                self.resolver.release();
                Err(DiskError::attach(locator.path(), e))
            }
        }
    }

    pub fn detach(&mut self) {
        if self.mounted.take().is_some() {
            debug!("hard disk detached");
        }
        self.resolver.release();
    }

    pub fn is_attached(&self) -> bool {
        self.mounted.is_some()
    }

    /// Whether writes are landing in a diff rather than the image itself.
    pub fn is_overlay(&self) -> bool {
        self.resolver.handle().is_some_and(|h| h.is_overlay())
    }

    pub fn geometry(&self) -> Option<DiskInfo> {
        self.mounted.map(|m| m.info)
    }

    pub fn total_sectors(&self) -> Option<u32> {
        self.mounted.map(|m| m.total_sectors)
    }

    pub fn handle(&self) -> Option<&ResolvedHandle> {
        self.resolver.handle()
    }

    pub fn read(&mut self, sector: u32) -> DiskResult<Vec<u8>> {
        let mounted = self.mounted.ok_or(DiskError::NotAttached)?;
        let (hunk, offset) = mounted.locate(sector)?;
        let handle = self.resolver.handle_mut().ok_or(DiskError::NotAttached)?;

        let data = handle.read_hunk(hunk)?;
        let len = mounted.info.sector_bytes as usize;
        Ok(data[offset..offset + len].to_vec())
    }

    pub fn write(&mut self, sector: u32, data: &[u8]) -> DiskResult<()> {
        let mounted = self.mounted.ok_or(DiskError::NotAttached)?;
        let len = mounted.info.sector_bytes as usize;
        if data.len() != len {
            return Err(DiskError::SectorLength {
                expected: len,
                actual: data.len(),
            });
        }
        let (hunk, offset) = mounted.locate(sector)?;
        let handle = self.resolver.handle_mut().ok_or(DiskError::NotAttached)?;

        if mounted.hunk_size as usize == len {
            return handle.write_hunk(hunk, data);
        }
        let mut buf = handle.read_hunk(hunk)?;
        buf[offset..offset + len].copy_from_slice(data);
        handle.write_hunk(hunk, &buf)
    }

    /// Create a blank image at `locator` sized for `geometry`, then attach it.
    ///
    /// A failed format removes the partially written file.
    pub fn format(&mut self, locator: &Path, geometry: &Geometry) -> DiskResult<()> {
        self.detach();
        geometry
            .validate()
            .map_err(|e| DiskError::attach(locator, e))?;

        let provider = self.resolver.provider();
        let proxy = provider
            .create(locator)
            .map_err(|e| DiskError::attach(locator, e))?;
        let formatted = GeometryFormatter::new()
            .format(proxy, geometry)
            .and_then(|mut container| container.close());
        if let Err(e) = formatted {
            if let Err(rm) = provider.remove(locator) {
                warn!("could not remove partial image {}: {}", locator.display(), rm);
            }
            return Err(DiskError::attach(locator, e));
        }

        self.attach(&Locator::Image(locator.to_path_buf()))
    }
}
