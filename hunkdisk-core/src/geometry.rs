//! Hard disk geometry and format-time container creation.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::container::{Codec, Container, MetadataTag};
use crate::error::{DiskError, DiskResult};
use crate::storage::StorageProxy;

pub const CYLINDERS: RangeInclusive<u32> = 1..=1024;
pub const HEADS: [u32; 4] = [1, 2, 4, 8];
pub const SECTORS: RangeInclusive<u32> = 1..=64;
pub const SECTOR_WORDS: RangeInclusive<u32> = 1..=32768;
pub const HUNK_BYTES: RangeInclusive<u32> = 1..=1024 * 1024;

/// Creation request for a hard disk image.
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Geometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
    /// Sector size in 16-bit words.
    pub sector_words: u32,
    pub hunk_bytes: u32,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            cylinders: 203,
            heads: 2,
            sectors: 12,
            sector_words: 267,
            hunk_bytes: 6408,
        }
    }
}

impl Geometry {
    pub fn sector_bytes(&self) -> u32 {
        self.sector_words * 2
    }

    /// Check every field against its range and return the total sector count.
    pub fn validate(&self) -> DiskResult<u32> {
        check_range("cylinders", self.cylinders, &CYLINDERS)?;
        if !HEADS.contains(&self.heads) {
            return Err(DiskError::Geometry(format!(
                "heads must be one of {:?}, got {}",
                HEADS, self.heads
            )));
        }
        check_range("sectors", self.sectors, &SECTORS)?;
        check_range("sector words", self.sector_words, &SECTOR_WORDS)?;
        check_range("hunk bytes", self.hunk_bytes, &HUNK_BYTES)?;

        if self.hunk_bytes % self.sector_bytes() != 0 {
            return Err(DiskError::Geometry(format!(
                "hunk size {} is not a multiple of the {}-byte sector",
                self.hunk_bytes,
                self.sector_bytes()
            )));
        }

        self.cylinders
            .checked_mul(self.heads)
            .and_then(|n| n.checked_mul(self.sectors))
            .ok_or_else(|| DiskError::Geometry("total sector count overflows".into()))
    }

    pub fn logical_length(&self) -> DiskResult<u64> {
        let total = self.validate()?;
        Ok(total as u64 * self.sector_bytes() as u64)
    }
}

fn check_range(name: &str, value: u32, range: &RangeInclusive<u32>) -> DiskResult<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(DiskError::Geometry(format!(
            "{} must be in {}-{}, got {}",
            name,
            range.start(),
            range.end(),
            value
        )))
    }
}

/// Geometry as recorded in an image's `GDDD` metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
    pub sector_bytes: u32,
}

impl DiskInfo {
    /// `None` when the record's dimensions overflow.
    pub fn total_sectors(&self) -> Option<u64> {
        (self.cylinders as u64)
            .checked_mul(self.heads as u64)?
            .checked_mul(self.sectors as u64)
    }

    /// Textual payload: `CYLS:<c>,HEADS:<h>,SECS:<s>,BPS:<b>` plus a NUL.
    pub fn to_metadata(&self) -> Vec<u8> {
        let mut text = format!(
            "CYLS:{},HEADS:{},SECS:{},BPS:{}",
            self.cylinders, self.heads, self.sectors, self.sector_bytes
        )
        .into_bytes();
        text.push(0);
        text
    }

    pub fn parse_metadata(payload: &[u8]) -> DiskResult<Self> {
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        let text = std::str::from_utf8(&payload[..end])
            .map_err(|_| DiskError::Format("geometry metadata is not text".into()))?;

        let mut fields = [None; 4];
        for part in text.split(',') {
            let (key, value) = part
                .split_once(':')
                .ok_or_else(|| DiskError::Format(format!("bad geometry field '{}'", part)))?;
            let slot = match key.trim() {
                "CYLS" => 0,
                "HEADS" => 1,
                "SECS" => 2,
                "BPS" => 3,
                _ => continue,
            };
            let value = value
                .trim()
                .parse::<u32>()
                .map_err(|_| DiskError::Format(format!("bad geometry value '{}'", part)))?;
            fields[slot] = Some(value);
        }

        match fields {
            [Some(cylinders), Some(heads), Some(sectors), Some(sector_bytes)] => Ok(Self {
                cylinders,
                heads,
                sectors,
                sector_bytes,
            }),
            _ => Err(DiskError::Format(format!(
                "incomplete geometry metadata '{}'",
                text
            ))),
        }
    }
}

impl From<&Geometry> for DiskInfo {
    fn from(g: &Geometry) -> Self {
        Self {
            cylinders: g.cylinders,
            heads: g.heads,
            sectors: g.sectors,
            sector_bytes: g.sector_bytes(),
        }
    }
}

/// Creates hard disk containers from a geometry record.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeometryFormatter;

impl GeometryFormatter {
    pub fn new() -> Self {
        Self
    }

    /// Create a container sized for `geometry` and record the geometry in its
    /// metadata. A failed metadata write closes the container and fails.
    pub fn format(
        &self,
        proxy: Box<dyn StorageProxy>,
        geometry: &Geometry,
    ) -> DiskResult<Container> {
        let logical_length = geometry.logical_length()?;
        let mut container = Container::create(proxy, logical_length, geometry.hunk_bytes, Codec::None)?;

        let info = DiskInfo::from(geometry);
        if let Err(e) = container.write_metadata(MetadataTag::HARD_DISK, 0, &info.to_metadata()) {
            if let Err(close) = container.close() {
                warn!("could not close half-formatted image: {}", close);
            }
            return Err(e);
        }

        info!(
            cylinders = geometry.cylinders,
            heads = geometry.heads,
            sectors = geometry.sectors,
            sector_bytes = info.sector_bytes,
            logical_length,
            "formatted hard disk image"
        );
        Ok(container)
    }
}
