//! Fixed-size container header.

use crate::error::{DiskError, DiskResult};

pub const MAGIC: [u8; 8] = *b"HUNKDSK\0";
pub const VERSION: u32 = 1;
pub const HEADER_LEN: usize = 64;

/// Header flag: hunks may be inherited from a parent container.
pub const FLAG_HAS_PARENT: u32 = 0x0000_0001;

/// Codec tags. Only the uncompressed codec is defined here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Codec {
    /// Hunks are stored raw, always exactly `hunk_size` bytes.
    None = 0,
}

impl TryFrom<u32> for Codec {
    type Error = DiskError;

    fn try_from(tag: u32) -> DiskResult<Self> {
        match tag {
            0 => Ok(Codec::None),
            other => Err(DiskError::Format(format!("unknown codec tag {:#x}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub flags: u32,
    pub codec: Codec,
    pub logical_length: u64,
    pub hunk_size: u32,
    pub hunk_count: u32,
    pub map_offset: u64,
    pub meta_offset: u64,
    pub meta_count: u32,
}

impl Header {
    /// Build a header for a fresh container with tables laid out back to back.
    pub fn new(logical_length: u64, hunk_size: u32, codec: Codec, flags: u32) -> DiskResult<Self> {
        if logical_length == 0 {
            return Err(DiskError::Create("logical length must be non-zero".into()));
        }
        if hunk_size == 0 {
            return Err(DiskError::Create("hunk size must be non-zero".into()));
        }
        let hunk_count = u32::try_from(logical_length.div_ceil(hunk_size as u64))
            .map_err(|_| DiskError::Create("too many hunks".into()))?;
        let map_offset = HEADER_LEN as u64;
        let meta_offset = map_offset + hunk_count as u64 * super::hunk_map::ENTRY_LEN as u64;
        Ok(Self {
            flags,
            codec,
            logical_length,
            hunk_size,
            hunk_count,
            map_offset,
            meta_offset,
            meta_count: 0,
        })
    }

    pub fn has_parent(&self) -> bool {
        self.flags & FLAG_HAS_PARENT != 0
    }

    pub fn map_len(&self) -> u64 {
        self.hunk_count as u64 * super::hunk_map::ENTRY_LEN as u64
    }

    pub fn parse(raw: &[u8; HEADER_LEN]) -> DiskResult<Self> {
        if raw[..8] != MAGIC {
            return Err(DiskError::Format("bad magic".into()));
        }
        let version = be_u32(&raw[8..12]);
        if version != VERSION {
            return Err(DiskError::Format(format!("unsupported version {}", version)));
        }
        let header_len = be_u32(&raw[12..16]);
        if header_len as usize != HEADER_LEN {
            return Err(DiskError::Format(format!("header length {}", header_len)));
        }

        let header = Self {
            flags: be_u32(&raw[16..20]),
            codec: Codec::try_from(be_u32(&raw[20..24]))?,
            logical_length: be_u64(&raw[24..32]),
            hunk_size: be_u32(&raw[32..36]),
            hunk_count: be_u32(&raw[36..40]),
            map_offset: be_u64(&raw[40..48]),
            meta_offset: be_u64(&raw[48..56]),
            meta_count: be_u32(&raw[56..60]),
        };

        if header.logical_length == 0 || header.hunk_size == 0 {
            return Err(DiskError::Format("zero geometry".into()));
        }
        if header.logical_length.div_ceil(header.hunk_size as u64) != header.hunk_count as u64 {
            return Err(DiskError::Format(format!(
                "hunk count {} does not cover {} bytes",
                header.hunk_count, header.logical_length
            )));
        }
        if header.map_offset < HEADER_LEN as u64 || header.meta_offset < HEADER_LEN as u64 {
            return Err(DiskError::Format("tables overlap header".into()));
        }
        Ok(header)
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        raw[..8].copy_from_slice(&MAGIC);
        raw[8..12].copy_from_slice(&VERSION.to_be_bytes());
        raw[12..16].copy_from_slice(&(HEADER_LEN as u32).to_be_bytes());
        raw[16..20].copy_from_slice(&self.flags.to_be_bytes());
        raw[20..24].copy_from_slice(&(self.codec as u32).to_be_bytes());
        raw[24..32].copy_from_slice(&self.logical_length.to_be_bytes());
        raw[32..36].copy_from_slice(&self.hunk_size.to_be_bytes());
        raw[36..40].copy_from_slice(&self.hunk_count.to_be_bytes());
        raw[40..48].copy_from_slice(&self.map_offset.to_be_bytes());
        raw[48..56].copy_from_slice(&self.meta_offset.to_be_bytes());
        raw[56..60].copy_from_slice(&self.meta_count.to_be_bytes());
        raw
    }
}

pub(crate) fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

pub(crate) fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub(crate) fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_last_hunk_count() {
        let header = Header::new(10_000, 4096, Codec::None, 0).unwrap();
        assert_eq!(header.hunk_count, 3);
        assert_eq!(header.map_offset, 64);
        assert_eq!(header.meta_offset, 64 + 3 * 16);
    }

    #[test]
    fn test_parse_encoded() {
        let header = Header::new(6408 * 20, 6408, Codec::None, FLAG_HAS_PARENT).unwrap();
        let parsed = Header::parse(&header.encode()).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.has_parent());
    }

    #[test]
    fn test_bad_magic() {
        let mut raw = Header::new(512, 512, Codec::None, 0).unwrap().encode();
        raw[0] = b'X';
        assert!(matches!(Header::parse(&raw), Err(DiskError::Format(_))));
    }

    #[test]
    fn test_bad_version() {
        let mut raw = Header::new(512, 512, Codec::None, 0).unwrap().encode();
        raw[8..12].copy_from_slice(&7u32.to_be_bytes());
        assert!(matches!(Header::parse(&raw), Err(DiskError::Format(_))));
    }

    #[test]
    fn test_unknown_codec() {
        let mut raw = Header::new(512, 512, Codec::None, 0).unwrap().encode();
        raw[20..24].copy_from_slice(b"zstd");
        assert!(matches!(Header::parse(&raw), Err(DiskError::Format(_))));
    }

    #[test]
    fn test_zero_geometry_rejected() {
        assert!(matches!(
            Header::new(0, 512, Codec::None, 0),
            Err(DiskError::Create(_))
        ));
        assert!(matches!(
            Header::new(512, 0, Codec::None, 0),
            Err(DiskError::Create(_))
        ));
    }
}
