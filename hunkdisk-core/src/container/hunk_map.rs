//! Hunk map entries.

use super::header::{be_u16, be_u32, be_u64, Codec};
use crate::error::{DiskError, DiskResult};

pub const ENTRY_LEN: usize = 16;

const KIND_ZERO: u8 = 0;
const KIND_STORED: u8 = 1;
const KIND_PARENT: u8 = 2;

/// Where a hunk's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HunkDescriptor {
    /// Never written; reads as zeros.
    Zero,
    /// Owned by this container.
    Stored { offset: u64, length: u32, codec: Codec },
    /// Inherited from the parent container.
    Parent,
}

impl HunkDescriptor {
    pub fn decode(raw: &[u8]) -> DiskResult<Self> {
        match raw[14] {
            KIND_ZERO => Ok(HunkDescriptor::Zero),
            KIND_PARENT => Ok(HunkDescriptor::Parent),
            KIND_STORED => Ok(HunkDescriptor::Stored {
                offset: be_u64(&raw[0..8]),
                length: be_u32(&raw[8..12]),
                codec: Codec::try_from(be_u16(&raw[12..14]) as u32)?,
            }),
            kind => Err(DiskError::Format(format!("unknown hunk kind {}", kind))),
        }
    }

    pub fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut raw = [0u8; ENTRY_LEN];
        match *self {
            HunkDescriptor::Zero => raw[14] = KIND_ZERO,
            HunkDescriptor::Parent => raw[14] = KIND_PARENT,
            HunkDescriptor::Stored {
                offset,
                length,
                codec,
            } => {
                raw[0..8].copy_from_slice(&offset.to_be_bytes());
                raw[8..12].copy_from_slice(&length.to_be_bytes());
                raw[12..14].copy_from_slice(&(codec as u16).to_be_bytes());
                raw[14] = KIND_STORED;
            }
        }
        raw
    }

    /// End of the stored extent, if this hunk owns one.
    pub fn extent_end(&self) -> Option<u64> {
        match *self {
            HunkDescriptor::Stored { offset, length, .. } => offset.checked_add(length as u64),
            _ => None,
        }
    }
}
