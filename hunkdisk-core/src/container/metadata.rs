//! Container metadata table.

use std::fmt;

use super::header::be_u32;
use crate::error::{DiskError, DiskResult};

/// Four-byte metadata identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataTag(pub [u8; 4]);

impl MetadataTag {
    /// Hard disk geometry record.
    pub const HARD_DISK: MetadataTag = MetadataTag(*b"GDDD");
    /// Identity of the parent a diff was created from.
    pub const ORIGIN: MetadataTag = MetadataTag(*b"ORGN");
}

impl From<&[u8; 4]> for MetadataTag {
    fn from(raw: &[u8; 4]) -> Self {
        MetadataTag(*raw)
    }
}

impl fmt::Display for MetadataTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub tag: MetadataTag,
    pub index: u32,
    pub payload: Vec<u8>,
}

/// Ordered (tag, index) -> payload table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MetadataTable {
    entries: Vec<MetadataEntry>,
}

impl MetadataTable {
    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    #[cfg(test)]
    pub fn entries_mut(&mut self) -> &mut Vec<MetadataEntry> {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, tag: MetadataTag, index: u32) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.tag == tag && e.index == index)
            .map(|e| e.payload.as_slice())
    }

    /// Replace an existing entry in place, or append a new one.
    pub fn set(&mut self, tag: MetadataTag, index: u32, payload: &[u8]) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.tag == tag && e.index == index)
        {
            Some(entry) => entry.payload = payload.to_vec(),
            None => self.entries.push(MetadataEntry {
                tag,
                index,
                payload: payload.to_vec(),
            }),
        }
    }

    pub fn encode(&self) -> DiskResult<Vec<u8>> {
        let mut out = Vec::new();
        for entry in &self.entries {
            let len = u32::try_from(entry.payload.len())
                .map_err(|_| DiskError::Create(format!("metadata {} too large", entry.tag)))?;
            out.extend_from_slice(&entry.tag.0);
            out.extend_from_slice(&entry.index.to_be_bytes());
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(&entry.payload);
        }
        Ok(out)
    }

    /// Decode `count` records from `raw`, which must hold exactly them.
    pub fn decode(raw: &[u8], count: u32) -> DiskResult<Self> {
        let mut entries = Vec::new();
        let mut pos = 0usize;
        for _ in 0..count {
            let head = raw
                .get(pos..pos + 12)
                .ok_or_else(|| DiskError::Format("metadata record header truncated".into()))?;
            let tag = MetadataTag([head[0], head[1], head[2], head[3]]);
            let index = be_u32(&head[4..8]);
            let len = be_u32(&head[8..12]) as usize;
            pos += 12;
            let payload = raw
                .get(pos..pos + len)
                .ok_or_else(|| DiskError::Format(format!("metadata {} truncated", tag)))?;
            entries.push(MetadataEntry {
                tag,
                index,
                payload: payload.to_vec(),
            });
            pos += len;
        }
        Ok(Self { entries })
    }

    /// Size on disk of `count` records, walking record headers through
    /// `read` (offsets relative to the table start).
    pub fn scan_len(
        mut read: impl FnMut(u64, &mut [u8]) -> DiskResult<()>,
        count: u32,
    ) -> DiskResult<u64> {
        let mut pos = 0u64;
        for _ in 0..count {
            let mut head = [0u8; 12];
            read(pos, &mut head)?;
            pos = pos
                .checked_add(12 + be_u32(&head[8..12]) as u64)
                .ok_or_else(|| DiskError::Format("metadata length overflow".into()))?;
        }
        Ok(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_in_place() {
        let mut table = MetadataTable::default();
        table.set(MetadataTag(*b"AAAA"), 0, b"one");
        table.set(MetadataTag(*b"BBBB"), 0, b"two");
        table.set(MetadataTag(*b"AAAA"), 0, b"three");

        assert_eq!(table.len(), 2);
        assert_eq!(table.entries()[0].payload, b"three");
        assert_eq!(table.get(MetadataTag(*b"BBBB"), 0), Some(&b"two"[..]));
        assert_eq!(table.get(MetadataTag(*b"BBBB"), 1), None);
    }

    #[test]
    fn test_decode_preserves_order() {
        let mut table = MetadataTable::default();
        table.set(MetadataTag::HARD_DISK, 0, b"CYLS:1");
        table.set(MetadataTag(*b"NOTE"), 3, b"");
        let raw = table.encode().unwrap();

        let decoded = MetadataTable::decode(&raw, 2).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn test_decode_truncated() {
        let mut table = MetadataTable::default();
        table.set(MetadataTag::HARD_DISK, 0, b"payload");
        let raw = table.encode().unwrap();
        assert!(MetadataTable::decode(&raw[..raw.len() - 1], 1).is_err());
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(MetadataTag::HARD_DISK.to_string(), "GDDD");
        assert_eq!(MetadataTag([b'A', 0, b'B', b'C']).to_string(), "A\\x00BC");
    }
}
