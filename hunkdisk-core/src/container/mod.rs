//! Hunk-addressed disk image container.
//!
//! A container stores a fixed-size logical address space as hunks, plus an
//! ordered metadata table. A diff container marks hunks it has not written as
//! inherited, and reads them from a parent container lent to it per call.
//!
//! # Layout
//!
//! ```text
//! [header 64B][hunk map: hunk_count x 16B][metadata table][hunk data ...]
//! ```
//!
//! Hunk data and rewritten metadata tables are appended at the end of the
//! storage; the header and map are updated in place.

mod header;
mod hunk_map;
mod metadata;

use tracing::{debug, trace, warn};

pub use header::Codec;
pub use hunk_map::HunkDescriptor;
pub use metadata::{MetadataEntry, MetadataTag};

use header::{Header, FLAG_HAS_PARENT, HEADER_LEN};
use hunk_map::ENTRY_LEN;
use metadata::MetadataTable;

use crate::error::{DiskError, DiskResult};
use crate::storage::StorageProxy;

/// An open container. Owns its storage proxy until closed or dropped.
pub struct Container {
    proxy: Option<Box<dyn StorageProxy>>,
    header: Header,
    map: Vec<HunkDescriptor>,
    metadata: MetadataTable,
    writable: bool,
}

impl Container {
    /// Open an existing container.
    ///
    /// Fails with `NotWritable` when `writable` is requested and the proxy
    /// only grants read access. The proxy is released on every error path.
    pub fn open(mut proxy: Box<dyn StorageProxy>, writable: bool) -> DiskResult<Self> {
        if writable && !proxy.is_writable() {
            return Err(DiskError::NotWritable);
        }

        let size = proxy.size()?;
        if size < HEADER_LEN as u64 {
            return Err(DiskError::Truncated {
                needed: HEADER_LEN as u64,
                actual: size,
            });
        }
        let mut raw = [0u8; HEADER_LEN];
        proxy.read_at(0, &mut raw)?;
        let header = Header::parse(&raw)?;

        let map_end = header
            .map_offset
            .checked_add(header.map_len())
            .ok_or_else(|| DiskError::Format("hunk map overflows".into()))?;
        if map_end > size {
            return Err(DiskError::Truncated {
                needed: map_end,
                actual: size,
            });
        }
        let mut raw_map = vec![0u8; header.map_len() as usize];
        proxy.read_at(header.map_offset, &mut raw_map)?;

        let mut map = Vec::with_capacity(header.hunk_count as usize);
        for (index, raw) in raw_map.chunks_exact(ENTRY_LEN).enumerate() {
            let desc = HunkDescriptor::decode(raw)?;
            match desc {
                HunkDescriptor::Stored { length, .. } => {
                    if length != header.hunk_size {
                        return Err(DiskError::Format(format!(
                            "hunk {} stores {} bytes, expected {}",
                            index, length, header.hunk_size
                        )));
                    }
                    let end = desc
                        .extent_end()
                        .ok_or_else(|| DiskError::Format(format!("hunk {} overflows", index)))?;
                    if end > size {
                        return Err(DiskError::Truncated {
                            needed: end,
                            actual: size,
                        });
                    }
                }
                HunkDescriptor::Parent if !header.has_parent() => {
                    return Err(DiskError::Corrupt(format!(
                        "hunk {} is inherited but the image has no parent",
                        index
                    )));
                }
                _ => {}
            }
            map.push(desc);
        }

        let meta_offset = header.meta_offset;
        let meta_len = MetadataTable::scan_len(
            |pos, buf| {
                let end = meta_offset
                    .saturating_add(pos)
                    .saturating_add(buf.len() as u64);
                if end > size {
                    return Err(DiskError::Truncated {
                        needed: end,
                        actual: size,
                    });
                }
                proxy.read_at(meta_offset + pos, buf)
            },
            header.meta_count,
        )?;
        let meta_end = meta_offset
            .checked_add(meta_len)
            .ok_or_else(|| DiskError::Format("metadata table overflows".into()))?;
        if meta_end > size {
            return Err(DiskError::Truncated {
                needed: meta_end,
                actual: size,
            });
        }
        let mut raw_meta = vec![0u8; meta_len as usize];
        proxy.read_at(meta_offset, &mut raw_meta)?;
        let metadata = MetadataTable::decode(&raw_meta, header.meta_count)?;

        debug!(
            logical_length = header.logical_length,
            hunk_size = header.hunk_size,
            writable,
            "opened container"
        );

        Ok(Self {
            proxy: Some(proxy),
            header,
            map,
            metadata,
            writable,
        })
    }

    /// Create a fresh container whose hunks all read as zeros.
    pub fn create(
        proxy: Box<dyn StorageProxy>,
        logical_length: u64,
        hunk_size: u32,
        codec: Codec,
    ) -> DiskResult<Self> {
        let header = Header::new(logical_length, hunk_size, codec, 0)?;
        let map = vec![HunkDescriptor::Zero; header.hunk_count as usize];
        Self::create_with(proxy, header, map, MetadataTable::default())
    }

    /// Create a diff against `parent`: same geometry, every hunk inherited,
    /// and a snapshot of the parent's metadata table.
    ///
    /// `origin_id` names the parent's storage. It is recorded together with
    /// the parent's header under [`MetadataTag::ORIGIN`] and checked by
    /// [`Container::check_parent`].
    ///
    /// Creation is all-or-nothing; on failure the storage is truncated.
    pub fn create_diff(
        proxy: Box<dyn StorageProxy>,
        parent: &Container,
        origin_id: &str,
    ) -> DiskResult<Self> {
        if !parent.is_open() {
            return Err(DiskError::ParentMismatch("parent image is closed".into()));
        }
        let header = Header::new(
            parent.logical_length(),
            parent.hunk_size(),
            Codec::None,
            FLAG_HAS_PARENT,
        )
        .map_err(|e| DiskError::ParentMismatch(e.to_string()))?;
        let map = vec![HunkDescriptor::Parent; header.hunk_count as usize];
        let mut metadata = parent.metadata.clone();
        metadata.set(MetadataTag::ORIGIN, 0, &parent.origin_record(origin_id));
        Self::create_with(proxy, header, map, metadata)
    }

    /// Parent header followed by the parent's storage name.
    fn origin_record(&self, origin_id: &str) -> Vec<u8> {
        let mut record = self.header.encode().to_vec();
        record.extend_from_slice(origin_id.as_bytes());
        record
    }

    fn create_with(
        mut proxy: Box<dyn StorageProxy>,
        mut header: Header,
        map: Vec<HunkDescriptor>,
        metadata: MetadataTable,
    ) -> DiskResult<Self> {
        if !proxy.is_writable() {
            return Err(DiskError::Create("storage is not writable".into()));
        }

        let raw_meta = metadata.encode()?;
        header.meta_count = u32::try_from(metadata.len())
            .map_err(|_| DiskError::Create("too many metadata entries".into()))?;

        let mut image = Vec::with_capacity(
            HEADER_LEN + map.len() * ENTRY_LEN + raw_meta.len(),
        );
        image.extend_from_slice(&header.encode());
        for desc in &map {
            image.extend_from_slice(&desc.encode());
        }
        image.extend_from_slice(&raw_meta);

        let written = proxy
            .set_size(0)
            .and_then(|_| proxy.write_at(0, &image))
            .and_then(|_| proxy.set_size(image.len() as u64))
            .and_then(|_| proxy.flush());
        if let Err(e) = written {
            if let Err(cleanup) = proxy.set_size(0) {
                warn!("could not truncate failed image: {}", cleanup);
            }
            return Err(DiskError::Create(e.to_string()));
        }

        debug!(
            logical_length = header.logical_length,
            hunk_size = header.hunk_size,
            diff = header.has_parent(),
            "created container"
        );

        Ok(Self {
            proxy: Some(proxy),
            header,
            map,
            metadata,
            writable: true,
        })
    }

    /// Check that this container is a diff made from `parent`, stored at
    /// `origin_id`, and that the parent has not changed since.
    pub fn check_parent(&self, parent: &Container, origin_id: &str) -> DiskResult<()> {
        if !self.has_parent() {
            return Err(DiskError::ParentMismatch(
                "image is not a diff".into(),
            ));
        }
        if self.logical_length() != parent.logical_length()
            || self.hunk_size() != parent.hunk_size()
        {
            return Err(DiskError::ParentMismatch(format!(
                "diff is {} bytes in {}-byte hunks, parent is {} bytes in {}-byte hunks",
                self.logical_length(),
                self.hunk_size(),
                parent.logical_length(),
                parent.hunk_size()
            )));
        }
        match self.metadata.get(MetadataTag::ORIGIN, 0) {
            Some(record) if record == parent.origin_record(origin_id).as_slice() => Ok(()),
            Some(_) => Err(DiskError::ParentMismatch(format!(
                "diff was made from a different image than {}",
                origin_id
            ))),
            None => Err(DiskError::ParentMismatch(
                "diff does not record its origin".into(),
            )),
        }
    }

    pub fn logical_length(&self) -> u64 {
        self.header.logical_length
    }

    pub fn hunk_size(&self) -> u32 {
        self.header.hunk_size
    }

    pub fn hunk_count(&self) -> u32 {
        self.header.hunk_count
    }

    pub fn codec(&self) -> Codec {
        self.header.codec
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_open(&self) -> bool {
        self.proxy.is_some()
    }

    /// Whether unwritten hunks are inherited from a parent.
    pub fn has_parent(&self) -> bool {
        self.header.has_parent()
    }

    /// Descriptor for a hunk. Panics if `index` is out of range.
    pub fn hunk_descriptor(&self, index: u32) -> HunkDescriptor {
        self.check_index(index);
        self.map[index as usize]
    }

    /// Number of hunks with locally stored data.
    pub fn stored_hunks(&self) -> usize {
        self.map
            .iter()
            .filter(|d| matches!(d, HunkDescriptor::Stored { .. }))
            .count()
    }

    /// Read a hunk of a container without a parent.
    pub fn read_hunk(&mut self, index: u32) -> DiskResult<Vec<u8>> {
        self.read_hunk_from(index, None)
    }

    /// Read a hunk, forwarding inherited hunks to `parent`.
    ///
    /// Panics if `index` is out of range.
    pub fn read_hunk_from(
        &mut self,
        index: u32,
        parent: Option<&mut Container>,
    ) -> DiskResult<Vec<u8>> {
        self.check_index(index);
        let hunk_size = self.header.hunk_size as usize;
        let proxy = self.proxy.as_mut().ok_or(DiskError::Closed)?;

        match self.map[index as usize] {
            HunkDescriptor::Zero => Ok(vec![0u8; hunk_size]),
            HunkDescriptor::Stored { offset, length, .. } => {
                let mut buf = vec![0u8; length as usize];
                proxy.read_at(offset, &mut buf)?;
                Ok(buf)
            }
            HunkDescriptor::Parent => match parent {
                Some(parent) => parent.read_hunk(index),
                None => Err(DiskError::Corrupt(format!(
                    "hunk {} is inherited but no parent is attached",
                    index
                ))),
            },
        }
    }

    /// Write a full hunk. The first write to a hunk allocates storage for it;
    /// later writes overwrite that storage in place.
    ///
    /// Panics if `index` is out of range.
    pub fn write_hunk(&mut self, index: u32, data: &[u8]) -> DiskResult<()> {
        self.check_index(index);
        if !self.writable {
            return Err(DiskError::NotWritable);
        }
        let hunk_size = self.header.hunk_size;
        if data.len() != hunk_size as usize {
            return Err(DiskError::HunkLength {
                expected: hunk_size as usize,
                actual: data.len(),
            });
        }
        let map_offset = self.header.map_offset;
        let proxy = self.proxy.as_mut().ok_or(DiskError::Closed)?;

        if let HunkDescriptor::Stored { offset, .. } = self.map[index as usize] {
            return proxy.write_at(offset, data);
        }

        let offset = proxy.size()?;
        proxy.write_at(offset, data)?;
        let desc = HunkDescriptor::Stored {
            offset,
            length: hunk_size,
            codec: Codec::None,
        };
        proxy.write_at(
            map_offset + index as u64 * ENTRY_LEN as u64,
            &desc.encode(),
        )?;
        self.map[index as usize] = desc;
        trace!(index, offset, "allocated hunk");
        Ok(())
    }

    /// All metadata entries in table order.
    pub fn metadata(&self) -> &[MetadataEntry] {
        self.metadata.entries()
    }

    pub fn read_metadata(&self, tag: MetadataTag, index: u32) -> DiskResult<Vec<u8>> {
        self.metadata
            .get(tag, index)
            .map(|p| p.to_vec())
            .ok_or(DiskError::NotFound { tag, index })
    }

    /// Set a metadata entry, replacing any existing (tag, index) entry.
    pub fn write_metadata(&mut self, tag: MetadataTag, index: u32, payload: &[u8]) -> DiskResult<()> {
        if !self.writable {
            return Err(DiskError::NotWritable);
        }
        let proxy = self.proxy.as_mut().ok_or(DiskError::Closed)?;

        let mut table = self.metadata.clone();
        table.set(tag, index, payload);
        let raw = table.encode()?;

        let mut header = self.header.clone();
        header.meta_offset = proxy.size()?;
        header.meta_count = u32::try_from(table.len())
            .map_err(|_| DiskError::Create("too many metadata entries".into()))?;

        proxy.write_at(header.meta_offset, &raw)?;
        proxy.write_at(0, &header.encode())?;

        self.header = header;
        self.metadata = table;
        Ok(())
    }

    pub fn flush(&mut self) -> DiskResult<()> {
        match self.proxy.as_mut() {
            Some(proxy) => proxy.flush(),
            None => Err(DiskError::Closed),
        }
    }

    /// Release the storage proxy. Calling it again is a no-op.
    pub fn close(&mut self) -> DiskResult<()> {
        match self.proxy.take() {
            Some(mut proxy) if self.writable => proxy.flush(),
            _ => Ok(()),
        }
    }

    fn check_index(&self, index: u32) {
        assert!(
            index < self.header.hunk_count,
            "hunk {} out of range ({} hunks)",
            index,
            self.header.hunk_count
        );
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to flush container on close: {}", e);
        }
    }
}
