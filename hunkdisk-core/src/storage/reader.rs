use std::io::{self, Read, Seek, SeekFrom};

use super::proxy::StorageProxy;

/// A `Read + Seek` adapter over a borrowed storage proxy.
///
/// Tracks its own offset and reads with positional `read_at` calls, so ZIP
/// archives can be read straight from any proxy.
pub(crate) struct ProxyReader<'a> {
    proxy: &'a mut dyn StorageProxy,
    offset: u64,
    size: u64,
}

impl<'a> ProxyReader<'a> {
    pub(crate) fn new(proxy: &'a mut dyn StorageProxy) -> io::Result<Self> {
        let size = proxy.size().map_err(io::Error::other)?;
        Ok(Self {
            proxy,
            offset: 0,
            size,
        })
    }
}

impl Read for ProxyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.offset);
        let n = (buf.len() as u64).min(remaining) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.proxy
            .read_at(self.offset, &mut buf[..n])
            .map_err(io::Error::other)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl Seek for ProxyReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.offset.checked_add_signed(delta),
        };
        match target {
            Some(n) => {
                self.offset = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}
