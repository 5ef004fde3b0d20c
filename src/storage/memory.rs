//! # In-Memory Device
//!
//! `MemoryDevice` implements [`RandomAccess`](super::device::RandomAccess)
//! over a plain `Vec<u8>`. It backs stores that never touch the filesystem
//! (temporary and result tables) and keeps device-level tests free of
//! tempdir plumbing. Semantics mirror the file device exactly: zero-filled
//! growth, big-endian scalars, reads past the end fail.

use eyre::Result;

use super::device::RandomAccess;
use crate::error::StorageIoError;

#[derive(Default)]
pub struct MemoryDevice {
    data: Vec<u8>,
    position: u64,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn io_error(&self, operation: &'static str) -> StorageIoError {
        StorageIoError {
            file: "<memory>".into(),
            offset: self.position,
            operation,
        }
    }
}

impl RandomAccess for MemoryDevice {
    fn seek(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let end = self.position + buf.len() as u64;
        if end > self.data.len() as u64 {
            return Err(eyre::Report::new(self.io_error("read"))
                .wrap_err("read past end of memory device"));
        }

        let start = self.position as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        self.position = end;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let end = self.position + buf.len() as u64;
        if end > self.data.len() as u64 {
            self.data.resize(end as usize, 0);
        }

        let start = self.position as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        self.position = end;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn ensure_len(&mut self, new_len: u64) -> bool {
        if new_len > self.data.len() as u64 {
            self.data.resize(new_len as usize, 0);
        }
        true
    }

    fn truncate(&mut self, new_len: u64) -> Result<()> {
        self.data.truncate(new_len as usize);
        self.position = self.position.min(new_len);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_only(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_zero_filled_on_gap_write() {
        let mut dev = MemoryDevice::new();

        dev.write_at(10, b"x").unwrap();

        assert_eq!(dev.len(), 11);
        let mut buf = [0xFFu8; 10];
        dev.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 10]);
    }

    #[test]
    fn read_past_end_fails() {
        let mut dev = MemoryDevice::new();
        dev.write_at(0, b"ab").unwrap();

        let mut buf = [0u8; 4];
        assert!(dev.read_at(0, &mut buf).is_err());
    }

    #[test]
    fn truncate_discards_tail() {
        let mut dev = MemoryDevice::new();
        dev.write_at(0, b"abcdef").unwrap();

        dev.truncate(3).unwrap();

        assert_eq!(dev.len(), 3);
        let mut buf = [0u8; 3];
        dev.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }
}
