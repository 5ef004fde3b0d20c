//! # Memory-Mapped Device
//!
//! `MmapDevice` implements [`RandomAccess`](super::device::RandomAccess)
//! over a memory-mapped file. Reads and writes are `copy_from_slice` against
//! the mapped region, so a cached-row miss costs a page fault at worst and
//! no syscall on the warm path.
//!
//! ## Size Threshold
//!
//! Mapping is chosen at open time only for files at or below
//! `MMAP_MAX_FILE_SIZE`; growth past that point keeps working (the file is
//! remapped), the threshold only gates the initial selection. Address space
//! on 32-bit hosts and remap churn on huge files make plain file I/O the
//! better default above the threshold.
//!
//! ## Remapping
//!
//! The map becomes invalid whenever the file is resized. `ensure_len` and
//! `truncate` flush the old map, resize the file, and remap. `&mut self` on
//! every resizing operation means the borrow checker proves no slice into
//! the old map survives a remap.
//!
//! ## Read-Only Mode
//!
//! A read-only store maps with `memmap2::Mmap`; writes and growth are
//! rejected without touching the file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::{Mmap, MmapMut};

use super::device::RandomAccess;
use crate::error::StorageIoError;

enum Map {
    Rw(MmapMut),
    Ro(Mmap),
}

impl Map {
    fn as_slice(&self) -> &[u8] {
        match self {
            Map::Rw(m) => &m[..],
            Map::Ro(m) => &m[..],
        }
    }
}

pub struct MmapDevice {
    file: File,
    map: Map,
    path: PathBuf,
    position: u64,
    length: u64,
}

impl MmapDevice {
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        let length = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            length > 0,
            "cannot memory-map empty data file '{}'",
            path.display()
        );

        // SAFETY: mapping a file is unsafe because another process could
        // resize or modify it underneath the map. The store owns its data
        // file exclusively for the lifetime of the open handle, all resizes
        // go through ensure_len/truncate which remap, and every access is
        // bounds-checked against the tracked length.
        let map = unsafe {
            if read_only {
                Map::Ro(
                    Mmap::map(&file)
                        .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?,
                )
            } else {
                Map::Rw(
                    MmapMut::map_mut(&file)
                        .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?,
                )
            }
        };

        Ok(Self {
            file,
            map,
            path: path.to_path_buf(),
            position: 0,
            length,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hints to the OS that `len` bytes from `position` will be read soon.
    pub fn prefetch(&self, position: u64, len: usize) {
        if position >= self.length {
            return;
        }

        let len = len.min((self.length - position) as usize);

        #[cfg(unix)]
        // SAFETY: the range is clamped to the mapped length above; madvise
        // is advisory and cannot fault the process on a valid range.
        unsafe {
            libc::madvise(
                self.map.as_slice().as_ptr().add(position as usize) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }

        #[cfg(not(unix))]
        let _ = len;
    }

    fn io_error(&self, operation: &'static str) -> StorageIoError {
        StorageIoError {
            file: self.path.clone(),
            offset: self.position,
            operation,
        }
    }

    fn remap(&mut self, new_len: u64) -> Result<()> {
        if let Map::Rw(m) = &self.map {
            m.flush().wrap_err(self.io_error("sync"))?;
        }

        self.file
            .set_len(new_len)
            .wrap_err(self.io_error("resize"))?;

        // SAFETY: same ownership argument as in open(); the old map is
        // dropped on assignment and no reference into it can outlive this
        // &mut self call.
        self.map = unsafe {
            Map::Rw(
                MmapMut::map_mut(&self.file)
                    .wrap_err_with(|| format!("failed to remap '{}'", self.path.display()))?,
            )
        };
        self.length = new_len;
        Ok(())
    }
}

impl RandomAccess for MmapDevice {
    fn seek(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let end = self.position + buf.len() as u64;
        if end > self.length {
            return Err(eyre::Report::new(self.io_error("read"))
                .wrap_err("read past end of mapped file"));
        }

        let start = self.position as usize;
        buf.copy_from_slice(&self.map.as_slice()[start..start + buf.len()]);
        self.position = end;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let end = self.position + buf.len() as u64;
        if end > self.length && !self.ensure_len(end) {
            return Err(eyre::Report::new(self.io_error("write"))
                .wrap_err("mapped file cannot grow"));
        }

        let start = self.position as usize;
        match &mut self.map {
            Map::Rw(m) => {
                m[start..start + buf.len()].copy_from_slice(buf);
            }
            Map::Ro(_) => {
                return Err(eyre::Report::new(self.io_error("write"))
                    .wrap_err("device is opened read-only"));
            }
        }
        self.position = end;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.length
    }

    fn ensure_len(&mut self, new_len: u64) -> bool {
        if new_len <= self.length {
            return true;
        }

        if matches!(self.map, Map::Ro(_)) {
            return false;
        }

        self.remap(new_len).is_ok()
    }

    fn truncate(&mut self, new_len: u64) -> Result<()> {
        ensure!(new_len > 0, "cannot truncate a mapped file to zero length");
        ensure!(
            !self.read_only(),
            "cannot truncate a read-only mapped file"
        );
        self.remap(new_len)?;
        self.position = self.position.min(new_len);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        match &self.map {
            Map::Rw(m) => m.flush().wrap_err(self.io_error("sync")),
            Map::Ro(_) => Ok(()),
        }
    }

    fn read_only(&self) -> bool {
        matches!(self.map, Map::Ro(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seeded(dir: &tempfile::TempDir, len: u64) -> std::path::PathBuf {
        let path = dir.path().join("t.dat");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(len).unwrap();
        path
    }

    #[test]
    fn open_rejects_empty_file() {
        let dir = tempdir().unwrap();
        let path = seeded(&dir, 0);

        assert!(MmapDevice::open(&path, false).is_err());
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = seeded(&dir, 64);

        let mut dev = MmapDevice::open(&path, false).unwrap();
        dev.write_at(16, b"abcd").unwrap();

        let mut buf = [0u8; 4];
        dev.read_at(16, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn writes_grow_the_map_on_demand() {
        let dir = tempdir().unwrap();
        let path = seeded(&dir, 32);

        let mut dev = MmapDevice::open(&path, false).unwrap();
        dev.write_at(60, b"tail").unwrap();

        assert_eq!(dev.len(), 64);
        let mut buf = [0u8; 4];
        dev.read_at(60, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
    }

    #[test]
    fn growth_preserves_existing_data() {
        let dir = tempdir().unwrap();
        let path = seeded(&dir, 32);

        let mut dev = MmapDevice::open(&path, false).unwrap();
        dev.write_at(0, b"head").unwrap();
        assert!(dev.ensure_len(4096));

        let mut buf = [0u8; 4];
        dev.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"head");
    }

    #[test]
    fn read_past_end_is_an_error() {
        let dir = tempdir().unwrap();
        let path = seeded(&dir, 32);

        let mut dev = MmapDevice::open(&path, false).unwrap();

        let mut buf = [0u8; 8];
        let err = dev.read_at(30, &mut buf).unwrap_err();
        assert!(err.downcast_ref::<StorageIoError>().is_some());
    }

    #[test]
    fn read_only_map_rejects_writes_and_growth() {
        let dir = tempdir().unwrap();
        let path = seeded(&dir, 32);

        let mut dev = MmapDevice::open(&path, true).unwrap();

        assert!(dev.write_at(0, b"x").is_err());
        assert!(!dev.ensure_len(64));
        assert!(dev.read_only());
    }

    #[test]
    fn sync_persists_through_reopen() {
        let dir = tempdir().unwrap();
        let path = seeded(&dir, 32);

        {
            let mut dev = MmapDevice::open(&path, false).unwrap();
            dev.write_at(8, b"durable").unwrap();
            dev.sync().unwrap();
        }

        let mut dev = MmapDevice::open(&path, false).unwrap();
        let mut buf = [0u8; 7];
        dev.read_at(8, &mut buf).unwrap();
        assert_eq!(&buf, b"durable");
    }
}
