//! # Block Device Abstraction
//!
//! The page store reads and writes its data file through the [`RandomAccess`]
//! trait: a byte-granular, seekable device with big-endian scalar helpers.
//! Keeping the device behind a trait lets one store implementation run over
//! a plain file, a memory-mapped file, or a process-memory buffer, chosen at
//! open time.
//!
//! ## Contract
//!
//! - `seek`/`read_exact`/`write_all` operate at an explicit current
//!   position; `read_u32`/`read_u64`/`write_u32`/`write_u64` are big-endian
//!   and advance the position like any other read/write.
//! - `ensure_len(new_len)` grows the device zero-filled and **returns
//!   `false` instead of erroring** when the medium cannot grow (disk full).
//!   The caller converts that into its own full-file condition before any
//!   row byte is written.
//! - `sync` flushes to stable storage.
//! - Writes on a read-only device fail with a tagged [`StorageIoError`].
//!
//! ## Implementations
//!
//! | Device         | Backing              | Use                              |
//! |----------------|----------------------|----------------------------------|
//! | `FileDevice`   | `std::fs::File`      | default read-write store         |
//! | `MmapDevice`   | `memmap2::MmapMut`   | files under the mmap threshold   |
//! | `MemoryDevice` | `Vec<u8>`            | in-memory stores, tests          |
//!
//! `AnyDevice` is a type-erased wrapper so the page store can hold any
//! backend without generics.

use std::path::Path;

use eyre::Result;

use super::file::FileDevice;
use super::memory::MemoryDevice;
use super::mmap::MmapDevice;
use crate::config::DeviceKind;

/// Byte-granular random-access device over a file or memory region.
pub trait RandomAccess: Send {
    /// Moves the current position. Seeking past the end is legal; the gap is
    /// zero-filled on the next write through `ensure_len`.
    fn seek(&mut self, position: u64) -> Result<()>;

    /// Current byte position.
    fn position(&self) -> u64;

    /// Fills `buf` from the current position, advancing it.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` at the current position, advancing it.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Device length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows the device to `new_len` zero-filled bytes. Reports failure as
    /// `false` rather than erroring so the caller can surface a full-medium
    /// condition distinct from an I/O fault. Never shrinks.
    fn ensure_len(&mut self, new_len: u64) -> bool;

    /// Truncates the device to `new_len` bytes.
    fn truncate(&mut self, new_len: u64) -> Result<()>;

    /// Flushes all written data to stable storage.
    fn sync(&mut self) -> Result<()>;

    /// True when the device rejects writes.
    fn read_only(&self) -> bool;

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_be_bytes())
    }

    fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_all(&value.to_be_bytes())
    }

    fn read_at(&mut self, position: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(position)?;
        self.read_exact(buf)
    }

    fn write_at(&mut self, position: u64, buf: &[u8]) -> Result<()> {
        self.seek(position)?;
        self.write_all(buf)
    }
}

/// Type-erased device wrapper, so `DataFileCache` holds one concrete field
/// whichever backend the configuration selected.
pub enum AnyDevice {
    File(FileDevice),
    Mmap(MmapDevice),
    Memory(MemoryDevice),
}

impl AnyDevice {
    /// Opens (or creates) a device of the requested kind. A memory-mapped
    /// device needs a non-empty file, so a fresh file is first materialized
    /// through plain file I/O sized to `initial_len` and then mapped.
    pub fn open(
        kind: DeviceKind,
        path: &Path,
        read_only: bool,
        initial_len: u64,
    ) -> Result<Self> {
        match kind {
            DeviceKind::Memory => Ok(AnyDevice::Memory(MemoryDevice::new())),
            DeviceKind::File => Ok(AnyDevice::File(FileDevice::open(path, read_only)?)),
            DeviceKind::Mmap => {
                if !path.exists() || std::fs::metadata(path)?.len() == 0 {
                    let mut seed = FileDevice::open(path, false)?;
                    seed.ensure_len(initial_len.max(1));
                    seed.sync()?;
                }
                Ok(AnyDevice::Mmap(MmapDevice::open(path, read_only)?))
            }
        }
    }

    /// Advisory readahead hint; only the mapped backend has one to give.
    pub fn prefetch(&self, position: u64, len: usize) {
        if let AnyDevice::Mmap(d) = self {
            d.prefetch(position, len);
        }
    }

    fn inner(&self) -> &dyn RandomAccess {
        match self {
            AnyDevice::File(d) => d,
            AnyDevice::Mmap(d) => d,
            AnyDevice::Memory(d) => d,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn RandomAccess {
        match self {
            AnyDevice::File(d) => d,
            AnyDevice::Mmap(d) => d,
            AnyDevice::Memory(d) => d,
        }
    }
}

impl RandomAccess for AnyDevice {
    fn seek(&mut self, position: u64) -> Result<()> {
        self.inner_mut().seek(position)
    }

    fn position(&self) -> u64 {
        self.inner().position()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner_mut().read_exact(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner_mut().write_all(buf)
    }

    fn len(&self) -> u64 {
        self.inner().len()
    }

    fn ensure_len(&mut self, new_len: u64) -> bool {
        self.inner_mut().ensure_len(new_len)
    }

    fn truncate(&mut self, new_len: u64) -> Result<()> {
        self.inner_mut().truncate(new_len)
    }

    fn sync(&mut self) -> Result<()> {
        self.inner_mut().sync()
    }

    fn read_only(&self) -> bool {
        self.inner().read_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scalar_helpers_are_big_endian() {
        let mut dev = MemoryDevice::new();

        dev.write_u32(0x0102_0304).unwrap();
        dev.write_u64(0x0506_0708_090a_0b0c).unwrap();

        dev.seek(0).unwrap();
        let mut raw = [0u8; 4];
        dev.read_exact(&mut raw).unwrap();
        assert_eq!(raw, [1, 2, 3, 4]);

        dev.seek(0).unwrap();
        assert_eq!(dev.read_u32().unwrap(), 0x0102_0304);
        assert_eq!(dev.read_u64().unwrap(), 0x0506_0708_090a_0b0c);
    }

    #[test]
    fn open_selects_backend() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");

        let dev = AnyDevice::open(DeviceKind::Memory, &path, false, 0).unwrap();
        assert!(matches!(dev, AnyDevice::Memory(_)));

        let dev = AnyDevice::open(DeviceKind::File, &path, false, 0).unwrap();
        assert!(matches!(dev, AnyDevice::File(_)));
    }

    #[test]
    fn open_mmap_materializes_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.dat");

        let dev = AnyDevice::open(DeviceKind::Mmap, &path, false, 64).unwrap();

        assert!(matches!(dev, AnyDevice::Mmap(_)));
        assert_eq!(dev.len(), 64);
    }
}
