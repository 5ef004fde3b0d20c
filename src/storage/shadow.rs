//! # Shadow File
//!
//! Before the page store overwrites any byte range in place, the pristine
//! contents of the affected pages are appended to a side file — the shadow.
//! If the process dies before the next commit, startup replays the shadow
//! over the data file and every touched page reverts to its pre-mutation
//! bytes. This is redo-log-style write-ahead protection at page granularity:
//! worst-case backup I/O is bounded by the pages actually touched in the
//! interval, never the whole file.
//!
//! ## Record Format
//!
//! ```text
//! +----------+------------+--------------------+
//! | size u32 | position   | page bytes         |
//! | (BE)     | u64 (BE)   | (size bytes)       |
//! +----------+------------+--------------------+
//! ```
//!
//! `position` is the byte offset of the page in the data file; `size` is a
//! full page except for the final page of a short file, which is clamped at
//! the data file's end.
//!
//! ## Copy Protocol
//!
//! - The first copy of an interval unconditionally records page 0: the
//!   header page is mutated by every checkpoint cycle and must always be
//!   restorable.
//! - A page is recorded at most once per interval, tracked by a bitmap of
//!   page numbers.
//! - Records are fsynced before `copy` returns, strictly before the
//!   corresponding write reaches the main file. A shadow record that is not
//!   durable protects nothing.
//!
//! ## Failure
//!
//! An I/O error during `copy` unmarks the failing page (a retry will
//! attempt it again), closes the shadow stream, and propagates — the page
//! store treats this as fatal for the current checkpoint interval.
//!
//! ## Replay
//!
//! `restore_file` reads records in file order and overwrites the
//! destination at each recorded position. A truncated trailing record (the
//! process died mid-append) ends the replay; everything before it is intact
//! because each record was fsynced before the main file was touched.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use roaring::RoaringBitmap;
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::device::RandomAccess;
use super::file::FileDevice;

pub const SHADOW_RECORD_HEADER_SIZE: usize = 12;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ShadowRecordHeader {
    size: U32,
    position: U64,
}

const _: () = assert!(std::mem::size_of::<ShadowRecordHeader>() == SHADOW_RECORD_HEADER_SIZE);

pub struct ShadowFile {
    path: PathBuf,
    page_size: usize,
    device: Option<FileDevice>,
    copied: RoaringBitmap,
    page_buf: Vec<u8>,
}

impl ShadowFile {
    pub fn new<P: AsRef<Path>>(path: P, page_size: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            page_size,
            device: None,
            copied: RoaringBitmap::new(),
            page_buf: vec![0u8; page_size],
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once any page has been recorded in the current interval.
    pub fn has_copies(&self) -> bool {
        !self.copied.is_empty()
    }

    /// Records the pre-image of every page overlapping `[offset,
    /// offset+size)` that has not been recorded in this interval. Must be
    /// called before the overwrite reaches `main`.
    pub fn copy(&mut self, main: &mut dyn RandomAccess, offset: u64, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        if self.copied.is_empty() {
            self.copy_page(main, 0)?;
        }

        let first = offset / self.page_size as u64;
        let last = (offset + size as u64 - 1) / self.page_size as u64;

        for page in first..=last {
            let page = page as u32;
            if !self.copied.contains(page) {
                self.copy_page(main, page)?;
            }
        }

        if let Some(device) = &mut self.device {
            device.sync().wrap_err("failed to sync shadow file")?;
        }

        Ok(())
    }

    fn copy_page(&mut self, main: &mut dyn RandomAccess, page: u32) -> Result<()> {
        self.copied.insert(page);

        match self.append_page(main, page) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Unmark so a retry attempts the page again; a half-written
                // trailing record is ignored by replay.
                self.copied.remove(page);
                self.device = None;
                Err(e).wrap_err_with(|| {
                    format!(
                        "severe: failed to shadow page {} into '{}'",
                        page,
                        self.path.display()
                    )
                })
            }
        }
    }

    fn append_page(&mut self, main: &mut dyn RandomAccess, page: u32) -> Result<()> {
        let start = page as u64 * self.page_size as u64;
        let main_len = main.len();

        if start >= main_len {
            // Nothing on disk to preserve; the page only exists in this
            // session's writes.
            return Ok(());
        }

        let len = self.page_size.min((main_len - start) as usize);
        main.read_at(start, &mut self.page_buf[..len])?;

        if self.device.is_none() {
            let device = FileDevice::open(&self.path, false)?;
            self.device = Some(device);
        }
        let device = self.device.as_mut().expect("shadow device just opened");

        let header = ShadowRecordHeader {
            size: U32::new(len as u32),
            position: U64::new(start),
        };

        let end = device.len();
        device.write_at(end, header.as_bytes())?;
        device.write_all(&self.page_buf[..len])?;
        Ok(())
    }

    /// Ends the interval: deletes the stream and clears the copied-page
    /// bitmap. Called after a successful commit has made the main file
    /// consistent.
    pub fn close_and_reset(&mut self) -> Result<()> {
        self.device = None;
        self.copied.clear();

        if self.path.exists() {
            std::fs::remove_file(&self.path).wrap_err_with(|| {
                format!("failed to remove shadow file '{}'", self.path.display())
            })?;
        }

        Ok(())
    }

    /// Replays shadow records over `dest` in file order, restoring every
    /// touched page to its pre-crash bytes. Returns the number of records
    /// applied.
    pub fn restore_file(shadow_path: &Path, dest_path: &Path) -> Result<u32> {
        let mut src = FileDevice::open(shadow_path, true)?;
        let mut dest = FileDevice::open(dest_path, false)?;
        let mut applied = 0u32;

        let mut header_buf = [0u8; SHADOW_RECORD_HEADER_SIZE];
        let mut page_buf = Vec::new();
        let mut offset = 0u64;

        loop {
            if src.read_at(offset, &mut header_buf).is_err() {
                break;
            }

            let header = ShadowRecordHeader::read_from_bytes(&header_buf)
                .map_err(|e| eyre::eyre!("invalid shadow record header: {:?}", e))?;
            let size = header.size.get() as usize;

            page_buf.resize(size, 0);
            if src.read_exact(&mut page_buf).is_err() {
                // Truncated trailing record from a crash mid-append.
                break;
            }

            dest.write_at(header.position.get(), &page_buf)?;
            applied += 1;
            offset += (SHADOW_RECORD_HEADER_SIZE + size) as u64;
        }

        dest.sync()?;
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryDevice;
    use tempfile::tempdir;

    fn main_file(dir: &tempfile::TempDir, len: usize) -> (std::path::PathBuf, FileDevice) {
        let path = dir.path().join("main.dat");
        let mut dev = FileDevice::open(&path, false).unwrap();
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        dev.write_at(0, &bytes).unwrap();
        dev.sync().unwrap();
        (path, dev)
    }

    #[test]
    fn first_copy_records_page_zero() {
        let dir = tempdir().unwrap();
        let (_, mut main) = main_file(&dir, 1024);
        let mut shadow = ShadowFile::new(dir.path().join("main.shadow"), 256);

        shadow.copy(&mut main, 700, 10).unwrap();

        assert!(shadow.copied.contains(0));
        assert!(shadow.copied.contains(2));
        assert_eq!(shadow.copied.len(), 2);
    }

    #[test]
    fn page_is_copied_once_per_interval() {
        let dir = tempdir().unwrap();
        let (_, mut main) = main_file(&dir, 1024);
        let shadow_path = dir.path().join("main.shadow");
        let mut shadow = ShadowFile::new(&shadow_path, 256);

        shadow.copy(&mut main, 0, 32).unwrap();
        let len_after_first = std::fs::metadata(&shadow_path).unwrap().len();

        shadow.copy(&mut main, 8, 32).unwrap();
        let len_after_second = std::fs::metadata(&shadow_path).unwrap().len();

        assert_eq!(len_after_first, len_after_second);
    }

    #[test]
    fn range_spanning_two_pages_records_both() {
        let dir = tempdir().unwrap();
        let (_, mut main) = main_file(&dir, 1024);
        let mut shadow = ShadowFile::new(dir.path().join("main.shadow"), 256);

        shadow.copy(&mut main, 250, 12).unwrap();

        assert!(shadow.copied.contains(0));
        assert!(shadow.copied.contains(1));
    }

    #[test]
    fn restore_reverts_overwritten_pages() {
        let dir = tempdir().unwrap();
        let (main_path, mut main) = main_file(&dir, 1024);
        let shadow_path = dir.path().join("main.shadow");
        let original = std::fs::read(&main_path).unwrap();

        let mut shadow = ShadowFile::new(&shadow_path, 256);
        shadow.copy(&mut main, 300, 300).unwrap();

        main.write_at(300, &[0xAA; 300]).unwrap();
        main.sync().unwrap();
        drop(main);

        let applied = ShadowFile::restore_file(&shadow_path, &main_path).unwrap();
        assert!(applied >= 2);

        let restored = std::fs::read(&main_path).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn final_short_page_is_clamped() {
        let dir = tempdir().unwrap();
        let (main_path, mut main) = main_file(&dir, 300);
        let shadow_path = dir.path().join("main.shadow");
        let original = std::fs::read(&main_path).unwrap();

        let mut shadow = ShadowFile::new(&shadow_path, 256);
        shadow.copy(&mut main, 260, 20).unwrap();

        main.write_at(256, &[0xBB; 44]).unwrap();
        drop(main);

        ShadowFile::restore_file(&shadow_path, &main_path).unwrap();

        assert_eq!(std::fs::read(&main_path).unwrap(), original);
    }

    #[test]
    fn pages_past_end_of_file_record_nothing() {
        let dir = tempdir().unwrap();
        let (_, mut main) = main_file(&dir, 100);
        let shadow_path = dir.path().join("main.shadow");
        let mut shadow = ShadowFile::new(&shadow_path, 256);

        // Page 3 does not exist on disk yet; only page 0 has a pre-image.
        shadow.copy(&mut main, 800, 16).unwrap();

        let mut src = FileDevice::open(&shadow_path, true).unwrap();
        assert_eq!(src.len() as usize, SHADOW_RECORD_HEADER_SIZE + 100);
        let mut header = [0u8; SHADOW_RECORD_HEADER_SIZE];
        src.read_at(0, &mut header).unwrap();
        assert_eq!(&header[..4], &100u32.to_be_bytes());
    }

    #[test]
    fn truncated_trailing_record_stops_replay() {
        let dir = tempdir().unwrap();
        let (main_path, mut main) = main_file(&dir, 512);
        let shadow_path = dir.path().join("main.shadow");
        let original = std::fs::read(&main_path).unwrap();

        let mut shadow = ShadowFile::new(&shadow_path, 256);
        shadow.copy(&mut main, 0, 512).unwrap();
        drop(main);

        // Simulate a crash mid-append of a further record.
        let full_len = std::fs::metadata(&shadow_path).unwrap().len();
        let mut raw = std::fs::read(&shadow_path).unwrap();
        raw.extend_from_slice(&[0x01, 0x02, 0x03]);
        std::fs::write(&shadow_path, &raw).unwrap();

        std::fs::write(&main_path, vec![0u8; 512]).unwrap();
        let applied = ShadowFile::restore_file(&shadow_path, &main_path).unwrap();

        assert_eq!(applied as u64 * 268, full_len);
        assert_eq!(std::fs::read(&main_path).unwrap(), original);
    }

    #[test]
    fn close_and_reset_deletes_stream_and_clears_bitmap() {
        let dir = tempdir().unwrap();
        let (_, mut main) = main_file(&dir, 512);
        let shadow_path = dir.path().join("main.shadow");
        let mut shadow = ShadowFile::new(&shadow_path, 256);

        shadow.copy(&mut main, 0, 16).unwrap();
        assert!(shadow_path.exists());

        shadow.close_and_reset().unwrap();

        assert!(!shadow_path.exists());
        assert!(!shadow.has_copies());
    }

    #[test]
    fn copy_works_against_any_device() {
        let dir = tempdir().unwrap();
        let mut main = MemoryDevice::new();
        main.write_at(0, &[7u8; 600]).unwrap();
        let mut shadow = ShadowFile::new(dir.path().join("m.shadow"), 256);

        shadow.copy(&mut main, 0, 600).unwrap();

        assert_eq!(shadow.copied.len(), 3);
    }
}
