//! # Plain-File Device
//!
//! `FileDevice` implements [`RandomAccess`](super::device::RandomAccess)
//! over a `std::fs::File` with an explicitly tracked position. This is the
//! default backend for read-write stores: no mapping lifetime to manage, no
//! size threshold, and growth is a single `set_len` call that the filesystem
//! zero-fills.
//!
//! ## Error Context
//!
//! Every failing operation is wrapped with a [`StorageIoError`] carrying the
//! file path, the offset being accessed, and the operation name, so the
//! severe-event log line at the page-store layer can state exactly where the
//! device failed.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use super::device::RandomAccess;
use crate::error::StorageIoError;

pub struct FileDevice {
    file: File,
    path: PathBuf,
    position: u64,
    length: u64,
    read_only: bool,
}

impl FileDevice {
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        let length = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        Ok(Self {
            file,
            path: path.to_path_buf(),
            position: 0,
            length,
            read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, operation: &'static str) -> StorageIoError {
        StorageIoError {
            file: self.path.clone(),
            offset: self.position,
            operation,
        }
    }
}

impl RandomAccess for FileDevice {
    fn seek(&mut self, position: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(position))
            .wrap_err(self.io_error("seek"))?;
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact(buf).wrap_err(self.io_error("read"))?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(eyre::Report::new(self.io_error("write"))
                .wrap_err("device is opened read-only"));
        }

        self.file.write_all(buf).wrap_err(self.io_error("write"))?;
        self.position += buf.len() as u64;
        self.length = self.length.max(self.position);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.length
    }

    fn ensure_len(&mut self, new_len: u64) -> bool {
        if new_len <= self.length {
            return true;
        }

        if self.read_only {
            return false;
        }

        match self.file.set_len(new_len) {
            Ok(()) => {
                self.length = new_len;
                true
            }
            Err(_) => false,
        }
    }

    fn truncate(&mut self, new_len: u64) -> Result<()> {
        self.file
            .set_len(new_len)
            .wrap_err(self.io_error("truncate"))?;
        self.length = new_len;
        self.position = self.position.min(new_len);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all().wrap_err(self.io_error("sync"))
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}
