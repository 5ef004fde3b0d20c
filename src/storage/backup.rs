//! # Full-Snapshot Backup Archive
//!
//! When incremental backup is off, crash safety comes from a full snapshot
//! of the data file taken at each checkpoint: if a session ends uncleanly,
//! the whole file is rolled back to the snapshot. The archive is a raw
//! image of the data file behind a small framed header; integrity is
//! guarded by a CRC-64 over the image so a torn or stale archive is
//! rejected instead of silently restoring garbage.
//!
//! ## Archive Layout
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  -----------------------------------
//! 0       8     magic      "RFBACKUP"
//! 8       4     version    Format version (currently 1)
//! 12      8     data_len   Byte length of the archived image
//! 20      8     checksum   CRC-64/ECMA-182 over the image bytes
//! 28      4     reserved
//! 32      ...   image      Raw data-file bytes
//! ```
//!
//! ## Restore Discipline
//!
//! `restore_backup` validates magic, version, and checksum over the full
//! image *before* a single byte is written to the destination. A restore
//! that fails validation leaves the destination untouched and surfaces a
//! [`DataFileCorruptedError`].

use std::path::Path;

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::device::RandomAccess;
use super::file::FileDevice;
use crate::error::DataFileCorruptedError;

pub const BACKUP_MAGIC: &[u8; 8] = b"RFBACKUP";
pub const BACKUP_VERSION: u32 = 1;
pub const BACKUP_HEADER_SIZE: usize = 32;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);
const COPY_CHUNK: usize = 64 * 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BackupHeader {
    magic: [u8; 8],
    version: U32,
    data_len: U64,
    checksum: U64,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<BackupHeader>() == BACKUP_HEADER_SIZE);

/// Snapshots the full contents of `main` into the archive at `path`,
/// replacing any previous archive.
pub fn write_backup(main: &mut dyn RandomAccess, path: &Path) -> Result<()> {
    let data_len = main.len();
    let mut dest = FileDevice::open(path, false)?;
    dest.truncate(0)?;

    // Placeholder header first; the checksum is known only after the image
    // has streamed through the digest.
    let mut header = BackupHeader {
        magic: *BACKUP_MAGIC,
        version: U32::new(BACKUP_VERSION),
        data_len: U64::new(data_len),
        checksum: U64::new(0),
        reserved: [0u8; 4],
    };
    dest.write_at(0, header.as_bytes())?;

    let mut digest = CRC64.digest();
    let mut chunk = vec![0u8; COPY_CHUNK];
    let mut offset = 0u64;

    while offset < data_len {
        let len = COPY_CHUNK.min((data_len - offset) as usize);
        main.read_at(offset, &mut chunk[..len])?;
        digest.update(&chunk[..len]);
        dest.write_all(&chunk[..len])?;
        offset += len as u64;
    }

    header.checksum = U64::new(digest.finalize());
    dest.write_at(0, header.as_bytes())?;
    dest.sync()
        .wrap_err_with(|| format!("failed to sync backup archive '{}'", path.display()))
}

/// Reads and validates the archive header; returns the image length.
fn validate(src: &mut FileDevice, path: &Path) -> Result<u64> {
    let mut header_buf = [0u8; BACKUP_HEADER_SIZE];
    src.read_at(0, &mut header_buf)
        .wrap_err_with(|| format!("backup archive '{}' is unreadable", path.display()))?;

    let header = BackupHeader::read_from_bytes(&header_buf)
        .map_err(|e| eyre::eyre!("invalid backup header: {:?}", e))?;

    ensure!(
        &header.magic == BACKUP_MAGIC,
        "'{}' is not a backup archive",
        path.display()
    );
    ensure!(
        header.version.get() == BACKUP_VERSION,
        "unsupported backup archive version {} in '{}'",
        header.version.get(),
        path.display()
    );

    let data_len = header.data_len.get();
    ensure!(
        src.len() >= BACKUP_HEADER_SIZE as u64 + data_len,
        "backup archive '{}' is truncated",
        path.display()
    );

    let mut digest = CRC64.digest();
    let mut chunk = vec![0u8; COPY_CHUNK];
    let mut remaining = data_len;
    src.seek(BACKUP_HEADER_SIZE as u64)?;

    while remaining > 0 {
        let len = COPY_CHUNK.min(remaining as usize);
        src.read_exact(&mut chunk[..len])?;
        digest.update(&chunk[..len]);
        remaining -= len as u64;
    }

    if digest.finalize() != header.checksum.get() {
        bail!(DataFileCorruptedError {
            file: path.to_path_buf(),
            offset: BACKUP_HEADER_SIZE as u64,
            detail: "backup archive checksum mismatch".into(),
        });
    }

    Ok(data_len)
}

/// Restores the archived image over `dest`. Validation happens over the
/// whole archive before the destination is touched.
pub fn restore_backup(path: &Path, dest: &mut dyn RandomAccess) -> Result<u64> {
    let mut src = FileDevice::open(path, true)?;
    let data_len = validate(&mut src, path)?;

    let mut chunk = vec![0u8; COPY_CHUNK];
    let mut offset = 0u64;

    while offset < data_len {
        let len = COPY_CHUNK.min((data_len - offset) as usize);
        src.read_at(BACKUP_HEADER_SIZE as u64 + offset, &mut chunk[..len])?;
        dest.write_at(offset, &chunk[..len])?;
        offset += len as u64;
    }

    if dest.len() > data_len {
        dest.truncate(data_len)?;
    }
    dest.sync()?;
    Ok(data_len)
}

/// Removes a stale archive, ignoring a missing file.
pub fn remove_backup(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .wrap_err_with(|| format!("failed to remove backup archive '{}'", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryDevice;
    use tempfile::tempdir;

    fn device_with(bytes: &[u8]) -> MemoryDevice {
        let mut dev = MemoryDevice::new();
        dev.write_at(0, bytes).unwrap();
        dev
    }

    #[test]
    fn snapshot_and_restore_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.backup");
        let image: Vec<u8> = (0..100_000).map(|i| (i % 241) as u8).collect();
        let mut main = device_with(&image);

        write_backup(&mut main, &path).unwrap();

        let mut dest = MemoryDevice::new();
        let restored = restore_backup(&path, &mut dest).unwrap();

        assert_eq!(restored, image.len() as u64);
        let mut buf = vec![0u8; image.len()];
        dest.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, image);
    }

    #[test]
    fn restore_truncates_longer_destination() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.backup");
        let mut main = device_with(&[1u8; 64]);

        write_backup(&mut main, &path).unwrap();

        let mut dest = device_with(&[9u8; 256]);
        restore_backup(&path, &mut dest).unwrap();

        assert_eq!(dest.len(), 64);
    }

    #[test]
    fn corrupted_image_is_rejected_before_restore() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.backup");
        let mut main = device_with(&[5u8; 512]);

        write_backup(&mut main, &path).unwrap();

        // Flip one image byte.
        let mut raw = std::fs::read(&path).unwrap();
        raw[BACKUP_HEADER_SIZE + 100] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let mut dest = device_with(&[7u8; 512]);
        let err = restore_backup(&path, &mut dest).unwrap_err();

        assert!(err.downcast_ref::<DataFileCorruptedError>().is_some());
        let mut buf = [0u8; 512];
        dest.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 512], "failed validation must not touch dest");
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.backup");
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let mut dest = MemoryDevice::new();
        assert!(restore_backup(&path, &mut dest).is_err());
    }

    #[test]
    fn truncated_archive_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.backup");
        let mut main = device_with(&[3u8; 1024]);

        write_backup(&mut main, &path).unwrap();

        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 10]).unwrap();

        let mut dest = MemoryDevice::new();
        assert!(restore_backup(&path, &mut dest).is_err());
    }

    #[test]
    fn rewrite_replaces_previous_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.backup");

        let mut first = device_with(&[1u8; 2048]);
        write_backup(&mut first, &path).unwrap();

        let mut second = device_with(&[2u8; 32]);
        write_backup(&mut second, &path).unwrap();

        let mut dest = MemoryDevice::new();
        let restored = restore_backup(&path, &mut dest).unwrap();
        assert_eq!(restored, 32);
    }

    #[test]
    fn remove_backup_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.backup");

        remove_backup(&path).unwrap();

        let mut main = device_with(&[1u8; 16]);
        write_backup(&mut main, &path).unwrap();
        remove_backup(&path).unwrap();

        assert!(!path.exists());
        remove_backup(&path).unwrap();
    }
}
