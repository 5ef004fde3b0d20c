//! # Defragmentation Rewrite
//!
//! Free space that the bounded allocator abandoned ("lost" bytes) is only
//! reclaimed by rewriting the data file compactly. The rewrite streams
//! every live row, in ascending old position, into a fresh `.new` file laid
//! out back-to-back after the header. The page store swaps the files
//! atomically afterward and hands the old→new position mapping to its row
//! stores so index roots and node tables can be rebuilt.
//!
//! The pass reads through the device abstraction, so it works identically
//! over plain-file and mapped stores.

use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use zerocopy::IntoBytes;

use super::device::RandomAccess;
use super::file::FileDevice;
use super::header::FileHeader;
use crate::config::{HEADER_SIZE, ROW_LENGTH_PREFIX};

/// Copies `live` rows (abstract positions, any order) from `src` into a
/// fresh compact file at `dest_path`. Returns the old→new position mapping
/// and the new end-of-file pointer in bytes.
pub(crate) fn copy_live_rows(
    src: &mut dyn RandomAccess,
    dest_path: &Path,
    live: &[u64],
    scale: u32,
    shadowed: bool,
) -> Result<(HashMap<u64, u64>, u64)> {
    let mut dest = FileDevice::open(dest_path, false)
        .wrap_err_with(|| format!("failed to create defrag target '{}'", dest_path.display()))?;
    dest.truncate(0)?;

    // The provisional header is written unclean; only the final header
    // (after every row landed) carries SAVED, so an interrupted pass can
    // never be mistaken for a complete replacement.
    let mut provisional = FileHeader::new(scale, shadowed);
    provisional.set_flag(crate::storage::header::FLAG_SAVED, false);
    dest.write_at(0, provisional.as_bytes())?;

    let mut positions: Vec<u64> = live.to_vec();
    positions.sort_unstable();
    positions.dedup();

    let mut mapping = HashMap::with_capacity(positions.len());
    let mut write_pos = (HEADER_SIZE as u64).div_ceil(scale as u64) * scale as u64;
    let mut row_buf: Vec<u8> = Vec::new();

    for old_pos in positions {
        let offset = old_pos * scale as u64;

        let mut prefix = [0u8; ROW_LENGTH_PREFIX];
        src.read_at(offset, &mut prefix)
            .wrap_err_with(|| format!("failed to read row length at position {}", old_pos))?;
        let len = u32::from_be_bytes(prefix) as usize;

        ensure!(
            len >= ROW_LENGTH_PREFIX && offset + len as u64 <= src.len(),
            "row at position {} has corrupt length {}",
            old_pos,
            len
        );

        row_buf.resize(len, 0);
        row_buf[..ROW_LENGTH_PREFIX].copy_from_slice(&prefix);
        src.read_exact(&mut row_buf[ROW_LENGTH_PREFIX..])?;

        let padded = (len as u64).div_ceil(scale as u64) * scale as u64;
        dest.write_at(write_pos, &row_buf)?;

        mapping.insert(old_pos, write_pos / scale as u64);
        write_pos += padded;
    }

    // The swapped-in file must open clean: correct free pointer, zero lost
    // bytes, SAVED set.
    let mut final_header = FileHeader::new(scale, shadowed);
    final_header.set_free_pos(write_pos);
    final_header.set_free_bytes(0);
    dest.write_at(0, final_header.as_bytes())?;
    dest.ensure_len(write_pos);
    dest.sync()?;

    Ok((mapping, write_pos))
}
