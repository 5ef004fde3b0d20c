//! # Data File Cache — the Page Store
//!
//! `DataFileCache` owns one data file and everything that keeps it honest:
//! the block device, the 32-byte header, the free-space allocator, the
//! bounded row cache, and (in incremental-backup mode) the shadow file. Row
//! stores talk to it in abstract positions; it talks to the device in
//! bytes.
//!
//! ## Life Cycle
//!
//! ```text
//! closed ──open()──> opening ──> open ──close()──> closing ──> closed
//!                      │
//!                      └─ header says unclean shutdown?
//!                         restore from shadow / backup first
//! ```
//!
//! Opening reads the header, refuses incompatible formats, and — when the
//! `SAVED` flag is down — rolls the file back to its last commit point from
//! the shadow stream (incremental mode) or the full backup archive before
//! anything else sees it. Leftover `.new`/`.old` replacement files from an
//! interrupted defragmentation are resolved before the header is even read.
//!
//! ## Locking
//!
//! One `parking_lot::RwLock` guards all mutable state. Reads that hit the
//! cache share the read lock; everything else — including the file I/O it
//! performs — runs under the write lock. That is a deliberate tradeoff:
//! writes are simple and obviously correct, at the cost of holding the lock
//! across I/O.
//!
//! A cache miss cannot upgrade its read lock (upgradeable locks reenter
//! badly); instead the miss path releases the read lock, takes the write
//! lock, and re-checks the cache before decoding. Two threads racing the
//! same miss decode once: the loser of the race finds the winner's entry in
//! the re-check.
//!
//! ## Durability Protocol
//!
//! - First mutation after a clean point: shadow-copy page 0, then clear the
//!   header `SAVED` bit on disk. From here the file is "dirty".
//! - Every in-place row write is preceded by a shadow copy of its byte
//!   range (incremental mode).
//! - `commit_changes`: flush dirty rows ascending, persist free-space
//!   totals and the end-of-file pointer, set `SAVED`, sync, drop the shadow
//!   stream, and (full-backup mode) refresh the backup archive so the next
//!   restore point is this commit.
//!
//! ## Space Accounting
//!
//! `add` allocates before any byte is written: either a freed range from
//! the allocator or fresh space at the end-of-file pointer. The file is
//! capped at `2^31 * scale` bytes — positions are 31-bit — and a medium
//! that refuses to grow surfaces as [`DataFileFullError`], distinct from
//! I/O failure, so the caller can fail one statement instead of the engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use zerocopy::IntoBytes;

use super::backup::{remove_backup, restore_backup, write_backup};
use super::cache::RowCache;
use super::defrag::copy_live_rows;
use super::device::{AnyDevice, RandomAccess};
use super::file::FileDevice;
use super::freespace::FreeSpaceMap;
use super::header::{FileHeader, FLAG_SAVED, FLAG_SHADOWED};
use super::memory::MemoryDevice;
use super::shadow::ShadowFile;
use crate::codec::{CachedObject, RowCodec};
use crate::config::{
    DeviceKind, ScaledFileConfig, BACKUP_SUFFIX, FREE_SPACE_CAPACITY, HEADER_SIZE,
    MAX_OBJECT_POSITION, MMAP_MAX_FILE_SIZE, NEW_SUFFIX, OLD_SUFFIX, ROW_LENGTH_PREFIX,
    SHADOW_PAGE_SIZE, SHADOW_SUFFIX,
};
use crate::error::{DataFileCorruptedError, DataFileFullError, WrongFileVersionError};

struct StoreState<O> {
    device: AnyDevice,
    header: FileHeader,
    cache: RowCache<O>,
    spaces: FreeSpaceMap,
    shadow: Option<ShadowFile>,
    free_pos: u64,
    file_modified: bool,
    open: bool,
    store_count: u32,
    out_buf: Vec<u8>,
    in_buf: Vec<u8>,
}

pub struct DataFileCache<C: RowCodec> {
    path: PathBuf,
    config: ScaledFileConfig,
    codec: C,
    state: RwLock<StoreState<C::Object>>,
}

impl<C: RowCodec> std::fmt::Debug for DataFileCache<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFileCache")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Reads the header of `path` without keeping the file open. `None` when
/// the file is too short or unparseable.
fn peek_header(path: &Path) -> Option<FileHeader> {
    let mut device = FileDevice::open(path, true).ok()?;
    if device.len() < HEADER_SIZE as u64 {
        return None;
    }
    let mut buf = [0u8; HEADER_SIZE];
    device.read_at(0, &mut buf).ok()?;
    FileHeader::from_bytes(&buf).ok().copied()
}

/// Resolves leftover `.new`/`.old` files from an interrupted replacement
/// swap. A complete `.new` (clean header) is adopted when the main file is
/// gone; a surviving `.old` restores the pre-swap file; everything else is
/// deleted.
fn cleanup_replacement_files(path: &Path) -> Result<()> {
    let new_path = suffixed(path, NEW_SUFFIX);
    let old_path = suffixed(path, OLD_SUFFIX);

    if new_path.exists() {
        let complete = peek_header(&new_path)
            .map(|h| h.format_accepted() && h.has_flag(FLAG_SAVED))
            .unwrap_or(false);

        if complete && !path.exists() {
            info!(file = %path.display(), "adopting completed replacement file");
            std::fs::rename(&new_path, path)
                .wrap_err("failed to adopt completed replacement file")?;
        } else {
            std::fs::remove_file(&new_path)
                .wrap_err("failed to remove incomplete replacement file")?;
        }
    }

    if old_path.exists() {
        if path.exists() {
            std::fs::remove_file(&old_path)
                .wrap_err("failed to remove leftover pre-swap file")?;
        } else {
            info!(file = %path.display(), "restoring pre-swap data file");
            std::fs::rename(&old_path, path).wrap_err("failed to restore pre-swap file")?;
        }
    }

    Ok(())
}

/// Serializes `object` and writes it at its position, shadow-copying the
/// byte range first when incremental backup is armed.
fn write_row_bytes<C: RowCodec>(
    codec: &C,
    device: &mut AnyDevice,
    shadow: &mut Option<ShadowFile>,
    scale: u32,
    out_buf: &mut Vec<u8>,
    object: &C::Object,
) -> Result<()> {
    let offset = object.position() * scale as u64;
    let storage = object.storage_size();

    out_buf.clear();
    out_buf.extend_from_slice(&[0u8; ROW_LENGTH_PREFIX]);
    codec.serialize(object, out_buf)?;

    let len = out_buf.len();
    if len > storage {
        bail!(crate::error::CacheConsistencyError {
            position: object.position(),
            detail: "serialized row exceeds its storage allocation",
        });
    }
    out_buf[..ROW_LENGTH_PREFIX].copy_from_slice(&(len as u32).to_be_bytes());

    if let Some(sh) = shadow {
        sh.copy(device, offset, storage)?;
    }

    device.ensure_len(offset + storage as u64);
    device.write_at(offset, out_buf)
}

impl<C: RowCodec> DataFileCache<C> {
    /// Opens (or creates) the store at `path`, recovering from an unclean
    /// previous session first when the header demands it.
    pub fn open<P: AsRef<Path>>(path: P, config: ScaledFileConfig, codec: C) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let scale = config.scale();
        let in_memory = config.device() == DeviceKind::Memory;

        if !in_memory {
            cleanup_replacement_files(&path)?;
        }

        let exists = !in_memory
            && path.exists()
            && std::fs::metadata(&path)?.len() >= HEADER_SIZE as u64;

        ensure!(
            exists || !config.read_only(),
            "cannot open missing data file '{}' read-only",
            path.display()
        );

        if exists {
            Self::recover_if_unclean(&path, &config)?;
        }

        let kind = Self::effective_kind(&path, &config, exists);
        let mut device = AnyDevice::open(kind, &path, config.read_only(), HEADER_SIZE as u64)?;

        let header = if exists {
            let mut buf = [0u8; HEADER_SIZE];
            device.read_at(0, &mut buf)?;
            let mut header = *FileHeader::from_bytes(&buf)?;

            if !header.format_accepted() {
                bail!(WrongFileVersionError {
                    file: path.clone(),
                    flags: header.flags(),
                });
            }

            // The flag must track this session's backup mode, not the
            // previous session's; it reaches disk with the first
            // mutation's flag write.
            header.set_flag(FLAG_SHADOWED, config.incremental_backup());
            header
        } else {
            let header = FileHeader::new(scale, config.incremental_backup());
            if in_memory || !config.read_only() {
                device.write_at(0, header.as_bytes())?;
                device.ensure_len(header.free_pos());
            }
            header
        };

        let writable = !config.read_only();
        let shadow_path = suffixed(&path, SHADOW_SUFFIX);
        let backup_path = suffixed(&path, BACKUP_SUFFIX);

        // A clean header with a leftover shadow stream means the last
        // commit finished but its cleanup did not.
        if writable && shadow_path.exists() {
            std::fs::remove_file(&shadow_path).wrap_err("failed to remove stale shadow file")?;
        }

        let shadow = if writable && !in_memory && config.incremental_backup() {
            Some(ShadowFile::new(&shadow_path, SHADOW_PAGE_SIZE))
        } else {
            None
        };

        if writable && !in_memory && !config.incremental_backup() && !backup_path.exists() {
            write_backup(&mut device, &backup_path)?;
        }

        let mut spaces = FreeSpaceMap::new(FREE_SPACE_CAPACITY, scale);
        spaces.set_lost_bytes(header.free_bytes());

        let free_pos = header.free_pos();
        debug!(
            file = %path.display(),
            free_pos,
            lost_bytes = header.free_bytes(),
            "data file opened"
        );

        Ok(Self {
            path,
            codec,
            state: RwLock::new(StoreState {
                device,
                header,
                cache: RowCache::new(config.max_cache_rows(), config.max_cache_bytes()),
                spaces,
                shadow,
                free_pos,
                file_modified: false,
                open: true,
                store_count: 0,
                out_buf: Vec::new(),
                in_buf: Vec::new(),
            }),
            config,
        })
    }

    /// Rolls the file back to its last commit point when the previous
    /// session ended uncleanly.
    fn recover_if_unclean(path: &Path, config: &ScaledFileConfig) -> Result<()> {
        let Some(header) = peek_header(path) else {
            bail!(DataFileCorruptedError {
                file: path.to_path_buf(),
                offset: 0,
                detail: "unreadable file header".into(),
            });
        };

        if !header.format_accepted() {
            bail!(WrongFileVersionError {
                file: path.to_path_buf(),
                flags: header.flags(),
            });
        }

        if header.has_flag(FLAG_SAVED) {
            return Ok(());
        }

        ensure!(
            !config.read_only(),
            "data file '{}' needs crash recovery but is opened read-only",
            path.display()
        );

        let shadow_path = suffixed(path, SHADOW_SUFFIX);
        let backup_path = suffixed(path, BACKUP_SUFFIX);

        if header.has_flag(FLAG_SHADOWED) && shadow_path.exists() {
            warn!(file = %path.display(), "unclean shutdown: restoring from shadow file");
            let applied = ShadowFile::restore_file(&shadow_path, path)
                .map_err(|e| {
                    error!(file = %path.display(), "shadow restore failed");
                    e
                })
                .wrap_err("crash recovery from shadow file failed")?;
            info!(file = %path.display(), applied, "shadow restore complete");
            std::fs::remove_file(&shadow_path)
                .wrap_err("failed to remove replayed shadow file")?;
        } else if backup_path.exists() {
            warn!(file = %path.display(), "unclean shutdown: restoring from backup archive");
            let mut device = FileDevice::open(path, false)?;
            restore_backup(&backup_path, &mut device)
                .map_err(|e| {
                    error!(file = %path.display(), "backup restore failed");
                    e
                })
                .wrap_err("crash recovery from backup archive failed")?;
        } else {
            bail!(DataFileCorruptedError {
                file: path.to_path_buf(),
                offset: 0,
                detail: "unclean shutdown with no shadow file or backup archive".into(),
            });
        }

        let restored = peek_header(path).ok_or_else(|| {
            eyre::eyre!("data file header unreadable after crash recovery")
        })?;
        ensure!(
            restored.has_flag(FLAG_SAVED),
            "crash recovery did not produce a clean data file"
        );

        Ok(())
    }

    fn effective_kind(path: &Path, config: &ScaledFileConfig, exists: bool) -> DeviceKind {
        match config.device() {
            DeviceKind::Memory => DeviceKind::Memory,
            DeviceKind::File => DeviceKind::File,
            DeviceKind::Mmap => {
                let too_big = exists
                    && std::fs::metadata(path)
                        .map(|m| m.len() > MMAP_MAX_FILE_SIZE)
                        .unwrap_or(true);
                if too_big {
                    DeviceKind::File
                } else {
                    DeviceKind::Mmap
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scale(&self) -> u32 {
        self.config.scale()
    }

    pub fn is_open(&self) -> bool {
        self.state.read().open
    }

    pub fn is_modified(&self) -> bool {
        self.state.read().file_modified
    }

    /// End-of-file / next-allocation pointer, in bytes.
    pub fn free_pos(&self) -> u64 {
        self.state.read().free_pos
    }

    pub fn total_free_bytes(&self) -> u64 {
        self.state.read().spaces.total_free_bytes()
    }

    pub fn cached_rows(&self) -> usize {
        self.state.read().cache.len()
    }

    pub fn cached_bytes(&self) -> usize {
        self.state.read().cache.bytes()
    }

    /// Clears the SAVED bit on the first mutation of an interval, shadowing
    /// the header page first so a crash can put it back.
    fn mark_modified(&self, state: &mut StoreState<C::Object>) -> Result<()> {
        if state.file_modified {
            return Ok(());
        }

        let StoreState {
            device,
            shadow,
            header,
            ..
        } = state;

        if let Some(sh) = shadow {
            sh.copy(device, 0, HEADER_SIZE)?;
        }

        header.set_flag(FLAG_SAVED, false);
        device.write_at(28, &header.flags().to_be_bytes())?;
        state.file_modified = true;
        Ok(())
    }

    fn cleanup_if_needed(&self, state: &mut StoreState<C::Object>) -> Result<()> {
        if !state.cache.over_limit() {
            return Ok(());
        }

        let StoreState {
            cache,
            device,
            shadow,
            out_buf,
            ..
        } = state;

        let evicted = cache.force_cleanup(|obj| {
            write_row_bytes(&self.codec, device, shadow, self.config.scale(), out_buf, obj)
        })?;

        debug!(evicted, "row cache cleanup");
        Ok(())
    }

    /// Returns the row at `position`, reading and decoding it on a cache
    /// miss. `keep` pins the row against eviction until [`Self::unpin`].
    pub fn get(&self, position: u64, keep: bool) -> Result<Arc<C::Object>> {
        {
            let state = self.state.read();
            ensure!(state.open, "data file cache is closed");
            if let Some(obj) = state.cache.get(position, keep) {
                return Ok(obj);
            }
        }

        // Optimistic read missed: take the write lock and re-check, since
        // another thread may have decoded this row while we waited.
        let mut state = self.state.write();
        ensure!(state.open, "data file cache is closed");
        if let Some(obj) = state.cache.get(position, keep) {
            return Ok(obj);
        }

        let object = self.read_object(&mut state, position)?;
        let object = Arc::new(object);
        state.cache.put(position, Arc::clone(&object), false)?;
        if keep {
            state.cache.set_keep(position, true);
        }

        self.cleanup_if_needed(&mut state)?;
        Ok(object)
    }

    fn read_object(&self, state: &mut StoreState<C::Object>, position: u64) -> Result<C::Object> {
        let scale = self.config.scale() as u64;
        let offset = position * scale;

        let len = self.read_row_length(state, position)?;

        let StoreState { device, in_buf, .. } = state;
        in_buf.resize(len - ROW_LENGTH_PREFIX, 0);
        device
            .read_at(offset + ROW_LENGTH_PREFIX as u64, in_buf)
            .map_err(|e| {
                error!(file = %self.path.display(), offset, "row read failed");
                e
            })?;

        match self.codec.deserialize(position, in_buf) {
            Ok(object) => Ok(object),
            Err(first) => {
                // One retry after a forced cleanup, in case the failure was
                // transient memory pressure rather than bad bytes.
                warn!(
                    file = %self.path.display(),
                    offset,
                    "row decode failed, retrying after cache cleanup"
                );
                self.force_cleanup_now(state)?;

                let StoreState { device, in_buf, .. } = state;
                device.read_at(offset + ROW_LENGTH_PREFIX as u64, in_buf)?;
                match self.codec.deserialize(position, in_buf) {
                    Ok(object) => Ok(object),
                    Err(second) => {
                        error!(
                            file = %self.path.display(),
                            offset,
                            "row decode failed after retry"
                        );
                        Err(second.wrap_err(first).wrap_err(DataFileCorruptedError {
                            file: self.path.clone(),
                            offset,
                            detail: "row payload failed to deserialize".into(),
                        }))
                    }
                }
            }
        }
    }

    fn force_cleanup_now(&self, state: &mut StoreState<C::Object>) -> Result<()> {
        let StoreState {
            cache,
            device,
            shadow,
            out_buf,
            ..
        } = state;

        cache.force_cleanup(|obj| {
            write_row_bytes(&self.codec, device, shadow, self.config.scale(), out_buf, obj)
        })?;
        Ok(())
    }

    /// Reads and sanity-checks a row's length prefix.
    fn read_row_length(&self, state: &mut StoreState<C::Object>, position: u64) -> Result<usize> {
        let scale = self.config.scale() as u64;
        let offset = position * scale;

        let mut prefix = [0u8; ROW_LENGTH_PREFIX];
        state.device.read_at(offset, &mut prefix).map_err(|e| {
            error!(file = %self.path.display(), offset, "row length read failed");
            e
        })?;
        let len = u32::from_be_bytes(prefix) as usize;

        if len < ROW_LENGTH_PREFIX || offset + len as u64 > state.device.len() {
            error!(file = %self.path.display(), offset, len, "corrupt row length prefix");
            bail!(DataFileCorruptedError {
                file: self.path.clone(),
                offset,
                detail: format!("corrupt row length prefix {}", len),
            });
        }

        Ok(len)
    }

    /// Allocates storage for `object`, assigns its position, and caches it
    /// dirty. The bytes reach the file on eviction, save, or commit.
    pub fn add(&self, mut object: C::Object) -> Result<Arc<C::Object>> {
        let mut state = self.state.write();
        ensure!(state.open, "data file cache is closed");
        ensure!(!self.config.read_only(), "data file cache is read-only");

        let scale = self.config.scale();
        let size = object.storage_size();
        ensure!(
            size >= ROW_LENGTH_PREFIX && size % scale as usize == 0,
            "storage size {} is not a positive multiple of the scale {}",
            size,
            scale
        );

        self.mark_modified(&mut state)?;

        let offset = match state.spaces.take(size as u32) {
            Some(offset) => offset,
            None => {
                let offset = state.free_pos;
                let end = offset + size as u64;
                let limit = MAX_OBJECT_POSITION * scale as u64;

                // Allocation fails before any byte is written, so a full
                // file never corrupts structure.
                if end > limit {
                    bail!(DataFileFullError {
                        requested: size,
                        file_limit: limit,
                    });
                }
                if !state.device.ensure_len(end) {
                    bail!(DataFileFullError {
                        requested: size,
                        file_limit: limit,
                    });
                }

                state.free_pos = end;
                offset
            }
        };

        let position = offset / scale as u64;
        object.set_position(position);

        let object = Arc::new(object);
        state.cache.put(position, Arc::clone(&object), true)?;

        self.cleanup_if_needed(&mut state)?;
        Ok(object)
    }

    /// Destroys the row at `position`, returning its storage to the
    /// free-space pool. Returns the cached object when one was resident.
    pub fn remove(&self, position: u64) -> Result<Option<Arc<C::Object>>> {
        let mut state = self.state.write();
        ensure!(state.open, "data file cache is closed");
        ensure!(!self.config.read_only(), "data file cache is read-only");

        self.mark_modified(&mut state)?;

        let released = state.cache.release(position);

        let scale = self.config.scale();
        let size = match &released {
            Some(object) => object.storage_size(),
            None => {
                let len = self.read_row_length(&mut state, position)?;
                len.div_ceil(scale as usize) * scale as usize
            }
        };

        state.spaces.give(position * scale as u64, size as u32);
        Ok(released)
    }

    /// Writes one row through to the file immediately, shadow-copying its
    /// range first. Clears the row's dirty flag if it is cached.
    pub fn save_row(&self, object: &C::Object) -> Result<()> {
        let mut state = self.state.write();
        ensure!(state.open, "data file cache is closed");
        ensure!(!self.config.read_only(), "data file cache is read-only");

        self.mark_modified(&mut state)?;

        let StoreState {
            device,
            shadow,
            out_buf,
            cache,
            ..
        } = &mut *state;

        write_row_bytes(&self.codec, device, shadow, self.config.scale(), out_buf, object)?;
        cache.set_dirty(object.position(), false);
        Ok(())
    }

    /// Defers the write: the row is flushed by eviction, `save_row`, or the
    /// next commit. Returns false when the position is not cached.
    pub fn mark_dirty(&self, position: u64) -> Result<bool> {
        let mut state = self.state.write();
        ensure!(state.open, "data file cache is closed");
        ensure!(!self.config.read_only(), "data file cache is read-only");

        self.mark_modified(&mut state)?;
        Ok(state.cache.set_dirty(position, true))
    }

    /// Drops the row from the cache without destroying its storage; the
    /// next `get` re-reads it from the file. A dirty row is written through
    /// first so the change is not lost.
    pub fn release_row(&self, position: u64) -> Result<bool> {
        let mut state = self.state.write();
        ensure!(state.open, "data file cache is closed");

        if state.cache.is_dirty(position) {
            if let Some(object) = state.cache.get(position, false) {
                let StoreState {
                    device,
                    shadow,
                    out_buf,
                    ..
                } = &mut *state;
                write_row_bytes(
                    &self.codec,
                    device,
                    shadow,
                    self.config.scale(),
                    out_buf,
                    &object,
                )?;
            }
        }

        Ok(state.cache.release(position).is_some())
    }

    /// Releases a pin taken by `get(position, true)`.
    pub fn unpin(&self, position: u64) {
        let state = self.state.read();
        state.cache.set_keep(position, false);
    }

    /// Flushes every dirty row, persists the header, syncs, and ends the
    /// backup interval. The file is clean after this returns.
    pub fn commit_changes(&self) -> Result<()> {
        let mut state = self.state.write();
        ensure!(state.open, "data file cache is closed");
        ensure!(!self.config.read_only(), "data file cache is read-only");

        self.commit_locked(&mut state)
    }

    fn commit_locked(&self, state: &mut StoreState<C::Object>) -> Result<()> {
        {
            let StoreState {
                cache,
                device,
                shadow,
                out_buf,
                ..
            } = state;

            cache
                .save_all(|obj| {
                    write_row_bytes(
                        &self.codec,
                        device,
                        shadow,
                        self.config.scale(),
                        out_buf,
                        obj,
                    )
                })
                .map_err(|e| {
                    error!(file = %self.path.display(), "dirty row flush failed");
                    e
                })?;
        }

        state.header.set_free_bytes(state.spaces.total_free_bytes());
        state.header.set_free_pos(state.free_pos);
        state.header.set_flag(FLAG_SAVED, true);

        let header_bytes = state.header.as_bytes().to_vec();
        state.device.write_at(0, &header_bytes)?;
        state.device.sync().map_err(|e| {
            error!(file = %self.path.display(), "commit sync failed");
            e
        })?;

        if let Some(sh) = &mut state.shadow {
            sh.close_and_reset()?;
        }

        if self.wants_full_backup() {
            self.refresh_backup(state)?;
        }

        state.file_modified = false;
        debug!(file = %self.path.display(), free_pos = state.free_pos, "commit complete");
        Ok(())
    }

    fn wants_full_backup(&self) -> bool {
        !self.config.incremental_backup()
            && !self.config.read_only()
            && self.config.device() != DeviceKind::Memory
    }

    /// Rewrites the backup archive to match the file's current (clean)
    /// contents. Written to a side file first so a crash mid-write leaves
    /// the previous archive intact.
    fn refresh_backup(&self, state: &mut StoreState<C::Object>) -> Result<()> {
        let backup_path = suffixed(&self.path, BACKUP_SUFFIX);
        let staging = suffixed(&backup_path, NEW_SUFFIX);

        write_backup(&mut state.device, &staging)?;
        std::fs::rename(&staging, &backup_path).wrap_err("failed to swap in backup archive")?;
        Ok(())
    }

    /// Closes the store. `write=true` commits first; `write=false` is the
    /// fast path that abandons this session's unflushed changes — the next
    /// open rolls back to the last commit point, exactly as a crash would.
    pub fn close(&self, write: bool) -> Result<()> {
        let mut state = self.state.write();
        if !state.open {
            return Ok(());
        }

        if write && !self.config.read_only() {
            self.commit_locked(&mut state)?;
        }

        state.open = false;
        state.cache.clear();
        debug!(file = %self.path.display(), write, "data file closed");
        Ok(())
    }

    /// Compacts the file: every live row is rewritten back-to-back into a
    /// replacement file which is then swapped in atomically. Returns the
    /// old→new position mapping so callers can rebuild index roots. The
    /// row cache is emptied — every resident position changed.
    pub fn defrag(&self, live_positions: &[u64]) -> Result<HashMap<u64, u64>> {
        let mut state = self.state.write();
        ensure!(state.open, "data file cache is closed");
        ensure!(!self.config.read_only(), "data file cache is read-only");
        ensure!(
            self.config.device() != DeviceKind::Memory,
            "defragmentation requires a file-backed store"
        );

        self.commit_locked(&mut state)?;

        let new_path = suffixed(&self.path, NEW_SUFFIX);
        let old_path = suffixed(&self.path, OLD_SUFFIX);
        let scale = self.config.scale();

        // The copy pass reads the whole file front to back.
        state.device.prefetch(0, state.free_pos as usize);

        let (mapping, new_free_pos) = copy_live_rows(
            &mut state.device,
            &new_path,
            live_positions,
            scale,
            self.config.incremental_backup(),
        )?;

        // Swap. The device must release its handle before the renames.
        let old_device = std::mem::replace(
            &mut state.device,
            AnyDevice::Memory(MemoryDevice::new()),
        );
        drop(old_device);

        std::fs::rename(&self.path, &old_path).wrap_err("defrag: failed to set aside old file")?;
        std::fs::rename(&new_path, &self.path).wrap_err("defrag: failed to swap in new file")?;
        std::fs::remove_file(&old_path).wrap_err("defrag: failed to remove old file")?;

        let kind = Self::effective_kind(&self.path, &self.config, true);
        state.device = AnyDevice::open(kind, &self.path, false, HEADER_SIZE as u64)?;

        let mut buf = [0u8; HEADER_SIZE];
        state.device.read_at(0, &mut buf)?;
        state.header = *FileHeader::from_bytes(&buf)?;

        state.free_pos = new_free_pos;
        state.spaces.clear();
        state.cache.clear();
        state.file_modified = false;

        if let Some(sh) = &mut state.shadow {
            sh.close_and_reset()?;
        }
        if self.wants_full_backup() {
            self.refresh_backup(&mut state)?;
        }

        info!(
            file = %self.path.display(),
            rows = mapping.len(),
            free_pos = new_free_pos,
            "defragmentation complete"
        );
        Ok(mapping)
    }

    /// Registers a pooled temporary store sharing this page store.
    pub fn attach_store(&self) -> u32 {
        let mut state = self.state.write();
        state.store_count += 1;
        state.store_count
    }

    /// Deregisters a pooled store. When the count returns to zero the store
    /// is cleared back to an empty file: cached rows, free-space tracking,
    /// and row data are all discarded.
    pub fn detach_store(&self) -> Result<u32> {
        let mut state = self.state.write();
        ensure!(state.store_count > 0, "detach without a matching attach");

        state.store_count -= 1;
        if state.store_count == 0 {
            let scale = self.config.scale();
            state.cache.clear();
            state.spaces.clear();

            let header = FileHeader::new(scale, self.config.incremental_backup());
            state.free_pos = header.free_pos();
            state.device.truncate(header.free_pos().max(HEADER_SIZE as u64))?;
            state.device.write_at(0, header.as_bytes())?;
            state.header = header;
            state.file_modified = false;
        }

        Ok(state.store_count)
    }

    /// Deletes the backup archive; used by callers that tear a store down
    /// permanently.
    pub fn remove_side_files(&self) -> Result<()> {
        remove_backup(&suffixed(&self.path, BACKUP_SUFFIX))?;
        let shadow_path = suffixed(&self.path, SHADOW_SUFFIX);
        if shadow_path.exists() {
            std::fs::remove_file(&shadow_path).wrap_err("failed to remove shadow file")?;
        }
        Ok(())
    }
}
