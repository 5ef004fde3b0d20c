//! # Bounded Row Cache
//!
//! `RowCache` keeps decoded row objects keyed by file position, bounded both
//! by row count and by total row bytes — whichever binds first. Rows read
//! from the file land here; rows mutated above are marked dirty here and
//! written back when the cache is flushed or when eviction needs their slot.
//!
//! ## Eviction
//!
//! Entries carry a "visited" flag set on every access and a hand pointer
//! sweeps the entry array: a visited entry gets its flag cleared and
//! survives one more round, an unvisited and unpinned entry is evicted.
//! This second-chance sweep keeps frequently-read rows resident while a
//! table scan's one-touch rows recycle quickly, without maintaining strict
//! recency order on every access.
//!
//! A cleanup pass drains occupancy to the low-water mark (3/4 of each
//! limit). Dirty victims are saved before removal, in ascending file
//! position so the write-back I/O is as sequential as the file layout
//! allows. Pinned (`keep`) entries are never evicted and may transiently
//! hold the cache above its limits until unpinned.
//!
//! ## Concurrency
//!
//! The cache itself is not a lock; the owning page store serializes all
//! mutation under its write lock. Access marking, pinning, and dirty flags
//! are atomics so that read-locked lookups can update them without the
//! write lock.
//!
//! ## Consistency
//!
//! Every entry's object reports the position it is keyed under; a mismatch
//! is a programming error surfaced as [`CacheConsistencyError`], never
//! silently accepted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::{HashMap, HashSet};

use crate::codec::CachedObject;
use crate::config::{CACHE_LOW_WATER_DEN, CACHE_LOW_WATER_NUM};
use crate::error::CacheConsistencyError;

struct CacheEntry<O> {
    position: u64,
    object: Arc<O>,
    visited: AtomicBool,
    dirty: AtomicBool,
    keep: AtomicBool,
}

impl<O: CachedObject> CacheEntry<O> {
    fn new(position: u64, object: Arc<O>, dirty: bool) -> Self {
        Self {
            position,
            object,
            visited: AtomicBool::new(true),
            dirty: AtomicBool::new(dirty),
            keep: AtomicBool::new(false),
        }
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn is_kept(&self) -> bool {
        self.keep.load(Ordering::Acquire)
    }
}

pub struct RowCache<O> {
    entries: Vec<CacheEntry<O>>,
    index: HashMap<u64, usize>,
    hand: usize,
    max_rows: usize,
    max_bytes: usize,
    bytes: usize,
}

impl<O: CachedObject> RowCache<O> {
    pub fn new(max_rows: usize, max_bytes: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_rows.min(1024)),
            index: HashMap::with_capacity(max_rows.min(1024)),
            hand: 0,
            max_rows,
            max_bytes,
            bytes: 0,
        }
    }

    /// Pure lookup; no I/O. Marks the entry accessed and pins it when
    /// `keep` is set.
    pub fn get(&self, position: u64, keep: bool) -> Option<Arc<O>> {
        let idx = *self.index.get(&position)?;
        let entry = &self.entries[idx];

        entry.visited.store(true, Ordering::Release);
        if keep {
            entry.keep.store(true, Ordering::Release);
        }

        Some(Arc::clone(&entry.object))
    }

    /// Inserts or replaces the object at `position`.
    pub fn put(&mut self, position: u64, object: Arc<O>, dirty: bool) -> Result<()> {
        if object.position() != position {
            bail!(CacheConsistencyError {
                position,
                detail: "object position does not match its cache key",
            });
        }

        if let Some(&idx) = self.index.get(&position) {
            let entry = &mut self.entries[idx];
            self.bytes -= entry.object.storage_size();
            self.bytes += object.storage_size();
            entry.object = object;
            entry.visited.store(true, Ordering::Release);
            if dirty {
                entry.dirty.store(true, Ordering::Release);
            }
            return Ok(());
        }

        self.bytes += object.storage_size();
        let entry = CacheEntry::new(position, object, dirty);
        let idx = self.entries.len();
        self.entries.push(entry);
        self.index.insert(position, idx);
        Ok(())
    }

    /// Removes and returns the entry's object without writing it back.
    pub fn release(&mut self, position: u64) -> Option<Arc<O>> {
        let idx = self.index.remove(&position)?;
        let entry = self.entries.swap_remove(idx);
        self.bytes -= entry.object.storage_size();

        if idx < self.entries.len() {
            let moved = self.entries[idx].position;
            self.index.insert(moved, idx);
        }

        if self.hand >= self.entries.len() {
            self.hand = 0;
        }

        Some(entry.object)
    }

    /// Empties the cache without write-back. Used after an external full
    /// save has made the file authoritative.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.hand = 0;
        self.bytes = 0;
    }

    pub fn set_dirty(&self, position: u64, dirty: bool) -> bool {
        match self.index.get(&position) {
            Some(&idx) => {
                self.entries[idx].dirty.store(dirty, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn is_dirty(&self, position: u64) -> bool {
        self.index
            .get(&position)
            .map(|&idx| self.entries[idx].is_dirty())
            .unwrap_or(false)
    }

    /// Releases a pin taken by `get(.., keep=true)`.
    pub fn set_keep(&self, position: u64, keep: bool) -> bool {
        match self.index.get(&position) {
            Some(&idx) => {
                self.entries[idx].keep.store(keep, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// True when either capacity limit is exceeded.
    pub fn over_limit(&self) -> bool {
        self.entries.len() > self.max_rows || self.bytes > self.max_bytes
    }

    /// Positions currently resident, unordered. Defragmentation uses this
    /// to flush before rewriting.
    pub fn positions(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.position).collect()
    }

    /// Writes every dirty entry through `writer` in ascending file
    /// position, then clears dirty flags.
    pub fn save_all<F>(&mut self, mut writer: F) -> Result<usize>
    where
        F: FnMut(&O) -> Result<()>,
    {
        let mut dirty: Vec<usize> = (0..self.entries.len())
            .filter(|&i| self.entries[i].is_dirty())
            .collect();
        dirty.sort_unstable_by_key(|&i| self.entries[i].position);

        for &i in &dirty {
            writer(&self.entries[i].object)?;
            self.entries[i].dirty.store(false, Ordering::Release);
        }

        Ok(dirty.len())
    }

    /// Evicts entries down to the low-water mark. Dirty victims are saved
    /// first, ascending by position. Pinned entries are skipped; if every
    /// entry is pinned the pass gives up after two full sweeps.
    pub fn force_cleanup<F>(&mut self, mut writer: F) -> Result<usize>
    where
        F: FnMut(&O) -> Result<()>,
    {
        if self.entries.is_empty() {
            return Ok(0);
        }

        let target_rows = self.max_rows / CACHE_LOW_WATER_DEN * CACHE_LOW_WATER_NUM;
        let target_bytes = self.max_bytes / CACHE_LOW_WATER_DEN * CACHE_LOW_WATER_NUM;

        let mut victims: Vec<u64> = Vec::new();
        let mut selected: HashSet<u64> = HashSet::new();
        let mut rows_after = self.entries.len();
        let mut bytes_after = self.bytes;
        let mut scanned = 0usize;
        let scan_limit = self.entries.len() * 2;

        while (rows_after > target_rows || bytes_after > target_bytes) && scanned < scan_limit {
            let entry = &self.entries[self.hand];
            scanned += 1;

            if entry.is_kept() || selected.contains(&entry.position) {
                self.advance_hand();
                continue;
            }

            if entry.visited.swap(false, Ordering::AcqRel) {
                self.advance_hand();
                continue;
            }

            rows_after -= 1;
            bytes_after -= entry.object.storage_size();
            selected.insert(entry.position);
            victims.push(entry.position);
            self.advance_hand();
        }

        victims.sort_unstable();

        for &position in &victims {
            let idx = self.index[&position];
            if self.entries[idx].is_dirty() {
                writer(&self.entries[idx].object)?;
                self.entries[idx].dirty.store(false, Ordering::Release);
            }
        }

        let evicted = victims.len();
        for position in victims {
            self.release(position);
        }

        Ok(evicted)
    }

    fn advance_hand(&mut self) {
        self.hand = (self.hand + 1) % self.entries.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawRow;

    fn row(position: u64, payload_len: usize) -> Arc<RawRow> {
        let mut row = RawRow::new(vec![0xAB; payload_len], 8);
        row.set_position(position);
        Arc::new(row)
    }

    #[test]
    fn put_get_release_roundtrip() {
        let mut cache: RowCache<RawRow> = RowCache::new(8, 1024);

        cache.put(4, row(4, 12), false).unwrap();

        assert!(cache.get(4, false).is_some());
        assert!(cache.get(5, false).is_none());

        let released = cache.release(4).unwrap();
        assert_eq!(released.position(), 4);
        assert!(cache.get(4, false).is_none());
    }

    #[test]
    fn put_rejects_mismatched_position() {
        let mut cache: RowCache<RawRow> = RowCache::new(8, 1024);

        let err = cache.put(9, row(4, 12), false).unwrap_err();

        assert!(err.downcast_ref::<CacheConsistencyError>().is_some());
    }

    #[test]
    fn replace_adjusts_byte_accounting() {
        let mut cache: RowCache<RawRow> = RowCache::new(8, 1024);

        cache.put(4, row(4, 12), false).unwrap();
        let first_bytes = cache.bytes();

        cache.put(4, row(4, 100), false).unwrap();

        assert_eq!(cache.len(), 1);
        assert!(cache.bytes() > first_bytes);
    }

    #[test]
    fn save_all_writes_dirty_ascending_then_clears() {
        let mut cache: RowCache<RawRow> = RowCache::new(8, 4096);

        cache.put(40, row(40, 8), true).unwrap();
        cache.put(4, row(4, 8), true).unwrap();
        cache.put(20, row(20, 8), false).unwrap();

        let mut saved = Vec::new();
        let count = cache
            .save_all(|obj| {
                saved.push(obj.position());
                Ok(())
            })
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(saved, vec![4, 40]);
        assert!(!cache.is_dirty(4));
        assert!(!cache.is_dirty(40));
    }

    #[test]
    fn cleanup_drains_to_low_water_mark() {
        let mut cache: RowCache<RawRow> = RowCache::new(8, usize::MAX);

        for pos in 0..10 {
            cache.put(pos, row(pos, 8), false).unwrap();
        }
        assert!(cache.over_limit());

        cache.force_cleanup(|_| Ok(())).unwrap();

        assert!(cache.len() <= 6);
        assert!(!cache.over_limit());
    }

    #[test]
    fn cleanup_respects_byte_limit() {
        let row_bytes = row(0, 60).storage_size();
        let mut cache: RowCache<RawRow> = RowCache::new(usize::MAX, row_bytes * 4);

        for pos in 0..8 {
            cache.put(pos, row(pos, 60), false).unwrap();
        }

        cache.force_cleanup(|_| Ok(())).unwrap();

        assert!(cache.bytes() <= row_bytes * 3);
    }

    #[test]
    fn cleanup_saves_dirty_victims() {
        let mut cache: RowCache<RawRow> = RowCache::new(4, usize::MAX);

        for pos in 0..8 {
            cache.put(pos, row(pos, 8), true).unwrap();
        }

        let mut saved = Vec::new();
        cache
            .force_cleanup(|obj| {
                saved.push(obj.position());
                Ok(())
            })
            .unwrap();

        assert!(!saved.is_empty());
        let mut sorted = saved.clone();
        sorted.sort_unstable();
        assert_eq!(saved, sorted, "victims must be saved ascending");
    }

    #[test]
    fn pinned_entries_survive_cleanup() {
        let mut cache: RowCache<RawRow> = RowCache::new(4, usize::MAX);

        for pos in 0..8 {
            cache.put(pos, row(pos, 8), false).unwrap();
        }
        cache.get(3, true);

        cache.force_cleanup(|_| Ok(())).unwrap();

        assert!(cache.get(3, false).is_some());
    }

    #[test]
    fn all_pinned_cache_gives_up_without_spinning() {
        let mut cache: RowCache<RawRow> = RowCache::new(2, usize::MAX);

        for pos in 0..4 {
            cache.put(pos, row(pos, 8), false).unwrap();
            cache.get(pos, true);
        }

        let evicted = cache.force_cleanup(|_| Ok(())).unwrap();

        assert_eq!(evicted, 0);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn visited_entries_get_a_second_chance() {
        let mut cache: RowCache<RawRow> = RowCache::new(4, usize::MAX);

        for pos in 0..6 {
            cache.put(pos, row(pos, 8), false).unwrap();
        }

        // Two sweep rounds: all entries start visited, so the first round
        // only clears flags and the second evicts.
        let evicted = cache.force_cleanup(|_| Ok(())).unwrap();

        assert!(evicted >= 3);
        assert!(cache.len() <= 3);
    }

    #[test]
    fn clear_discards_everything_without_writing() {
        let mut cache: RowCache<RawRow> = RowCache::new(8, 4096);

        cache.put(4, row(4, 8), true).unwrap();
        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.bytes(), 0);
    }
}
