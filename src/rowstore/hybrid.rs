//! # Hybrid Row Store
//!
//! Starts as an in-memory store and becomes disk-backed the moment its row
//! count crosses the configured threshold. Result tables and session
//! temporaries usually stay small and never pay for a file; the few that
//! grow large migrate once and stay migrated.
//!
//! ## Migration
//!
//! `change_to_disk_table` drains the memory store in primary order,
//! re-adds every row through a freshly opened page store (positions are
//! reassigned), clears each index, and re-indexes the new rows. Rows are
//! cloned into the new store, so `Clone` is required of the object type.
//! Row handles obtained before the migration keep working for reads of
//! their payload but their positions are stale; callers re-fetch after a
//! migration, exactly as they must after a defragmentation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use tracing::info;

use super::disk::DiskRowStore;
use super::memory::MemoryRowStore;
use super::{Index, RowStore, StoreCapabilities, TxAction};
use crate::codec::RowCodec;
use crate::config::{ScaledFileConfig, HYBRID_ROWS_THRESHOLD};
use crate::storage::DataFileCache;

enum Backing<C: RowCodec> {
    Memory(MemoryRowStore<C::Object>),
    Disk(DiskRowStore<C>),
}

pub struct HybridRowStore<C: RowCodec> {
    backing: RwLock<Backing<C>>,
    codec: Mutex<Option<C>>,
    path: PathBuf,
    config: ScaledFileConfig,
    indexes: Vec<Arc<dyn Index<C::Object>>>,
    threshold: usize,
}

impl<C: RowCodec> HybridRowStore<C>
where
    C::Object: Clone,
{
    pub fn new<P: AsRef<Path>>(
        path: P,
        config: ScaledFileConfig,
        codec: C,
        indexes: Vec<Arc<dyn Index<C::Object>>>,
    ) -> Self {
        Self::with_threshold(path, config, codec, indexes, HYBRID_ROWS_THRESHOLD)
    }

    pub fn with_threshold<P: AsRef<Path>>(
        path: P,
        config: ScaledFileConfig,
        codec: C,
        indexes: Vec<Arc<dyn Index<C::Object>>>,
        threshold: usize,
    ) -> Self {
        Self {
            backing: RwLock::new(Backing::Memory(MemoryRowStore::new(indexes.clone()))),
            codec: Mutex::new(Some(codec)),
            path: path.as_ref().to_path_buf(),
            config,
            indexes,
            threshold,
        }
    }

    pub fn is_disk_backed(&self) -> bool {
        matches!(&*self.backing.read(), Backing::Disk(_))
    }

    /// Migrates the store to disk backing. Idempotent.
    pub fn change_to_disk_table(&self) -> Result<()> {
        let mut backing = self.backing.write();

        let memory = match &*backing {
            Backing::Disk(_) => return Ok(()),
            Backing::Memory(memory) => memory,
        };

        let Some(codec) = self.codec.lock().take() else {
            eyre::bail!("hybrid store cannot migrate again after a failed migration");
        };

        let cache = DataFileCache::open(&self.path, self.config.clone(), codec)
            .wrap_err("hybrid store failed to open its data file")?;
        let disk = DiskRowStore::new(Arc::new(cache), self.indexes.clone());

        let rows = memory.rows_in_order();
        for index in &self.indexes {
            index.clear();
        }

        for old in &rows {
            let row = disk.add((**old).clone())?;
            disk.index_row(&row)?;
        }

        info!(
            file = %self.path.display(),
            rows = rows.len(),
            "hybrid store migrated to disk"
        );
        *backing = Backing::Disk(disk);
        Ok(())
    }

    fn migrate_if_needed(&self) -> Result<()> {
        let over = match &*self.backing.read() {
            Backing::Memory(memory) => memory.row_count() > self.threshold,
            Backing::Disk(_) => false,
        };

        if over {
            self.change_to_disk_table()?;
        }
        Ok(())
    }
}

impl<C: RowCodec> RowStore<C::Object> for HybridRowStore<C>
where
    C::Object: Clone,
{
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            disk_backed: self.is_disk_backed(),
            temporary: true,
        }
    }

    fn add(&self, object: C::Object) -> Result<Arc<C::Object>> {
        let row = match &*self.backing.read() {
            Backing::Memory(memory) => memory.add(object)?,
            Backing::Disk(disk) => disk.add(object)?,
        };

        self.migrate_if_needed()?;
        Ok(row)
    }

    fn get(&self, position: u64, keep: bool) -> Result<Arc<C::Object>> {
        match &*self.backing.read() {
            Backing::Memory(memory) => memory.get(position, keep),
            Backing::Disk(disk) => disk.get(position, keep),
        }
    }

    fn remove(&self, position: u64) -> Result<()> {
        match &*self.backing.read() {
            Backing::Memory(memory) => memory.remove(position),
            Backing::Disk(disk) => disk.remove(position),
        }
    }

    fn release(&self, position: u64) -> Result<()> {
        match &*self.backing.read() {
            Backing::Memory(memory) => memory.release(position),
            Backing::Disk(disk) => disk.release(position),
        }
    }

    fn index_row(&self, row: &Arc<C::Object>) -> Result<()> {
        match &*self.backing.read() {
            Backing::Memory(memory) => memory.index_row(row),
            Backing::Disk(disk) => disk.index_row(row),
        }
    }

    fn commit_row(&self, row: &Arc<C::Object>, action: TxAction) -> Result<()> {
        match &*self.backing.read() {
            Backing::Memory(memory) => memory.commit_row(row, action),
            Backing::Disk(disk) => disk.commit_row(row, action),
        }
    }

    fn rollback_row(&self, row: &Arc<C::Object>, action: TxAction) -> Result<()> {
        match &*self.backing.read() {
            Backing::Memory(memory) => memory.rollback_row(row, action),
            Backing::Disk(disk) => disk.rollback_row(row, action),
        }
    }

    fn move_data(&self, reshape: &dyn Fn(&C::Object) -> Result<C::Object>) -> Result<()> {
        match &*self.backing.read() {
            Backing::Memory(memory) => memory.move_data(reshape),
            Backing::Disk(disk) => disk.move_data(reshape),
        }
    }

    fn reset_accessors(&self, new_index_count: usize) -> Result<()> {
        ensure!(
            new_index_count == self.indexes.len(),
            "hybrid index list changes shape through add_index/drop_index on the backing store"
        );
        match &*self.backing.read() {
            Backing::Memory(memory) => memory.reset_accessors(new_index_count),
            Backing::Disk(disk) => disk.reset_accessors(new_index_count),
        }
    }

    fn row_count(&self) -> usize {
        match &*self.backing.read() {
            Backing::Memory(memory) => memory.row_count(),
            Backing::Disk(disk) => disk.row_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RawRow, RawRowCodec};
    use crate::rowstore::testutil::PayloadIndex;
    use tempfile::tempdir;

    fn hybrid(
        dir: &tempfile::TempDir,
        indexes: Vec<Arc<dyn Index<RawRow>>>,
        threshold: usize,
    ) -> HybridRowStore<RawRowCodec> {
        let config = ScaledFileConfig::builder().scale(8).build().unwrap();
        HybridRowStore::with_threshold(
            dir.path().join("hybrid.dat"),
            config,
            RawRowCodec::new(8),
            indexes,
            threshold,
        )
    }

    #[test]
    fn starts_in_memory() {
        let dir = tempdir().unwrap();
        let store = hybrid(&dir, vec![], 4);

        store.add(RawRow::new(b"small".to_vec(), 8)).unwrap();

        assert!(!store.is_disk_backed());
        assert!(!store.capabilities().disk_backed);
        assert!(!dir.path().join("hybrid.dat").exists());
    }

    #[test]
    fn migrates_past_the_threshold() {
        let dir = tempdir().unwrap();
        let store = hybrid(&dir, vec![], 4);

        for i in 0..5u8 {
            store.add(RawRow::new(vec![i; 10], 8)).unwrap();
        }

        assert!(store.is_disk_backed());
        assert_eq!(store.row_count(), 5);
        assert!(dir.path().join("hybrid.dat").exists());
    }

    #[test]
    fn rows_survive_the_migration() {
        let dir = tempdir().unwrap();
        let store = hybrid(&dir, vec![], 3);

        for text in ["aa", "bb", "cc", "dd"] {
            store.add(RawRow::new(text.as_bytes().to_vec(), 8)).unwrap();
        }
        assert!(store.is_disk_backed());

        // Memory positions are synthetic 1..=4; disk positions start after
        // the header. Every payload must still be reachable.
        let mut seen = Vec::new();
        for pos in [4u64, 5, 6, 7, 8, 9, 10] {
            if let Ok(row) = store.get(pos, false) {
                seen.push(String::from_utf8(row.payload().to_vec()).unwrap());
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["aa", "bb", "cc", "dd"]);
    }

    #[test]
    fn indexes_are_rebuilt_during_migration() {
        let dir = tempdir().unwrap();
        let index: Arc<PayloadIndex> = Arc::new(PayloadIndex::non_unique());
        let store = hybrid(&dir, vec![index.clone()], 2);

        for text in ["x", "y", "z"] {
            let row = store.add(RawRow::new(text.as_bytes().to_vec(), 8)).unwrap();
            if !store.is_disk_backed() {
                store.index_row(&row).unwrap();
            }
        }

        assert!(store.is_disk_backed());
        assert_eq!(index.len(), 3);
        assert!(index.contains_payload(b"x"));
        assert!(index.contains_payload(b"z"));
    }

    #[test]
    fn explicit_migration_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = hybrid(&dir, vec![], 100);

        store.add(RawRow::new(b"only".to_vec(), 8)).unwrap();

        store.change_to_disk_table().unwrap();
        assert!(store.is_disk_backed());
        store.change_to_disk_table().unwrap();

        assert_eq!(store.row_count(), 1);
    }
}
