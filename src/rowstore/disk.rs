//! # Disk-Backed Row Store
//!
//! Binds a table's index set and node table to a shared
//! [`DataFileCache`](crate::storage::DataFileCache). Row bytes live in the
//! page store; this adapter owns what the page store does not know about:
//! which rows belong to the table, their per-index node slots, and the
//! index-maintenance choreography.
//!
//! ## Pooled Temporary Stores
//!
//! Result-table stores built with [`DiskRowStore::temporary`] share one
//! page store instance and reference-count it (`attach_store`). When the
//! last temporary store drops, the shared page store resets itself to
//! empty.

use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use tracing::error;

use super::nodes::NodeTable;
use super::{Index, RowStore, StoreCapabilities, TxAction};
use crate::codec::{CachedObject, RowCodec};
use crate::error::UniquenessViolation;
use crate::storage::DataFileCache;

pub struct DiskRowStore<C: RowCodec> {
    cache: Arc<DataFileCache<C>>,
    indexes: RwLock<Vec<Arc<dyn Index<C::Object>>>>,
    nodes: Mutex<NodeTable>,
    temporary: bool,
}

impl<C: RowCodec> DiskRowStore<C> {
    pub fn new(cache: Arc<DataFileCache<C>>, indexes: Vec<Arc<dyn Index<C::Object>>>) -> Self {
        let index_count = indexes.len();
        Self {
            cache,
            indexes: RwLock::new(indexes),
            nodes: Mutex::new(NodeTable::new(index_count)),
            temporary: false,
        }
    }

    /// A pooled temporary store sharing `cache` with its siblings.
    pub fn temporary(
        cache: Arc<DataFileCache<C>>,
        indexes: Vec<Arc<dyn Index<C::Object>>>,
    ) -> Self {
        cache.attach_store();
        let mut store = Self::new(cache, indexes);
        store.temporary = true;
        store
    }

    pub fn page_store(&self) -> &Arc<DataFileCache<C>> {
        &self.cache
    }

    pub fn index_count(&self) -> usize {
        self.indexes.read().len()
    }

    /// Adds an index to the list, widening every row's node array first so
    /// the new ordinal is addressable before any insert reaches it.
    pub fn add_index(&self, index: Arc<dyn Index<C::Object>>) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let mut indexes = self.indexes.write();

        nodes.reset_accessors(indexes.len() + 1)?;
        indexes.push(index);
        Ok(())
    }

    /// Drops the index at `ordinal`, closing the slot gap in every row.
    pub fn drop_index(&self, ordinal: usize) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let mut indexes = self.indexes.write();

        ensure!(ordinal < indexes.len(), "index ordinal {} out of range", ordinal);
        indexes.remove(ordinal);
        nodes.remove_slot(ordinal)
    }

    fn index_snapshot(&self) -> Vec<Arc<dyn Index<C::Object>>> {
        self.indexes.read().clone()
    }

    /// Deletes the row from every index (reverse order, best effort) and
    /// destroys its storage.
    fn deindex_and_destroy(&self, row: &Arc<C::Object>) -> Result<()> {
        for (i, index) in self.index_snapshot().iter().enumerate().rev() {
            if let Err(e) = index.delete(row) {
                error!(index = i, position = row.position(), "index delete failed: {e:#}");
            }
        }
        self.remove(row.position())
    }
}

impl<C: RowCodec> RowStore<C::Object> for DiskRowStore<C> {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            disk_backed: true,
            temporary: self.temporary,
        }
    }

    fn add(&self, object: C::Object) -> Result<Arc<C::Object>> {
        let row = self.cache.add(object)?;
        self.nodes.lock().attach_row(row.position());
        Ok(row)
    }

    fn get(&self, position: u64, keep: bool) -> Result<Arc<C::Object>> {
        self.cache.get(position, keep)
    }

    fn remove(&self, position: u64) -> Result<()> {
        self.nodes.lock().detach_row(position);
        self.cache.remove(position)?;
        Ok(())
    }

    fn release(&self, position: u64) -> Result<()> {
        self.cache.release_row(position)?;
        Ok(())
    }

    fn index_row(&self, row: &Arc<C::Object>) -> Result<()> {
        let indexes = self.index_snapshot();

        for (i, index) in indexes.iter().enumerate() {
            if let Err(e) = index.insert(row) {
                // Sequential rollback: pull the row out of the indexes that
                // already accepted it, then out of the store itself.
                for prior in indexes[..i].iter().rev() {
                    if let Err(del) = prior.delete(row) {
                        error!(position = row.position(), "rollback delete failed: {del:#}");
                    }
                }
                if let Err(rem) = self.remove(row.position()) {
                    error!(position = row.position(), "rollback remove failed: {rem:#}");
                }
                return Err(e.wrap_err(UniquenessViolation { index: i }));
            }
        }

        Ok(())
    }

    fn commit_row(&self, row: &Arc<C::Object>, action: TxAction) -> Result<()> {
        match action {
            TxAction::Insert => Ok(()),
            TxAction::Delete | TxAction::InsertDelete | TxAction::DeleteFinal => {
                self.deindex_and_destroy(row)
            }
        }
    }

    fn rollback_row(&self, row: &Arc<C::Object>, action: TxAction) -> Result<()> {
        match action {
            TxAction::Insert | TxAction::InsertDelete => self.deindex_and_destroy(row),
            TxAction::Delete => {
                for index in self.index_snapshot().iter() {
                    index.insert(row)?;
                }
                Ok(())
            }
            TxAction::DeleteFinal => Ok(()),
        }
    }

    fn move_data(&self, reshape: &dyn Fn(&C::Object) -> Result<C::Object>) -> Result<()> {
        let positions = self.nodes.lock().positions();

        // Phase one: transform everything before mutating anything, so a
        // reshape failure aborts with the table untouched.
        let mut staged = Vec::with_capacity(positions.len());
        for &position in &positions {
            let old = self.get(position, false)?;
            let new = reshape(&old)
                .wrap_err_with(|| format!("reshape failed for row at position {}", position))?;
            staged.push((old, new));
        }

        // Phase two: replace storage and index entries row by row.
        let indexes = self.index_snapshot();
        for (old, new) in staged {
            self.remove(old.position())?;
            let row = self.cache.add(new)?;
            self.nodes.lock().attach_row(row.position());

            for index in &indexes {
                index.delete(&old)?;
                index.insert(&row)?;
            }
        }

        Ok(())
    }

    fn reset_accessors(&self, new_index_count: usize) -> Result<()> {
        self.nodes.lock().reset_accessors(new_index_count)
    }

    fn row_count(&self) -> usize {
        self.nodes.lock().row_count()
    }
}

impl<C: RowCodec> Drop for DiskRowStore<C> {
    fn drop(&mut self) {
        if self.temporary {
            if let Err(e) = self.cache.detach_store() {
                error!("temporary store detach failed: {e:#}");
            }
        }
    }
}
