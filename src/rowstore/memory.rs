//! # In-Memory Row Store
//!
//! Rows live in a position-keyed map; positions are synthetic, assigned
//! from a monotonic counter, and mean nothing outside this store. Used for
//! MEMORY tables and as the starting state of the hybrid store. The index
//! maintenance contract is identical to the disk adapter — uniqueness
//! rollback does not care where the row bytes live.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, eyre, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::error;

use super::nodes::NodeTable;
use super::{Index, RowStore, StoreCapabilities, TxAction};
use crate::codec::CachedObject;
use crate::error::UniquenessViolation;

pub struct MemoryRowStore<O> {
    rows: RwLock<HashMap<u64, Arc<O>>>,
    indexes: RwLock<Vec<Arc<dyn Index<O>>>>,
    nodes: Mutex<NodeTable>,
    next_position: AtomicU64,
    temporary: bool,
}

impl<O: CachedObject> MemoryRowStore<O> {
    pub fn new(indexes: Vec<Arc<dyn Index<O>>>) -> Self {
        let index_count = indexes.len();
        Self {
            rows: RwLock::new(HashMap::new()),
            indexes: RwLock::new(indexes),
            nodes: Mutex::new(NodeTable::new(index_count)),
            next_position: AtomicU64::new(1),
            temporary: false,
        }
    }

    pub fn temporary(indexes: Vec<Arc<dyn Index<O>>>) -> Self {
        let mut store = Self::new(indexes);
        store.temporary = true;
        store
    }

    pub fn index_count(&self) -> usize {
        self.indexes.read().len()
    }

    pub fn add_index(&self, index: Arc<dyn Index<O>>) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let mut indexes = self.indexes.write();

        nodes.reset_accessors(indexes.len() + 1)?;
        indexes.push(index);
        Ok(())
    }

    pub fn drop_index(&self, ordinal: usize) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let mut indexes = self.indexes.write();

        ensure!(ordinal < indexes.len(), "index ordinal {} out of range", ordinal);
        indexes.remove(ordinal);
        nodes.remove_slot(ordinal)
    }

    /// Rows in primary (position) order; the hybrid store drains this at
    /// migration time.
    pub fn rows_in_order(&self) -> Vec<Arc<O>> {
        let rows = self.rows.read();
        let mut positions: Vec<u64> = rows.keys().copied().collect();
        positions.sort_unstable();
        positions
            .into_iter()
            .map(|p| Arc::clone(&rows[&p]))
            .collect()
    }

    fn index_snapshot(&self) -> Vec<Arc<dyn Index<O>>> {
        self.indexes.read().clone()
    }

    fn deindex_and_destroy(&self, row: &Arc<O>) -> Result<()> {
        for (i, index) in self.index_snapshot().iter().enumerate().rev() {
            if let Err(e) = index.delete(row) {
                error!(index = i, position = row.position(), "index delete failed: {e:#}");
            }
        }
        self.remove(row.position())
    }
}

impl<O: CachedObject> RowStore<O> for MemoryRowStore<O> {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            disk_backed: false,
            temporary: self.temporary,
        }
    }

    fn add(&self, mut object: O) -> Result<Arc<O>> {
        let position = self.next_position.fetch_add(1, Ordering::Relaxed);
        object.set_position(position);

        let row = Arc::new(object);
        self.rows.write().insert(position, Arc::clone(&row));
        self.nodes.lock().attach_row(position);
        Ok(row)
    }

    fn get(&self, position: u64, _keep: bool) -> Result<Arc<O>> {
        self.rows
            .read()
            .get(&position)
            .cloned()
            .ok_or_else(|| eyre!("no row at position {}", position))
    }

    fn remove(&self, position: u64) -> Result<()> {
        self.nodes.lock().detach_row(position);
        self.rows.write().remove(&position);
        Ok(())
    }

    fn release(&self, _position: u64) -> Result<()> {
        // Nothing is cached separately from the rows themselves.
        Ok(())
    }

    fn index_row(&self, row: &Arc<O>) -> Result<()> {
        let indexes = self.index_snapshot();

        for (i, index) in indexes.iter().enumerate() {
            if let Err(e) = index.insert(row) {
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

    fn commit_row(&self, row: &Arc<O>, action: TxAction) -> Result<()> {
        match action {
            TxAction::Insert => Ok(()),
            TxAction::Delete | TxAction::InsertDelete | TxAction::DeleteFinal => {
                self.deindex_and_destroy(row)
            }
        }
    }

    fn rollback_row(&self, row: &Arc<O>, action: TxAction) -> Result<()> {
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

    fn move_data(&self, reshape: &dyn Fn(&O) -> Result<O>) -> Result<()> {
        let old_rows = self.rows_in_order();

        let mut staged = Vec::with_capacity(old_rows.len());
        for old in &old_rows {
            let mut new = reshape(old).wrap_err_with(|| {
                format!("reshape failed for row at position {}", old.position())
            })?;
            new.set_position(old.position());
            staged.push((Arc::clone(old), Arc::new(new)));
        }

        let indexes = self.index_snapshot();
        let mut rows = self.rows.write();
        for (old, new) in staged {
            rows.insert(new.position(), Arc::clone(&new));
            for index in &indexes {
                index.delete(&old)?;
                index.insert(&new)?;
            }
        }

        Ok(())
    }

    fn reset_accessors(&self, new_index_count: usize) -> Result<()> {
        self.nodes.lock().reset_accessors(new_index_count)
    }

    fn row_count(&self) -> usize {
        self.rows.read().len()
    }
}
