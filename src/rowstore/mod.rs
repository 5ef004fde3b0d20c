//! # Row Store Adapters
//!
//! A row store binds one table's rows to a backing medium and to the
//! table's index set. Three adapters share one trait: disk-backed over a
//! [`DataFileCache`](crate::storage::DataFileCache), pure in-memory, and a
//! hybrid that starts in memory and migrates to disk past a row-count
//! threshold. Capability flags replace a subclass hierarchy — callers ask
//! `capabilities()` instead of downcasting.
//!
//! ## Indexes Are Collaborators
//!
//! Index structures live above this crate; the store sees them only through
//! the [`Index`] trait. The one delicate contract is `index_row`: a row is
//! inserted into every index in order, and a uniqueness failure at index
//! *i* must delete the row from indexes `[0, i)` in reverse and remove the
//! row from the backing store before the error propagates. No lock spans
//! the whole operation; atomicity comes from that sequential rollback.
//!
//! ## Transaction Hooks
//!
//! The transaction manager above tags each pending row change with a
//! [`TxAction`]; `commit_row`/`rollback_row` apply or undo the change:
//!
//! | action         | commit              | rollback            |
//! |----------------|---------------------|---------------------|
//! | `Insert`       | keep row            | deindex + destroy   |
//! | `Delete`       | deindex + destroy   | re-index (row kept) |
//! | `InsertDelete` | deindex + destroy   | deindex + destroy   |
//! | `DeleteFinal`  | deindex + destroy   | —                   |
//!
//! ## Node Tables
//!
//! Each row carries one integer slot per index (`nodes`), replacing linked
//! node references with arena-style tables so that growing or shrinking the
//! per-row arrays when an index is added or dropped is a plain array
//! resize with row-by-row back-out on failure.

mod disk;
mod hybrid;
mod memory;
mod nodes;

pub use disk::DiskRowStore;
pub use hybrid::HybridRowStore;
pub use memory::MemoryRowStore;
pub use nodes::{NodeTable, NODE_NONE};

use std::sync::Arc;

use eyre::Result;

use crate::codec::CachedObject;

/// Outcome tag for a pending row change, assigned by the transaction
/// manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    Insert,
    Delete,
    InsertDelete,
    DeleteFinal,
}

/// What a store is, instead of which subclass it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapabilities {
    pub disk_backed: bool,
    pub temporary: bool,
}

/// An index over the rows of one store. Implementations decide keys and
/// ordering; the store only inserts, deletes, and rebuilds.
pub trait Index<O>: Send + Sync {
    /// Inserts the row; fails on a uniqueness conflict.
    fn insert(&self, row: &Arc<O>) -> Result<()>;

    /// Deletes the row; absent rows are a no-op.
    fn delete(&self, row: &Arc<O>) -> Result<()>;

    /// Drops every entry; used when a store rebuilds after migration.
    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The per-table adapter surface consumed by the engine above.
pub trait RowStore<O: CachedObject>: Send + Sync {
    fn capabilities(&self) -> StoreCapabilities;

    /// Stores a new row, assigning its position.
    fn add(&self, object: O) -> Result<Arc<O>>;

    /// Fetches the row at `position`; `keep` pins it in the cache.
    fn get(&self, position: u64, keep: bool) -> Result<Arc<O>>;

    /// Destroys the row's storage.
    fn remove(&self, position: u64) -> Result<()>;

    /// Drops the row from the cache without destroying storage.
    fn release(&self, position: u64) -> Result<()>;

    /// Inserts the row into every index, rolling back the partial insert on
    /// failure (see module docs).
    fn index_row(&self, row: &Arc<O>) -> Result<()>;

    fn commit_row(&self, row: &Arc<O>, action: TxAction) -> Result<()>;

    fn rollback_row(&self, row: &Arc<O>, action: TxAction) -> Result<()>;

    /// Rewrites every row through `reshape` (column add/drop). Transforms
    /// are computed for all rows before any storage mutation, so a failed
    /// transform aborts cleanly.
    fn move_data(&self, reshape: &dyn Fn(&O) -> Result<O>) -> Result<()>;

    /// Grows or shrinks every row's per-index node array after the index
    /// list changed shape.
    fn reset_accessors(&self, new_index_count: usize) -> Result<()>;

    fn row_count(&self) -> usize;
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A minimal ordered index over raw payload bytes, enough to exercise
    //! the index_row rollback contract and rebuilds.

    use std::collections::BTreeMap;
    use std::sync::Arc;

    use eyre::{bail, Result};
    use parking_lot::Mutex;

    use super::Index;
    use crate::codec::{CachedObject, RawRow};
    use crate::error::UniquenessViolation;

    #[derive(Default)]
    pub struct PayloadIndex {
        unique: bool,
        entries: Mutex<BTreeMap<Vec<u8>, Vec<u64>>>,
        pub fail_next_insert: Mutex<bool>,
    }

    impl PayloadIndex {
        pub fn unique() -> Self {
            Self {
                unique: true,
                ..Default::default()
            }
        }

        pub fn non_unique() -> Self {
            Self::default()
        }

        pub fn contains_payload(&self, payload: &[u8]) -> bool {
            self.entries.lock().contains_key(payload)
        }
    }

    impl Index<RawRow> for PayloadIndex {
        fn insert(&self, row: &Arc<RawRow>) -> Result<()> {
            if std::mem::take(&mut *self.fail_next_insert.lock()) {
                bail!(UniquenessViolation { index: 0 });
            }

            let mut entries = self.entries.lock();
            let slot = entries.entry(row.payload().to_vec()).or_default();
            if self.unique && !slot.is_empty() {
                bail!(UniquenessViolation { index: 0 });
            }
            slot.push(row.position());
            Ok(())
        }

        fn delete(&self, row: &Arc<RawRow>) -> Result<()> {
            let mut entries = self.entries.lock();
            if let Some(slot) = entries.get_mut(row.payload()) {
                slot.retain(|&p| p != row.position());
                if slot.is_empty() {
                    entries.remove(row.payload());
                }
            }
            Ok(())
        }

        fn clear(&self) {
            self.entries.lock().clear();
        }

        fn len(&self) -> usize {
            self.entries.lock().values().map(Vec::len).sum()
        }
    }
}
