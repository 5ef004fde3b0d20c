//! # Per-Row Index Node Tables
//!
//! Every indexed row carries one integer slot per index — the position of
//! its node inside that index's own arena. Keeping the slots in a table
//! owned by the row store, instead of linked node references threaded
//! through live row objects, means reshaping the index list is an array
//! resize and recovering from a failure is a truncation, not a pointer
//! chase through shared mutable structures.
//!
//! ## Accessor Reset
//!
//! When an index is added or dropped, `reset_accessors` walks every row in
//! primary order and grows or shrinks its slot array in place. Growth
//! reserves fallibly; if row *k* cannot grow, rows `[0, k)` are restored to
//! the old width before the error propagates, so the table never ends up
//! half-reshaped.

use hashbrown::HashMap;
use smallvec::SmallVec;

use eyre::{eyre, Result};

/// Sentinel for "row has no node in this index yet".
pub const NODE_NONE: u32 = u32::MAX;

type Slots = SmallVec<[u32; 4]>;

#[derive(Debug, Default)]
pub struct NodeTable {
    rows: HashMap<u64, Slots>,
    index_count: usize,
}

impl NodeTable {
    pub fn new(index_count: usize) -> Self {
        Self {
            rows: HashMap::new(),
            index_count,
        }
    }

    pub fn index_count(&self) -> usize {
        self.index_count
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Registers a row, giving it an empty slot per index.
    pub fn attach_row(&mut self, position: u64) {
        let mut slots = Slots::new();
        slots.resize(self.index_count, NODE_NONE);
        self.rows.insert(position, slots);
    }

    pub fn detach_row(&mut self, position: u64) -> bool {
        self.rows.remove(&position).is_some()
    }

    pub fn contains(&self, position: u64) -> bool {
        self.rows.contains_key(&position)
    }

    pub fn node(&self, position: u64, index: usize) -> Option<u32> {
        self.rows.get(&position).and_then(|s| s.get(index).copied())
    }

    pub fn set_node(&mut self, position: u64, index: usize, node: u32) -> Result<()> {
        let slots = self
            .rows
            .get_mut(&position)
            .ok_or_else(|| eyre!("no node slots attached for row position {}", position))?;
        let slot = slots
            .get_mut(index)
            .ok_or_else(|| eyre!("index ordinal {} out of range", index))?;
        *slot = node;
        Ok(())
    }

    /// Attached row positions in ascending order — the primary scan order
    /// used for reshape passes.
    pub fn positions(&self) -> Vec<u64> {
        let mut positions: Vec<u64> = self.rows.keys().copied().collect();
        positions.sort_unstable();
        positions
    }

    /// Re-keys a row after its storage moved (defragmentation, hybrid
    /// migration).
    pub fn rekey_row(&mut self, old_position: u64, new_position: u64) {
        if let Some(slots) = self.rows.remove(&old_position) {
            self.rows.insert(new_position, slots);
        }
    }

    /// Grows or shrinks every row's slot array to `new_count`, restoring
    /// the old width row-by-row if growth fails mid-scan.
    pub fn reset_accessors(&mut self, new_count: usize) -> Result<()> {
        let old_count = self.index_count;
        if new_count == old_count {
            return Ok(());
        }

        let positions = self.positions();

        if new_count < old_count {
            for &position in &positions {
                if let Some(slots) = self.rows.get_mut(&position) {
                    slots.truncate(new_count);
                }
            }
            self.index_count = new_count;
            return Ok(());
        }

        let grow_by = new_count - old_count;
        for (done, &position) in positions.iter().enumerate() {
            let slots = self.rows.get_mut(&position).expect("position just listed");

            if slots.try_reserve(grow_by).is_err() {
                // Back out the rows already widened.
                for &prior in &positions[..done] {
                    if let Some(slots) = self.rows.get_mut(&prior) {
                        slots.truncate(old_count);
                    }
                }
                return Err(eyre!(
                    "out of memory widening node slots at row position {}",
                    position
                ));
            }

            slots.resize(new_count, NODE_NONE);
        }

        self.index_count = new_count;
        Ok(())
    }

    /// Removes one index's slot from every row, closing the gap. Used when
    /// an index in the middle of the list is dropped.
    pub fn remove_slot(&mut self, ordinal: usize) -> Result<()> {
        if ordinal >= self.index_count {
            return Err(eyre!("index ordinal {} out of range", ordinal));
        }

        for slots in self.rows.values_mut() {
            slots.remove(ordinal);
        }
        self.index_count -= 1;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}
