//! # Bounded Free-Space Allocator
//!
//! `FreeSpaceMap` tracks byte ranges freed inside the data file and serves
//! them back to new allocations, so row churn reuses holes instead of
//! growing the file. It is deliberately bounded: a fixed node budget caps
//! its memory regardless of churn.
//!
//! ## Structure
//!
//! Free blocks live in power-of-two size-class buckets (class =
//! `log2(size)`), each bucket a `SmallVec` kept sorted by `(size,
//! position)`. A request scans its own class and then larger classes, so the
//! first qualifying entry is automatically the best fit.
//!
//! ## Allocation Policy
//!
//! Best fit: the smallest tracked block that satisfies the request wins;
//! among equal sizes the lowest file offset wins, which keeps reuse packed
//! toward the start of the file. A remainder of at least one scale unit is
//! re-inserted as its own free block when the node budget allows; smaller
//! remainders are counted as lost.
//!
//! ## Degrade Path
//!
//! Once the node budget is exhausted, `give` stops tracking ranges and only
//! increases the lost counter. That space stays unreclaimed until a
//! defragmentation pass rewrites the file. The bound is the point: heavy
//! delete churn must not grow allocator memory without limit.
//!
//! ## Merging
//!
//! A freed range is merged with a tracked neighbor when one exists (the
//! node count is small enough that a linear adjacency scan is cheap), which
//! counters fragmentation from repeated neighbor frees.
//!
//! ## Units
//!
//! All positions and sizes here are raw bytes; callers keep them multiples
//! of the file scale. Totals feed the header's lost-bytes field and the
//! defragmentation threshold decision.

use smallvec::SmallVec;

const NUM_CLASSES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    position: u64,
    size: u32,
}

#[derive(Debug)]
pub struct FreeSpaceMap {
    buckets: Vec<SmallVec<[FreeBlock; 4]>>,
    capacity: usize,
    len: usize,
    scale: u32,
    tracked_bytes: u64,
    lost_bytes: u64,
}

impl FreeSpaceMap {
    pub fn new(capacity: usize, scale: u32) -> Self {
        Self {
            buckets: vec![SmallVec::new(); NUM_CLASSES],
            capacity,
            len: 0,
            scale,
            tracked_bytes: 0,
            lost_bytes: 0,
        }
    }

    /// Restores the persisted lost counter at open time.
    pub fn set_lost_bytes(&mut self, lost: u64) {
        self.lost_bytes = lost;
    }

    fn class_of(size: u32) -> usize {
        (31 - size.leading_zeros()) as usize
    }

    /// Removes and returns the start of a free range of at least `size`
    /// bytes, or `None` when nothing tracked satisfies the request.
    pub fn take(&mut self, size: u32) -> Option<u64> {
        if size == 0 || self.len == 0 {
            return None;
        }

        for class in Self::class_of(size)..NUM_CLASSES {
            let bucket = &mut self.buckets[class];
            let Some(idx) = bucket.iter().position(|b| b.size >= size) else {
                continue;
            };

            let block = bucket.remove(idx);
            self.len -= 1;
            self.tracked_bytes -= block.size as u64;

            let remainder = block.size - size;
            if remainder >= self.scale && self.len < self.capacity {
                self.insert(FreeBlock {
                    position: block.position + size as u64,
                    size: remainder,
                });
            } else if remainder > 0 {
                self.lost_bytes += remainder as u64;
            }

            return Some(block.position);
        }

        None
    }

    /// Returns a range to the pool. Once the node budget is full the range
    /// is abandoned to the lost counter.
    pub fn give(&mut self, position: u64, size: u32) {
        if size == 0 {
            return;
        }

        let merged = self.merge_adjacent(FreeBlock { position, size });

        if self.len >= self.capacity {
            self.lost_bytes += merged.size as u64;
            return;
        }

        self.insert(merged);
    }

    fn insert(&mut self, block: FreeBlock) {
        let bucket = &mut self.buckets[Self::class_of(block.size)];
        let at = bucket
            .iter()
            .position(|b| (b.size, b.position) > (block.size, block.position))
            .unwrap_or(bucket.len());
        bucket.insert(at, block);
        self.len += 1;
        self.tracked_bytes += block.size as u64;
    }

    /// Folds tracked neighbors of `block` into it, removing them from their
    /// buckets. Both sides are checked repeatedly until no neighbor remains.
    fn merge_adjacent(&mut self, mut block: FreeBlock) -> FreeBlock {
        loop {
            let mut found = None;

            'scan: for class in 0..NUM_CLASSES {
                for (idx, other) in self.buckets[class].iter().enumerate() {
                    let before = other.position + other.size as u64 == block.position;
                    let after = block.position + block.size as u64 == other.position;
                    if before || after {
                        found = Some((class, idx));
                        break 'scan;
                    }
                }
            }

            let Some((class, idx)) = found else {
                return block;
            };

            let other = self.buckets[class].remove(idx);
            self.len -= 1;
            self.tracked_bytes -= other.size as u64;

            block = FreeBlock {
                position: block.position.min(other.position),
                size: block.size + other.size,
            };
        }
    }

    /// Bytes freed but no longer tracked; reclaimed only by defragmentation.
    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes
    }

    /// Bytes in tracked free blocks, available for reuse.
    pub fn tracked_bytes(&self) -> u64 {
        self.tracked_bytes
    }

    /// Everything the file holds that is not live row data. Persisted into
    /// the header and compared against the defragmentation threshold.
    pub fn total_free_bytes(&self) -> u64 {
        self.tracked_bytes + self.lost_bytes
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.len = 0;
        self.tracked_bytes = 0;
        self.lost_bytes = 0;
    }
}
