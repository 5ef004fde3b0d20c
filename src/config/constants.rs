//! # Configuration Constants
//!
//! This module centralizes the numeric constants of the store, grouping
//! interdependent values together and documenting their relationships.
//! Constants that depend on each other are co-located to prevent mismatch
//! bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_CACHE_FILE_SCALE (8)
//!       │
//!       ├─> row padding granularity (storage sizes are multiples of scale)
//!       │
//!       ├─> MAX_OBJECT_POSITION (2^31 positions; file offset = pos * scale)
//!       │
//!       └─> HEADER_SIZE (32) must itself be a multiple of every legal scale
//!             up to 32, so the first row lands on a scale boundary.
//!
//! ROW_LENGTH_PREFIX (4 bytes)
//!       │
//!       └─> MIN_ROW_SIZE: no allocation may be smaller than the prefix,
//!           or a stored row could not record its own length.
//!
//! SHADOW_PAGE_SIZE (4096)
//!       │
//!       └─> Shadow records carry whole pages; restore seeks in page-size
//!           strides. Must be a power of two.
//!
//! MAX_CACHE_ROWS / MAX_CACHE_BYTES
//!       │
//!       └─> CACHE_LOW_WATER_NUM/DEN: cleanup drains to 3/4 of either limit.
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions below:
//!
//! 1. `HEADER_SIZE % 32 == 0` (first allocation aligns for every scale ≤ 32)
//! 2. `MIN_ROW_SIZE >= ROW_LENGTH_PREFIX`
//! 3. `SHADOW_PAGE_SIZE.is_power_of_two()`

/// Byte granularity multiplier converting object positions to file offsets.
/// Legal values: 1, or any power of two >= 8.
pub const DEFAULT_CACHE_FILE_SCALE: u32 = 8;

/// Fixed size of the data-file header region at offset 0.
pub const HEADER_SIZE: usize = 32;

/// Length prefix stored in front of every row, included in its own count.
pub const ROW_LENGTH_PREFIX: usize = 4;

/// Smallest storage allocation handed out for a row.
pub const MIN_ROW_SIZE: usize = 8;

/// Positions are encoded in 31 bits; file offset = position * scale.
pub const MAX_OBJECT_POSITION: u64 = 1 << 31;

/// Default bound on cached decoded rows.
pub const DEFAULT_MAX_CACHE_ROWS: usize = 4096;

/// Default bound on total cached row bytes.
pub const DEFAULT_MAX_CACHE_BYTES: usize = 8 * 1024 * 1024;

/// Cleanup drains the cache to LOW_WATER_NUM/LOW_WATER_DEN of each limit.
pub const CACHE_LOW_WATER_NUM: usize = 3;
pub const CACHE_LOW_WATER_DEN: usize = 4;

/// Granularity of the incremental-backup pre-image copies.
pub const SHADOW_PAGE_SIZE: usize = 4096;

/// Node budget of the free-space allocator; beyond it, freed ranges only
/// increase the lost counter until a defragmentation pass.
pub const FREE_SPACE_CAPACITY: usize = 512;

/// Files at or below this size are eligible for the memory-mapped device.
pub const MMAP_MAX_FILE_SIZE: u64 = 256 * 1024 * 1024;

/// Row count at which a hybrid row store migrates to disk backing.
pub const HYBRID_ROWS_THRESHOLD: usize = 16384;

/// Suffix of the full-snapshot backup archive.
pub const BACKUP_SUFFIX: &str = ".backup";

/// Suffix of the incremental shadow stream.
pub const SHADOW_SUFFIX: &str = ".shadow";

/// Suffix of a data file mid-replacement (defrag target before rename).
pub const NEW_SUFFIX: &str = ".new";

/// Suffix of the displaced data file during a replacement swap.
pub const OLD_SUFFIX: &str = ".old";

const _: () = assert!(HEADER_SIZE % 32 == 0);
const _: () = assert!(MIN_ROW_SIZE >= ROW_LENGTH_PREFIX);
const _: () = assert!(SHADOW_PAGE_SIZE.is_power_of_two());
const _: () = assert!(CACHE_LOW_WATER_NUM < CACHE_LOW_WATER_DEN);
