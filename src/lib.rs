//! # rowfile — Cached-Table Page/Row Store
//!
//! rowfile persists variable-size table rows into a single growable data
//! file, keeps a bounded in-memory working set of decoded row objects,
//! recycles freed file space through a bounded allocator, and makes every
//! in-place file mutation crash-safe with page-granularity shadow copies
//! or a full backup archive.
//!
//! ## Quick Start
//!
//! ```ignore
//! use rowfile::codec::{RawRow, RawRowCodec};
//! use rowfile::config::ScaledFileConfig;
//! use rowfile::storage::DataFileCache;
//!
//! let config = ScaledFileConfig::builder()
//!     .scale(8)
//!     .incremental_backup(true)
//!     .build()?;
//!
//! let store = DataFileCache::open("table.dat", config, RawRowCodec::new(8))?;
//!
//! let row = store.add(RawRow::new(b"payload".to_vec(), 8))?;
//! let same = store.get(row.position(), false)?;
//! store.close(true)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │   Row stores (disk / memory / hybrid)          │
//! │   index binding · tx hooks · node tables       │
//! ├───────────────────────────────────────────────┤
//! │   DataFileCache (page store)                   │
//! │   header · free pointer · RwLock · recovery    │
//! ├──────────────┬──────────────┬─────────────────┤
//! │   RowCache   │ FreeSpaceMap │ Shadow / Backup  │
//! ├──────────────┴──────────────┴─────────────────┤
//! │   RandomAccess devices (file / mmap / memory)  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Row encoding is not this crate's business: callers supply a
//! [`codec::RowCodec`] that serializes their row type into an opaque
//! payload, and the store frames it with a length prefix at a
//! scale-aligned file position.
//!
//! ## Concurrency
//!
//! Parallel readers share the page store's read lock for cache hits; every
//! mutation, including its file I/O, runs under the single write lock. A
//! cache miss re-checks under the write lock instead of upgrading. Index
//! maintenance above the page store relies on sequential rollback, not a
//! spanning lock — see the `rowstore` module docs.
//!
//! ## Module Overview
//!
//! - [`storage`]: devices, header, free space, shadow/backup, row cache,
//!   and the page store itself
//! - [`rowstore`]: per-table adapters binding indexes and transaction
//!   hooks to a backing store
//! - [`codec`]: the collaborator traits for row objects and their codec
//! - [`config`]: constants and the per-store configuration builder
//! - [`error`]: typed error conditions, downcastable from `eyre::Report`

#[macro_use]
mod macros;

pub mod codec;
pub mod config;
pub mod error;
pub mod rowstore;
pub mod storage;

pub use codec::{CachedObject, RowCodec};
pub use config::{DeviceKind, ScaledFileConfig};
pub use rowstore::{RowStore, StoreCapabilities, TxAction};
pub use storage::DataFileCache;
