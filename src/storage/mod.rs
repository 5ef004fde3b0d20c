//! # Storage Module
//!
//! This module is the persistence core of rowfile: one growable data file
//! holding variable-size rows, fronted by a bounded cache of decoded row
//! objects, with freed file ranges recycled by a bounded allocator and
//! every in-place mutation made crash-safe by shadow paging or a full
//! backup archive.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            DataFileCache (datafile)          │
//! │  header flags · free pointer · RwLock        │
//! ├──────────┬──────────────┬───────────────────┤
//! │ RowCache │ FreeSpaceMap │ ShadowFile/backup  │
//! │ (cache)  │ (freespace)  │ (shadow, backup)   │
//! ├──────────┴──────────────┴───────────────────┤
//! │        RandomAccess devices (device)         │
//! │     FileDevice · MmapDevice · MemoryDevice   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## File Format
//!
//! A data file is a 32-byte header followed by rows. Every row starts on a
//! multiple of the configured scale and carries a 4-byte big-endian length
//! prefix counting itself plus the payload:
//!
//! ```text
//! Offset 0:        header (32 bytes)
//! Offset 32:       [len u32][payload len-4][padding to scale]
//! ...
//! ```
//!
//! A row's abstract position is its byte offset divided by the scale, which
//! is what bounds the file at `2^31 * scale` bytes.
//!
//! ## Side Files
//!
//! | Suffix     | Purpose                                       |
//! |------------|-----------------------------------------------|
//! | `.shadow`  | page pre-images for the current dirty interval |
//! | `.backup`  | full snapshot of the last commit point         |
//! | `.new`     | replacement file mid-swap (defragmentation)    |
//! | `.old`     | displaced file during the swap                 |
//!
//! ## Module Organization
//!
//! - `device`, `file`, `mmap`, `memory`: the block-device abstraction
//! - `header`: the 32-byte file header
//! - `freespace`: bounded free-range allocator
//! - `shadow`: incremental-backup pre-image log
//! - `backup`: full-snapshot archive
//! - `cache`: bounded decoded-row cache
//! - `datafile`: the page store that owns all of the above
//! - `defrag`: compacting rewrite pass

pub mod backup;
pub mod cache;
mod defrag;
pub mod device;
pub mod file;
pub mod freespace;
pub mod header;
pub mod memory;
pub mod mmap;
pub mod shadow;

mod datafile;

pub use cache::RowCache;
pub use datafile::DataFileCache;
pub use device::{AnyDevice, RandomAccess};
pub use file::FileDevice;
pub use freespace::FreeSpaceMap;
pub use header::{FileHeader, FLAG_FORMAT_CURRENT, FLAG_FORMAT_REJECTED, FLAG_ROWINFO, FLAG_SAVED, FLAG_SHADOWED};
pub use memory::MemoryDevice;
pub use mmap::MmapDevice;
pub use shadow::ShadowFile;
