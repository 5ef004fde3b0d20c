//! # Error Conditions
//!
//! This module defines the typed error conditions of the store. All fallible
//! APIs return `eyre::Result`; conditions a caller must distinguish are
//! raised as one of the structs below via `bail!`, so they can be recovered
//! with `Report::downcast_ref` at the call site that cares.
//!
//! ## Taxonomy
//!
//! | Condition               | Class                 | Caller reaction          |
//! |-------------------------|-----------------------|--------------------------|
//! | `StorageIoError`        | fatal to operation    | propagate, log severe    |
//! | `DataFileFullError`     | recoverable           | abort statement/txn      |
//! | `WrongFileVersionError` | fatal at open         | refuse to open           |
//! | `DataFileCorruptedError`| fatal after one retry | refuse row / open        |
//! | `CacheConsistencyError` | programming error     | treat as fatal defect    |
//! | `UniquenessViolation`   | recoverable           | roll back partial insert |
//!
//! Device and decode errors are logged severe with context (file name,
//! offset) before being re-thrown; allocation and version conditions are
//! expected operational outcomes and are not logged severe.

use std::path::PathBuf;

/// Device-level read/write/seek failure. Always fatal to the current
/// operation.
#[derive(Debug)]
pub struct StorageIoError {
    pub file: PathBuf,
    pub offset: u64,
    pub operation: &'static str,
}

impl std::fmt::Display for StorageIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "storage {} failed on '{}' at offset {}",
            self.operation,
            self.file.display(),
            self.offset
        )
    }
}

impl std::error::Error for StorageIoError {}

/// An allocation cannot be satisfied: the file hit its addressing ceiling or
/// the medium refused to grow. Recoverable by the caller.
#[derive(Debug)]
pub struct DataFileFullError {
    pub requested: usize,
    pub file_limit: u64,
}

impl std::fmt::Display for DataFileFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "data file full: cannot allocate {} bytes within the {} byte limit",
            self.requested, self.file_limit
        )
    }
}

impl std::error::Error for DataFileFullError {}

/// The file header encodes an incompatible or rejected format. Fatal at
/// open; no recovery is attempted.
#[derive(Debug)]
pub struct WrongFileVersionError {
    pub file: PathBuf,
    pub flags: u32,
}

impl std::fmt::Display for WrongFileVersionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "data file '{}' has an incompatible format (flags {:#010b})",
            self.file.display(),
            self.flags
        )
    }
}

impl std::error::Error for WrongFileVersionError {}

/// Row bytes failed to deserialize after the forced-cleanup retry.
#[derive(Debug)]
pub struct DataFileCorruptedError {
    pub file: PathBuf,
    pub offset: u64,
    pub detail: String,
}

impl std::fmt::Display for DataFileCorruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "corrupted row in '{}' at offset {}: {}",
            self.file.display(),
            self.offset,
            self.detail
        )
    }
}

impl std::error::Error for DataFileCorruptedError {}

/// Invariant breach inside the cache, such as two live objects claiming the
/// same position. Not user-recoverable.
#[derive(Debug)]
pub struct CacheConsistencyError {
    pub position: u64,
    pub detail: &'static str,
}

impl std::fmt::Display for CacheConsistencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cache consistency violation at position {}: {}",
            self.position, self.detail
        )
    }
}

impl std::error::Error for CacheConsistencyError {}

/// A unique index rejected a row. The row store rolls back the partial
/// insertion and propagates this condition.
#[derive(Debug)]
pub struct UniquenessViolation {
    pub index: usize,
}

impl std::fmt::Display for UniquenessViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "uniqueness violation in index {}", self.index)
    }
}

impl std::error::Error for UniquenessViolation {}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::{bail, Result};

    fn fails_full() -> Result<()> {
        bail!(DataFileFullError {
            requested: 64,
            file_limit: 1 << 34,
        });
    }

    #[test]
    fn typed_conditions_downcast_through_report() {
        let err = fails_full().unwrap_err();

        let full = err.downcast_ref::<DataFileFullError>().unwrap();
        assert_eq!(full.requested, 64);
        assert!(err.downcast_ref::<StorageIoError>().is_none());
    }

    #[test]
    fn display_carries_context() {
        let err = StorageIoError {
            file: PathBuf::from("t.dat"),
            offset: 96,
            operation: "read",
        };

        let text = err.to_string();
        assert!(text.contains("t.dat"));
        assert!(text.contains("96"));
    }
}
