//! # Row Codec Collaborator Interfaces
//!
//! Row encoding rules belong to the engine layer above this crate. The store
//! only requires that each stored object report its serialized byte size and
//! that it serializes into / deserializes from an opaque buffer. These two
//! traits are that contract.
//!
//! ## Position and Storage Size
//!
//! Positions are abstract: file offset = `position * scale`. A row's storage
//! size is its length prefix plus payload, rounded up to the scale, and is
//! fixed for the row's on-disk lifetime — replacing a row with a larger
//! serialization requires a remove + re-add through the page store.
//!
//! ## RawRow
//!
//! `RawRow` / `RawRowCodec` implement the contract for plain byte payloads.
//! They serve as the baseline codec for blob-like tables and carry the
//! round-trip tests for the row framing rules.

use eyre::{ensure, Result};

use crate::config::ROW_LENGTH_PREFIX;

/// Rounds a row's serialized length up to the file's padding granularity.
pub fn padded_size(payload_len: usize, scale: u32) -> usize {
    let raw = ROW_LENGTH_PREFIX + payload_len;
    let scale = scale as usize;
    raw.div_ceil(scale) * scale
}

/// A row-like entity stored in the data file.
///
/// Once assigned, `position` is stable for the object's on-disk lifetime;
/// `storage_size` never changes after first write without a remove + re-add.
pub trait CachedObject: Send + Sync + 'static {
    /// Abstract file position (byte offset / scale).
    fn position(&self) -> u64;

    /// Called exactly once by the page store when storage is allocated.
    fn set_position(&mut self, position: u64);

    /// Padded on-disk size in bytes, a multiple of the file scale.
    fn storage_size(&self) -> usize;
}

/// Serializes rows into and out of their opaque on-disk payload.
pub trait RowCodec: Send + Sync {
    type Object: CachedObject;

    /// Appends the object's payload bytes (everything after the length
    /// prefix) to `out`.
    fn serialize(&self, object: &Self::Object, out: &mut Vec<u8>) -> Result<()>;

    /// Rebuilds an object from its payload bytes. `position` is the slot the
    /// bytes were read from; the returned object must report it.
    fn deserialize(&self, position: u64, payload: &[u8]) -> Result<Self::Object>;
}

/// Baseline row: an opaque byte payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    position: u64,
    storage_size: usize,
    payload: Vec<u8>,
}

impl RawRow {
    /// Creates an unstored row. The position is assigned by the page store
    /// at `add` time.
    pub fn new(payload: Vec<u8>, scale: u32) -> Self {
        let storage_size = padded_size(payload.len(), scale);
        Self {
            position: u64::MAX,
            storage_size,
            payload,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl CachedObject for RawRow {
    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    fn storage_size(&self) -> usize {
        self.storage_size
    }
}

/// Codec for [`RawRow`].
#[derive(Debug, Clone, Copy)]
pub struct RawRowCodec {
    scale: u32,
}

impl RawRowCodec {
    pub fn new(scale: u32) -> Self {
        Self { scale }
    }
}

impl RowCodec for RawRowCodec {
    type Object = RawRow;

    fn serialize(&self, object: &RawRow, out: &mut Vec<u8>) -> Result<()> {
        ensure!(
            padded_size(object.payload.len(), self.scale) == object.storage_size,
            "row payload length {} no longer matches its storage size {}",
            object.payload.len(),
            object.storage_size
        );

        out.extend_from_slice(&object.payload);
        Ok(())
    }

    fn deserialize(&self, position: u64, payload: &[u8]) -> Result<RawRow> {
        let mut row = RawRow::new(payload.to_vec(), self.scale);
        row.set_position(position);
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_size_rounds_up_to_scale() {
        assert_eq!(padded_size(17, 8), 24);
        assert_eq!(padded_size(9, 8), 16);
        assert_eq!(padded_size(4, 8), 8);
        assert_eq!(padded_size(0, 8), 8);
        assert_eq!(padded_size(12, 8), 16);
    }

    #[test]
    fn padded_size_with_scale_one_is_exact() {
        assert_eq!(padded_size(17, 1), 21);
        assert_eq!(padded_size(0, 1), 4);
    }

    #[test]
    fn raw_row_roundtrip_preserves_payload() {
        let codec = RawRowCodec::new(8);
        let row = RawRow::new(b"hello world".to_vec(), 8);

        let mut buf = Vec::new();
        codec.serialize(&row, &mut buf).unwrap();
        let back = codec.deserialize(7, &buf).unwrap();

        assert_eq!(back.payload(), b"hello world");
        assert_eq!(back.position(), 7);
        assert_eq!(back.storage_size(), row.storage_size());
    }
}
