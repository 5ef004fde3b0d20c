//! # Data-File Header
//!
//! Every data file begins with a fixed 32-byte header. The header is the
//! file's single source of truth for how much space is lost to freed rows,
//! where the next end-of-file allocation lands, and whether the previous
//! session shut down cleanly.
//!
//! ## Header Layout (32 bytes, big-endian)
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  -------------------------------------------
//! 0       4     reserved    Unused
//! 4       8     free_bytes  Total lost/free byte count
//! 12      8     free_pos    End-of-file / next-allocation pointer (bytes)
//! 20      8     space_ptr   Reserved for a free-space index (unused)
//! 28      4     flags       Bit flags, see below
//! ```
//!
//! ## Flags
//!
//! - bit 1 `SHADOWED`: incremental backup was active in the last session
//! - bit 2 `SAVED`: clean shutdown; cleared on the first unflushed write
//!   and set again only by a completed commit/close
//! - bit 3 `ROWINFO`: rows carry type info (owned by the codec layer)
//! - bit 4 `FORMAT_CURRENT`: written by this format generation
//! - bit 5 `FORMAT_REJECTED`: readers must refuse to open
//!
//! A file opened with `SAVED` unset ended its previous session uncleanly
//! and must be restored from backup before use.
//!
//! ## Zerocopy
//!
//! The struct is `#[repr(C)]` over big-endian wrapper fields and reads
//! directly from the header bytes without copying. Size is verified at
//! compile time.

use eyre::{ensure, Result};
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::be_accessors;
use crate::config::HEADER_SIZE;

pub const FLAG_SHADOWED: u32 = 1 << 0;
pub const FLAG_SAVED: u32 = 1 << 1;
pub const FLAG_ROWINFO: u32 = 1 << 2;
pub const FLAG_FORMAT_CURRENT: u32 = 1 << 3;
pub const FLAG_FORMAT_REJECTED: u32 = 1 << 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    reserved: [u8; 4],
    free_bytes: U64,
    free_pos: U64,
    space_ptr: U64,
    flags: U32,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == HEADER_SIZE);

impl FileHeader {
    /// Header for a freshly created file: the first allocation starts right
    /// after the header region, rounded up to the scale.
    pub fn new(scale: u32, shadowed: bool) -> Self {
        let first = (HEADER_SIZE as u64).div_ceil(scale as u64) * scale as u64;
        let mut flags = FLAG_SAVED | FLAG_FORMAT_CURRENT;
        if shadowed {
            flags |= FLAG_SHADOWED;
        }

        Self {
            reserved: [0u8; 4],
            free_bytes: U64::new(0),
            free_pos: U64::new(first),
            space_ptr: U64::new(0),
            flags: U32::new(flags),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= HEADER_SIZE,
            "buffer too small for file header: {} < {}",
            bytes.len(),
            HEADER_SIZE
        );

        Self::ref_from_bytes(&bytes[..HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse file header: {:?}", e))
    }

    be_accessors! {
        free_bytes: u64,
        free_pos: u64,
        space_ptr: u64,
        flags: u32,
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32, on: bool) {
        let flags = if on {
            self.flags() | flag
        } else {
            self.flags() & !flag
        };
        self.set_flags(flags);
    }

    /// True when this reader may open the file: the current format bit is
    /// present and the rejection bit is not.
    pub fn format_accepted(&self) -> bool {
        self.has_flag(FLAG_FORMAT_CURRENT) && !self.has_flag(FLAG_FORMAT_REJECTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes as _;

    #[test]
    fn header_size_is_32() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 32);
    }

    #[test]
    fn new_header_starts_after_header_region() {
        let header = FileHeader::new(8, false);

        assert_eq!(header.free_pos(), 32);
        assert_eq!(header.free_bytes(), 0);
        assert!(header.has_flag(FLAG_SAVED));
        assert!(header.format_accepted());
        assert!(!header.has_flag(FLAG_SHADOWED));
    }

    #[test]
    fn large_scale_rounds_first_allocation_up() {
        let header = FileHeader::new(1024, false);

        assert_eq!(header.free_pos(), 1024);
    }

    #[test]
    fn roundtrip_through_bytes() {
        let mut header = FileHeader::new(8, true);
        header.set_free_bytes(4096);
        header.set_free_pos(65536);

        let bytes = header.as_bytes();
        let parsed = FileHeader::from_bytes(bytes).unwrap();

        assert_eq!(parsed.free_bytes(), 4096);
        assert_eq!(parsed.free_pos(), 65536);
        assert!(parsed.has_flag(FLAG_SHADOWED));
    }

    #[test]
    fn fields_are_big_endian_on_disk() {
        let mut header = FileHeader::new(8, false);
        header.set_free_pos(0x0102_0304);

        let bytes = header.as_bytes();
        assert_eq!(&bytes[12..20], &[0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn rejected_format_is_not_accepted() {
        let mut header = FileHeader::new(8, false);
        header.set_flag(FLAG_FORMAT_REJECTED, true);

        assert!(!header.format_accepted());
    }

    #[test]
    fn saved_flag_toggles() {
        let mut header = FileHeader::new(8, false);

        header.set_flag(FLAG_SAVED, false);
        assert!(!header.has_flag(FLAG_SAVED));

        header.set_flag(FLAG_SAVED, true);
        assert!(header.has_flag(FLAG_SAVED));
    }
}
