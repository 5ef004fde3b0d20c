//! # Internal Macros
//!
//! This module provides internal macros for reducing boilerplate in rowfile.
//!
//! ## be_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! big-endian wrapper types (U32, U64). The on-disk format is big-endian
//! throughout, so every header struct carries wrapped fields and exposes
//! plain-integer accessors generated by this macro.
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::big_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct Header {
//!     free_pos: U64,
//!     flags: U32,
//! }
//!
//! impl Header {
//!     be_accessors! {
//!         free_pos: u64,
//!         flags: u32,
//!     }
//! }
//!
//! // Generates:
//! // pub fn free_pos(&self) -> u64 { self.free_pos.get() }
//! // pub fn set_free_pos(&mut self, val: u64) { self.free_pos = U64::new(val); }
//! // pub fn flags(&self) -> u32 { self.flags.get() }
//! // pub fn set_flags(&mut self, val: u32) { self.flags = U32::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy big-endian fields.
#[macro_export]
macro_rules! be_accessors {
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::big_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::big_endian::U64::new(val);
            }
        }
    };
    ($($field:ident: $ty:tt),+ $(,)?) => {
        $(
            $crate::be_accessors!(@impl $field, $ty);
        )+
    };
}
