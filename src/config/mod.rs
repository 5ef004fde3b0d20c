//! # Configuration Module
//!
//! This module centralizes all configuration for rowfile. Constants are
//! grouped by their functional area and interdependencies are documented and
//! enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! Scattered constants across multiple files lead to bugs where
//! interdependent values become mismatched. For example, the minimum row
//! allocation must never be smaller than the row length prefix, or a stored
//! row could not even record its own size. By co-locating these constants
//! and adding compile-time checks, we prevent such issues.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency
//!   documentation
//! - [`ScaledFileConfig`]: Per-store runtime configuration with a builder

mod constants;
mod options;

pub use constants::*;
pub use options::{DeviceKind, ScaledFileConfig, ScaledFileConfigBuilder};
