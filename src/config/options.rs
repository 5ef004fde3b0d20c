//! # Per-Store Runtime Configuration
//!
//! `ScaledFileConfig` carries the knobs a page store is opened with: the
//! file scale, cache bounds, backup mode, read-only flag, and the backing
//! device kind. A builder validates the combination before any file is
//! touched, so an invalid scale is rejected up front rather than producing
//! a misaligned file.
//!
//! ## Scale Rules
//!
//! The scale is the byte granularity converting object positions to file
//! offsets. Legal values are exactly 1, or any power of two between 8 and
//! 1024. The scale also sets the row padding granularity and, together with
//! the 31-bit position encoding, the maximum file size (`2^31 * scale`).
//!
//! ## Usage
//!
//! ```ignore
//! let config = ScaledFileConfig::builder()
//!     .scale(8)
//!     .max_cache_rows(1024)
//!     .max_cache_bytes(4 * 1024 * 1024)
//!     .incremental_backup(true)
//!     .build()?;
//! ```

use eyre::{ensure, Result};

use super::{DEFAULT_CACHE_FILE_SCALE, DEFAULT_MAX_CACHE_BYTES, DEFAULT_MAX_CACHE_ROWS};

/// Selects the backing block-device implementation for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceKind {
    /// Plain random-access file I/O.
    #[default]
    File,
    /// Memory-mapped file, used when the file fits the configured threshold.
    Mmap,
    /// Process-memory buffer; nothing touches the filesystem.
    Memory,
}

#[derive(Debug, Clone)]
pub struct ScaledFileConfig {
    scale: u32,
    max_cache_rows: usize,
    max_cache_bytes: usize,
    incremental_backup: bool,
    read_only: bool,
    device: DeviceKind,
}

impl ScaledFileConfig {
    pub fn builder() -> ScaledFileConfigBuilder {
        ScaledFileConfigBuilder::default()
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn max_cache_rows(&self) -> usize {
        self.max_cache_rows
    }

    pub fn max_cache_bytes(&self) -> usize {
        self.max_cache_bytes
    }

    pub fn incremental_backup(&self) -> bool {
        self.incremental_backup
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }
}

impl Default for ScaledFileConfig {
    fn default() -> Self {
        ScaledFileConfigBuilder::default()
            .build()
            .expect("default configuration is valid")
    }
}

#[derive(Debug, Clone)]
pub struct ScaledFileConfigBuilder {
    scale: u32,
    max_cache_rows: usize,
    max_cache_bytes: usize,
    incremental_backup: bool,
    read_only: bool,
    device: DeviceKind,
}

impl Default for ScaledFileConfigBuilder {
    fn default() -> Self {
        Self {
            scale: DEFAULT_CACHE_FILE_SCALE,
            max_cache_rows: DEFAULT_MAX_CACHE_ROWS,
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            incremental_backup: false,
            read_only: false,
            device: DeviceKind::File,
        }
    }
}

impl ScaledFileConfigBuilder {
    pub fn scale(mut self, scale: u32) -> Self {
        self.scale = scale;
        self
    }

    pub fn max_cache_rows(mut self, rows: usize) -> Self {
        self.max_cache_rows = rows;
        self
    }

    pub fn max_cache_bytes(mut self, bytes: usize) -> Self {
        self.max_cache_bytes = bytes;
        self
    }

    pub fn incremental_backup(mut self, enabled: bool) -> Self {
        self.incremental_backup = enabled;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn device(mut self, device: DeviceKind) -> Self {
        self.device = device;
        self
    }

    pub fn build(self) -> Result<ScaledFileConfig> {
        ensure!(
            self.scale == 1 || (self.scale.is_power_of_two() && (8..=1024).contains(&self.scale)),
            "illegal file scale {}: must be 1 or a power of two in 8..=1024",
            self.scale
        );

        ensure!(
            self.max_cache_rows > 0,
            "cache row limit must be at least 1"
        );

        ensure!(
            self.max_cache_bytes as u64 >= self.scale as u64,
            "cache byte limit {} is smaller than one row allocation unit {}",
            self.max_cache_bytes,
            self.scale
        );

        Ok(ScaledFileConfig {
            scale: self.scale,
            max_cache_rows: self.max_cache_rows,
            max_cache_bytes: self.max_cache_bytes,
            incremental_backup: self.incremental_backup,
            read_only: self.read_only,
            device: self.device,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ScaledFileConfig::default();

        assert_eq!(config.scale(), DEFAULT_CACHE_FILE_SCALE);
        assert!(!config.incremental_backup());
        assert!(!config.read_only());
    }

    #[test]
    fn builder_accepts_scale_one() {
        let config = ScaledFileConfig::builder().scale(1).build().unwrap();

        assert_eq!(config.scale(), 1);
    }

    #[test]
    fn builder_accepts_power_of_two_scales() {
        for scale in [8, 16, 32, 64, 128, 256, 512, 1024] {
            let config = ScaledFileConfig::builder().scale(scale).build().unwrap();
            assert_eq!(config.scale(), scale);
        }
    }

    #[test]
    fn builder_rejects_illegal_scales() {
        for scale in [0, 2, 4, 7, 12, 2048] {
            assert!(ScaledFileConfig::builder().scale(scale).build().is_err());
        }
    }

    #[test]
    fn builder_rejects_zero_row_limit() {
        let result = ScaledFileConfig::builder().max_cache_rows(0).build();

        assert!(result.is_err());
    }
}
