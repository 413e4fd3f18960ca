//! Configuration for the logging subsystem: defaults and invariant checks
//! are applied once in `build()`, not scattered across call sites.

use serde::{Deserialize, Serialize};

pub const DEFAULT_FLASH_PAGE_SIZE: u32 = 4 * 1024;
pub const DEFAULT_WRITE_BUFFER_SIZE: u32 = 16 * 1024 * 1024;
pub const DEFAULT_LOG_SEGMENT_SIZE: u32 = 8 * 1024 * 1024;
pub const DEFAULT_SECONDARY_LOG_BUFFER_SIZE: u32 = 128 * 1024;
pub const DEFAULT_PRIMARY_LOG_SIZE: u64 = 256 * 1024 * 1024;
pub const DEFAULT_BACKUP_RANGE_SIZE: u64 = 256 * 1024 * 1024;
pub const DEFAULT_REORG_UTILISATION_THRESHOLD: f32 = 0.60;
pub const DEFAULT_PROCESSTHREAD_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_SMALL_BUFFER_POOL_SIZE: usize = 64;
pub const FLUSH_THRESHOLD_FRACTION: f64 = 0.45;

/// Selects which [`crate::io_backend::DiskBackend`] implementation backs a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardDriveAccessMode {
    Buffered,
    Direct,
    Raw,
}

impl Default for HardDriveAccessMode {
    fn default() -> Self {
        HardDriveAccessMode::Buffered
    }
}

/// Validated, immutable configuration for a [`crate::subsystem::LogSubsystem`].
#[derive(Debug, Clone)]
pub struct Config {
    pub write_buffer_size: u32,
    pub flash_page_size: u32,
    pub log_segment_size: u32,
    pub secondary_log_buffer_size: u32,
    pub primary_log_size: u64,
    pub backup_range_size: u64,
    pub reorg_utilisation_threshold: f32,
    pub use_checksum: bool,
    pub harddrive_access_mode: HardDriveAccessMode,
    pub raw_device_path: Option<std::path::PathBuf>,
    pub two_level_logging: bool,
    pub small_buffer_pool_size: usize,
    pub processthread_timeout_ms: u64,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn secondary_log_size(&self) -> u64 {
        2 * self.backup_range_size
    }

    pub fn flush_threshold(&self) -> u32 {
        (self.write_buffer_size as f64 * FLUSH_THRESHOLD_FRACTION) as u32
    }

    /// Largest payload a single entry may carry before it must be split into
    /// chained parts, leaving room for the worst-case header.
    pub fn max_entry_size(&self) -> u32 {
        self.log_segment_size
            .saturating_sub(crate::header::MAX_HEADER_SIZE as u32)
    }
}

/// Error returned by [`ConfigBuilder::build`] when the configured knobs
/// violate a validation rule.
#[derive(Debug, snafu::Snafu)]
pub enum ConfigError {
    #[snafu(display("write_buffer_size must be a power of two, >= flash_page_size and <= 1 GiB, got {value}"))]
    InvalidWriteBufferSize { value: u32 },

    #[snafu(display("log_segment_size must be a power of two >= flash_page_size, got {value}"))]
    InvalidSegmentSize { value: u32 },

    #[snafu(display("reorg_utilisation_threshold must be in (0, 1), got {value}"))]
    InvalidThreshold { value: f32 },

    #[snafu(display("raw_device_path is required when harddrive_access_mode is Raw"))]
    MissingRawDevicePath,
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    write_buffer_size: Option<u32>,
    flash_page_size: Option<u32>,
    log_segment_size: Option<u32>,
    secondary_log_buffer_size: Option<u32>,
    primary_log_size: Option<u64>,
    backup_range_size: Option<u64>,
    reorg_utilisation_threshold: Option<f32>,
    use_checksum: Option<bool>,
    harddrive_access_mode: Option<HardDriveAccessMode>,
    raw_device_path: Option<std::path::PathBuf>,
    two_level_logging: Option<bool>,
    small_buffer_pool_size: Option<usize>,
    processthread_timeout_ms: Option<u64>,
}

impl ConfigBuilder {
    pub fn write_buffer_size(mut self, value: u32) -> Self {
        self.write_buffer_size = Some(value);
        self
    }

    pub fn flash_page_size(mut self, value: u32) -> Self {
        self.flash_page_size = Some(value);
        self
    }

    pub fn log_segment_size(mut self, value: u32) -> Self {
        self.log_segment_size = Some(value);
        self
    }

    pub fn secondary_log_buffer_size(mut self, value: u32) -> Self {
        self.secondary_log_buffer_size = Some(value);
        self
    }

    pub fn primary_log_size(mut self, value: u64) -> Self {
        self.primary_log_size = Some(value);
        self
    }

    pub fn backup_range_size(mut self, value: u64) -> Self {
        self.backup_range_size = Some(value);
        self
    }

    pub fn reorg_utilisation_threshold(mut self, value: f32) -> Self {
        self.reorg_utilisation_threshold = Some(value);
        self
    }

    pub fn use_checksum(mut self, value: bool) -> Self {
        self.use_checksum = Some(value);
        self
    }

    pub fn harddrive_access_mode(mut self, value: HardDriveAccessMode) -> Self {
        self.harddrive_access_mode = Some(value);
        self
    }

    pub fn raw_device_path(mut self, value: std::path::PathBuf) -> Self {
        self.raw_device_path = Some(value);
        self
    }

    pub fn two_level_logging(mut self, value: bool) -> Self {
        self.two_level_logging = Some(value);
        self
    }

    pub fn small_buffer_pool_size(mut self, value: usize) -> Self {
        self.small_buffer_pool_size = Some(value);
        self
    }

    pub fn processthread_timeout_ms(mut self, value: u64) -> Self {
        self.processthread_timeout_ms = Some(value);
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        let flash_page_size = self.flash_page_size.unwrap_or(DEFAULT_FLASH_PAGE_SIZE);
        let write_buffer_size = self.write_buffer_size.unwrap_or(DEFAULT_WRITE_BUFFER_SIZE);
        let log_segment_size = self.log_segment_size.unwrap_or(DEFAULT_LOG_SEGMENT_SIZE);
        let reorg_utilisation_threshold = self
            .reorg_utilisation_threshold
            .unwrap_or(DEFAULT_REORG_UTILISATION_THRESHOLD);

        if !write_buffer_size.is_power_of_two()
            || write_buffer_size < flash_page_size
            || (write_buffer_size as u64) > (1 << 30)
        {
            return Err(ConfigError::InvalidWriteBufferSize {
                value: write_buffer_size,
            });
        }

        if !log_segment_size.is_power_of_two() || log_segment_size < flash_page_size {
            return Err(ConfigError::InvalidSegmentSize {
                value: log_segment_size,
            });
        }

        if !(reorg_utilisation_threshold > 0.0 && reorg_utilisation_threshold < 1.0) {
            return Err(ConfigError::InvalidThreshold {
                value: reorg_utilisation_threshold,
            });
        }

        let harddrive_access_mode = self.harddrive_access_mode.unwrap_or_default();
        if harddrive_access_mode == HardDriveAccessMode::Raw && self.raw_device_path.is_none() {
            return Err(ConfigError::MissingRawDevicePath);
        }

        Ok(Config {
            write_buffer_size,
            flash_page_size,
            log_segment_size,
            secondary_log_buffer_size: self
                .secondary_log_buffer_size
                .unwrap_or(DEFAULT_SECONDARY_LOG_BUFFER_SIZE),
            primary_log_size: self.primary_log_size.unwrap_or(DEFAULT_PRIMARY_LOG_SIZE),
            backup_range_size: self.backup_range_size.unwrap_or(DEFAULT_BACKUP_RANGE_SIZE),
            reorg_utilisation_threshold,
            use_checksum: self.use_checksum.unwrap_or(true),
            harddrive_access_mode,
            raw_device_path: self.raw_device_path,
            two_level_logging: self.two_level_logging.unwrap_or(true),
            small_buffer_pool_size: self
                .small_buffer_pool_size
                .unwrap_or(DEFAULT_SMALL_BUFFER_POOL_SIZE),
            processthread_timeout_ms: self
                .processthread_timeout_ms
                .unwrap_or(DEFAULT_PROCESSTHREAD_TIMEOUT_MS),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_build_succeeds() {
        let cfg = Config::builder().build().unwrap();
        assert_eq!(cfg.secondary_log_size(), 2 * DEFAULT_BACKUP_RANGE_SIZE);
    }

    #[test]
    fn rejects_non_power_of_two_write_buffer() {
        let err = Config::builder().write_buffer_size(100_000).build();
        assert!(matches!(err, Err(ConfigError::InvalidWriteBufferSize { .. })));
    }

    #[test]
    fn rejects_raw_mode_without_device_path() {
        let err = Config::builder()
            .harddrive_access_mode(HardDriveAccessMode::Raw)
            .build();
        assert!(matches!(err, Err(ConfigError::MissingRawDevicePath)));
    }
}
