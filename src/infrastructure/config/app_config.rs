//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::args::CliArgs;
use crate::infrastructure::image::ImageLoaderConfig;
use crate::infrastructure::image::disk_cache::{DEFAULT_MAX_CACHE_SIZE, default_cache_dir};
use crate::infrastructure::image::http_fetcher::{DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT};
use crate::infrastructure::image::loading_state::DEFAULT_STATE_CAPACITY;
use crate::infrastructure::image::memory_cache::{DEFAULT_MAX_COST, DEFAULT_MAX_ENTRIES};
use crate::infrastructure::memory::PressureThresholds;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log file path.
    #[serde(skip)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Memory and disk tier limits.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Network fetch settings.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Memory pressure monitoring.
    #[serde(default)]
    pub pressure: PressureConfig,
}

/// Cache tier configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disk cache directory. Defaults to the platform cache directory.
    pub cache_dir: Option<PathBuf>,

    /// Maximum images held in memory.
    pub memory_max_entries: usize,

    /// Maximum total decoded size held in memory, in bytes.
    pub memory_max_cost: usize,

    /// Disk cache budget in bytes.
    pub disk_max_size: u64,

    /// Loading states kept before unobserved ones are pruned.
    pub state_table_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            memory_max_entries: DEFAULT_MAX_ENTRIES,
            memory_max_cost: DEFAULT_MAX_COST,
            disk_max_size: DEFAULT_MAX_CACHE_SIZE,
            state_table_capacity: DEFAULT_STATE_CAPACITY,
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// Maximum simultaneous downloads.
    pub max_concurrent_downloads: usize,

    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_concurrent_downloads: 4,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Memory pressure configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Run the background memory sampler.
    pub enabled: bool,

    /// Resident memory that raises a warning-level event, in megabytes.
    pub warning_threshold_mb: u64,

    /// Resident memory that raises a critical-level event, in megabytes.
    pub critical_threshold_mb: u64,

    /// Seconds between samples.
    pub sample_interval_secs: u64,

    /// Cancel in-flight downloads when pressure is signalled.
    pub cancel_fetches_on_pressure: bool,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold_mb: 500,
            critical_threshold_mb: 1000,
            sample_interval_secs: 5,
            cancel_fetches_on_pressure: true,
        }
    }
}

impl PressureConfig {
    /// Warning and critical thresholds in bytes.
    #[must_use]
    pub const fn thresholds(&self) -> PressureThresholds {
        PressureThresholds::from_mb(self.warning_threshold_mb, self.critical_threshold_mb)
    }

    /// Time between samples, never shorter than one second.
    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }
}

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(cache_dir) = &args.cache_dir {
            self.cache.cache_dir = Some(cache_dir.clone());
        }
        if let Some(disk_max_mb) = args.disk_max_mb {
            self.cache.disk_max_size = disk_max_mb * BYTES_PER_MB;
        }
        if let Some(threshold) = args.memory_threshold_mb {
            self.pressure.warning_threshold_mb = threshold;
            if self.pressure.critical_threshold_mb < threshold {
                self.pressure.critical_threshold_mb = threshold * 2;
            }
        }
    }

    /// Builds the loader configuration from the cache, network and pressure sections.
    #[must_use]
    pub fn loader_config(&self) -> ImageLoaderConfig {
        ImageLoaderConfig {
            memory_max_entries: self.cache.memory_max_entries,
            memory_max_cost: self.cache.memory_max_cost,
            max_concurrent_downloads: self.network.max_concurrent_downloads,
            state_table_capacity: self.cache.state_table_capacity,
            cancel_fetches_on_pressure: self.pressure.cancel_fetches_on_pressure,
        }
    }

    /// Returns the configured disk cache directory or the platform default.
    #[must_use]
    pub fn effective_cache_dir(&self) -> PathBuf {
        self.cache.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_partial_config() {
        let toml_content = r#"
            log_level = "debug"

            [cache]
            cache_dir = "/tmp/pix"
            disk_max_size = 1048576

            [pressure]
            enabled = false
        "#;

        let config: AppConfig = toml::from_str(toml_content).expect("Failed to parse config");

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.cache.cache_dir, Some(PathBuf::from("/tmp/pix")));
        assert_eq!(config.cache.disk_max_size, 1_048_576);
        assert_eq!(config.cache.memory_max_entries, DEFAULT_MAX_ENTRIES);
        assert!(!config.pressure.enabled);
        assert_eq!(config.pressure.warning_threshold_mb, 500);
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.cache.memory_max_cost, 50 * 1024 * 1024);
        assert_eq!(config.cache.disk_max_size, 100 * 1024 * 1024);
        assert_eq!(config.network.timeout_secs, 30);
        assert!(config.pressure.cancel_fetches_on_pressure);
    }

    #[test]
    fn test_merge_with_args() {
        let mut config = AppConfig::default();
        let args = CliArgs::parse_from([
            "pixcache",
            "--cache-dir",
            "/var/cache/pix",
            "--disk-max-mb",
            "10",
            "--memory-threshold-mb",
            "2000",
            "--log-level",
            "trace",
        ]);

        config.merge_with_args(&args);

        assert_eq!(config.effective_cache_dir(), PathBuf::from("/var/cache/pix"));
        assert_eq!(config.cache.disk_max_size, 10 * 1024 * 1024);
        assert_eq!(config.pressure.warning_threshold_mb, 2000);
        assert_eq!(config.pressure.critical_threshold_mb, 4000);
        assert_eq!(config.log_level, LogLevel::Trace);
    }

    #[test]
    fn test_zero_disk_budget_from_args_fails_validation() {
        let mut config = AppConfig::default();
        let args = CliArgs::parse_from(["pixcache", "--disk-max-mb", "0"]);

        config.merge_with_args(&args);

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loader_config_follows_sections() {
        let mut config = AppConfig::default();
        config.network.max_concurrent_downloads = 8;
        config.pressure.cancel_fetches_on_pressure = false;

        let loader = config.loader_config();

        assert_eq!(loader.max_concurrent_downloads, 8);
        assert!(!loader.cancel_fetches_on_pressure);
        assert_eq!(loader.memory_max_entries, config.cache.memory_max_entries);
    }
}
