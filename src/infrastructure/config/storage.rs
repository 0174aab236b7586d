//! Reading and writing `config.toml`.
//!
//! Values are range checked per section after parsing. A section that fails
//! its checks is replaced by its defaults so one bad value cannot disable the
//! cache; CLI overrides are checked strictly with [`AppConfig::validate`].

use super::app_config::{AppConfig, CacheConfig, NetworkConfig, PressureConfig};
use directories::ProjectDirs;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "pixcache";
const APP_NAME: &str = "pixcache";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors raised while locating, reading or checking the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform has no per-user configuration directory.
    #[error("failed to determine config directory")]
    ConfigDirNotFound,
    /// Reading or writing the configuration file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration could not be serialized.
    #[error("toml serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// The configuration file is not valid TOML.
    #[error("toml deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
    /// A value is out of range for its section.
    #[error("invalid [{section}] config: {reason}")]
    Invalid {
        /// Section holding the value.
        section: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

fn check_cache(cache: &CacheConfig) -> Result<(), String> {
    if cache.memory_max_entries == 0 {
        return Err("memory_max_entries must be at least 1".into());
    }
    if cache.memory_max_cost == 0 {
        return Err("memory_max_cost must be at least 1 byte".into());
    }
    if cache.disk_max_size == 0 {
        return Err("disk_max_size must be at least 1 byte".into());
    }
    if cache.state_table_capacity == 0 {
        return Err("state_table_capacity must be at least 1".into());
    }
    Ok(())
}

fn check_network(network: &NetworkConfig) -> Result<(), String> {
    if network.timeout_secs == 0 {
        return Err("timeout_secs must be at least 1".into());
    }
    if network.max_concurrent_downloads == 0 {
        return Err("max_concurrent_downloads must be at least 1".into());
    }
    if network.user_agent.trim().is_empty() {
        return Err("user_agent must not be empty".into());
    }
    Ok(())
}

fn check_pressure(pressure: &PressureConfig) -> Result<(), String> {
    if pressure.warning_threshold_mb == 0 {
        return Err("warning_threshold_mb must be at least 1".into());
    }
    if pressure.critical_threshold_mb < pressure.warning_threshold_mb {
        return Err(format!(
            "critical_threshold_mb ({}) is below warning_threshold_mb ({})",
            pressure.critical_threshold_mb, pressure.warning_threshold_mb
        ));
    }
    if pressure.sample_interval_secs == 0 {
        return Err("sample_interval_secs must be at least 1".into());
    }
    Ok(())
}

impl AppConfig {
    /// Checks every section, reporting the first out-of-range value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |section| move |reason| ConfigError::Invalid { section, reason };
        check_cache(&self.cache).map_err(invalid("cache"))?;
        check_network(&self.network).map_err(invalid("network"))?;
        check_pressure(&self.pressure).map_err(invalid("pressure"))?;
        Ok(())
    }

    /// Replaces every section that fails its checks with its defaults.
    /// A configured cache directory is kept.
    fn sanitize(mut self, path: &Path) -> Self {
        if let Err(reason) = check_cache(&self.cache) {
            warn!(path = %path.display(), section = "cache", reason = %reason, "Invalid config section, using defaults");
            self.cache = CacheConfig {
                cache_dir: self.cache.cache_dir.take(),
                ..CacheConfig::default()
            };
        }
        if let Err(reason) = check_network(&self.network) {
            warn!(path = %path.display(), section = "network", reason = %reason, "Invalid config section, using defaults");
            self.network = NetworkConfig::default();
        }
        if let Err(reason) = check_pressure(&self.pressure) {
            warn!(path = %path.display(), section = "pressure", reason = %reason, "Invalid config section, using defaults");
            self.pressure = PressureConfig::default();
        }
        self
    }
}

/// Locates, loads and saves the pixcache configuration file.
pub struct StorageManager {
    config_dir: PathBuf,
}

impl StorageManager {
    /// Uses the platform configuration directory for pixcache.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration directory cannot be determined.
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::ConfigDirNotFound)?;

        Ok(Self { config_dir })
    }

    /// Uses `path` as the configuration directory.
    #[must_use]
    pub fn with_dir(path: PathBuf) -> Self {
        Self { config_dir: path }
    }

    /// Path of `config.toml` inside the configuration directory.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    /// Loads `path_override` or the default `config.toml`.
    ///
    /// A missing file is created with defaults. An unparsable file yields
    /// defaults and is left untouched. Out-of-range sections fall back to
    /// their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or the default file
    /// cannot be written.
    pub fn load_config(&self, path_override: Option<&Path>) -> Result<AppConfig, ConfigError> {
        let config_path = path_override.map_or_else(|| self.config_path(), Path::to_path_buf);

        if !config_path.exists() {
            info!(path = %config_path.display(), "No config file, writing defaults");
            let config = AppConfig::default();
            Self::save_to_file(&config_path, &config)?;
            return Ok(config);
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str::<AppConfig>(&content) {
            Ok(config) => {
                debug!(path = %config_path.display(), "Loaded config file");
                Ok(config.sanitize(&config_path))
            }
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "Unparsable config file, using defaults");
                Ok(AppConfig::default())
            }
        }
    }

    /// Writes `config` to the default `config.toml`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be written.
    pub fn save_config(&self, config: &AppConfig) -> Result<(), ConfigError> {
        Self::save_to_file(&self.config_path(), config)
    }

    fn save_to_file(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(config)?;

        let parent = path
            .parent()
            .ok_or_else(|| std::io::Error::other("config path has no parent directory"))?;
        fs::create_dir_all(parent)?;
        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.persist(path).map_err(|e| e.error)?;

        Ok(())
    }
}
