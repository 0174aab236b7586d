use super::app_config::LogLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pixcache",
    version,
    about = "Tiered image cache with memory, disk and network layers",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH")]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Disk cache directory.
    #[arg(long, env = "PIXCACHE_CACHE_DIR", value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Disk cache budget in megabytes.
    #[arg(long, value_name = "MB")]
    pub disk_max_mb: Option<u64>,

    /// Resident memory that triggers a warning-level pressure event, in megabytes.
    #[arg(long, value_name = "MB")]
    pub memory_threshold_mb: Option<u64>,

    /// Action to run. Defaults to `stats`.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Load images through the cache and report which tier served each.
    Fetch {
        /// Image URLs.
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,
    },
    /// Show disk cache usage.
    Stats {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Remove every image from the disk cache.
    Clear,
}

impl Default for Command {
    fn default() -> Self {
        Self::Stats { json: false }
    }
}
