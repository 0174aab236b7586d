//! Infrastructure layer with cache tiers and external service adapters.

/// Application configuration.
pub mod config;
/// Image handling (caching, decoding, loading).
pub mod image;
/// Memory pressure detection.
pub mod memory;
/// Process-wide cache context.
pub mod runtime;
/// Background task scheduling.
pub mod tasks;

pub use config::{AppConfig, CliArgs, Command, LogLevel, StorageManager};
pub use image::{
    CacheStats, DiskImageCache, HttpImageFetcher, ImageLoader, ImageLoaderConfig, ImageRequest,
    LoadingStateTable, MemoryImageCache,
};
pub use memory::{
    MemoryPressureEvent, MemoryPressureMonitor, PressureBus, PressureLevel, SysinfoMemorySampler,
};
pub use runtime::ImageRuntime;
pub use tasks::TaskRegistry;
