//! Image handling infrastructure.
//!
//! This module provides:
//! - Memory caching with LRU eviction bounded by entry count and cost
//! - Disk caching for persistence across restarts
//! - Per-key loading state shared by every observer
//! - Async image loading pipeline with request coalescing

mod decode;
pub mod disk_cache;
pub mod http_fetcher;
pub mod loader;
pub mod loading_state;
pub mod memory_cache;

pub use decode::decode_image;
pub use disk_cache::DiskImageCache;
pub use http_fetcher::HttpImageFetcher;
pub use loader::{ImageLoader, ImageLoaderConfig, ImageRequest};
pub use loading_state::LoadingStateTable;
pub use memory_cache::{CacheStats, MemoryImageCache};
