//! Domain layer with core cache entities and port definitions.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;

pub use entities::{CacheKey, CachedImage, ImageSource, LoadedImage, LoadingPhase, LoadingState};
pub use errors::{CacheError, CacheResult};
pub use ports::{ImageCachePort, ImageFetchPort, ImageLoaderPort, MemorySamplerPort};
