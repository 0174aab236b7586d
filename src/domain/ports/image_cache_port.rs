//! Port definitions for image caching and loading.

use crate::domain::entities::{CacheKey, CachedImage, LoadedImage, LoadingState};
use crate::domain::errors::CacheResult;

/// Port for volatile image caches.
/// Implementations must be thread-safe.
#[async_trait::async_trait]
pub trait ImageCachePort: Send + Sync {
    /// Attempts to get an image from the cache.
    /// Returns None if not cached.
    async fn get(&self, key: &CacheKey) -> Option<CachedImage>;

    /// Stores an image in the cache.
    async fn put(&self, key: CacheKey, image: CachedImage);

    /// Removes an image from the cache.
    async fn evict(&self, key: &CacheKey);

    /// Returns the current number of cached images.
    fn len(&self) -> usize;

    /// Returns true if the cache is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears all images from the cache.
    async fn clear(&self);
}

/// Inbound port used by presentation code to acquire images.
#[async_trait::async_trait]
pub trait ImageLoaderPort: Send + Sync {
    /// Loads an image, checking caches first then network.
    async fn load(&self, source: &str) -> CacheResult<LoadedImage>;

    /// Loads an image and discards the failure reason.
    async fn load_image(&self, source: &str) -> Option<CachedImage> {
        self.load(source).await.ok().map(|loaded| loaded.image)
    }

    /// Returns the current loading state for a source.
    fn observe_loading_state(&self, source: &str) -> LoadingState;

    /// Starts loading without waiting for the result.
    fn load_async(&self, source: String);

    /// Cancels any pending load for the given source.
    fn cancel(&self, source: &str);
}
