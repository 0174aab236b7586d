//! Async image loading orchestrator.
//!
//! Implements a three-tier cache: Memory -> Disk -> Network
//!
//! Requests are coalesced per key: the first request to miss memory marks
//! the key `Loading` and schedules one job on the task registry. The job
//! looks at the memory tier again, then the disk tier, then the network.
//! Every later request for that key joins the job and waits for the result
//! of that job's generation.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::entities::{CacheKey, CachedImage, ImageSource, LoadedImage, LoadingState};
use crate::domain::errors::{CacheError, CacheResult};
use crate::domain::ports::{ImageCachePort, ImageFetchPort, ImageLoaderPort};
use crate::infrastructure::memory::PressureSubscription;
use crate::infrastructure::tasks::TaskRegistry;

use super::decode::decode_image;
use super::disk_cache::DiskImageCache;
use super::loading_state::{
    Begin, DEFAULT_STATE_CAPACITY, FetchOutcome, LoadingStateTable, OutcomeReceiver,
};
use super::memory_cache::{CacheStats, DEFAULT_MAX_COST, DEFAULT_MAX_ENTRIES, MemoryImageCache};

/// Configuration for the image loader.
#[derive(Debug, Clone)]
pub struct ImageLoaderConfig {
    /// Maximum images in memory cache.
    pub memory_max_entries: usize,
    /// Maximum total cost of the memory cache in bytes.
    pub memory_max_cost: usize,
    /// Maximum concurrent downloads.
    pub max_concurrent_downloads: usize,
    /// Loading states kept before unobserved terminal ones are pruned.
    pub state_table_capacity: usize,
    /// Cancel in-flight fetches when memory pressure is signalled.
    pub cancel_fetches_on_pressure: bool,
}

impl Default for ImageLoaderConfig {
    fn default() -> Self {
        Self {
            memory_max_entries: DEFAULT_MAX_ENTRIES,
            memory_max_cost: DEFAULT_MAX_COST,
            max_concurrent_downloads: 4,
            state_table_capacity: DEFAULT_STATE_CAPACITY,
            cancel_fetches_on_pressure: true,
        }
    }
}

/// Orchestrates image loading from memory, disk, and network.
///
/// Cloning is cheap and yields a handle to the same caches.
#[derive(Clone)]
pub struct ImageLoader {
    memory_cache: Arc<MemoryImageCache>,
    disk_cache: Arc<DiskImageCache>,
    fetcher: Arc<dyn ImageFetchPort>,
    tasks: Arc<TaskRegistry<CacheKey>>,
    states: Arc<LoadingStateTable>,
    semaphore: Arc<Semaphore>,
    config: ImageLoaderConfig,
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ImageLoader {
    /// Creates a new image loader with an empty memory tier.
    #[must_use]
    pub fn new(
        config: ImageLoaderConfig,
        fetcher: Arc<dyn ImageFetchPort>,
        disk_cache: Arc<DiskImageCache>,
    ) -> Self {
        let memory_cache = Arc::new(MemoryImageCache::new(
            config.memory_max_entries,
            config.memory_max_cost,
        ));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1)));
        let states = Arc::new(LoadingStateTable::new(config.state_table_capacity));

        Self {
            memory_cache,
            disk_cache,
            fetcher,
            tasks: Arc::new(TaskRegistry::new()),
            states,
            semaphore,
            config,
        }
    }

    /// Resolves `source` through the tiers and returns a handle to the result.
    ///
    /// Memory hits resolve immediately. Otherwise the handle is attached to
    /// the in-flight job for the key, starting one if none is running; only
    /// that job reads the disk tier or the network. Dropping the handle
    /// releases the caller's interest.
    pub async fn request(&self, source: &str) -> ImageRequest {
        let key = CacheKey::new(source);

        if let Some(image) = self.memory_cache.get(&key).await {
            self.states.publish_ready(&key, image.clone());
            return ImageRequest::ready(key, image, ImageSource::MemoryCache);
        }

        match self.states.begin(&key) {
            Begin::Joined {
                generation,
                outcome,
            } => {
                debug!(key = %key, "Coalescing with in-flight fetch");
                let interest = self.interest(&key, generation);
                ImageRequest::pending(key, outcome, interest, true)
            }
            Begin::Started {
                generation,
                outcome,
            } => {
                let job = FetchJob {
                    key: key.clone(),
                    generation,
                    memory_cache: self.memory_cache.clone(),
                    disk_cache: self.disk_cache.clone(),
                    fetcher: self.fetcher.clone(),
                    states: self.states.clone(),
                    semaphore: self.semaphore.clone(),
                };
                // The state table already decided this key has no fetch in
                // flight, so any registry entry left for it is finishing.
                self.tasks.schedule(key.clone(), move |token| job.run(token));
                let interest = self.interest(&key, generation);
                ImageRequest::pending(key, outcome, interest, false)
            }
        }
    }

    /// Loads an image, checking caches first.
    ///
    /// # Errors
    /// Returns error if the image cannot be fetched or decoded, or if the
    /// fetch was cancelled.
    pub async fn load(&self, source: &str) -> CacheResult<LoadedImage> {
        self.request(source).await.wait().await
    }

    /// One-shot load that maps any failure to `None`.
    pub async fn load_image(&self, source: &str) -> Option<CachedImage> {
        match self.load(source).await {
            Ok(loaded) => Some(loaded.image),
            Err(e) => {
                debug!(source = %source, error = %e, "Image unavailable");
                None
            }
        }
    }

    /// Starts loading an image without waiting for it.
    /// Progress is visible through [`Self::observe_loading_state`].
    pub fn load_async(&self, source: String) {
        let loader = self.clone();
        tokio::spawn(async move {
            loader.request(&source).await.detach();
        });
    }

    /// Prefetches multiple images into cache.
    pub fn prefetch<I>(&self, sources: I)
    where
        I: IntoIterator<Item = String>,
    {
        for source in sources {
            self.load_async(source);
        }
    }

    /// Returns the current loading state for `source`.
    pub fn observe_loading_state(&self, source: &str) -> LoadingState {
        let key = CacheKey::new(source);
        match self.states.state(&key) {
            LoadingState::Idle => self
                .memory_cache
                .peek(&key)
                .map_or(LoadingState::Idle, LoadingState::Loaded),
            state => state,
        }
    }

    /// Subscribes to loading state changes for `source`.
    pub fn subscribe(&self, source: &str) -> watch::Receiver<LoadingState> {
        self.states.subscribe(&CacheKey::new(source))
    }

    /// Cancels the in-flight fetch for `source`, regardless of observers.
    pub fn cancel(&self, source: &str) -> bool {
        let cancelled = self.tasks.cancel(&CacheKey::new(source));
        if cancelled {
            debug!(source = %source, "Cancelled image load");
        }
        cancelled
    }

    /// Cancels every in-flight fetch.
    pub fn cancel_all(&self) -> usize {
        let count = self.tasks.cancel_all();
        if count > 0 {
            debug!(count = count, "Cancelled all pending image loads");
        }
        count
    }

    /// Returns true if a fetch for `source` is in flight.
    pub fn is_loading(&self, source: &str) -> bool {
        self.states.state(&CacheKey::new(source)).is_loading()
    }

    /// Returns the number of in-flight fetches.
    pub fn pending_count(&self) -> usize {
        self.tasks.len()
    }

    /// Drops the memory tier and terminal loading states, keeping the disk
    /// tier. In-flight fetches are cancelled when configured to.
    pub async fn handle_memory_pressure(&self) {
        let evicted = self.memory_cache.len();
        self.memory_cache.clear().await;
        let cancelled = if self.config.cancel_fetches_on_pressure {
            self.tasks.cancel_all()
        } else {
            0
        };
        self.states.reset_terminal();
        info!(
            evicted = evicted,
            cancelled = cancelled,
            "Memory pressure: cleared image memory cache"
        );
    }

    /// Spawns a listener that handles every event from `subscription`.
    pub fn listen_for_pressure(&self, mut subscription: PressureSubscription) -> JoinHandle<()> {
        let loader = self.clone();
        tokio::spawn(async move {
            while subscription.recv().await.is_some() {
                loader.handle_memory_pressure().await;
            }
            debug!("Memory pressure channel closed");
        })
    }

    /// Returns memory cache statistics.
    #[must_use]
    pub fn memory_cache_stats(&self) -> CacheStats {
        self.memory_cache.stats()
    }

    /// Returns the memory tier.
    #[must_use]
    pub fn memory_cache(&self) -> &Arc<MemoryImageCache> {
        &self.memory_cache
    }

    /// Returns the disk tier.
    #[must_use]
    pub fn disk_cache(&self) -> &Arc<DiskImageCache> {
        &self.disk_cache
    }

    /// Cancels all fetches and clears every tier.
    pub async fn clear_all(&self) {
        self.tasks.cancel_all();
        self.memory_cache.clear().await;
        self.disk_cache.clear().await;
        self.states.reset_terminal();
        info!("Cleared all image caches");
    }

    /// Cancels all fetches and waits for them to stop.
    pub async fn shutdown(&self) {
        self.tasks.shutdown().await;
    }

    fn interest(&self, key: &CacheKey, generation: u64) -> Interest {
        Interest {
            key: key.clone(),
            generation,
            states: self.states.clone(),
            tasks: self.tasks.clone(),
            armed: true,
        }
    }
}

#[async_trait::async_trait]
impl ImageLoaderPort for ImageLoader {
    async fn load(&self, source: &str) -> CacheResult<LoadedImage> {
        ImageLoader::request(self, source).await.wait().await
    }

    fn observe_loading_state(&self, source: &str) -> LoadingState {
        ImageLoader::observe_loading_state(self, source)
    }

    fn load_async(&self, source: String) {
        ImageLoader::load_async(self, source);
    }

    fn cancel(&self, source: &str) {
        ImageLoader::cancel(self, source);
    }
}

/// One tier walk for a key, run on the task registry.
struct FetchJob {
    key: CacheKey,
    generation: u64,
    memory_cache: Arc<MemoryImageCache>,
    disk_cache: Arc<DiskImageCache>,
    fetcher: Arc<dyn ImageFetchPort>,
    states: Arc<LoadingStateTable>,
    semaphore: Arc<Semaphore>,
}

impl FetchJob {
    async fn run(self, token: CancellationToken) {
        let started = Instant::now();
        let outcome: FetchOutcome = tokio::select! {
            biased;
            () = token.cancelled() => Err(CacheError::Cancelled),
            result = self.resolve() => result,
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &outcome {
            Ok(loaded) => {
                debug!(key = %self.key, elapsed_ms, source = %loaded.source, "Image loaded successfully");
            }
            Err(CacheError::Cancelled) => {
                debug!(key = %self.key, elapsed_ms, "Image fetch cancelled");
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, elapsed_ms, "Image fetch failed");
            }
        }
        self.states.publish(&self.key, self.generation, outcome);
    }

    async fn resolve(&self) -> FetchOutcome {
        // A job started right after another one settled finds its image here.
        let (image, source) = if let Some(image) = self.memory_cache.peek(&self.key) {
            (image, ImageSource::MemoryCache)
        } else if let Some(image) = self.load_from_disk().await {
            self.memory_cache.put(self.key.clone(), image.clone()).await;
            (image, ImageSource::DiskCache)
        } else {
            (self.fetch().await?, ImageSource::Network)
        };

        Ok(LoadedImage {
            key: self.key.clone(),
            image,
            source,
        })
    }

    async fn load_from_disk(&self) -> Option<CachedImage> {
        let bytes = self.disk_cache.read(&self.key).await?;
        match decode_image(Bytes::from(bytes)).await {
            Ok(image) => {
                debug!(key = %self.key, "Decoded image from disk cache");
                Some(image)
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Discarding undecodable disk cache entry");
                self.disk_cache.remove(&self.key).await;
                None
            }
        }
    }

    /// Downloads, decodes and stores the image. Nothing is cached unless the
    /// bytes decode.
    async fn fetch(&self) -> CacheResult<CachedImage> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| CacheError::Cancelled)?;

        debug!(key = %self.key, "Downloading image from network");
        let bytes = self.fetcher.fetch_bytes(self.key.as_str()).await?;
        let image = decode_image(bytes.clone()).await?;

        self.disk_cache.write(&self.key, &bytes).await;
        self.memory_cache.put(self.key.clone(), image.clone()).await;
        Ok(image)
    }
}

/// One caller's interest in an in-flight fetch.
///
/// Dropping the last interest in a fetch that is still loading cancels it.
struct Interest {
    key: CacheKey,
    generation: u64,
    states: Arc<LoadingStateTable>,
    tasks: Arc<TaskRegistry<CacheKey>>,
    armed: bool,
}

impl Drop for Interest {
    fn drop(&mut self) {
        if self.armed && self.states.release(&self.key, self.generation) {
            debug!(key = %self.key, "No observers left, cancelling fetch");
            self.tasks.cancel(&self.key);
        }
    }
}

enum Resolution {
    Ready {
        image: CachedImage,
        source: ImageSource,
    },
    Pending {
        outcome: OutcomeReceiver,
        interest: Interest,
        coalesced: bool,
    },
}

/// Handle to a single `request` for an image.
pub struct ImageRequest {
    key: CacheKey,
    resolution: Resolution,
}

impl std::fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRequest")
            .field("key", &self.key)
            .field("state", &self.state().phase())
            .finish_non_exhaustive()
    }
}

impl ImageRequest {
    fn ready(key: CacheKey, image: CachedImage, source: ImageSource) -> Self {
        Self {
            key,
            resolution: Resolution::Ready { image, source },
        }
    }

    fn pending(
        key: CacheKey,
        outcome: OutcomeReceiver,
        interest: Interest,
        coalesced: bool,
    ) -> Self {
        Self {
            key,
            resolution: Resolution::Pending {
                outcome,
                interest,
                coalesced,
            },
        }
    }

    /// The key this request resolves.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The tier that satisfied the request, if it resolved from a cache.
    #[must_use]
    pub fn cached_source(&self) -> Option<ImageSource> {
        match &self.resolution {
            Resolution::Ready { source, .. } => Some(*source),
            Resolution::Pending { .. } => None,
        }
    }

    /// Returns true if this request attached to a fetch started by another.
    #[must_use]
    pub fn is_coalesced(&self) -> bool {
        matches!(
            self.resolution,
            Resolution::Pending {
                coalesced: true,
                ..
            }
        )
    }

    /// Returns the state of the fetch this request is attached to.
    ///
    /// Once that fetch settles the result is kept here even if the key's
    /// shared state is later reset or reused.
    #[must_use]
    pub fn state(&self) -> LoadingState {
        match &self.resolution {
            Resolution::Ready { image, .. } => LoadingState::Loaded(image.clone()),
            Resolution::Pending { outcome, .. } => match &*outcome.borrow() {
                None => LoadingState::Loading,
                Some(Ok(loaded)) => LoadingState::Loaded(loaded.image.clone()),
                Some(Err(CacheError::Cancelled)) => LoadingState::Idle,
                Some(Err(e)) => LoadingState::Failed(e.clone()),
            },
        }
    }

    /// Waits for the terminal state.
    ///
    /// # Errors
    /// Returns the fetch error, or `Cancelled` if the fetch was cancelled.
    pub async fn wait(self) -> CacheResult<LoadedImage> {
        let key = self.key;
        match self.resolution {
            Resolution::Ready { image, source } => Ok(LoadedImage { key, image, source }),
            Resolution::Pending {
                mut outcome,
                interest,
                ..
            } => {
                let result = wait_outcome(&mut outcome).await;
                drop(interest);
                result
            }
        }
    }

    /// Lets the fetch run to completion without holding this handle.
    pub fn detach(self) {
        if let Resolution::Pending { mut interest, .. } = self.resolution {
            interest.armed = false;
        }
    }
}

/// Waits for the generation behind `outcome` to settle. A channel closed
/// without a result means the job never ran to completion.
async fn wait_outcome(outcome: &mut OutcomeReceiver) -> FetchOutcome {
    match outcome.wait_for(Option::is_some).await {
        Ok(settled) => (*settled).clone().unwrap_or(Err(CacheError::Cancelled)),
        Err(_) => Err(CacheError::Cancelled),
    }
}
