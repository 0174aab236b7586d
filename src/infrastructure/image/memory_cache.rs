//! In-memory LRU image cache bounded by entry count and total cost.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::{CacheKey, CachedImage};
use crate::domain::ports::ImageCachePort;

/// Default maximum number of images to cache in memory.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Default maximum total cost in bytes (50 MB).
pub const DEFAULT_MAX_COST: usize = 50 * 1024 * 1024;

struct CostBoundedLru {
    entries: LruCache<CacheKey, CachedImage>,
    total_cost: usize,
    max_cost: usize,
}

/// In-memory LRU cache for decoded images.
///
/// Inserting past either bound evicts least-recently-used entries until both
/// hold again. All operations take a short synchronous lock and never await
/// while holding it, so `clear` may race freely with `get` and `put`.
pub struct MemoryImageCache {
    inner: Mutex<CostBoundedLru>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryImageCache {
    /// Creates a new cache with the given entry and cost limits.
    #[must_use]
    pub fn new(max_entries: usize, max_cost: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CostBoundedLru {
                entries: LruCache::new(cap),
                total_cost: 0,
                max_cost,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Creates a new cache with the default limits.
    #[must_use]
    pub fn with_default_limits() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_COST)
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let inner = self.inner.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: inner.entries.len(),
            total_cost: inner.total_cost,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Peeks at an image without promoting it in the LRU.
    pub fn peek(&self, key: &CacheKey) -> Option<CachedImage> {
        self.inner.lock().entries.peek(key).cloned()
    }

    /// Returns true if the key is cached, without promoting it.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Returns the total cost of all cached images.
    pub fn total_cost(&self) -> usize {
        self.inner.lock().total_cost
    }

    fn insert(&self, key: CacheKey, image: CachedImage) {
        let cost = image.cost();
        let mut inner = self.inner.lock();

        if cost > inner.max_cost {
            debug!(key = %key, cost, max_cost = inner.max_cost, "Image exceeds memory cost limit, not caching");
            if let Some(old) = inner.entries.pop(&key) {
                inner.total_cost -= old.cost();
            }
            return;
        }

        if let Some((old_key, old)) = inner.entries.push(key.clone(), image) {
            inner.total_cost -= old.cost();
            if old_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(key = %old_key, "Evicted image at entry limit");
            }
        }
        inner.total_cost += cost;

        while inner.total_cost > inner.max_cost {
            let Some((old_key, old)) = inner.entries.pop_lru() else {
                break;
            };
            inner.total_cost -= old.cost();
            self.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(key = %old_key, "Evicted image at cost limit");
        }

        debug!(key = %key, cost, total_cost = inner.total_cost, "Stored image in memory cache");
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::with_default_limits()
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of cached images.
    pub size: usize,
    /// Sum of the cost of every cached image.
    pub total_cost: usize,
    /// Entries dropped to satisfy a limit.
    pub evictions: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} images, {} bytes, {:.1}% hit rate ({} hits, {} misses, {} evictions)",
            self.size, self.total_cost, self.hit_rate, self.hits, self.misses, self.evictions
        )
    }
}

#[async_trait::async_trait]
impl ImageCachePort for MemoryImageCache {
    async fn get(&self, key: &CacheKey) -> Option<CachedImage> {
        let found = self.inner.lock().entries.get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
        }
        found
    }

    async fn put(&self, key: CacheKey, image: CachedImage) {
        self.insert(key, image);
    }

    async fn evict(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(key) {
            inner.total_cost -= old.cost();
            debug!(key = %key, "Evicted image from memory cache");
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    async fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_cost = 0;
        debug!("Cleared memory image cache");
    }
}
