//! Disk-based image cache for persistence across sessions.
//!
//! Files are named `<digest>.img` and hold the raw fetched bytes; the
//! filesystem modification time is the only metadata. Size accounting and
//! eviction run under one async lock so concurrent writers never race on the
//! budget, while reads and the byte transfer of a write happen outside it.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::domain::entities::CacheKey;
use crate::domain::errors::{CacheError, CacheResult};

/// Maximum disk cache size in bytes (100 MB default).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 100 * 1024 * 1024;

/// Extension of committed cache entries.
pub const CACHE_FILE_EXTENSION: &str = "img";

const TEMP_FILE_EXTENSION: &str = "tmp";

#[derive(Debug, Default)]
struct DiskLedger {
    current_size: u64,
    item_count: usize,
}

struct DiskEntry {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

/// Disk-based image cache that persists raw image bytes.
pub struct DiskImageCache {
    cache_dir: PathBuf,
    max_size: u64,
    ledger: Mutex<DiskLedger>,
}

impl std::fmt::Debug for DiskImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageCache")
            .field("cache_dir", &self.cache_dir)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl DiskImageCache {
    /// Creates a new disk cache in the specified directory.
    ///
    /// Leftover temporary files from interrupted writes are removed and the
    /// budget is enforced once before returning.
    ///
    /// # Errors
    /// Returns error if cache directory cannot be created.
    pub async fn new(cache_dir: PathBuf, max_size: u64) -> CacheResult<Self> {
        fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| CacheError::StorageError(format!("Failed to create cache dir: {e}")))?;

        if let Ok(mut entries) = fs::read_dir(&cache_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == TEMP_FILE_EXTENSION) {
                    let _ = fs::remove_file(&path).await;
                }
            }
        }

        let cache = Self {
            cache_dir,
            max_size,
            ledger: Mutex::new(DiskLedger::default()),
        };

        {
            let mut ledger = cache.ledger.lock().await;
            cache.evict_if_over_budget(&mut ledger).await;
        }

        Ok(cache)
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the configured byte budget.
    #[must_use]
    pub const fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Returns the path for a cached image.
    fn cache_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir
            .join(format!("{}.{CACHE_FILE_EXTENSION}", key.digest()))
    }

    /// Reads raw image bytes. Any I/O failure is a miss.
    pub async fn read(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let path = self.cache_path(key);
        match fs::read(&path).await {
            Ok(bytes) => {
                trace!(key = %key, path = %path.display(), "Disk cache hit");
                Some(bytes)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(key = %key, "Disk cache miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Disk cache read failed, treating as miss");
                None
            }
        }
    }

    /// Stores raw bytes, best effort. Failures are logged and dropped.
    pub async fn write(&self, key: &CacheKey, bytes: &[u8]) {
        if let Err(e) = self.try_write(key, bytes).await {
            warn!(key = %key, error = %e, "Failed to cache to disk");
        }
    }

    /// Stores raw bytes in the disk cache.
    ///
    /// The bytes are written to a temporary file first; the rename into place
    /// and the size recomputation happen under the ledger lock.
    async fn try_write(&self, key: &CacheKey, bytes: &[u8]) -> CacheResult<()> {
        let len = bytes.len() as u64;
        if len > self.max_size {
            debug!(key = %key, size = len, max_size = self.max_size, "Entry exceeds disk budget, not caching");
            return Ok(());
        }

        // The directory may have been purged externally since the last write.
        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| CacheError::StorageError(format!("Failed to create cache dir: {e}")))?;

        let temp_path = self.cache_dir.join(format!(
            "{}.{}.{TEMP_FILE_EXTENSION}",
            key.digest(),
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(e) = write_file(&temp_path, bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        let path = self.cache_path(key);
        let mut ledger = self.ledger.lock().await;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(CacheError::StorageError(format!(
                "Failed to commit cache file: {e}"
            )));
        }

        debug!(key = %key, path = %path.display(), size = bytes.len(), "Stored image in disk cache");

        self.evict_if_over_budget(&mut ledger).await;
        Ok(())
    }

    /// Removes an image from disk cache.
    pub async fn remove(&self, key: &CacheKey) {
        let path = self.cache_path(key);
        let mut ledger = self.ledger.lock().await;
        let size = fs::metadata(&path).await.map(|m| m.len()).ok();
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(key = %key, error = %e, "Failed to remove from disk cache");
            }
        } else if let Some(s) = size {
            ledger.current_size = ledger.current_size.saturating_sub(s);
            ledger.item_count = ledger.item_count.saturating_sub(1);
            debug!(key = %key, "Removed from disk cache");
        }
    }

    /// Clears the entire disk cache. Per-file failures are logged and skipped.
    pub async fn clear(&self) {
        let mut ledger = self.ledger.lock().await;
        let mut entries = match fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, "Failed to read cache dir");
                }
                *ledger = DiskLedger::default();
                return;
            }
        };

        let mut removed = 0usize;
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if let Err(e) = fs::remove_file(&path).await {
                        warn!(path = %path.display(), error = %e, "Failed to remove cache file");
                    } else {
                        removed += 1;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read cache entry");
                    break;
                }
            }
        }

        *ledger = DiskLedger::default();
        debug!(removed, "Cleared disk cache");
    }

    /// Returns the cache size in bytes as of the last write or eviction.
    pub async fn current_size(&self) -> u64 {
        self.ledger.lock().await.current_size
    }

    /// Returns the number of cached files as of the last write or eviction.
    pub async fn len(&self) -> usize {
        self.ledger.lock().await.item_count
    }

    /// Returns true if the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Checks if an image is cached.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        let path = self.cache_path(key);
        fs::try_exists(&path).await.unwrap_or(false)
    }

    /// Recomputes usage from the directory and evicts oldest-first down to
    /// half the budget when over it. Caller holds the ledger lock.
    async fn evict_if_over_budget(&self, ledger: &mut DiskLedger) {
        let mut files = self.scan_entries().await;
        let current_size: u64 = files.iter().map(|f| f.size).sum();
        ledger.current_size = current_size;
        ledger.item_count = files.len();

        if current_size <= self.max_size {
            return;
        }

        let low_water = self.max_size / 2;
        debug!(
            current_size = current_size,
            max_size = self.max_size,
            target = low_water,
            "Disk cache over limit, cleaning up"
        );

        files.sort_by_key(|f| f.modified);

        let mut freed_size = 0u64;
        let mut freed_count = 0usize;

        for file in files {
            if ledger.current_size <= low_water {
                break;
            }

            match fs::remove_file(&file.path).await {
                Ok(()) => {
                    trace!(path = %file.path.display(), "Removed old cache file");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "Failed to remove old cache file");
                    continue;
                }
            }
            ledger.current_size -= file.size;
            ledger.item_count -= 1;
            freed_size += file.size;
            freed_count += 1;
        }

        debug!(
            freed_size = freed_size,
            freed_count = freed_count,
            "Disk cache cleanup complete"
        );
    }

    async fn scan_entries(&self) -> Vec<DiskEntry> {
        let mut files = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.cache_dir).await else {
            return files;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path
                .extension()
                .is_none_or(|ext| ext != CACHE_FILE_EXTENSION)
            {
                continue;
            }

            if let Ok(meta) = entry.metadata().await {
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                files.push(DiskEntry {
                    path,
                    modified,
                    size: meta.len(),
                });
            }
        }
        files
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| CacheError::StorageError(format!("Failed to create cache file: {e}")))?;

    file.write_all(bytes)
        .await
        .map_err(|e| CacheError::StorageError(format!("Failed to write cache file: {e}")))?;

    file.flush()
        .await
        .map_err(|e| CacheError::StorageError(format!("Failed to flush cache file: {e}")))
}

/// Returns the default cache directory path.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "pixcache", "pixcache").map_or_else(
        || {
            std::env::temp_dir()
                .join("pixcache")
                .join("cache")
                .join("images")
        },
        |dirs| dirs.cache_dir().join("images"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use test_case::test_case;

    async fn create_test_cache(max_size: u64) -> (DiskImageCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskImageCache::new(temp_dir.path().to_path_buf(), max_size)
            .await
            .unwrap();
        (cache, temp_dir)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (cache, _temp) = create_test_cache(1024 * 1024).await;
        let key = CacheKey::new("https://img/a.jpg");
        let data = b"test image data";

        cache.write(&key, data).await;
        let retrieved = cache.read(&key).await;

        assert_eq!(retrieved.as_deref(), Some(&data[..]));
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let (cache, _temp) = create_test_cache(1024 * 1024).await;
        assert!(cache.read(&CacheKey::new("nonexistent")).await.is_none());
    }

    #[tokio::test]
    async fn test_file_named_by_digest() {
        let (cache, temp) = create_test_cache(1024 * 1024).await;
        let key = CacheKey::new("https://img/a.jpg");

        cache.write(&key, b"abc").await;

        let expected = temp.path().join(format!("{}.img", key.digest()));
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn test_overwrite_updates_size() {
        let (cache, _temp) = create_test_cache(1024 * 1024).await;

        cache.write(&CacheKey::new("test1"), b"hello").await;
        cache.write(&CacheKey::new("test2"), b"world!").await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.current_size().await, 11);

        cache.write(&CacheKey::new("test1"), b"hey").await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.current_size().await, 9);

        cache.remove(&CacheKey::new("test2")).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.current_size().await, 3);
    }

    #[tokio::test]
    async fn test_remove() {
        let (cache, _temp) = create_test_cache(1024 * 1024).await;
        let key = CacheKey::new("test1");

        cache.write(&key, b"test").await;
        assert!(cache.contains(&key).await);

        cache.remove(&key).await;
        assert!(!cache.contains(&key).await);
    }

    #[tokio::test]
    async fn test_clear() {
        let (cache, temp) = create_test_cache(1024 * 1024).await;

        cache.write(&CacheKey::new("test1"), b"data1").await;
        cache.write(&CacheKey::new("test2"), b"data2").await;
        assert_eq!(cache.len().await, 2);

        cache.clear().await;
        assert_eq!(cache.len().await, 0);
        assert_eq!(cache.current_size().await, 0);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test_case(100, 30 ; "three entries per budget")]
    #[test_case(100, 10 ; "ten entries per budget")]
    #[test_case(64, 20 ; "uneven budget")]
    #[tokio::test]
    async fn test_eviction_drops_to_half_budget(max_size: u64, entry_size: usize) {
        let (cache, _temp) = create_test_cache(max_size).await;
        let payload = vec![7u8; entry_size];

        let mut evicted = false;
        for i in 0..12 {
            let before = cache.current_size().await;
            cache.write(&CacheKey::new(format!("key{i}")), &payload).await;
            let after = cache.current_size().await;

            assert!(after <= max_size, "usage {after} exceeds budget {max_size}");
            if after < before + entry_size as u64 {
                evicted = true;
                assert!(after <= max_size / 2, "eviction left {after} bytes");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(evicted);
    }

    #[tokio::test]
    async fn test_eviction_removes_oldest_first() {
        let (cache, _temp) = create_test_cache(10).await;

        cache.write(&CacheKey::new("old"), b"1234").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.write(&CacheKey::new("mid"), b"1234").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.write(&CacheKey::new("new"), b"1234").await;

        assert!(!cache.contains(&CacheKey::new("old")).await);
        assert!(!cache.contains(&CacheKey::new("mid")).await);
        assert!(cache.contains(&CacheKey::new("new")).await);
        assert_eq!(cache.current_size().await, 4);
    }

    #[tokio::test]
    async fn test_oversized_entry_is_skipped() {
        let (cache, _temp) = create_test_cache(8).await;
        let key = CacheKey::new("big");

        cache.write(&key, b"0123456789").await;

        assert!(!cache.contains(&key).await);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_external_purge_is_a_miss_and_recovers() {
        let (cache, temp) = create_test_cache(1024).await;
        let key = CacheKey::new("https://img/a.jpg");
        cache.write(&key, b"bytes").await;

        std::fs::remove_dir_all(temp.path()).unwrap();

        assert!(cache.read(&key).await.is_none());

        cache.write(&key, b"again").await;
        assert_eq!(cache.read(&key).await.as_deref(), Some(&b"again"[..]));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_clear_after_external_purge() {
        let (cache, temp) = create_test_cache(1024).await;
        cache.write(&CacheKey::new("a"), b"bytes").await;
        std::fs::remove_dir_all(temp.path()).unwrap();

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_open_counts_existing_entries_and_drops_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        {
            let cache = DiskImageCache::new(temp_dir.path().to_path_buf(), 1024)
                .await
                .unwrap();
            cache.write(&CacheKey::new("a"), b"12345").await;
        }
        let stray = temp_dir.path().join("abc.123.tmp");
        std::fs::write(&stray, b"partial").unwrap();

        let cache = DiskImageCache::new(temp_dir.path().to_path_buf(), 1024)
            .await
            .unwrap();

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.current_size().await, 5);
        assert!(!stray.exists());
    }

    #[tokio::test]
    async fn test_concurrent_writers_respect_budget() {
        let temp_dir = TempDir::new().unwrap();
        let cache = std::sync::Arc::new(
            DiskImageCache::new(temp_dir.path().to_path_buf(), 200)
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .write(&CacheKey::new(format!("key{i}")), &[1u8; 25])
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(cache.current_size().await <= 200);
    }
}
