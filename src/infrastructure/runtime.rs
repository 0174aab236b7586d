//! Process-wide image cache context.
//!
//! Owns the loader, the memory pressure bus and its background workers so
//! that they are created together and torn down together.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain::errors::CacheResult;
use crate::domain::ports::{ImageFetchPort, MemorySamplerPort};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::image::{DiskImageCache, HttpImageFetcher, ImageLoader};
use crate::infrastructure::memory::{MemoryPressureMonitor, PressureBus, SysinfoMemorySampler};

/// The loader together with its pressure bus and background workers.
pub struct ImageRuntime {
    loader: ImageLoader,
    bus: PressureBus,
    monitor: Option<Arc<MemoryPressureMonitor>>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ImageRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRuntime")
            .field("loader", &self.loader)
            .field("bus", &self.bus)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl ImageRuntime {
    /// Builds the HTTP fetcher, opens the disk tier and starts the pressure
    /// workers described by `config`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built or the cache
    /// directory cannot be created.
    pub async fn init(config: &AppConfig) -> CacheResult<Self> {
        let fetcher = HttpImageFetcher::new(
            Duration::from_secs(config.network.timeout_secs),
            &config.network.user_agent,
        )?;
        let disk =
            DiskImageCache::new(config.effective_cache_dir(), config.cache.disk_max_size).await?;
        let sampler = config
            .pressure
            .enabled
            .then(|| Arc::new(SysinfoMemorySampler::new()) as Arc<dyn MemorySamplerPort>);

        Ok(Self::with_parts(
            config,
            Arc::new(fetcher),
            Arc::new(disk),
            sampler,
        ))
    }

    /// Wires the runtime from already constructed parts. No sampler means no
    /// background monitor; pressure can still be published on the bus.
    #[must_use]
    pub fn with_parts(
        config: &AppConfig,
        fetcher: Arc<dyn ImageFetchPort>,
        disk: Arc<DiskImageCache>,
        sampler: Option<Arc<dyn MemorySamplerPort>>,
    ) -> Self {
        let loader = ImageLoader::new(config.loader_config(), fetcher, disk);
        let bus = PressureBus::new();
        let shutdown = CancellationToken::new();

        let mut workers = vec![loader.listen_for_pressure(bus.subscribe())];
        let monitor = sampler.map(|sampler| {
            let monitor = Arc::new(MemoryPressureMonitor::new(
                sampler,
                bus.clone(),
                config.pressure.thresholds(),
            ));
            workers.push(monitor.start(config.pressure.sample_interval(), shutdown.clone()));
            monitor
        });

        info!(
            cache_dir = %loader.disk_cache().cache_dir().display(),
            monitored = monitor.is_some(),
            "Image runtime started"
        );

        Self {
            loader,
            bus,
            monitor,
            shutdown,
            workers,
        }
    }

    /// The shared image loader.
    #[must_use]
    pub fn loader(&self) -> &ImageLoader {
        &self.loader
    }

    /// Bus the loader listens on. Emit here to signal memory pressure.
    #[must_use]
    pub fn pressure_bus(&self) -> &PressureBus {
        &self.bus
    }

    /// The memory sampler, if one was configured.
    #[must_use]
    pub fn monitor(&self) -> Option<&Arc<MemoryPressureMonitor>> {
        self.monitor.as_ref()
    }

    /// Cancels all fetches and stops the background workers.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.loader.shutdown().await;
        for worker in self.workers {
            worker.abort();
            let _ = worker.await;
        }
        info!("Image runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::ImageSource;
    use crate::domain::ports::mocks::{MockImageFetcher, MockMemorySamplerPort, png_bytes};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    const URL: &str = "https://img/avatar.png";

    async fn disk(temp: &TempDir) -> Arc<DiskImageCache> {
        Arc::new(
            DiskImageCache::new(temp.path().to_path_buf(), 1024 * 1024)
                .await
                .unwrap(),
        )
    }

    fn fetcher() -> Arc<MockImageFetcher> {
        let fetcher = MockImageFetcher::new();
        fetcher.respond(URL, png_bytes(8, 8));
        Arc::new(fetcher)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_bus_event_clears_loader_memory() {
        let temp = TempDir::new().unwrap();
        let runtime =
            ImageRuntime::with_parts(&AppConfig::default(), fetcher(), disk(&temp).await, None);
        assert!(runtime.monitor().is_none());

        runtime.loader().load(URL).await.unwrap();
        assert_eq!(runtime.loader().memory_cache_stats().size, 1);

        runtime.pressure_bus().notify();
        wait_until(|| runtime.loader().memory_cache_stats().size == 0).await;

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_sampled_pressure_clears_memory_only() {
        let temp = TempDir::new().unwrap();
        let fetcher = fetcher();
        let resident = Arc::new(AtomicU64::new(0));

        let mut sampler = MockMemorySamplerPort::new();
        let reading = resident.clone();
        sampler
            .expect_resident_bytes()
            .returning(move || Some(reading.load(Ordering::SeqCst)));

        let runtime = ImageRuntime::with_parts(
            &AppConfig::default(),
            fetcher.clone(),
            disk(&temp).await,
            Some(Arc::new(sampler)),
        );
        let Some(monitor) = runtime.monitor().cloned() else {
            panic!("monitor must run when a sampler is given");
        };

        runtime.loader().load(URL).await.unwrap();
        resident.store(4096 * 1024 * 1024, Ordering::SeqCst);
        assert!(monitor.sample().is_some());

        wait_until(|| runtime.loader().memory_cache_stats().size == 0).await;
        let again = runtime.loader().load(URL).await.unwrap();
        assert_eq!(again.source, ImageSource::DiskCache);
        assert_eq!(fetcher.call_count(), 1);

        runtime.shutdown().await;
    }
}
