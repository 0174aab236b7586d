//! Memory pressure bus and monitor.
//!
//! The monitor samples resident memory and publishes on the bus when usage
//! climbs into a higher pressure level. Subscribers react by dropping soft
//! caches. Delivery is broadcast and at-least-once: a subscriber that falls
//! behind still observes one event for the events it missed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::domain::ports::{ImageCachePort, MemorySamplerPort};

const BUS_CAPACITY: usize = 16;
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Memory pressure levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PressureLevel {
    /// Below the warning threshold.
    #[default]
    Normal,
    /// At or above the warning threshold.
    Warning,
    /// At or above the critical threshold.
    Critical,
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A memory pressure notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPressureEvent {
    /// Level that was reached.
    pub level: PressureLevel,
    /// Resident memory that triggered the event, absent for external signals.
    pub resident_bytes: Option<u64>,
}

impl MemoryPressureEvent {
    /// Event raised by an external low-memory signal.
    #[must_use]
    pub const fn signalled() -> Self {
        Self {
            level: PressureLevel::Critical,
            resident_bytes: None,
        }
    }
}

/// Resident memory thresholds in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureThresholds {
    /// Resident bytes that start the warning level.
    pub warning_bytes: u64,
    /// Resident bytes that start the critical level.
    pub critical_bytes: u64,
}

impl PressureThresholds {
    /// Builds thresholds from megabyte values.
    #[must_use]
    pub const fn from_mb(warning_mb: u64, critical_mb: u64) -> Self {
        Self {
            warning_bytes: warning_mb * BYTES_PER_MB,
            critical_bytes: critical_mb * BYTES_PER_MB,
        }
    }

    /// Level reached by `resident_bytes`.
    #[must_use]
    pub const fn classify(&self, resident_bytes: u64) -> PressureLevel {
        if resident_bytes >= self.critical_bytes {
            PressureLevel::Critical
        } else if resident_bytes >= self.warning_bytes {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self::from_mb(500, 1000)
    }
}

/// Broadcast channel for memory pressure events.
#[derive(Clone)]
pub struct PressureBus {
    sender: broadcast::Sender<MemoryPressureEvent>,
}

impl PressureBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Subscribes to every event emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> PressureSubscription {
        PressureSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Publishes `event`, returning the number of subscribers reached.
    pub fn emit(&self, event: MemoryPressureEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Publishes an externally signalled pressure event.
    pub fn notify(&self) -> usize {
        self.emit(MemoryPressureEvent::signalled())
    }

    /// Clears `cache` on every pressure event until the bus is dropped.
    pub fn attach_cache(&self, cache: Arc<dyn ImageCachePort>) -> JoinHandle<()> {
        let mut subscription = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let evicted = cache.len();
                cache.clear().await;
                debug!(level = %event.level, evicted, "Cleared attached cache");
            }
        })
    }
}

impl Default for PressureBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PressureBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PressureBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Receiving end of a [`PressureBus`].
#[derive(Debug)]
pub struct PressureSubscription {
    receiver: broadcast::Receiver<MemoryPressureEvent>,
}

impl PressureSubscription {
    /// Waits for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<MemoryPressureEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                trace!(skipped, "Pressure subscriber lagged");
                Some(MemoryPressureEvent::signalled())
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    current: PressureLevel,
    /// Highest level announced since usage was last below the warning threshold.
    announced: PressureLevel,
}

/// Samples process memory and emits pressure events on upward transitions.
pub struct MemoryPressureMonitor {
    sampler: Arc<dyn MemorySamplerPort>,
    bus: PressureBus,
    thresholds: PressureThresholds,
    state: Mutex<MonitorState>,
}

impl fmt::Debug for MemoryPressureMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPressureMonitor")
            .field("thresholds", &self.thresholds)
            .field("level", &self.level())
            .finish_non_exhaustive()
    }
}

impl MemoryPressureMonitor {
    /// Creates a monitor that emits on `bus`. Nothing is sampled until
    /// [`Self::sample`] or [`Self::start`] is called.
    #[must_use]
    pub fn new(
        sampler: Arc<dyn MemorySamplerPort>,
        bus: PressureBus,
        thresholds: PressureThresholds,
    ) -> Self {
        Self {
            sampler,
            bus,
            thresholds,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Level observed by the latest sample.
    pub fn level(&self) -> PressureLevel {
        self.state.lock().current
    }

    /// Thresholds this monitor classifies samples against.
    #[must_use]
    pub const fn thresholds(&self) -> PressureThresholds {
        self.thresholds
    }

    /// Takes one sample. Emits and returns an event if usage reached a level
    /// not yet announced since it was last below the warning threshold.
    pub fn sample(&self) -> Option<MemoryPressureEvent> {
        let Some(resident) = self.sampler.resident_bytes() else {
            trace!("Resident memory unavailable");
            return None;
        };
        let level = self.thresholds.classify(resident);

        let event = {
            let mut state = self.state.lock();
            state.current = level;
            if level == PressureLevel::Normal {
                state.announced = PressureLevel::Normal;
                None
            } else if level > state.announced {
                state.announced = level;
                Some(MemoryPressureEvent {
                    level,
                    resident_bytes: Some(resident),
                })
            } else {
                None
            }
        };

        if let Some(event) = event {
            warn!(
                level = %level,
                resident_mb = resident / BYTES_PER_MB,
                "Memory pressure detected"
            );
            self.bus.emit(event);
        }
        event
    }

    /// Emits a pressure event regardless of the sampled level.
    pub fn signal(&self) {
        info!("Memory pressure signalled");
        self.bus.notify();
    }

    /// Samples every `interval` until `shutdown` is cancelled.
    pub fn start(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            debug!(interval_secs = interval.as_secs(), "Memory pressure monitor starting");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => {
                        debug!("Memory pressure monitor stopping");
                        break;
                    }

                    _ = ticker.tick() => {
                        monitor.sample();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{CacheKey, CachedImage};
    use crate::domain::ports::mocks::MockMemorySamplerPort;
    use crate::infrastructure::image::MemoryImageCache;
    use std::collections::VecDeque;
    use test_case::test_case;
    use tokio_test::assert_ok;

    const MB: u64 = BYTES_PER_MB;

    fn sampler_returning(values: Vec<Option<u64>>) -> Arc<dyn MemorySamplerPort> {
        let queue = Mutex::new(VecDeque::from(values));
        let mut sampler = MockMemorySamplerPort::new();
        sampler
            .expect_resident_bytes()
            .returning(move || queue.lock().pop_front().flatten());
        Arc::new(sampler)
    }

    fn monitor(values: Vec<Option<u64>>, bus: &PressureBus) -> MemoryPressureMonitor {
        MemoryPressureMonitor::new(
            sampler_returning(values),
            bus.clone(),
            PressureThresholds::from_mb(500, 1000),
        )
    }

    #[test_case(0 => PressureLevel::Normal; "empty")]
    #[test_case(499 => PressureLevel::Normal; "below warning")]
    #[test_case(500 => PressureLevel::Warning; "at warning")]
    #[test_case(999 => PressureLevel::Warning; "below critical")]
    #[test_case(1000 => PressureLevel::Critical; "at critical")]
    fn test_classify(mb: u64) -> PressureLevel {
        PressureThresholds::from_mb(500, 1000).classify(mb * MB)
    }

    #[test]
    fn test_below_threshold_emits_nothing() {
        let bus = PressureBus::new();
        let monitor = monitor(vec![Some(100 * MB)], &bus);
        assert!(monitor.sample().is_none());
        assert_eq!(monitor.level(), PressureLevel::Normal);
    }

    #[test]
    fn test_unavailable_sample_emits_nothing() {
        let bus = PressureBus::new();
        let monitor = monitor(vec![None], &bus);
        assert!(monitor.sample().is_none());
    }

    #[test]
    fn test_emits_once_per_upward_transition() {
        let bus = PressureBus::new();
        let monitor = monitor(
            vec![
                Some(600 * MB),
                Some(700 * MB),
                Some(1200 * MB),
                Some(800 * MB),
                Some(1100 * MB),
            ],
            &bus,
        );

        assert_eq!(
            monitor.sample().map(|e| e.level),
            Some(PressureLevel::Warning)
        );
        assert!(monitor.sample().is_none());
        assert_eq!(
            monitor.sample().map(|e| e.level),
            Some(PressureLevel::Critical)
        );
        assert!(monitor.sample().is_none());
        assert_eq!(monitor.level(), PressureLevel::Warning);
        assert!(monitor.sample().is_none());
    }

    #[test]
    fn test_dropping_below_warning_rearms() {
        let bus = PressureBus::new();
        let monitor = monitor(vec![Some(600 * MB), Some(100 * MB), Some(600 * MB)], &bus);

        assert!(monitor.sample().is_some());
        assert!(monitor.sample().is_none());
        assert!(monitor.sample().is_some());
    }

    #[tokio::test]
    async fn test_sample_reaches_subscribers() {
        let bus = PressureBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let monitor = monitor(vec![Some(2000 * MB)], &bus);

        monitor.sample();

        let event = first.recv().await.unwrap();
        assert_eq!(event.level, PressureLevel::Critical);
        assert_eq!(event.resident_bytes, Some(2000 * MB));
        assert_eq!(second.recv().await, Some(event));
    }

    #[tokio::test]
    async fn test_signal_emits_unconditionally() {
        let bus = PressureBus::new();
        let mut subscription = bus.subscribe();
        let monitor = monitor(vec![], &bus);

        monitor.signal();
        monitor.signal();

        assert_eq!(subscription.recv().await, Some(MemoryPressureEvent::signalled()));
        assert_eq!(subscription.recv().await, Some(MemoryPressureEvent::signalled()));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_still_observes_pressure() {
        let bus = PressureBus::new();
        let mut subscription = bus.subscribe();
        for _ in 0..(BUS_CAPACITY * 2) {
            bus.notify();
        }
        assert!(subscription.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_subscription_ends_when_bus_dropped() {
        let bus = PressureBus::new();
        let mut subscription = bus.subscribe();
        drop(bus);
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_attached_cache_is_cleared() {
        let bus = PressureBus::new();
        let cache = Arc::new(MemoryImageCache::with_default_limits());
        cache
            .put(
                CacheKey::new("a"),
                CachedImage::new(image::DynamicImage::new_rgb8(2, 2)),
            )
            .await;
        let listener = bus.attach_cache(cache.clone());

        assert_eq!(bus.notify(), 1);
        for _ in 0..200 {
            if cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cache.is_empty());

        drop(bus);
        assert_ok!(listener.await);
    }

    #[tokio::test]
    async fn test_start_samples_until_cancelled() {
        let bus = PressureBus::new();
        let mut subscription = bus.subscribe();
        let monitor = Arc::new(monitor(vec![Some(700 * MB)], &bus));
        let shutdown = CancellationToken::new();

        let handle = monitor.start(Duration::from_millis(10), shutdown.clone());

        let event = subscription.recv().await.unwrap();
        assert_eq!(event.level, PressureLevel::Warning);

        shutdown.cancel();
        assert_ok!(handle.await);
    }
}
