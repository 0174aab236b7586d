//! Per-key loading state shared by every observer of a key.
//!
//! Each key owns a `watch` channel. Observers subscribe to it instead of
//! starting their own fetch, which is what coalesces concurrent requests.
//! A fetch is identified by a generation number so a late completion from a
//! cancelled fetch never overwrites the state of a newer one.
//!
//! The key's state channel is shared and may be reset or reused by a later
//! fetch. Callers waiting on a fetch therefore read its result from a
//! separate outcome channel that belongs to that generation alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use crate::domain::entities::{CacheKey, CachedImage, LoadedImage, LoadingState};
use crate::domain::errors::{CacheError, CacheResult};

/// Default number of slots kept before unobserved terminal states are pruned.
pub const DEFAULT_STATE_CAPACITY: usize = 256;

/// Terminal result of one fetch generation.
pub type FetchOutcome = CacheResult<LoadedImage>;

/// Receiver for the result of one fetch generation. Holds `None` until the
/// fetch settles.
pub type OutcomeReceiver = watch::Receiver<Option<FetchOutcome>>;

struct Slot {
    tx: watch::Sender<LoadingState>,
    outcome: watch::Sender<Option<FetchOutcome>>,
    generation: u64,
    interest: usize,
}

impl Slot {
    fn new() -> Self {
        let (tx, _) = watch::channel(LoadingState::Idle);
        let (outcome, _) = watch::channel(None);
        Self {
            tx,
            outcome,
            generation: 0,
            interest: 0,
        }
    }

    fn is_loading(&self) -> bool {
        self.tx.borrow().is_loading()
    }
}

/// Maps a fetch result to the state published to observers of the key.
fn settled_state(outcome: &FetchOutcome) -> LoadingState {
    match outcome {
        Ok(loaded) => LoadingState::Loaded(loaded.image.clone()),
        Err(CacheError::Cancelled) => LoadingState::Idle,
        Err(e) => LoadingState::Failed(e.clone()),
    }
}

/// Outcome of [`LoadingStateTable::begin`].
#[derive(Debug)]
pub enum Begin {
    /// No fetch was in flight; the caller must start one for `generation`.
    Started {
        /// Generation of the new fetch.
        generation: u64,
        /// Result of the new fetch.
        outcome: OutcomeReceiver,
    },
    /// A fetch is already in flight; the caller attached to it.
    Joined {
        /// Generation of the in-flight fetch.
        generation: u64,
        /// Result of the in-flight fetch.
        outcome: OutcomeReceiver,
    },
}

/// Shared map from key to loading state.
pub struct LoadingStateTable {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    next_generation: AtomicU64,
    capacity: usize,
}

impl LoadingStateTable {
    /// Creates a table that prunes unobserved terminal states beyond `capacity`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            capacity,
        }
    }

    /// Returns the current state for `key`, `Idle` if never observed.
    pub fn state(&self, key: &CacheKey) -> LoadingState {
        self.slots
            .lock()
            .get(key)
            .map(|slot| slot.tx.borrow().clone())
            .unwrap_or_default()
    }

    /// Subscribes to state changes for `key`, creating the slot if needed.
    pub fn subscribe(&self, key: &CacheKey) -> watch::Receiver<LoadingState> {
        let mut slots = self.slots.lock();
        self.slot_mut(&mut slots, key).tx.subscribe()
    }

    /// Atomically joins the in-flight fetch for `key` or marks a new one as
    /// loading. Either way the caller holds one unit of interest.
    ///
    /// A `Started` caller owns every tier lookup for the key until it
    /// publishes, so concurrent callers can only join it.
    pub fn begin(&self, key: &CacheKey) -> Begin {
        let mut slots = self.slots.lock();
        let slot = self.slot_mut(&mut slots, key);

        if slot.is_loading() {
            slot.interest += 1;
            trace!(key = %key, interest = slot.interest, "Joined in-flight fetch");
            return Begin::Joined {
                generation: slot.generation,
                outcome: slot.outcome.subscribe(),
            };
        }

        slot.generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        slot.interest = 1;
        // Waiters of the previous generation keep their own channel.
        slot.outcome = watch::channel(None).0;
        slot.tx.send_replace(LoadingState::Loading);
        Begin::Started {
            generation: slot.generation,
            outcome: slot.outcome.subscribe(),
        }
    }

    /// Publishes the result of fetch `generation`.
    ///
    /// Ignored unless that fetch is still the one in flight. Returns true if
    /// the result was delivered.
    pub fn publish(&self, key: &CacheKey, generation: u64, outcome: FetchOutcome) -> bool {
        let slots = self.slots.lock();
        let Some(slot) = slots.get(key) else {
            return false;
        };
        if slot.generation != generation || !slot.is_loading() {
            trace!(key = %key, generation, "Dropping stale fetch result");
            return false;
        }
        slot.tx.send_replace(settled_state(&outcome));
        slot.outcome.send_replace(Some(outcome));
        true
    }

    /// Marks `key` as loaded after a memory hit. A fetch in flight for the
    /// key keeps its `Loading` state until it publishes.
    pub fn publish_ready(&self, key: &CacheKey, image: CachedImage) {
        let mut slots = self.slots.lock();
        let slot = self.slot_mut(&mut slots, key);
        if !slot.is_loading() {
            slot.tx.send_replace(LoadingState::Loaded(image));
        }
    }

    /// Releases one unit of interest in fetch `generation`.
    ///
    /// Returns true if that fetch is still loading and nobody else is
    /// interested, meaning the caller should cancel it.
    pub fn release(&self, key: &CacheKey, generation: u64) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        if slot.generation != generation {
            return false;
        }
        slot.interest = slot.interest.saturating_sub(1);
        slot.interest == 0 && slot.is_loading()
    }

    /// Returns every terminal state to `Idle`, dropping held images, and
    /// removes slots nobody subscribes to. Loading slots are untouched, and
    /// results already delivered to waiters are kept by their receivers.
    pub fn reset_terminal(&self) {
        let mut slots = self.slots.lock();
        slots.retain(|_, slot| {
            if slot.is_loading() {
                return true;
            }
            slot.tx.send_replace(LoadingState::Idle);
            slot.tx.receiver_count() > 0
        });
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns true if no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_mut<'a>(
        &self,
        slots: &'a mut HashMap<CacheKey, Slot>,
        key: &CacheKey,
    ) -> &'a mut Slot {
        if !slots.contains_key(key) && slots.len() >= self.capacity {
            slots.retain(|_, slot| slot.is_loading() || slot.tx.receiver_count() > 0);
        }
        slots.entry(key.clone()).or_insert_with(Slot::new)
    }
}

impl Default for LoadingStateTable {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{ImageSource, LoadingPhase};

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s)
    }

    fn sample_image() -> CachedImage {
        CachedImage::new(image::DynamicImage::new_rgb8(2, 2))
    }

    fn loaded(s: &str) -> FetchOutcome {
        Ok(LoadedImage {
            key: key(s),
            image: sample_image(),
            source: ImageSource::Network,
        })
    }

    fn started(table: &LoadingStateTable, s: &str) -> (u64, OutcomeReceiver) {
        match table.begin(&key(s)) {
            Begin::Started { generation, outcome } => (generation, outcome),
            Begin::Joined { .. } => panic!("begin must start"),
        }
    }

    #[test]
    fn test_unknown_key_is_idle() {
        let table = LoadingStateTable::default();
        assert_eq!(table.state(&key("a")).phase(), LoadingPhase::Idle);
        assert!(table.is_empty());
    }

    #[test]
    fn test_second_begin_joins() {
        let table = LoadingStateTable::default();

        let (generation, _) = started(&table, "a");
        let Begin::Joined { generation: joined, .. } = table.begin(&key("a")) else {
            panic!("second begin must join");
        };

        assert_eq!(generation, joined);
        assert_eq!(table.len(), 1);
        assert!(table.state(&key("a")).is_loading());
    }

    #[test]
    fn test_publish_reaches_subscribers() {
        let table = LoadingStateTable::default();
        let mut observer = table.subscribe(&key("a"));
        assert_eq!(observer.borrow_and_update().phase(), LoadingPhase::Idle);

        let (generation, outcome) = started(&table, "a");
        assert!(observer.has_changed().unwrap());
        assert_eq!(observer.borrow_and_update().phase(), LoadingPhase::Loading);
        assert!(outcome.borrow().is_none());

        assert!(table.publish(&key("a"), generation, loaded("a")));
        assert_eq!(observer.borrow_and_update().phase(), LoadingPhase::Loaded);
        assert!(matches!(*outcome.borrow(), Some(Ok(_))));
    }

    #[test]
    fn test_cancelled_outcome_publishes_idle() {
        let table = LoadingStateTable::default();
        let (generation, outcome) = started(&table, "a");

        assert!(table.publish(&key("a"), generation, Err(CacheError::Cancelled)));

        assert_eq!(table.state(&key("a")).phase(), LoadingPhase::Idle);
        assert!(matches!(*outcome.borrow(), Some(Err(CacheError::Cancelled))));
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let table = LoadingStateTable::default();
        let (old, _) = started(&table, "a");
        table.publish(&key("a"), old, Err(CacheError::Cancelled));

        let (new, outcome) = started(&table, "a");
        assert_ne!(old, new);

        let failed = Err(CacheError::NetworkError("late".into()));
        assert!(!table.publish(&key("a"), old, failed));
        assert!(table.state(&key("a")).is_loading());
        assert!(outcome.borrow().is_none());
    }

    #[test]
    fn test_terminal_state_is_not_overwritten() {
        let table = LoadingStateTable::default();
        let (generation, _) = started(&table, "a");
        assert!(table.publish(&key("a"), generation, loaded("a")));
        assert!(!table.publish(&key("a"), generation, Err(CacheError::Cancelled)));
        assert!(table.state(&key("a")).is_loaded());
    }

    #[test]
    fn test_memory_hit_does_not_settle_in_flight_fetch() {
        let table = LoadingStateTable::default();
        let (generation, _) = started(&table, "a");

        table.publish_ready(&key("a"), sample_image());

        assert!(table.state(&key("a")).is_loading());
        assert!(table.publish(&key("a"), generation, loaded("a")));
    }

    #[test]
    fn test_outcome_survives_reset_and_next_generation() {
        let table = LoadingStateTable::default();
        let (first, outcome) = started(&table, "a");
        assert!(table.publish(&key("a"), first, loaded("a")));

        table.reset_terminal();
        assert_eq!(table.state(&key("a")).phase(), LoadingPhase::Idle);
        let (second, next) = started(&table, "a");
        assert_ne!(first, second);

        assert!(matches!(*outcome.borrow(), Some(Ok(_))));
        assert!(next.borrow().is_none());
    }

    #[test]
    fn test_release_reports_last_interest() {
        let table = LoadingStateTable::default();
        let (generation, _) = started(&table, "a");
        let _ = table.begin(&key("a"));

        assert!(!table.release(&key("a"), generation));
        assert!(table.release(&key("a"), generation));
    }

    #[test]
    fn test_release_after_completion_does_not_cancel() {
        let table = LoadingStateTable::default();
        let (generation, _) = started(&table, "a");
        table.publish(&key("a"), generation, loaded("a"));
        assert!(!table.release(&key("a"), generation));
    }

    #[test]
    fn test_reset_terminal_keeps_loading_and_observed() {
        let table = LoadingStateTable::default();
        table.publish_ready(&key("loaded"), sample_image());
        let observer = table.subscribe(&key("observed"));
        table.publish_ready(&key("observed"), sample_image());
        let _ = table.begin(&key("loading"));

        table.reset_terminal();

        assert_eq!(table.len(), 2);
        assert!(table.state(&key("loading")).is_loading());
        assert_eq!(observer.borrow().phase(), LoadingPhase::Idle);
        assert_eq!(table.state(&key("loaded")).phase(), LoadingPhase::Idle);
    }

    #[test]
    fn test_capacity_prunes_unobserved_terminal_states() {
        let table = LoadingStateTable::new(2);
        table.publish_ready(&key("a"), sample_image());
        table.publish_ready(&key("b"), sample_image());
        let _ = table.begin(&key("c"));

        assert_eq!(table.len(), 1);
        assert!(table.state(&key("c")).is_loading());
    }
}
