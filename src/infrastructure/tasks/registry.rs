//! Keyed registry of background tasks.
//!
//! Each task runs on the tokio worker pool and receives a
//! [`CancellationToken`] it must watch at its suspension points. Scheduling
//! under a key that is already running supersedes the old task; callers that
//! want to coalesce instead use [`TaskRegistry::schedule_if_absent`].
//! Finished tasks remove their own entry.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct TaskEntry {
    id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of named asynchronous operations.
pub struct TaskRegistry<K = String> {
    tasks: Arc<Mutex<HashMap<K, TaskEntry>>>,
    next_id: AtomicU64,
}

impl<K> std::fmt::Debug for TaskRegistry<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("running", &self.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

impl<K> Default for TaskRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TaskRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Starts `operation` under `key`, cancelling any task already running
    /// under the same key.
    pub fn schedule<F, Fut>(&self, key: K, operation: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if let Some(previous) = tasks.remove(&key) {
            previous.token.cancel();
            debug!(key = ?key, "Superseded running task");
        }
        let entry = self.spawn_entry(key.clone(), operation);
        tasks.insert(key, entry);
    }

    /// Starts `operation` under `key` only if nothing is running under it.
    ///
    /// Returns false, without calling `operation`, when a task is already
    /// registered.
    pub fn schedule_if_absent<F, Fut>(&self, key: K, operation: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&key) {
            trace!(key = ?key, "Task already running");
            return false;
        }
        let entry = self.spawn_entry(key.clone(), operation);
        tasks.insert(key, entry);
        true
    }

    /// Signals cancellation to the task under `key` and forgets it.
    ///
    /// Returns true if a task was registered.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.tasks.lock().remove(key);
        if let Some(entry) = removed {
            entry.token.cancel();
            debug!(key = ?key, "Cancelled task");
            true
        } else {
            false
        }
    }

    /// Signals cancellation to every task and forgets them all.
    ///
    /// Returns the number of tasks cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<TaskEntry> = self.tasks.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.token.cancel();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "Cancelled all tasks");
        }
        drained.len()
    }

    /// Cancels every task and waits for them to wind down.
    pub async fn shutdown(&self) {
        let drained: Vec<TaskEntry> = self.tasks.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.token.cancel();
        }
        for entry in drained {
            let _ = entry.handle.await;
        }
    }

    /// Returns true if a task is registered under `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.tasks.lock().contains_key(key)
    }

    /// Returns the number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns true if no task is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn_entry<F, Fut>(&self, key: K, operation: F) -> TaskEntry
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let future = operation(token.clone());
        let tasks = Arc::clone(&self.tasks);

        // The caller holds the map lock, so the entry is inserted before the
        // spawned task can try to remove it.
        let handle = tokio::spawn(async move {
            future.await;
            let mut tasks = tasks.lock();
            if tasks.get(&key).is_some_and(|entry| entry.id == id) {
                tasks.remove(&key);
            }
        });

        TaskEntry { id, token, handle }
    }
}
