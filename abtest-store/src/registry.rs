use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use crate::{
    counter::{Counter, CounterHandle},
    storage::{CounterStorage, MemoryStorage},
};

/// Default bound on how long a single storage operation may take.
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// A registry of named counters.
///
/// `CounterRegistry` maps a logical counter name to exactly one [`Counter`], creating it lazily on
/// first reference. Resolving the same name always yields a handle to the same counter, and
/// therefore the same persisted slot; different names never share a counter.
///
/// The registry imposes no ordering across counters: each counter serializes its own operations,
/// and operations on different counters proceed independently.
pub struct CounterRegistry {
    counters: RwLock<HashMap<String, CounterHandle>>,
    storage: Arc<dyn CounterStorage>,
    storage_timeout: Duration,
}

impl CounterRegistry {
    /// Creates a new `CounterRegistry` whose counters persist to `storage`.
    pub fn new(storage: Arc<dyn CounterStorage>) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            storage,
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
        }
    }

    /// Creates a new `CounterRegistry` backed by process-local [`MemoryStorage`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Sets the bound on how long a single storage operation may take.
    ///
    /// Only affects counters created after this call.
    ///
    /// Defaults to 5 seconds.
    #[must_use]
    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    /// Resolves `name` to its counter, creating the counter if it does not yet exist.
    pub fn resolve(&self, name: &str) -> CounterHandle {
        if let Some(counter) =
            self.counters.read().unwrap_or_else(PoisonError::into_inner).get(name)
        {
            return counter.clone();
        }

        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        counters
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(Counter::new(name, self.storage.clone(), self.storage_timeout))
            })
            .clone()
    }
}
