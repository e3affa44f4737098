use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use super::{CounterStorage, StorageFuture};

/// Process-local counter storage.
///
/// Values survive for as long as the `MemoryStorage` itself does, which makes it suitable for
/// tests and for ephemeral deployments where losing counts on restart is acceptable.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, u64>>,
}

impl MemoryStorage {
    /// Creates an empty `MemoryStorage`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a `MemoryStorage` pre-populated with the given values.
    pub fn with_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        let values = values.into_iter().map(|(key, value)| (key.into(), value)).collect();
        Self { values: Mutex::new(values) }
    }

    /// Gets the currently persisted value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).get(key).copied()
    }
}

impl CounterStorage for MemoryStorage {
    fn load<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<u64>> {
        let value = self.get(key);
        Box::pin(async move { Ok(value) })
    }

    fn store<'a>(&'a self, key: &'a str, value: u64) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            // Writes always suspend at least once, like a durable write would.
            tokio::task::yield_now().await;
            self.values
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.to_owned(), value);
            Ok(())
        })
    }
}
