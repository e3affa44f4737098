use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::storage::{CounterStorage, StorageError};

/// Errors that can occur while operating on a counter.
#[derive(Debug, Error)]
pub enum CounterError {
    /// The counter's persisted value could not be read or written.
    ///
    /// When a write fails, the counter reloads its value from storage before its next operation.
    /// A write that timed out may still land; that next operation waits for it to settle first.
    #[error("storage failure for counter `{key}`: {source}")]
    StorageFailure {
        /// Key of the affected counter.
        key: String,

        /// The underlying storage error.
        #[source]
        source: StorageError,
    },

    /// The requested operation is not part of the counter protocol.
    #[error("unknown counter operation `{0}`")]
    UnknownOperation(String),

    /// The counter is already zero and cannot be decremented.
    #[error("counter `{key}` cannot be decremented below zero")]
    Underflow {
        /// Key of the affected counter.
        key: String,
    },

    /// The counter is already at its maximum and cannot be incremented.
    #[error("counter `{key}` cannot be incremented past its maximum")]
    Overflow {
        /// Key of the affected counter.
        key: String,
    },
}

impl CounterError {
    /// Whether this error corresponds to a "not found" response in the counter protocol.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CounterError::UnknownOperation(_))
    }
}

/// An operation in the counter protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CounterOp {
    /// Adds one to the counter and returns the resulting value.
    Increment,

    /// Subtracts one from the counter and returns the resulting value.
    Decrement,

    /// Returns the current value without modifying it.
    Value,
}

impl CounterOp {
    /// Gets the protocol name of this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterOp::Increment => "increment",
            CounterOp::Decrement => "decrement",
            CounterOp::Value => "value",
        }
    }
}

impl fmt::Display for CounterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CounterOp {
    type Err = CounterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_matches('/') {
            "increment" => Ok(CounterOp::Increment),
            "decrement" => Ok(CounterOp::Decrement),
            "value" | "" => Ok(CounterOp::Value),
            other => Err(CounterError::UnknownOperation(other.to_owned())),
        }
    }
}

#[derive(Clone, Copy)]
enum Step {
    Up,
    Down,
}

/// Shared handle to a [`Counter`].
pub type CounterHandle = Arc<Counter>;

/// A durable, strictly-serialized integer register.
///
/// All operations on a `Counter` run inside a single async critical section, so at most one
/// read-modify-write sequence is in flight at any time and every operation observes the effect of
/// all operations that completed before it began. The value a mutating operation returns is the
/// value that operation itself produced.
///
/// The in-memory value is only replaced once the new value has been durably persisted. If
/// persisting fails or times out, the operation fails with [`CounterError::StorageFailure`] and
/// the counter forgets its in-memory value, reloading it from storage on the next operation.
///
/// A timed-out write keeps running in the background and may still land. The critical section
/// stays held until it settles, so the next operation reloads whatever it left behind and never
/// races it.
pub struct Counter {
    key: Arc<str>,
    storage: Arc<dyn CounterStorage>,
    storage_timeout: Duration,
    // `None` until the persisted value has been loaded.
    state: Arc<Mutex<Option<u64>>>,
}

impl Counter {
    /// Creates a new `Counter` for `key`, backed by `storage`.
    ///
    /// No storage access happens until the counter is first used. Each storage access is bounded
    /// by `storage_timeout`.
    pub fn new(
        key: impl Into<String>,
        storage: Arc<dyn CounterStorage>,
        storage_timeout: Duration,
    ) -> Self {
        let key: String = key.into();
        Self { key: Arc::from(key), storage, storage_timeout, state: Arc::new(Mutex::new(None)) }
    }

    /// Loads the persisted value of this counter if it has not been loaded yet.
    ///
    /// Other operations call this implicitly, and block until it completes.
    ///
    /// # Errors
    ///
    /// If the persisted value cannot be read, [`CounterError::StorageFailure`] is returned.
    pub async fn initialize(&self) -> Result<u64, CounterError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await
    }

    /// Increments the counter by one, returning the resulting value.
    ///
    /// # Errors
    ///
    /// If the new value cannot be durably persisted, [`CounterError::StorageFailure`] is returned.
    /// A failed write does not take effect; a timed-out one may.
    pub async fn increment(&self) -> Result<u64, CounterError> {
        self.adjust(Step::Up).await
    }

    /// Decrements the counter by one, returning the resulting value.
    ///
    /// # Errors
    ///
    /// If the counter is zero, [`CounterError::Underflow`] is returned. If the new value cannot be
    /// durably persisted, [`CounterError::StorageFailure`] is returned. A failed write does not
    /// take effect; a timed-out one may.
    pub async fn decrement(&self) -> Result<u64, CounterError> {
        self.adjust(Step::Down).await
    }

    /// Gets the current value of the counter.
    ///
    /// # Errors
    ///
    /// If the counter has not been initialized yet and its persisted value cannot be read,
    /// [`CounterError::StorageFailure`] is returned.
    pub async fn value(&self) -> Result<u64, CounterError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await
    }

    /// Runs a counter protocol operation by name, returning the resulting value as a string.
    ///
    /// Recognized names are `increment`, `decrement`, and `value` (or an empty name, which reads
    /// the value).
    ///
    /// # Errors
    ///
    /// Unrecognized names fail with [`CounterError::UnknownOperation`]; otherwise errors are as
    /// for the corresponding method.
    pub async fn dispatch(&self, operation: &str) -> Result<String, CounterError> {
        let value = match operation.parse::<CounterOp>()? {
            CounterOp::Increment => self.increment().await?,
            CounterOp::Decrement => self.decrement().await?,
            CounterOp::Value => self.value().await?,
        };
        Ok(value.to_string())
    }

    async fn adjust(&self, step: Step) -> Result<u64, CounterError> {
        let mut state = self.state.clone().lock_owned().await;
        let current = self.ensure_loaded(&mut state).await?;

        let next = match step {
            Step::Up => current
                .checked_add(1)
                .ok_or_else(|| CounterError::Overflow { key: self.key.to_string() })?,
            Step::Down => current
                .checked_sub(1)
                .ok_or_else(|| CounterError::Underflow { key: self.key.to_string() })?,
        };

        match self.persist(next, state).await {
            Ok(()) => {
                debug!(key = %self.key, value = next, "persisted counter value");
                Ok(next)
            }
            Err(source) => {
                warn!(key = %self.key, error = %source, "failed to persist counter value");
                Err(CounterError::StorageFailure { key: self.key.to_string(), source })
            }
        }
    }

    async fn ensure_loaded(&self, state: &mut Option<u64>) -> Result<u64, CounterError> {
        if let Some(value) = *state {
            return Ok(value);
        }

        let load = tokio::time::timeout(self.storage_timeout, self.storage.load(&self.key));
        let loaded = match load.await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(self.storage_timeout)),
        }
        .map_err(|source| CounterError::StorageFailure { key: self.key.to_string(), source })?
        .unwrap_or(0);

        debug!(key = %self.key, value = loaded, "initialized counter");
        *state = Some(loaded);
        Ok(loaded)
    }

    /// Persists `value`, recording it as the in-memory value once the write succeeds.
    ///
    /// The write runs as its own task, which holds the critical section until the write settles.
    /// A caller that times out or goes away therefore never lets a competing write for this key
    /// start, and a write that lands late still leaves memory matching storage.
    async fn persist(
        &self,
        value: u64,
        mut state: OwnedMutexGuard<Option<u64>>,
    ) -> Result<(), StorageError> {
        *state = None;

        let storage = self.storage.clone();
        let key = self.key.clone();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = storage.store(&key, value).await;
            if result.is_ok() {
                *state = Some(value);
            }
            if let Err(result) = tx.send(result) {
                debug!(key = %key, value, landed = result.is_ok(), "late counter write settled");
            }
        });

        match tokio::time::timeout(self.storage_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StorageError::Interrupted),
            Err(_) => Err(StorageError::Timeout(self.storage_timeout)),
        }
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("key", &self.key)
            .field("storage_timeout", &self.storage_timeout)
            .finish_non_exhaustive()
    }
}
