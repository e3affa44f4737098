//! Durable storage backends for counters.
use std::{future::Future, io, pin::Pin, time::Duration};

use thiserror::Error;

mod file;
pub use self::file::FileStorage;

mod memory;
pub use self::memory::MemoryStorage;

/// Errors that can occur while loading or persisting a counter value.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying storage medium returned an I/O error.
    #[error("i/o error on counter slot `{slot}`: {source}")]
    Io {
        /// Slot that was being accessed.
        slot: String,

        /// The originating I/O error.
        #[source]
        source: io::Error,
    },

    /// The persisted record could not be decoded.
    #[error("corrupt record in counter slot `{slot}`: {reason}")]
    Corrupt {
        /// Slot holding the corrupt record.
        slot: String,

        /// Details about the decoding failure.
        reason: String,
    },

    /// The persisted record belongs to a different counter.
    #[error("counter slot `{slot}` holds key `{found}`, expected `{expected}`")]
    KeyMismatch {
        /// Slot holding the record.
        slot: String,

        /// Key the caller asked for.
        expected: String,

        /// Key found in the record.
        found: String,
    },

    /// The storage operation did not complete in time.
    #[error("storage operation did not complete within {0:?}")]
    Timeout(Duration),

    /// The task running the storage operation stopped before reporting a result.
    #[error("storage operation stopped before completing")]
    Interrupted,
}

/// Future returned by [`CounterStorage`] operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Durable storage for counter values.
///
/// Implementations map a logical counter key to a persisted slot. The mapping must be
/// deterministic, so that a restarted process finds the value written by its predecessor, and
/// injective, so that two keys never share a slot.
///
/// Callers guarantee that at most one `store` is in flight for a given key at any time.
pub trait CounterStorage: Send + Sync {
    /// Loads the persisted value for `key`, or `None` if nothing has been persisted yet.
    fn load<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Option<u64>>;

    /// Durably persists `value` for `key`.
    ///
    /// The returned future must only resolve successfully once the value would survive a process
    /// restart.
    fn store<'a>(&'a self, key: &'a str, value: u64) -> StorageFuture<'a, ()>;
}

/// Derives the slot name for a counter key.
///
/// ASCII alphanumerics and `-` are kept as-is. Every other byte, including `_`, is escaped as `_`
/// followed by two uppercase hex digits, which keeps the mapping injective and the result safe to
/// use as a file name. The empty key maps to `_`, which no escaped key can produce.
pub fn slot_name(key: &str) -> String {
    if key.is_empty() {
        return String::from("_");
    }

    let mut slot = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            slot.push(char::from(byte));
        } else {
            slot.push('_');
            slot.push_str(&format!("{byte:02X}"));
        }
    }
    slot
}
