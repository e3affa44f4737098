//! Durable, strictly-serialized counters.
//!
//! This crate provides the counter store used by the A/B-testing edge service: a small set of
//! named integer registers, each of which is persisted durably and mutated through a serialized
//! read-modify-persist-return cycle.
//!
//! # Consistency model
//!
//! Every [`Counter`] owns exactly one persisted slot and an async critical section. Operations on
//! the same counter are totally ordered: an operation observes the effect of every operation that
//! completed before it began, and at most one read-modify-write sequence is ever in flight for a
//! given counter. Operations on different counters are fully independent and proceed
//! concurrently; no ordering is provided across keys.
//!
//! Counters are lazily initialized: the first operation against a counter loads its persisted
//! value (or zero, when nothing has been persisted yet) before anything else may observe it.
//!
//! # Usage
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use abtest_store::{CounterRegistry, FileStorage};
//!
//! let storage = FileStorage::open("/var/lib/abtest")?;
//! let registry = CounterRegistry::new(Arc::new(storage));
//!
//! let shown = registry.resolve("controlShow");
//! let value = shown.increment().await?;
//! assert!(value >= 1);
//! # Ok(())
//! # }
//! ```
#![deny(clippy::all)]
#![warn(missing_docs)]

mod counter;
pub use self::counter::{Counter, CounterError, CounterHandle, CounterOp};

mod registry;
pub use self::registry::{CounterRegistry, DEFAULT_STORAGE_TIMEOUT};

mod storage;
pub use self::storage::{
    slot_name, CounterStorage, FileStorage, MemoryStorage, StorageError, StorageFuture,
};
