//! An A/B-testing edge service.
//!
//! The edge sits in front of an origin server. Visitors arriving at `/abtest` are assigned to the
//! control or variant group, remembered by cookie, and served that group's page from the origin.
//! Four counters track how often each group's page was shown to a newly-assigned visitor and how
//! often each group's visitors took the tracked action:
//!
//! - `/abtest` assigns (on first visit) and serves the group page
//! - `/abtest/control` and `/abtest/variant` are forwarded as-is
//! - `/abtest/action` counts the action at most once per visitor and redirects
//! - `/abtest/result` reports the counters as JSON
//! - everything else is forwarded untouched
//!
//! Counting never fails a visitor's request: if a counter cannot be persisted, the failure is
//! logged and the response is served anyway.
//!
//! # Usage
//!
//! ```no_run
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use abtest_edge::EdgeBuilder;
//!
//! let router = EdgeBuilder::new()
//!     .with_http_listener(([127, 0, 0, 1], 8787))
//!     .with_upstream("http://127.0.0.1:8080")?
//!     .with_storage_path("/var/lib/abtest")
//!     .add_allowed_address("10.0.0.0/8")?
//!     .install()?;
//! # drop(router);
//! # Ok(())
//! # }
//! ```
#![deny(clippy::all)]
#![warn(missing_docs)]

mod assignment;
pub use self::assignment::{
    ActionOutcome, FixedSource, Group, GroupSource, PageOutcome, RngSource, Tally,
    ThreadRngSource, Visitor,
};

mod builder;
pub use self::builder::{BuildError, EdgeBuilder, DEFAULT_LISTEN_ADDRESS};

pub mod cookies;

mod experiment;
pub use self::experiment::{Experiment, Results};

mod listener;
pub use self::listener::{ServerError, ServerFuture};

mod router;
pub use self::router::{EdgeRouter, RemoteAddr, Route, DEFAULT_COOKIE_MAX_AGE};

mod upstream;
pub use self::upstream::{HttpUpstream, Upstream, UpstreamError, UpstreamFuture};
