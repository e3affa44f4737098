use std::sync::Arc;

use abtest_store::{CounterError, CounterRegistry};
use serde::Serialize;
use tracing::{debug, warn};

use crate::assignment::{ActionOutcome, GroupSource, PageOutcome, Tally, Visitor};

/// Current totals of the four experiment counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Results {
    /// Control pages shown to newly-assigned visitors.
    pub control_show: u64,

    /// Actions counted for control visitors.
    pub control_action: u64,

    /// Variant pages shown to newly-assigned visitors.
    pub variant_show: u64,

    /// Actions counted for variant visitors.
    pub variant_action: u64,
}

/// The experiment: group assignment, deduplicated counting, and result reporting.
///
/// Counting never fails a visitor's request. If a tally cannot be recorded, the failure is logged
/// and the request proceeds as if it had been, accepting an undercount.
pub struct Experiment {
    registry: CounterRegistry,
    groups: Arc<dyn GroupSource>,
}

impl Experiment {
    /// Creates a new `Experiment` counting into `registry` and assigning groups from `groups`.
    pub fn new(registry: CounterRegistry, groups: Arc<dyn GroupSource>) -> Self {
        Self { registry, groups }
    }

    /// Handles a page request, counting a show if the visitor is newly assigned.
    pub async fn page(&self, visitor: &Visitor) -> PageOutcome {
        let outcome = visitor.on_page(self.groups.as_ref());
        if let Some(tally) = outcome.tally() {
            self.record(tally).await;
        }
        outcome
    }

    /// Handles an action request, counting the action if it has not been counted before.
    pub async fn action(&self, visitor: &Visitor) -> ActionOutcome {
        let outcome = visitor.on_action();
        if let Some(tally) = outcome.tally() {
            self.record(tally).await;
        }
        outcome
    }

    /// Reads the current totals of all four counters.
    ///
    /// # Errors
    ///
    /// If any counter cannot be read from storage, an error is returned.
    pub async fn results(&self) -> Result<Results, CounterError> {
        let [control_show, control_action, variant_show, variant_action] =
            Tally::ALL.map(|tally| self.registry.resolve(tally.counter_name()));

        let (control_show, control_action, variant_show, variant_action) = tokio::try_join!(
            control_show.value(),
            control_action.value(),
            variant_show.value(),
            variant_action.value(),
        )?;

        Ok(Results { control_show, control_action, variant_show, variant_action })
    }

    async fn record(&self, tally: Tally) -> Option<u64> {
        let name = tally.counter_name();
        match self.registry.resolve(name).increment().await {
            Ok(value) => {
                debug!(counter = name, value, "recorded tally");
                Some(value)
            }
            Err(e) => {
                warn!(counter = name, error = %e, "failed to record tally, serving anyway");
                None
            }
        }
    }
}
