//! Prometheus metrics of the coordination client.
//!
//! The families are owned by [`KvStoreMetrics`] and only exported once the embedding agent
//! registers them into its own [`Registry`]. An unregistered instance still records, which keeps
//! the call sites free of `Option` checks.

use std::iter;
use std::time::Duration;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

const KVSTORE_REGISTRY_PREFIX: &str = "kvstore";

// Note: no suffix on the names, the client library infers it from the metric type.
const OPERATION_DURATION: &str = "operations_duration_seconds";
const QUORUM_ERRORS: &str = "quorum_errors";
const LIMITER_WAIT_DURATION: &str = "api_limiter_wait_duration_seconds";
const WATCH_EVENTS: &str = "events";

const SCOPE_LABEL: &str = "scope";
const KIND_LABEL: &str = "kind";
const ACTION_LABEL: &str = "action";
const OUTCOME_LABEL: &str = "outcome";
const ERROR_LABEL: &str = "error";
const LIMITER_LABEL: &str = "limiter";

pub(crate) const OUTCOME_SUCCESS: &str = "success";
pub(crate) const OUTCOME_FAILURE: &str = "failure";

type Labels = Vec<(String, String)>;

/// Exponential bucket distribution with `length` buckets from `min` to `max`.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let growth_factor = (max / min).powf(1.0 / (f64::from(length) - 1.0));
    iter::successors(Some(min), move |prev| Some(prev * growth_factor)).take(length.into())
}

fn seconds_histogram() -> Histogram {
    Histogram::new(exponential_buckets_range(0.0005, 60.0, 12))
}

#[derive(Debug)]
pub struct KvStoreMetrics {
    operation_duration: Family<Labels, Histogram, fn() -> Histogram>,
    quorum_errors: Family<Labels, Counter>,
    limiter_wait: Family<Labels, Histogram, fn() -> Histogram>,
    watch_events: Family<Labels, Counter>,
}

impl Default for KvStoreMetrics {
    fn default() -> Self {
        Self {
            operation_duration: Family::new_with_constructor(seconds_histogram),
            quorum_errors: Family::default(),
            limiter_wait: Family::new_with_constructor(seconds_histogram),
            watch_events: Family::default(),
        }
    }
}

impl KvStoreMetrics {
    /// Creates the families and registers them under the `kvstore` prefix of `registry`.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let registry = registry.sub_registry_with_prefix(KVSTORE_REGISTRY_PREFIX);
        registry.register(
            OPERATION_DURATION,
            "Duration of operations against the remote store, by scope, kind, action and outcome",
            metrics.operation_duration.clone(),
        );
        registry.register(
            QUORUM_ERRORS,
            "Number of quorum errors detected by the status monitor",
            metrics.quorum_errors.clone(),
        );
        registry.register(
            LIMITER_WAIT_DURATION,
            "Time spent waiting for admission by the API rate limiter",
            metrics.limiter_wait.clone(),
        );
        registry.register(
            WATCH_EVENTS,
            "Number of events emitted by the watchers, by scope and action",
            metrics.watch_events.clone(),
        );
        metrics
    }

    pub(crate) fn observe_operation(
        &self,
        key: &str,
        kind: &str,
        action: &str,
        outcome: &str,
        elapsed: Duration,
    ) {
        self.operation_duration
            .get_or_create(&vec![
                (SCOPE_LABEL.to_string(), scope_from_key(key).to_string()),
                (KIND_LABEL.to_string(), kind.to_string()),
                (ACTION_LABEL.to_string(), action.to_string()),
                (OUTCOME_LABEL.to_string(), outcome.to_string()),
            ])
            .observe(elapsed.as_secs_f64());
    }

    pub(crate) fn quorum_error(&self, err: &str) {
        self.quorum_errors
            .get_or_create(&vec![(ERROR_LABEL.to_string(), err.to_string())])
            .inc();
    }

    pub(crate) fn limiter_waited(&self, limiter: &str, waited: Duration) {
        self.limiter_wait
            .get_or_create(&vec![(LIMITER_LABEL.to_string(), limiter.to_string())])
            .observe(waited.as_secs_f64());
    }

    pub(crate) fn watch_event(&self, prefix: &str, action: &str) {
        self.watch_events
            .get_or_create(&vec![
                (SCOPE_LABEL.to_string(), scope_from_key(prefix).to_string()),
                (ACTION_LABEL.to_string(), action.to_string()),
            ])
            .inc();
    }
}

/// Metric scope of a key: its first two path components, e.g. `agents/state` for
/// `agents/state/nodes/v1/n1`. Keeps the label cardinality bounded.
pub(crate) fn scope_from_key(key: &str) -> &str {
    let mut boundaries = key.match_indices('/').map(|(i, _)| i);
    match boundaries.nth(1) {
        Some(end) => key.get(..end).unwrap_or(key),
        None => key.trim_end_matches('/'),
    }
}
