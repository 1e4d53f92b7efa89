use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for [crate::PageCache] and [crate::AsyncPageCache].
#[derive(Default)]
pub(crate) struct Metrics {
    /// Number of resident pages
    pub resident: Gauge,
    /// Number of loads dispatched but not yet applied
    pub in_flight: Gauge,
    /// Number of page requests served by a resident page
    pub hits: Counter,
    /// Number of page requests that created a page
    pub misses: Counter,
    /// Number of neighbor pages created by prefetching
    pub prefetches: Counter,
    /// Number of pages evicted by the sweep
    pub evictions: Counter,
    /// Number of resets caused by a count change
    pub resets: Counter,
    /// Number of failed count or page loads
    pub failures: Counter,
    /// Number of completions dropped because their page was no longer resident
    pub stale: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register("resident", "Number of resident pages", metrics.resident.clone());
        context.register(
            "in_flight",
            "Number of loads dispatched but not yet applied",
            metrics.in_flight.clone(),
        );
        context.register(
            "hits",
            "Number of page requests served by a resident page",
            metrics.hits.clone(),
        );
        context.register(
            "misses",
            "Number of page requests that created a page",
            metrics.misses.clone(),
        );
        context.register(
            "prefetches",
            "Number of neighbor pages created by prefetching",
            metrics.prefetches.clone(),
        );
        context.register(
            "evictions",
            "Number of pages evicted by the sweep",
            metrics.evictions.clone(),
        );
        context.register(
            "resets",
            "Number of resets caused by a count change",
            metrics.resets.clone(),
        );
        context.register(
            "failures",
            "Number of failed count or page loads",
            metrics.failures.clone(),
        );
        context.register(
            "stale",
            "Number of completions dropped because their page was no longer resident",
            metrics.stale.clone(),
        );
        metrics
    }
}
