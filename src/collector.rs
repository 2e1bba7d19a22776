//! # Metric Collectors
//!
//! Collector back-ends that receive one [`MetricResult`] per finished
//! execution. The default collector tracks rolling counts for every outcome
//! kind; additional back-ends (statsd bridges, log exporters, test probes)
//! can be registered and receive the same fan-out.

use crate::rolling::RollingNumber;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Per-execution metric deltas fanned out to every registered collector.
///
/// Counter fields carry either 0 or 1 for a single execution; they are
/// summed into rolling buckets by the collectors.
#[derive(Debug, Clone, Default)]
pub struct MetricResult {
    pub attempts: f64,
    pub errors: f64,
    pub successes: f64,
    pub failures: f64,
    pub rejects: f64,
    pub short_circuits: f64,
    pub timeouts: f64,
    pub context_canceled: f64,
    pub context_deadline_exceeded: f64,
    pub fallback_successes: f64,
    pub fallback_failures: f64,
    /// Wall-clock time from command creation to completion
    pub total_duration: Duration,
    /// Wall-clock time the run function itself took
    pub run_duration: Duration,
    /// Bulkhead utilization ratio (issued / max) at report time
    pub concurrency_in_use: f64,
}

/// A metrics back-end receiving one update per finished execution.
///
/// Implementations must be internally synchronized: `update` is called from
/// the single queue consumer while `reset` may arrive from a breaker
/// transition on another task.
pub trait MetricCollector: Send + Sync {
    /// Apply one execution's deltas.
    fn update(&self, result: &MetricResult);

    /// Zero all state.
    fn reset(&self);
}

/// Default collector backing the breaker health check.
///
/// Tracks a rolling number per outcome kind plus the rolling maximum of
/// bulkhead utilization.
#[derive(Debug, Default)]
pub struct DefaultMetricCollector {
    num_requests: RollingNumber,
    errors: RollingNumber,
    successes: RollingNumber,
    failures: RollingNumber,
    rejects: RollingNumber,
    short_circuits: RollingNumber,
    timeouts: RollingNumber,
    context_canceled: RollingNumber,
    context_deadline_exceeded: RollingNumber,
    fallback_successes: RollingNumber,
    fallback_failures: RollingNumber,
    max_concurrency_in_use: RollingNumber,
}

impl DefaultMetricCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rolling request count over the window ending at `now`.
    pub fn num_requests(&self, now: SystemTime) -> f64 {
        self.num_requests.sum(now)
    }

    /// Rolling error count over the window ending at `now`.
    pub fn errors(&self, now: SystemTime) -> f64 {
        self.errors.sum(now)
    }

    pub fn successes(&self, now: SystemTime) -> f64 {
        self.successes.sum(now)
    }

    pub fn failures(&self, now: SystemTime) -> f64 {
        self.failures.sum(now)
    }

    pub fn rejects(&self, now: SystemTime) -> f64 {
        self.rejects.sum(now)
    }

    pub fn short_circuits(&self, now: SystemTime) -> f64 {
        self.short_circuits.sum(now)
    }

    pub fn timeouts(&self, now: SystemTime) -> f64 {
        self.timeouts.sum(now)
    }

    pub fn context_canceled(&self, now: SystemTime) -> f64 {
        self.context_canceled.sum(now)
    }

    pub fn context_deadline_exceeded(&self, now: SystemTime) -> f64 {
        self.context_deadline_exceeded.sum(now)
    }

    pub fn fallback_successes(&self, now: SystemTime) -> f64 {
        self.fallback_successes.sum(now)
    }

    pub fn fallback_failures(&self, now: SystemTime) -> f64 {
        self.fallback_failures.sum(now)
    }

    pub fn max_concurrency_in_use(&self, now: SystemTime) -> f64 {
        self.max_concurrency_in_use.max(now)
    }
}

impl MetricCollector for DefaultMetricCollector {
    fn update(&self, result: &MetricResult) {
        let now = SystemTime::now();
        self.num_requests.increment(now, result.attempts);
        self.errors.increment(now, result.errors);
        self.successes.increment(now, result.successes);
        self.failures.increment(now, result.failures);
        self.rejects.increment(now, result.rejects);
        self.short_circuits.increment(now, result.short_circuits);
        self.timeouts.increment(now, result.timeouts);
        self.context_canceled.increment(now, result.context_canceled);
        self.context_deadline_exceeded
            .increment(now, result.context_deadline_exceeded);
        self.fallback_successes
            .increment(now, result.fallback_successes);
        self.fallback_failures
            .increment(now, result.fallback_failures);
        self.max_concurrency_in_use
            .update_max(now, result.concurrency_in_use);
    }

    fn reset(&self) {
        self.num_requests.reset();
        self.errors.reset();
        self.successes.reset();
        self.failures.reset();
        self.rejects.reset();
        self.short_circuits.reset();
        self.timeouts.reset();
        self.context_canceled.reset();
        self.context_deadline_exceeded.reset();
        self.fallback_successes.reset();
        self.fallback_failures.reset();
        self.max_concurrency_in_use.reset();
    }
}

/// Constructor for one additional collector back-end, invoked once per
/// operation name.
pub type CollectorCtor = Box<dyn Fn(&str) -> Arc<dyn MetricCollector> + Send + Sync>;

/// Registry of collector constructors shared by all breakers.
///
/// The default collector is always instantiated first for every operation;
/// registered constructors are appended in registration order.
pub struct CollectorRegistry {
    ctors: RwLock<Vec<CollectorCtor>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self {
            ctors: RwLock::new(Vec::new()),
        }
    }

    /// Append an additional collector back-end.
    ///
    /// Only affects breakers created after the call.
    pub fn register(&self, ctor: CollectorCtor) {
        self.ctors.write().push(ctor);
    }

    /// Instantiate the collector chain for one operation. The typed default
    /// collector is returned separately so the health check can read it
    /// without downcasting; it is also the first element of the chain.
    pub fn initialize(
        &self,
        name: &str,
    ) -> (Arc<DefaultMetricCollector>, Vec<Arc<dyn MetricCollector>>) {
        let default = Arc::new(DefaultMetricCollector::new());
        let mut chain: Vec<Arc<dyn MetricCollector>> = vec![default.clone()];
        for ctor in self.ctors.read().iter() {
            chain.push(ctor(name));
        }
        (default, chain)
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("registered", &self.ctors.read().len())
            .finish()
    }
}
