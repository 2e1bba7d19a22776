//! # Metric Exchange
//!
//! Non-blocking metrics pipeline between command executions and the rolling
//! collectors. Finished executions enqueue an [`ExecutionUpdate`] onto a
//! bounded queue; a single consumer task drains the queue and fans each
//! update out to every registered collector. Enqueueing never blocks the
//! execution path: when the queue is full the update is dropped and a
//! capacity error is surfaced for logging.

use crate::collector::{CollectorRegistry, DefaultMetricCollector, MetricCollector, MetricResult};
use crate::errors::{CommandError, CommandResult};
use crate::events::Event;
use crate::settings::SettingsRegistry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tracing::debug;

/// Bound on queued, not-yet-applied updates per operation.
pub const UPDATE_QUEUE_CAPACITY: usize = 2000;

/// Snapshot of one finished execution, queued for the metrics consumer.
#[derive(Debug, Clone)]
pub struct ExecutionUpdate {
    /// Primary outcome first, optional fallback outcome second
    pub events: Vec<Event>,
    /// When the command was created
    pub start: Instant,
    /// Wall-clock duration of the run function
    pub run_duration: Duration,
    /// Bulkhead utilization at report time
    pub concurrency_in_use: f64,
}

/// Point-in-time view of one operation's rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub open: bool,
    pub requests: f64,
    pub errors: f64,
    pub error_percent: u32,
    pub successes: f64,
    pub failures: f64,
    pub rejects: f64,
    pub short_circuits: f64,
    pub timeouts: f64,
    pub context_canceled: f64,
    pub context_deadline_exceeded: f64,
    pub fallback_successes: f64,
    pub fallback_failures: f64,
    pub max_concurrency_in_use: f64,
}

/// Per-operation exchange: bounded update queue, consumer task, and the
/// collector chain the consumer fans out to.
///
/// The collector chain sits behind a read/write lock held shared during
/// fan-out and exclusive during [`MetricExchange::reset`], so a reset can
/// never interleave with a partially-applied update.
pub struct MetricExchange {
    name: String,
    settings: Arc<SettingsRegistry>,
    default_collector: Arc<DefaultMetricCollector>,
    collectors: Arc<RwLock<Vec<Arc<dyn MetricCollector>>>>,
    updates: mpsc::Sender<ExecutionUpdate>,
}

impl MetricExchange {
    pub fn new(
        name: &str,
        settings: Arc<SettingsRegistry>,
        collector_registry: &CollectorRegistry,
    ) -> Self {
        Self::with_capacity(name, settings, collector_registry, UPDATE_QUEUE_CAPACITY)
    }

    pub(crate) fn with_capacity(
        name: &str,
        settings: Arc<SettingsRegistry>,
        collector_registry: &CollectorRegistry,
        capacity: usize,
    ) -> Self {
        let (default_collector, chain) = collector_registry.initialize(name);
        let collectors = Arc::new(RwLock::new(chain));
        let (tx, rx) = mpsc::channel(capacity);

        let consumer_collectors = Arc::clone(&collectors);
        let consumer_name = name.to_string();
        tokio::spawn(async move {
            Self::consume(consumer_name, consumer_collectors, rx).await;
        });

        Self {
            name: name.to_string(),
            settings,
            default_collector,
            collectors,
            updates: tx,
        }
    }

    /// Non-blocking enqueue of one finished execution.
    ///
    /// A full queue drops the update: outcome recording is best-effort under
    /// overload and must never stall a command's completion path.
    pub fn try_update(&self, update: ExecutionUpdate) -> CommandResult<()> {
        self.updates
            .try_send(update)
            .map_err(|_| CommandError::MetricsCapacity {
                operation: self.name.clone(),
            })
    }

    /// Rolling request count over the window ending at `now`.
    pub fn requests(&self, now: SystemTime) -> f64 {
        let _collectors = self.collectors.read();
        self.default_collector.num_requests(now)
    }

    /// Rolling error percentage, rounded to the nearest integer; 0 when the
    /// window holds no requests.
    pub fn error_percent(&self, now: SystemTime) -> u32 {
        let _collectors = self.collectors.read();
        let requests = self.default_collector.num_requests(now);
        let errors = self.default_collector.errors(now);
        let mut percent = 0.0;
        if requests > 0.0 {
            percent = (errors / requests) * 100.0;
        }
        (percent + 0.5) as u32
    }

    /// True iff the rolling error percentage is below the configured
    /// threshold for this operation.
    pub fn is_healthy(&self, now: SystemTime) -> bool {
        self.error_percent(now) < self.settings.get(&self.name).error_percent_threshold
    }

    /// Zero every collector. Serialized against in-flight fan-out by the
    /// exclusive side of the collector lock.
    pub fn reset(&self) {
        let collectors = self.collectors.write();
        for collector in collectors.iter() {
            collector.reset();
        }
    }

    /// Point-in-time sums for introspection.
    pub fn snapshot(&self, open: bool, now: SystemTime) -> MetricsSnapshot {
        let _collectors = self.collectors.read();
        let default = &self.default_collector;
        MetricsSnapshot {
            open,
            requests: default.num_requests(now),
            errors: default.errors(now),
            error_percent: {
                let requests = default.num_requests(now);
                let errors = default.errors(now);
                if requests > 0.0 {
                    ((errors / requests) * 100.0 + 0.5) as u32
                } else {
                    0
                }
            },
            successes: default.successes(now),
            failures: default.failures(now),
            rejects: default.rejects(now),
            short_circuits: default.short_circuits(now),
            timeouts: default.timeouts(now),
            context_canceled: default.context_canceled(now),
            context_deadline_exceeded: default.context_deadline_exceeded(now),
            fallback_successes: default.fallback_successes(now),
            fallback_failures: default.fallback_failures(now),
            max_concurrency_in_use: default.max_concurrency_in_use(now),
        }
    }

    async fn consume(
        name: String,
        collectors: Arc<RwLock<Vec<Arc<dyn MetricCollector>>>>,
        mut rx: mpsc::Receiver<ExecutionUpdate>,
    ) {
        while let Some(update) = rx.recv().await {
            let result = Self::build_result(&update);
            let collectors = collectors.read();
            for collector in collectors.iter() {
                collector.update(&result);
            }
        }
        debug!(operation = %name, "Metrics consumer stopped");
    }

    fn build_result(update: &ExecutionUpdate) -> MetricResult {
        let mut result = MetricResult {
            attempts: 1.0,
            total_duration: update.start.elapsed(),
            run_duration: update.run_duration,
            concurrency_in_use: update.concurrency_in_use,
            ..Default::default()
        };

        if let Some(primary) = update.events.first() {
            match primary {
                Event::Success => result.successes = 1.0,
                Event::Failure => result.failures = 1.0,
                Event::Rejected => result.rejects = 1.0,
                Event::ShortCircuit => result.short_circuits = 1.0,
                Event::Timeout => result.timeouts = 1.0,
                Event::ContextCanceled => result.context_canceled = 1.0,
                Event::ContextDeadlineExceeded => result.context_deadline_exceeded = 1.0,
                Event::FallbackSuccess | Event::FallbackFailure => {}
            }
            if primary.is_error() {
                result.errors = 1.0;
            }
        }

        if let Some(fallback) = update.events.get(1) {
            match fallback {
                Event::FallbackSuccess => result.fallback_successes = 1.0,
                Event::FallbackFailure => result.fallback_failures = 1.0,
                _ => {}
            }
        }

        result
    }
}

impl std::fmt::Debug for MetricExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricExchange")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
