//! # Circuit Breaker
//!
//! Per-operation fault-isolation state machine driven by the rolling metrics
//! window and the concurrency bulkhead. A breaker is Closed (requests flow)
//! or Open (requests short-circuit); while Open, a single probe request is
//! released per sleep window to test recovery. Tripping happens lazily
//! inside the health check, and a successful probe closes the breaker and
//! clears the rolling history.

use crate::collector::CollectorRegistry;
use crate::errors::{CommandError, CommandResult};
use crate::events::Event;
use crate::metrics::{ExecutionUpdate, MetricExchange, MetricsSnapshot};
use crate::pool::TicketPool;
use crate::settings::SettingsRegistry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Get current epoch nanos from SystemTime
#[inline]
fn epoch_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

#[derive(Debug, Default)]
struct BreakerFlags {
    open: bool,
    force_open: bool,
}

/// Per-operation breaker: open/force-open flags, probe timestamp, and the
/// owned metrics exchange and ticket pool.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    flags: RwLock<BreakerFlags>,
    /// Epoch nanos when the circuit last opened or released a probe.
    /// CAS-gated so exactly one caller wins each probe window.
    opened_or_last_tested_ns: AtomicU64,
    settings: Arc<SettingsRegistry>,
    metrics: MetricExchange,
    pool: TicketPool,
}

impl CircuitBreaker {
    pub fn new(
        name: &str,
        settings: Arc<SettingsRegistry>,
        collector_registry: &CollectorRegistry,
    ) -> Self {
        let resolved = settings.get(name);
        info!(
            operation = name,
            timeout_ms = resolved.timeout.as_millis() as u64,
            max_concurrent_requests = resolved.max_concurrent_requests,
            request_volume_threshold = resolved.request_volume_threshold,
            sleep_window_ms = resolved.sleep_window.as_millis() as u64,
            error_percent_threshold = resolved.error_percent_threshold,
            "Circuit breaker initialized"
        );

        Self {
            name: name.to_string(),
            flags: RwLock::new(BreakerFlags::default()),
            opened_or_last_tested_ns: AtomicU64::new(0),
            metrics: MetricExchange::new(name, Arc::clone(&settings), collector_registry),
            pool: TicketPool::new(name, resolved.max_concurrent_requests),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the breaker currently refuses traffic.
    ///
    /// Trips lazily: when the flag is clear but the rolling window has
    /// reached the volume threshold with an unhealthy error rate, the
    /// breaker opens here.
    pub fn is_open(&self) -> bool {
        let flagged = {
            let flags = self.flags.read();
            flags.force_open || flags.open
        };
        if flagged {
            return true;
        }

        let now = SystemTime::now();
        let volume_threshold = self.settings.get(&self.name).request_volume_threshold;
        if self.metrics.requests(now) < volume_threshold as f64 {
            return false;
        }

        if !self.metrics.is_healthy(now) {
            self.set_open();
            return true;
        }
        false
    }

    /// Admission check run before every execution: the breaker is closed,
    /// or it is open and this caller won the probe slot.
    pub fn allow_request(&self) -> bool {
        !self.is_open() || self.allow_single_probe()
    }

    /// At most one probe per sleep window while open. The compare-and-swap
    /// on the timestamp guarantees a single winner regardless of how many
    /// callers race.
    fn allow_single_probe(&self) -> bool {
        let flags = self.flags.read();
        let now = epoch_nanos_now();
        let last_tested = self.opened_or_last_tested_ns.load(Ordering::Acquire);
        let sleep_window = self.settings.get(&self.name).sleep_window.as_nanos() as u64;

        if flags.open && now > last_tested.saturating_add(sleep_window) {
            let swapped = self
                .opened_or_last_tested_ns
                .compare_exchange(last_tested, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if swapped {
                info!(operation = %self.name, "Releasing single probe to test recovery");
            }
            return swapped;
        }
        false
    }

    fn set_open(&self) {
        let mut flags = self.flags.write();
        if flags.open {
            return;
        }
        self.opened_or_last_tested_ns
            .store(epoch_nanos_now(), Ordering::Release);
        flags.open = true;
        drop(flags);

        warn!(operation = %self.name, "Circuit breaker opened (failing fast)");
    }

    fn set_closed(&self) {
        {
            let mut flags = self.flags.write();
            if !flags.open {
                return;
            }
            flags.open = false;
        }
        // Recovery: stale failure history must not count against the now
        // healthy operation.
        self.metrics.reset();
        info!(operation = %self.name, "Circuit breaker closed (recovered)");
    }

    /// Operator/test override: treat the breaker as open regardless of
    /// computed health. Does not touch the rolling metrics.
    pub fn set_force_open(&self, toggle: bool) {
        self.flags.write().force_open = toggle;
        warn!(operation = %self.name, force_open = toggle, "Circuit breaker force-open toggled");
    }

    /// Forward one finished execution to the metrics pipeline.
    ///
    /// A success reported while open closes the breaker. Enqueueing is
    /// best-effort: a full queue surfaces [`CommandError::MetricsCapacity`]
    /// for logging and the update is dropped.
    pub fn report_outcome(
        &self,
        events: &[Event],
        start: Instant,
        run_duration: Duration,
    ) -> CommandResult<()> {
        if events.is_empty() {
            return Err(CommandError::MissingEvents);
        }

        let open = self.flags.read().open;
        if events[0] == Event::Success && open {
            self.set_closed();
        }

        self.metrics.try_update(ExecutionUpdate {
            events: events.to_vec(),
            start,
            run_duration,
            concurrency_in_use: self.pool.concurrency_in_use(),
        })
    }

    pub(crate) fn pool(&self) -> &TicketPool {
        &self.pool
    }

    #[cfg(test)]
    pub(crate) fn metrics(&self) -> &MetricExchange {
        &self.metrics
    }

    /// Point-in-time rolling sums plus the open flag.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let open = {
            let flags = self.flags.read();
            flags.force_open || flags.open
        };
        self.metrics.snapshot(open, SystemTime::now())
    }
}

/// Shared, lazily-populated store of breakers by operation name.
///
/// Lookup takes the shared side of the lock; creation re-checks under the
/// exclusive side so two racing callers never both allocate.
#[derive(Debug)]
pub struct CircuitRegistry {
    circuits: tokio::sync::RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    settings: Arc<SettingsRegistry>,
    collectors: Arc<CollectorRegistry>,
}

impl CircuitRegistry {
    pub fn new(settings: Arc<SettingsRegistry>, collectors: Arc<CollectorRegistry>) -> Self {
        Self {
            circuits: tokio::sync::RwLock::new(HashMap::new()),
            settings,
            collectors,
        }
    }

    /// Breaker for `name`, created on first reference.
    pub async fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let circuits = self.circuits.read().await;
            if let Some(circuit) = circuits.get(name) {
                return Arc::clone(circuit);
            }
        }

        let mut circuits = self.circuits.write().await;
        // Double-check: another task may have created the breaker between
        // the read release and the write acquire.
        if let Some(circuit) = circuits.get(name) {
            return Arc::clone(circuit);
        }

        let circuit = Arc::new(CircuitBreaker::new(
            name,
            Arc::clone(&self.settings),
            &self.collectors,
        ));
        circuits.insert(name.to_string(), Arc::clone(&circuit));
        info!(
            operation = name,
            total_breakers = circuits.len(),
            "Created new circuit breaker"
        );
        circuit
    }

    /// Existing breaker for `name`, if one has been created.
    pub async fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuits.read().await.get(name).map(Arc::clone)
    }

    /// Names of all breakers created so far.
    pub async fn operation_names(&self) -> Vec<String> {
        self.circuits.read().await.keys().cloned().collect()
    }

    /// Drop every breaker. Settings are untouched.
    pub async fn flush(&self) {
        self.circuits.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::OperationConfig;

    fn registry() -> CircuitRegistry {
        CircuitRegistry::new(
            Arc::new(SettingsRegistry::new()),
            Arc::new(CollectorRegistry::new()),
        )
    }

    async fn drive_outcomes(circuit: &CircuitBreaker, successes: usize, failures: usize) {
        for _ in 0..successes {
            circuit
                .report_outcome(&[Event::Success], Instant::now(), Duration::ZERO)
                .unwrap();
        }
        for _ in 0..failures {
            circuit
                .report_outcome(&[Event::Failure], Instant::now(), Duration::ZERO)
                .unwrap();
        }
        let expected = (successes + failures) as f64;
        for _ in 0..200 {
            if circuit.metrics().requests(SystemTime::now()) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("metrics consumer never caught up to {expected} outcomes");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_or_create_returns_same_instance() {
        let registry = registry();
        let first = registry.get_or_create("db").await;
        let second = registry.get_or_create("db").await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.operation_names().await, vec!["db".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_racing_creation_yields_one_breaker() {
        let registry = Arc::new(registry());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(
                async move { registry.get_or_create("db").await },
            ));
        }
        let mut breakers = Vec::new();
        for handle in handles {
            breakers.push(handle.await.unwrap());
        }
        for breaker in &breakers[1..] {
            assert!(Arc::ptr_eq(&breakers[0], breaker));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_breaker_stays_closed_below_volume_threshold() {
        let registry = registry();
        let circuit = registry.get_or_create("db").await;

        // 10 failures at 100% error rate, but volume threshold is 20
        drive_outcomes(&circuit, 0, 10).await;
        assert!(!circuit.is_open());
        assert!(circuit.allow_request());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_breaker_trips_at_volume_and_error_threshold() {
        let settings = Arc::new(SettingsRegistry::new());
        settings.configure(
            "db",
            OperationConfig {
                request_volume_threshold: 20,
                error_percent_threshold: 50,
                ..Default::default()
            },
        );
        let registry = CircuitRegistry::new(settings, Arc::new(CollectorRegistry::new()));
        let circuit = registry.get_or_create("db").await;

        // 20 requests, 11 failures: 55% error rate
        drive_outcomes(&circuit, 9, 11).await;
        assert!(circuit.is_open());
        assert!(!circuit.allow_request());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_healthy_traffic_keeps_breaker_closed() {
        let registry = registry();
        let circuit = registry.get_or_create("db").await;

        // 25 requests, 8 failures: 32% error rate, below the 50% default
        drive_outcomes(&circuit, 17, 8).await;
        assert!(!circuit.is_open());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_success_while_open_closes_and_resets() {
        let settings = Arc::new(SettingsRegistry::new());
        settings.configure(
            "db",
            OperationConfig {
                request_volume_threshold: 5,
                ..Default::default()
            },
        );
        let registry = CircuitRegistry::new(settings, Arc::new(CollectorRegistry::new()));
        let circuit = registry.get_or_create("db").await;

        drive_outcomes(&circuit, 0, 5).await;
        assert!(circuit.is_open());

        circuit
            .report_outcome(&[Event::Success], Instant::now(), Duration::ZERO)
            .unwrap();
        assert!(!circuit.is_open());
        // rolling history cleared on recovery
        assert!(circuit.metrics().requests(SystemTime::now()) < 5.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_probe_per_sleep_window() {
        let settings = Arc::new(SettingsRegistry::new());
        settings.configure(
            "db",
            OperationConfig {
                request_volume_threshold: 5,
                sleep_window_ms: 100,
                ..Default::default()
            },
        );
        let registry = CircuitRegistry::new(settings, Arc::new(CollectorRegistry::new()));
        let circuit = registry.get_or_create("db").await;

        drive_outcomes(&circuit, 0, 5).await;
        assert!(circuit.is_open());

        // No probe before the sleep window elapses
        assert!(!circuit.allow_request());

        tokio::time::sleep(Duration::from_millis(150)).await;

        let allowed: Vec<bool> = (0..32).map(|_| circuit.allow_request()).collect();
        assert_eq!(allowed.iter().filter(|allowed| **allowed).count(), 1);

        // The winning probe consumed this window
        assert!(!circuit.allow_request());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_force_open_overrides_health() {
        let registry = registry();
        let circuit = registry.get_or_create("db").await;

        circuit.set_force_open(true);
        assert!(circuit.is_open());
        assert!(!circuit.allow_request());

        circuit.set_force_open(false);
        assert!(!circuit.is_open());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_report_outcome_rejects_empty_events() {
        let registry = registry();
        let circuit = registry.get_or_create("db").await;
        let err = circuit
            .report_outcome(&[], Instant::now(), Duration::ZERO)
            .unwrap_err();
        assert_eq!(err, CommandError::MissingEvents);
    }
}
