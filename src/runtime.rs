//! # Runtime Facade
//!
//! [`BulwarkCore`] owns the process-scoped stores (settings, collector
//! constructors, and breakers) and exposes the programmatic surface:
//! configure an operation, schedule a protected call, introspect breaker
//! state. No ambient globals: every component receives the stores it needs
//! by reference.

use crate::circuit::CircuitRegistry;
use crate::collector::{CollectorCtor, CollectorRegistry};
use crate::command::{box_fallback, box_run, spawn_command, CallContext, CommandHandle};
use crate::errors::{CommandError, CommandResult};
use crate::metrics::MetricsSnapshot;
use crate::settings::{OperationConfig, SettingsRegistry};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fault-isolation and admission-control runtime for named operations.
///
/// One instance per process is typical; all state lives in memory and
/// resets on restart.
#[derive(Debug)]
pub struct BulwarkCore {
    settings: Arc<SettingsRegistry>,
    collectors: Arc<CollectorRegistry>,
    circuits: CircuitRegistry,
}

impl BulwarkCore {
    pub fn new() -> Self {
        let settings = Arc::new(SettingsRegistry::new());
        let collectors = Arc::new(CollectorRegistry::new());
        let circuits = CircuitRegistry::new(Arc::clone(&settings), Arc::clone(&collectors));
        Self {
            settings,
            collectors,
            circuits,
        }
    }

    /// Configure one operation. Idempotent, last-write-wins; zero-valued
    /// fields fall back to the documented defaults.
    ///
    /// The concurrency limit is captured when the operation's breaker is
    /// first created; reconfigure before the first call to change it.
    pub fn configure(&self, name: &str, config: OperationConfig) {
        self.settings.configure(name, config);
    }

    /// Register an additional metrics back-end for operations created from
    /// now on. The default collector is always present.
    pub fn register_collector(&self, ctor: CollectorCtor) {
        self.collectors.register(ctor);
    }

    /// Schedule `run` under the breaker and bulkhead for `name`; returns
    /// immediately with a single-use completion handle.
    pub async fn spawn<R, Fut>(&self, ctx: CallContext, name: &str, run: R) -> CommandHandle
    where
        R: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let circuit = self.circuits.get_or_create(name).await;
        let settings = self.settings.get(name);
        spawn_command(circuit, settings, ctx, box_run(run), None)
    }

    /// Like [`BulwarkCore::spawn`], with a fallback invoked on any
    /// non-success outcome. A successful fallback rescues the call; a
    /// failing fallback composes both errors.
    pub async fn spawn_with_fallback<R, RFut, F, FFut>(
        &self,
        ctx: CallContext,
        name: &str,
        run: R,
        fallback: F,
    ) -> CommandHandle
    where
        R: FnOnce(CancellationToken) -> RFut + Send + 'static,
        RFut: Future<Output = anyhow::Result<()>> + Send + 'static,
        F: FnOnce(CancellationToken, CommandError) -> FFut + Send + 'static,
        FFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let circuit = self.circuits.get_or_create(name).await;
        let settings = self.settings.get(name);
        spawn_command(
            circuit,
            settings,
            ctx,
            box_run(run),
            Some(box_fallback(fallback)),
        )
    }

    /// Schedule `run` and wait for its outcome.
    pub async fn run<R, Fut>(&self, ctx: CallContext, name: &str, run: R) -> CommandResult<()>
    where
        R: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn(ctx, name, run).await.outcome().await
    }

    /// Schedule `run` with a fallback and wait for the outcome.
    pub async fn run_with_fallback<R, RFut, F, FFut>(
        &self,
        ctx: CallContext,
        name: &str,
        run: R,
        fallback: F,
    ) -> CommandResult<()>
    where
        R: FnOnce(CancellationToken) -> RFut + Send + 'static,
        RFut: Future<Output = anyhow::Result<()>> + Send + 'static,
        F: FnOnce(CancellationToken, CommandError) -> FFut + Send + 'static,
        FFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_with_fallback(ctx, name, run, fallback)
            .await
            .outcome()
            .await
    }

    /// Whether the breaker for `name` currently refuses traffic. Creates
    /// the breaker on first reference, like any other access.
    pub async fn is_open(&self, name: &str) -> bool {
        self.circuits.get_or_create(name).await.is_open()
    }

    /// Operator/test hook: force the breaker open or release the override.
    pub async fn set_force_open(&self, name: &str, toggle: bool) {
        self.circuits.get_or_create(name).await.set_force_open(toggle);
    }

    /// Rolling metrics for an existing breaker.
    pub async fn metrics_snapshot(&self, name: &str) -> Option<MetricsSnapshot> {
        Some(self.circuits.get(name).await?.metrics_snapshot())
    }

    /// Names of all operations with a breaker.
    pub async fn operation_names(&self) -> Vec<String> {
        self.circuits.operation_names().await
    }

    /// Drop every breaker and all stored settings. Intended for tests.
    pub async fn flush(&self) {
        self.circuits.flush().await;
        self.settings.flush();
    }
}

impl Default for BulwarkCore {
    fn default() -> Self {
        Self::new()
    }
}
