#![allow(clippy::doc_markdown)] // Allow technical terms without backticks in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Bulwark Core
//!
//! Per-operation fault-isolation and admission-control runtime. Given a
//! named remote operation, the runtime bounds concurrent in-flight calls,
//! tracks a rolling window of outcomes, trips a breaker that short-circuits
//! calls once the operation is unhealthy, and probes for recovery without
//! re-flooding a failing dependency.
//!
//! ## Architecture
//!
//! One execution flows through five components:
//!
//! - [`settings`] - per-operation configuration, lazily materialized with
//!   defaults on first access
//! - [`circuit`] - the per-operation breaker state machine and the shared
//!   breaker registry
//! - [`pool`] - the concurrency bulkhead: a fixed pool of admission tickets
//! - [`metrics`] - the non-blocking rolling metrics pipeline
//! - [`command`] - the executor orchestrating admission, the user function
//!   under deadline and cancellation, fallback, and exactly-once completion
//!
//! ## Key Guarantees
//!
//! - Outstanding tickets never exceed the configured concurrency limit, and
//!   every acquired ticket is returned exactly once across every exit path
//! - Completion (ticket return, outcome reporting, result delivery) happens
//!   exactly once per execution regardless of how timeouts, cancellations,
//!   and natural completion race
//! - Outcome recording never blocks the execution path: the metrics queue
//!   drops updates under overload
//! - While a breaker is open, at most one probe is released per sleep
//!   window no matter how many callers race
//!
//! ## Quick Start
//!
//! ```rust
//! use bulwark_core::{BulwarkCore, CallContext, OperationConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let core = BulwarkCore::new();
//! core.configure(
//!     "user-lookup",
//!     OperationConfig {
//!         timeout_ms: 500,
//!         max_concurrent_requests: 32,
//!         ..Default::default()
//!     },
//! );
//!
//! let result = core
//!     .run_with_fallback(
//!         CallContext::new(),
//!         "user-lookup",
//!         |_token| async { /* call the dependency */ Ok(()) },
//!         |_token, _err| async { /* degrade gracefully */ Ok(()) },
//!     )
//!     .await;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod collector;
pub mod command;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod pool;
pub mod rolling;
pub mod runtime;
pub mod settings;

pub use circuit::{CircuitBreaker, CircuitRegistry};
pub use collector::{
    CollectorCtor, CollectorRegistry, DefaultMetricCollector, MetricCollector, MetricResult,
};
pub use command::{CallContext, CommandHandle};
pub use errors::{CommandError, CommandResult};
pub use events::Event;
pub use metrics::{ExecutionUpdate, MetricExchange, MetricsSnapshot};
pub use pool::{Ticket, TicketPool};
pub use rolling::RollingNumber;
pub use runtime::BulwarkCore;
pub use settings::{
    OperationConfig, OperationSettings, SettingsRegistry, DEFAULT_ERROR_PERCENT_THRESHOLD,
    DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_REQUEST_VOLUME_THRESHOLD, DEFAULT_SLEEP_WINDOW_MS,
    DEFAULT_TIMEOUT_MS,
};
