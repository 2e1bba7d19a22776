//! # Command Executor
//!
//! Orchestrates one protected call: admission through the breaker and the
//! bulkhead, the user function under a deadline and external cancellation,
//! fallback on failure, and exactly-once completion. Completion (ticket
//! return, outcome reporting, result delivery) is funneled through a single
//! routine guarded by an atomic flag: whichever of the racing triggers
//! (rejection, natural finish, watchdog) fires first wins, the rest are
//! no-ops.
//!
//! Cancellation is best-effort: a run function still executing after the
//! watchdog fires is detached, not preempted. It should honor the
//! cancellation token to actually stop early; its late ticket-return attempt
//! is absorbed by the ticket slot.

use crate::circuit::CircuitBreaker;
use crate::errors::{CommandError, CommandResult};
use crate::events::Event;
use crate::pool::Ticket;
use crate::settings::OperationSettings;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// External cancellation signal for one call: a cancellation token plus an
/// optional deadline. The two are classified separately so callers can tell
/// "caller walked away" from "caller's deadline elapsed".
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Absolute deadline for this call.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

pub(crate) type RunFn =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;
pub(crate) type FallbackFn = Box<
    dyn FnOnce(CancellationToken, CommandError) -> BoxFuture<'static, anyhow::Result<()>> + Send,
>;

pub(crate) fn box_run<R, Fut>(run: R) -> RunFn
where
    R: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |token| run(token).boxed())
}

pub(crate) fn box_fallback<F, Fut>(fallback: F) -> FallbackFn
where
    F: FnOnce(CancellationToken, CommandError) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |token, err| fallback(token, err).boxed())
}

/// Single-use handle resolving to a command's final result.
///
/// The executor delivers exactly one value: `Ok(())` on success (including
/// a successful fallback rescue) or the final [`CommandError`].
#[derive(Debug)]
pub struct CommandHandle {
    rx: oneshot::Receiver<CommandResult<()>>,
}

impl CommandHandle {
    /// Wait for the command to finish.
    pub async fn outcome(self) -> CommandResult<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Internal(
                "executor dropped without delivering a result".to_string(),
            )),
        }
    }
}

/// Payload consumed exactly once by whichever completion trigger wins.
struct CompletionInner {
    fallback: Option<FallbackFn>,
    result_tx: oneshot::Sender<CommandResult<()>>,
}

/// State shared between the work task, the watchdog task, and a possibly
/// detached run function.
struct CommandState {
    circuit: Arc<CircuitBreaker>,
    completed: AtomicBool,
    /// Ticket hand-off slot. The work task stores its ticket here; the
    /// completion routine takes whatever the slot holds. A work task that
    /// acquired after completion returns its ticket directly.
    ticket: Mutex<Option<Ticket>>,
    inner: Mutex<Option<CompletionInner>>,
    token: CancellationToken,
    start: Instant,
}

impl CommandState {
    /// First caller wins; everyone else is a no-op. The winning path, in
    /// order: release the ticket, classify the outcome, run the fallback on
    /// any non-success, report all events, deliver the result.
    async fn complete(&self, outcome: Option<CommandError>, run_duration: Duration) {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(inner) = self.inner.lock().take() else {
            return;
        };

        let ticket = self.ticket.lock().take();
        self.circuit.pool().release(ticket);

        let mut events = vec![classify(&outcome)];
        let result = match outcome {
            None => Ok(()),
            Some(err) => match inner.fallback {
                None => Err(err),
                Some(fallback) => {
                    match fallback(self.token.clone(), err.clone()).await {
                        Ok(()) => {
                            events.push(Event::FallbackSuccess);
                            Ok(())
                        }
                        Err(fallback_err) => {
                            events.push(Event::FallbackFailure);
                            Err(CommandError::Fallback {
                                run: err.to_string(),
                                fallback: fallback_err.to_string(),
                            })
                        }
                    }
                }
            },
        };

        if let Err(report_err) = self
            .circuit
            .report_outcome(&events, self.start, run_duration)
        {
            warn!(
                operation = %self.circuit.name(),
                error = %report_err,
                "Dropped metrics update for finished command"
            );
        }

        let _ = inner.result_tx.send(result);
    }
}

fn classify(outcome: &Option<CommandError>) -> Event {
    match outcome {
        None => Event::Success,
        Some(CommandError::CircuitOpen { .. }) => Event::ShortCircuit,
        Some(CommandError::MaxConcurrency { .. }) => Event::Rejected,
        Some(CommandError::Timeout { .. }) => Event::Timeout,
        Some(CommandError::Canceled) => Event::ContextCanceled,
        Some(CommandError::DeadlineExceeded) => Event::ContextDeadlineExceeded,
        Some(_) => Event::Failure,
    }
}

/// Schedule one execution: a work task that admits and runs the user
/// function, and a watchdog racing the configured timeout against the
/// external cancellation signal. Returns immediately.
pub(crate) fn spawn_command(
    circuit: Arc<CircuitBreaker>,
    settings: Arc<OperationSettings>,
    ctx: CallContext,
    run: RunFn,
    fallback: Option<FallbackFn>,
) -> CommandHandle {
    let (result_tx, result_rx) = oneshot::channel();
    let (finished_tx, finished_rx) = oneshot::channel::<()>();

    let state = Arc::new(CommandState {
        circuit: Arc::clone(&circuit),
        completed: AtomicBool::new(false),
        ticket: Mutex::new(None),
        inner: Mutex::new(Some(CompletionInner {
            fallback,
            result_tx,
        })),
        token: ctx.token(),
        start: Instant::now(),
    });

    let work_state = Arc::clone(&state);
    let work_token = ctx.token();
    tokio::spawn(async move {
        let circuit = Arc::clone(&work_state.circuit);
        if !circuit.allow_request() {
            work_state
                .complete(
                    Some(CommandError::CircuitOpen {
                        operation: circuit.name().to_string(),
                    }),
                    Duration::ZERO,
                )
                .await;
            let _ = finished_tx.send(());
            return;
        }

        let Some(acquired) = circuit.pool().try_acquire() else {
            work_state
                .complete(
                    Some(CommandError::MaxConcurrency {
                        operation: circuit.name().to_string(),
                    }),
                    Duration::ZERO,
                )
                .await;
            let _ = finished_tx.send(());
            return;
        };

        let mut leftover = Some(acquired);
        {
            let mut slot = work_state.ticket.lock();
            if !work_state.completed.load(Ordering::Acquire) {
                *slot = leftover.take();
            }
        }
        if leftover.is_some() {
            // The watchdog already completed this command; the slot never
            // saw our ticket, so it goes straight back.
            circuit.pool().release(leftover);
            let _ = finished_tx.send(());
            return;
        }

        let run_start = Instant::now();
        let run_result = run(work_token).await;
        let run_duration = run_start.elapsed();

        let outcome = match run_result {
            Ok(()) => None,
            Err(err) => Some(CommandError::Run(err.to_string())),
        };
        debug!(
            operation = %circuit.name(),
            run_duration_ms = run_duration.as_millis() as u64,
            success = outcome.is_none(),
            "Command run finished"
        );
        work_state.complete(outcome, run_duration).await;
        let _ = finished_tx.send(());
    });

    let watchdog_state = state;
    let watchdog_token = ctx.token();
    let timeout = settings.timeout;
    let operation = circuit.name().to_string();
    tokio::spawn(async move {
        let deadline = async {
            match ctx.deadline {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => futures::future::pending().await,
            }
        };

        tokio::select! {
            _ = finished_rx => {}
            _ = watchdog_token.cancelled() => {
                watchdog_state
                    .complete(Some(CommandError::Canceled), Duration::ZERO)
                    .await;
            }
            _ = deadline => {
                watchdog_state
                    .complete(Some(CommandError::DeadlineExceeded), Duration::ZERO)
                    .await;
            }
            _ = tokio::time::sleep(timeout) => {
                watchdog_state
                    .complete(
                        Some(CommandError::Timeout { operation, timeout }),
                        Duration::ZERO,
                    )
                    .await;
            }
        }
    });

    CommandHandle { rx: result_rx }
}
