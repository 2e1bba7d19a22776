//! Error types for the bulwark runtime.
//!

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced through a command's single-use result handle.
///
/// Every variant is local to one execution and delivered to its caller;
/// none are fatal to the process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    /// The breaker denied the request before any work started
    #[error("circuit open for operation '{operation}'")]
    CircuitOpen { operation: String },
    /// The bulkhead for this operation had no free tickets
    #[error("max concurrency reached for operation '{operation}'")]
    MaxConcurrency { operation: String },
    /// The run function exceeded the configured timeout
    #[error("operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
    /// The external cancellation signal fired before completion
    #[error("execution canceled")]
    Canceled,
    /// The caller-supplied deadline elapsed before completion
    #[error("execution deadline exceeded")]
    DeadlineExceeded,
    /// The run function's own reported error
    #[error("command run failed: {0}")]
    Run(String),
    /// Both the run function and its fallback failed
    #[error("fallback failed with '{fallback}'; run error was '{run}'")]
    Fallback { run: String, fallback: String },
    /// The bounded metrics queue was full and an update was dropped.
    /// Non-fatal: logged by the executor, never delivered to the caller.
    #[error("metrics channel for operation '{operation}' is at capacity")]
    MetricsCapacity { operation: String },
    /// An outcome report carried no events
    #[error("no events recorded for metrics report")]
    MissingEvents,
    /// Invariant violation inside the runtime
    #[error("internal error: {0}")]
    Internal(String),
}

pub type CommandResult<T> = anyhow::Result<T, CommandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CommandError::CircuitOpen {
            operation: "billing".to_string(),
        };
        assert_eq!(err.to_string(), "circuit open for operation 'billing'");

        let err = CommandError::Fallback {
            run: "connection refused".to_string(),
            fallback: "cache miss".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "fallback failed with 'cache miss'; run error was 'connection refused'"
        );
    }

    #[test]
    fn test_timeout_display_includes_duration() {
        let err = CommandError::Timeout {
            operation: "search".to_string(),
            timeout: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("250ms"));
    }
}
