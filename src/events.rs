//! # Execution Outcome Events
//!
//! Closed set of outcome classifications produced by command execution.
//! Events drive both the rolling metrics window and the circuit breaker
//! health decisions.

use serde::{Deserialize, Serialize};

/// Classification of one execution's result.
///
/// An execution records at most two events: the primary outcome first,
/// followed by an optional fallback outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Event {
    /// The run function returned without error
    Success,
    /// The run function returned an error
    Failure,
    /// The bulkhead had no free tickets
    Rejected,
    /// The breaker was open and denied the request
    ShortCircuit,
    /// The run function exceeded the configured timeout
    Timeout,
    /// The external cancellation signal fired
    ContextCanceled,
    /// The caller-supplied deadline elapsed
    ContextDeadlineExceeded,
    /// The fallback function rescued a failed execution
    FallbackSuccess,
    /// The fallback function itself failed
    FallbackFailure,
}

impl Event {
    /// Whether this event counts as an error for the rolling error rate.
    ///
    /// Cancellations are excluded: the caller walked away, the dependency
    /// did not fail.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Event::Failure | Event::Rejected | Event::ShortCircuit | Event::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Event::Failure.is_error());
        assert!(Event::Rejected.is_error());
        assert!(Event::ShortCircuit.is_error());
        assert!(Event::Timeout.is_error());

        assert!(!Event::Success.is_error());
        assert!(!Event::ContextCanceled.is_error());
        assert!(!Event::ContextDeadlineExceeded.is_error());
        assert!(!Event::FallbackSuccess.is_error());
        assert!(!Event::FallbackFailure.is_error());
    }
}
