//! # Concurrency Bulkhead
//!
//! Fixed-capacity pool of admission tickets per operation. The pool bounds
//! concurrent executions independent of breaker state: a ticket must be held
//! for the duration of a run and returned exactly once on any exit path.

use crossbeam::queue::ArrayQueue;
use tracing::warn;

/// Opaque admission slot issued by a [`TicketPool`].
#[derive(Debug)]
pub struct Ticket {
    _private: (),
}

/// Lock-free pool of `max` tickets, pre-filled at creation.
#[derive(Debug)]
pub struct TicketPool {
    name: String,
    max: u32,
    tickets: ArrayQueue<Ticket>,
}

impl TicketPool {
    pub fn new(name: &str, max: u32) -> Self {
        let capacity = max.max(1);
        let tickets = ArrayQueue::new(capacity as usize);
        for _ in 0..capacity {
            let _ = tickets.push(Ticket { _private: () });
        }
        Self {
            name: name.to_string(),
            max: capacity,
            tickets,
        }
    }

    /// Non-blocking acquire. `None` means the bulkhead is exhausted.
    pub fn try_acquire(&self) -> Option<Ticket> {
        self.tickets.pop()
    }

    /// Return a ticket to the pool; a no-op when no ticket was acquired.
    pub fn release(&self, ticket: Option<Ticket>) {
        let Some(ticket) = ticket else {
            return;
        };
        if self.tickets.push(ticket).is_err() {
            warn!(
                operation = %self.name,
                "Ticket returned to a full pool; double release suppressed"
            );
        }
    }

    /// Number of tickets currently issued.
    pub fn active_count(&self) -> u32 {
        self.max - self.tickets.len() as u32
    }

    /// Issued / max, reported alongside each outcome.
    pub fn concurrency_in_use(&self) -> f64 {
        f64::from(self.active_count()) / f64::from(self.max)
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_pool_prefilled_to_max() {
        let pool = TicketPool::new("search", 4);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.concurrency_in_use(), 0.0);
    }

    #[test]
    fn test_acquire_exhausts_then_release_refills() {
        let pool = TicketPool::new("search", 2);
        let first = pool.try_acquire();
        let second = pool.try_acquire();
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.concurrency_in_use(), 1.0);

        pool.release(first);
        assert_eq!(pool.active_count(), 1);
        assert!(pool.try_acquire().is_some());
        pool.release(second);
    }

    #[test]
    fn test_release_none_is_noop() {
        let pool = TicketPool::new("search", 1);
        pool.release(None);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_max() {
        let pool = Arc::new(TicketPool::new("search", 8));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                let mut held = 0;
                for _ in 0..1000 {
                    if let Some(ticket) = pool.try_acquire() {
                        held += 1;
                        assert!(pool.active_count() <= pool.max());
                        pool.release(Some(ticket));
                    }
                }
                held
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.active_count(), 0);
    }

    proptest! {
        // Any interleaving of acquires and releases keeps the number of
        // issued tickets within [0, max].
        #[test]
        fn prop_outstanding_tickets_bounded(ops in prop::collection::vec(any::<bool>(), 1..200), max in 1u32..16) {
            let pool = TicketPool::new("search", max);
            let mut held = Vec::new();
            for acquire in ops {
                if acquire {
                    if let Some(ticket) = pool.try_acquire() {
                        held.push(ticket);
                    }
                } else if let Some(ticket) = held.pop() {
                    pool.release(Some(ticket));
                }
                prop_assert!(pool.active_count() <= max);
                prop_assert_eq!(pool.active_count() as usize, held.len());
            }
        }
    }
}
