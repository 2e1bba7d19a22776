//! # Rolling Window Counters
//!
//! Time-bounded aggregate counters that age out old data. Each counter keeps
//! one bucket per second over a fixed window (10 seconds by default); sums and
//! maxima are computed over the buckets that fall inside the window at read
//! time.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default aggregation window for all rolling counters.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

fn epoch_secs(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// A single rolling counter with per-second buckets.
#[derive(Debug)]
pub struct RollingNumber {
    window_secs: u64,
    buckets: RwLock<HashMap<u64, f64>>,
}

impl RollingNumber {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window_secs: window.as_secs().max(1),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Add `value` to the current second's bucket.
    pub fn increment(&self, now: SystemTime, value: f64) {
        if value == 0.0 {
            return;
        }
        let key = epoch_secs(now);
        let mut buckets = self.buckets.write();
        *buckets.entry(key).or_insert(0.0) += value;
        Self::prune(&mut buckets, key, self.window_secs);
    }

    /// Raise the current second's bucket to `value` if it is larger.
    pub fn update_max(&self, now: SystemTime, value: f64) {
        let key = epoch_secs(now);
        let mut buckets = self.buckets.write();
        let entry = buckets.entry(key).or_insert(0.0);
        if value > *entry {
            *entry = value;
        }
        Self::prune(&mut buckets, key, self.window_secs);
    }

    /// Sum of all buckets inside the window ending at `now`.
    pub fn sum(&self, now: SystemTime) -> f64 {
        let cutoff = epoch_secs(now).saturating_sub(self.window_secs);
        let buckets = self.buckets.read();
        buckets
            .iter()
            .filter(|(key, _)| **key > cutoff)
            .map(|(_, value)| value)
            .sum()
    }

    /// Largest bucket value inside the window ending at `now`.
    pub fn max(&self, now: SystemTime) -> f64 {
        let cutoff = epoch_secs(now).saturating_sub(self.window_secs);
        let buckets = self.buckets.read();
        buckets
            .iter()
            .filter(|(key, _)| **key > cutoff)
            .map(|(_, value)| *value)
            .fold(0.0, f64::max)
    }

    /// Discard all buckets.
    pub fn reset(&self) {
        self.buckets.write().clear();
    }

    fn prune(buckets: &mut HashMap<u64, f64>, current: u64, window_secs: u64) {
        let cutoff = current.saturating_sub(window_secs);
        buckets.retain(|key, _| *key > cutoff);
    }
}

impl Default for RollingNumber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_increment_and_sum() {
        let number = RollingNumber::new();
        number.increment(at(100), 1.0);
        number.increment(at(100), 1.0);
        number.increment(at(101), 3.0);

        assert_eq!(number.sum(at(101)), 5.0);
    }

    #[test]
    fn test_old_buckets_age_out() {
        let number = RollingNumber::new();
        number.increment(at(100), 10.0);
        number.increment(at(105), 1.0);

        assert_eq!(number.sum(at(105)), 11.0);
        // bucket 100 falls outside the window at t=111
        assert_eq!(number.sum(at(111)), 1.0);
        assert_eq!(number.sum(at(120)), 0.0);
    }

    #[test]
    fn test_prune_on_write() {
        let number = RollingNumber::new();
        number.increment(at(100), 1.0);
        number.increment(at(150), 1.0);

        let buckets = number.buckets.read();
        assert_eq!(buckets.len(), 1);
        assert!(buckets.contains_key(&150));
    }

    #[test]
    fn test_update_max() {
        let number = RollingNumber::new();
        number.update_max(at(100), 0.3);
        number.update_max(at(100), 0.8);
        number.update_max(at(100), 0.5);
        number.update_max(at(102), 0.6);

        assert_eq!(number.max(at(102)), 0.8);
        assert_eq!(number.max(at(112)), 0.6);
    }

    #[test]
    fn test_reset_clears_all_buckets() {
        let number = RollingNumber::new();
        number.increment(at(100), 5.0);
        number.reset();

        assert_eq!(number.sum(at(100)), 0.0);
    }

    #[test]
    fn test_zero_increment_is_skipped() {
        let number = RollingNumber::new();
        number.increment(at(100), 0.0);

        assert!(number.buckets.read().is_empty());
    }
}
