//! Per-key exponential backoff for failed reconciliations.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

/// Tracks consecutive failures per key and computes the next retry delay
/// as `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct Backoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> Backoff<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure for `key` and returns how long to wait before
    /// retrying it.
    pub fn next_delay(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        let exponent = (*count).min(31);
        *count = count.saturating_add(1);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Clears the failure history of `key` after a success.
    pub fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}
