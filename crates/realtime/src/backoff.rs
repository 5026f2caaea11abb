//! Exponential reconnect backoff
//!
//! The same policy drives push-channel reconnection and retried marker writes
//! in the notification aggregator.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Consecutive failures after which retrying stops
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt, given the number of consecutive failed
    /// attempts so far.
    ///
    /// With the default policy: 0 → 1s, 1 → 2s, 2 → 4s, 3 → 8s, 4 → 16s.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let multiplier = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        let delay = self
            .initial_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);

        delay.min(self.max_delay)
    }

    /// True once `failures` consecutive attempts have failed
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    /// The full delay sequence, one entry per permitted retry.
    ///
    /// Suitable as a `tokio_retry` strategy.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Clone {
        let policy = *self;
        (0..self.max_attempts).map(move |n| policy.delay_for(n))
    }
}
