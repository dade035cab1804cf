//! Bounded, jittered exponential backoff for optimistic-lock conflicts.

use std::time::Duration;

/// Default number of read-modify-write attempts per operation.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default first backoff step (milliseconds).
const DEFAULT_BASE_BACKOFF_MS: u64 = 10;

/// Default backoff ceiling (milliseconds).
const DEFAULT_MAX_BACKOFF_MS: u64 = 250;

/// Retry budget for version conflicts. Never applied to business-rule failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_BASE_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
            max_backoff: max_backoff.max(base_backoff),
        }
    }

    /// Upper bound of the wait after the given (zero-based) failed attempt.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Full-jitter delay: uniform in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        let jitter = rand::random::<u64>() % (ceiling_ms + 1);
        Duration::from_millis(jitter)
    }
}
