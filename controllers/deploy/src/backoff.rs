//! # Per-item Exponential Backoff
//!
//! Delay before a failed key is handed out again. The delay doubles with
//! every consecutive failure of the same key and is capped, so one
//! persistently failing object cannot hot-loop the workers while a key that
//! fails once is retried almost immediately.
//!
//! Sequence with the defaults: 5ms, 10ms, 20ms, 40ms, ... 1000s (max).

use std::time::Duration;

/// Default delay after the first failure.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Default ceiling for the delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator
///
/// Stateless: the caller tracks the failure count per item (the work queue
/// does this) and asks for the delay matching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemExponentialBackoff {
    /// Delay for the first failure (failure count 0)
    base: Duration,
    /// Maximum delay
    max: Duration,
}

impl Default for ItemExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl ItemExponentialBackoff {
    /// Create a backoff with the given base and maximum delays.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Calculate the delay for the given number of previous failures
    ///
    /// `base * 2^failures`, capped at `max`. Saturates instead of
    /// overflowing for very large failure counts.
    #[must_use]
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}
