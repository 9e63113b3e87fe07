//! Retry policy value object.
//!
//! Policies are passed explicitly into each operation that retries; there is
//! no ambient retry configuration.

use std::time::Duration;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap applied to the exponential schedule.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given bounds.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before the given attempt (1-based). The first attempt has no
    /// delay; each subsequent attempt doubles, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(32);
        let delay = self.base_delay.saturating_mul(1u32 << exponent.min(31));
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}
