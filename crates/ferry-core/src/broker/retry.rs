use std::time::Duration;

use crate::queue::RetryPolicy;

/// Computes redelivery delays and decides when a failing message is done
/// retrying. Holds no state beyond the queue's immutable policy.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Exponential backoff for the delivery numbered `attempts`:
    /// `min(base * 2^(attempts - 1), max)`. `attempts = 0` is treated as 1.
    pub fn backoff(&self, attempts: u32) -> Duration {
        Duration::from_millis(backoff_ms(
            self.policy.base_delay_ms,
            self.policy.max_delay_ms,
            attempts,
        ))
    }

    /// Whether a message that just failed its `attempts`-th delivery
    /// should leave the queue instead of being rescheduled.
    pub fn should_dead_letter(&self, attempts: u32) -> bool {
        should_dead_letter(attempts, self.policy.max_attempts)
    }
}

pub fn backoff_ms(base_delay_ms: u64, max_delay_ms: u64, attempts: u32) -> u64 {
    let exponent = attempts.max(1) - 1;
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    base_delay_ms.saturating_mul(factor).min(max_delay_ms)
}

pub fn should_dead_letter(attempts: u32, max_attempts: u32) -> bool {
    attempts >= max_attempts
}
