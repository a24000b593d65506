//! Retry policy for retryable push failures.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capped exponential backoff with jitter and a bounded attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `retries` failed retries.
    pub fn should_retry(&self, retries: u32) -> bool {
        retries < self.max_retries
    }

    /// Delay before retry number `attempt` (zero-based), without jitter:
    /// `min(cap, base * 2^attempt)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay with "equal jitter": half the delay is fixed, the other half is
    /// scaled by `unit`, a sample from `[0, 1)`.
    pub fn jittered_delay(&self, attempt: u32, unit: f64) -> Duration {
        let delay = self.delay(attempt);
        let half = delay / 2;
        half + half.mul_f64(unit.clamp(0.0, 1.0))
    }
}
