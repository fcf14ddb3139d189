//! Exponential backoff with bounded jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy applied by the dispatcher to transient failures.
///
/// Delay before attempt `n+1` is `min(cap, base * 2^(n-1)) * (1 ± jitter)`.
/// Permanent failures are never retried regardless of this policy.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempt budget including the first try.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    #[serde(with = "super::duration_ms")]
    pub base_delay: Duration,
    /// Upper bound on the exponential component.
    #[serde(with = "super::duration_ms")]
    pub cap: Duration,
    /// Jitter bound as a fraction of the delay, in [0, 1).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after failed attempt number `attempt` (1-based).
    ///
    /// Jitter is sampled uniformly from `[-jitter, +jitter]` around the
    /// capped exponential delay.
    #[must_use]
    pub fn delay_after(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(20));
        let capped = exp.min(self.cap);
        let jitter = self.jitter.clamp(0.0, 0.99);
        let factor = if jitter > 0.0 {
            1.0 + rng.random_range(-jitter..=jitter)
        } else {
            1.0
        };
        capped.mul_f64(factor)
    }

    /// Bounds of the possible delay after `attempt`, for assertions.
    #[must_use]
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(20));
        let capped = exp.min(self.cap);
        let jitter = self.jitter.clamp(0.0, 0.99);
        (capped.mul_f64(1.0 - jitter), capped.mul_f64(1.0 + jitter))
    }
}
