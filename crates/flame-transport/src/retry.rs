//! Retry policy for transient transport failures
//!
//! - Budget: `max_retries` retries after the first attempt (default 2)
//! - Backoff: `initial_backoff * 2^step`, capped at `max_backoff`
//! - Jitter: down-jitter, multiplier in `[1 - jitter_factor, 1.0]`

use std::time::Duration;

use rand::Rng;

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries (not counting the first attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// 0.25 = up to 25% reduction
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            jitter_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        RetryPolicy {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Whether another retry is allowed after `retries_so_far` retries
    #[inline]
    pub fn allows_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }

    /// Total attempts including the first
    #[inline]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Backoff before retry number `step + 1` (step 0 precedes the first retry)
    pub fn backoff(&self, step: u32) -> Duration {
        self.backoff_with(step, &mut rand::thread_rng())
    }

    /// Backoff using a caller-supplied RNG, for reproducible schedules
    pub fn backoff_with<R: Rng + ?Sized>(&self, step: u32, rng: &mut R) -> Duration {
        let jitter = 1.0 - rng.gen::<f64>() * self.jitter_factor;
        self.backoff_ceiling(step).mul_f64(jitter)
    }

    /// Longest backoff `step` can produce; jitter only shortens it
    pub fn backoff_ceiling(&self, step: u32) -> Duration {
        let exp = 2.0_f64.powi(step.min(30) as i32);
        let base = self.initial_backoff.as_secs_f64() * exp;
        Duration::from_secs_f64(base.min(self.max_backoff.as_secs_f64()))
    }

    /// Upper bound on the time spent across every attempt and backoff
    /// when each attempt runs to `attempt_timeout`
    pub fn worst_case(&self, attempt_timeout: Duration) -> Duration {
        (0..self.max_retries).fold(
            attempt_timeout.saturating_mul(self.max_attempts()),
            |total, step| total.saturating_add(self.backoff_ceiling(step)),
        )
    }
}
