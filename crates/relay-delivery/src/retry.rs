//! Retry scheduling with exponential backoff and jitter.
//!
//! Delays double per attempt from a fixed base up to a hard cap, plus a
//! small uniform jitter so simultaneous failures do not reconverge on the
//! same instant.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Base delay applied after the first failed attempt.
pub const BASE_DELAY: Duration = Duration::from_millis(5_000);

/// Upper bound on the exponential component of the delay.
pub const MAX_DELAY: Duration = Duration::from_millis(3_600_000);

/// Width of the uniform jitter window added to every delay.
pub const JITTER_WINDOW: Duration = Duration::from_millis(1_000);

/// Backoff configuration for failed delivery attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Cap on the exponential component.
    pub max_delay: Duration,
    /// Uniform jitter window, half open at the top.
    pub jitter_window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            jitter_window: JITTER_WINDOW,
        }
    }
}

/// What to do with a delivery after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt at the given instant.
    Retry {
        /// When the delivery becomes due again.
        next_attempt_at: DateTime<Utc>,
    },
    /// The attempt budget is spent; fail terminally.
    GiveUp,
}

impl RetryPolicy {
    /// Deterministic exponential component for a completed attempt number.
    ///
    /// `attempt` is 1-based: the delay after attempt 1 is `base_delay`, and
    /// each subsequent attempt doubles it until `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let unclamped = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        unclamped.min(self.max_delay)
    }

    /// Full delay for a completed attempt, jitter included.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        self.backoff_delay(attempt) + self.jitter()
    }

    /// Decides whether a delivery gets another attempt.
    ///
    /// `attempts_made` is the number of attempts already spent, including
    /// the one that just failed.
    pub fn decide(
        &self,
        attempts_made: i32,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if attempts_made >= max_attempts {
            return RetryDecision::GiveUp;
        }
        let delay = self.delay_with_jitter(attempts_made.max(1) as u32);
        let next_attempt_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
        RetryDecision::Retry { next_attempt_at }
    }

    fn jitter(&self) -> Duration {
        let window_ms = self.jitter_window.as_millis() as u64;
        if window_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(0..window_ms))
    }
}
