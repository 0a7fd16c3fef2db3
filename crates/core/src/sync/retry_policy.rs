//! Retry classification and backoff policy for queued deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy classification for API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    Retryable,
    Permanent,
    Conflict,
    ReauthRequired,
}

/// Classify HTTP status into retry behavior.
pub fn classify_http_status(status: u16) -> RetryClass {
    match status {
        409 | 412 => RetryClass::Conflict,
        401 | 403 => RetryClass::ReauthRequired,
        408 | 423 | 425 | 429 => RetryClass::Retryable,
        500..=599 => RetryClass::Retryable,
        _ => RetryClass::Permanent,
    }
}

/// Default first retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Default cap on the retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default attempt ceiling before an entry is demoted to permanent failure.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Exponential backoff with a cap and an attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempt_count` failed attempts.
    ///
    /// Doubles from `base_delay` and never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        const MAX_EXPONENT: u32 = 16;

        let exponent = attempt_count.saturating_sub(1).min(MAX_EXPONENT);
        let delay = self.base_delay.saturating_mul(1_u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Wall-clock deadline for the next attempt.
    pub fn next_retry_at(&self, attempt_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        now + delay
    }

    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}
