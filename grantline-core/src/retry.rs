//! Bounded retry-with-backoff for optimistic-concurrency writes.
//!
//! Every writer of a shared object goes through [`retry_on_conflict`]. Only
//! [`LicensingError::Conflict`] is retried; any other error is returned as is.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LicensingError, LicensingResult};

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Same delay after every attempt.
    Fixed { delay_ms: u64 },

    /// Delay grows by `multiplier` per attempt, capped at `max_delay_ms`.
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 10,
            max_delay_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay after the given attempt (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let delay_ms = (*initial_delay_ms as f64) * multiplier.powi(exponent);
                let capped = delay_ms.min(*max_delay_ms as f64).max(0.0);
                Duration::from_millis(capped as u64)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping. Meant for tests and in-memory backends.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffConfig::Fixed { delay_ms: 0 },
        }
    }
}

/// Runs `op` until it succeeds, fails with something other than a conflict,
/// or the attempt budget is spent. `op` must re-read the object it writes.
pub fn retry_on_conflict<T, F>(policy: &RetryPolicy, mut op: F) -> LicensingResult<T>
where
    F: FnMut() -> LicensingResult<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(err @ LicensingError::Conflict { .. }) if attempt < max_attempts => {
                let delay = policy.backoff.delay_for_attempt(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "retrying after conflict");
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
            result => return result,
        }
    }
}
