//! Retry with exponential backoff and jitter
//!
//! Used for queue receive/delete and node mutations. Only errors that report
//! [`InterruptionError::is_transient`] are retried; anything else returns on the
//! first failure. Sleeping between attempts observes the controller's
//! cancellation token, so shutdown never waits out a backoff.

use crate::error::{InterruptionError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Default attempts for a single operation (first call included)
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Backoff policy
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, first call included (minimum 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default policy with a different attempt cap
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::with_max_attempts(1)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        // 0.5x to 1.5x of the nominal delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * jitter)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation`, retrying transient failures with backoff
///
/// Returns the last error once attempts are exhausted, the first non-transient
/// error as-is, or [`InterruptionError::Cancelled`] if `cancel` fires first.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InterruptionError::Cancelled),
            outcome = operation() => outcome,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_transient() {
            return Err(err);
        }

        if attempt >= max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Operation failed after max retries"
            );
            return Err(err);
        }

        let wait = config.jittered(delay);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = wait.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(InterruptionError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }

        delay = config.next_delay(delay);
    }
}
