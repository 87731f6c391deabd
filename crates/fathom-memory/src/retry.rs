//! Exponential backoff for store writes and provider calls.
//!
//! Jitter is seeded from `SystemTime` nanos; good enough to spread retries
//! from concurrent ingestion tasks.

use fathom_types::config::RetrySettings;
use fathom_types::error::{FathomError, FathomResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        /// The successful result.
        result: T,
        /// Total attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// The error was final or attempts ran out.
    Exhausted {
        /// The error from the last attempt.
        last_error: E,
        /// Total attempts made.
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Collapse into a plain `Result`.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryOutcome::Success { result, .. } => Ok(result),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Delay before retry number `attempt` (0-indexed).
///
/// `min(min_delay * 2^attempt, max_delay) * (1 + random * jitter)`, capped at
/// `max_delay`.
pub fn compute_backoff(settings: &RetrySettings, attempt: u32) -> u64 {
    let base = settings
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(settings.max_delay_ms);
    if settings.jitter <= 0.0 {
        return capped;
    }
    let with_jitter = (capped as f64) * (1.0 + pseudo_random_fraction() * settings.jitter);
    (with_jitter as u64).min(settings.max_delay_ms)
}

fn pseudo_random_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let mixed = nanos.wrapping_mul(2654435761); // Knuth multiplicative hash
    (mixed as f64) / (u32::MAX as f64 + 1.0)
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or `max_attempts` is reached.
pub async fn retry_with<F, Fut, T, E, P>(
    settings: &RetrySettings,
    what: &str,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max = settings.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(what, attempts = attempt + 1, "Retry succeeded");
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt + 1,
                };
            }
            Err(err) => {
                let retryable = should_retry(&err);
                if !retryable || attempt + 1 >= max {
                    if retryable {
                        warn!(what, attempts = attempt + 1, error = %err, "Retries exhausted");
                    } else {
                        debug!(what, error = %err, "Error is not retryable");
                    }
                    return RetryOutcome::Exhausted {
                        last_error: err,
                        attempts: attempt + 1,
                    };
                }
                let delay_ms = compute_backoff(settings, attempt);
                debug!(what, attempt = attempt + 1, delay_ms, error = %err, "Retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// [`retry_with`] using [`FathomError::is_retryable`].
pub async fn retry_transient<F, Fut, T>(
    settings: &RetrySettings,
    what: &str,
    operation: F,
) -> FathomResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FathomResult<T>>,
{
    retry_with(settings, what, operation, FathomError::is_retryable)
        .await
        .into_result()
}
