//! Retry helpers with exponential backoff
//!
//! Used for FX lookups, finalize jobs and every ledger write. Ledger writes
//! go through [`retry_locked`], which only retries when the target document
//! is locked by another writer; all other errors propagate immediately.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::ledger::{LedgerError, LedgerResult};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
    /// Multiplier applied to the backoff after every failed attempt
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Lock contention on ledger documents: 12 retries plus a final attempt,
    /// starting at 2s and growing by 1.5x up to 15s.
    pub fn document_lock() -> Self {
        Self {
            max_attempts: 13,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(15),
            backoff_factor: 1.5,
        }
    }

    /// FX provider lookups: 3 attempts, doubling from 500ms
    pub fn fx_lookup() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        std::cmp::min(current.mul_f64(self.backoff_factor), self.max_backoff)
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// Every error is treated as retryable. Returns the last error once
/// `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_when(operation, |_| true, config, context).await
}

/// Retry only while `should_retry` accepts the error
pub async fn retry_when<F, Fut, T, E, P>(
    operation: F,
    should_retry: P,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }

                if attempt >= config.max_attempts {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                sleep(backoff).await;
                backoff = config.next_backoff(backoff);
            }
        }
    }
}

/// Run a ledger write, retrying only on `LedgerError::Locked`
pub async fn retry_locked<F, Fut, T>(operation: F, context: &str) -> LedgerResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    retry_when(
        operation,
        LedgerError::is_locked,
        &RetryConfig::document_lock(),
        context,
    )
    .await
}
