//! Request Retry Logic
//!
//! Exponential backoff with jitter for transient model backend failures
//! (timeouts, connection errors, 5xx/429 responses). Permanent failures
//! return immediately. Backoff sleeps end early when the batch is cancelled.

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Errors that know whether another attempt could help
pub trait RetryableError: Sized {
    /// True for failures worth retrying (timeouts, transport, overload)
    fn is_transient(&self) -> bool;

    /// Error reported when cancellation is observed before an attempt
    fn cancelled() -> Self;
}

/// Retry bounds for one logical request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1)
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    /// Backoff before attempt `attempt + 1`, doubled per attempt and capped
    fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff);
        // Up to 25% jitter so parallel workers don't retry in lockstep
        let jitter_ms = (base.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        (base + Duration::from_millis(extra)).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(500), Duration::from_secs(8))
    }
}

/// Final result plus the attempt accounting for the run record
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Retry an operation with exponential backoff until it succeeds, fails
/// permanently, runs out of attempts or the batch is cancelled.
///
/// # Arguments
/// * `operation_name` - Name for logging (e.g., "photo:abc tags")
/// * `policy` - Attempt and backoff bounds
/// * `cancel` - Batch cancellation token; no attempt starts once cancelled
/// * `operation` - Async closure performing one attempt
///
/// # Returns
/// The last attempt's result together with the attempt count
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let start_time = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(E::cancelled()),
                attempts: attempt,
                elapsed: start_time.elapsed(),
            };
        }

        attempt += 1;
        if attempt > 1 {
            tracing::debug!(operation = operation_name, attempt, "Retrying request");
        }

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Request succeeded after retry"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    elapsed: start_time.elapsed(),
                };
            }
            Err(err) => {
                if !err.is_transient() || attempt >= max_attempts {
                    if err.is_transient() {
                        tracing::error!(
                            operation = operation_name,
                            attempt,
                            elapsed_ms = start_time.elapsed().as_millis() as u64,
                            error = %err,
                            "Request failed: retries exhausted"
                        );
                    } else {
                        tracing::warn!(
                            operation = operation_name,
                            attempt,
                            error = %err,
                            "Request failed permanently"
                        );
                    }
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                        elapsed: start_time.elapsed(),
                    };
                }

                let backoff = policy.backoff_for(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Transient failure, will retry after backoff"
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        return RetryOutcome {
                            result: Err(E::cancelled()),
                            attempts: attempt,
                            elapsed: start_time.elapsed(),
                        };
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}
