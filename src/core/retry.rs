//! Bounded exponential backoff around fallible async operations.
//!
//! Attempt 1 runs immediately. A failed attempt is classified; non-retryable
//! errors return at once, retryable ones sleep for
//! `min(initial_backoff × 2^(attempt-1), max_backoff)` and try again until
//! `max_attempts` is reached. Cancellation is observed both while the
//! operation runs and while sleeping.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{classify, PipelineError};

/// Retry policy for step bodies and service calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound for any single delay, in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    30000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Delay to wait after the given failed attempt (1-indexed)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Check if another attempt is allowed after `attempt` attempts
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_attempts == 0 {
            return Err(PipelineError::invalid_config(
                "retry.max_attempts must be at least 1",
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(PipelineError::invalid_config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }
        Ok(())
    }
}

/// Successful outcome of a retried operation
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,

    /// Attempts used, including the successful one
    pub attempts: u32,
}

impl<T> Retried<T> {
    /// Number of retries (attempts beyond the first)
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Why a retried operation gave up
#[derive(Debug, Error)]
pub enum RetryError {
    /// Cancellation was requested before the operation could finish
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    /// Every attempt failed with a retryable error
    #[error("retries exhausted after {attempts} attempt(s): {source}")]
    Exhausted { attempts: u32, source: PipelineError },

    /// The failure was not retryable
    #[error("{source}")]
    Permanent { attempts: u32, source: PipelineError },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Cancelled { attempts }
            | Self::Exhausted { attempts, .. }
            | Self::Permanent { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Collapse into the classified error to report
    pub fn into_pipeline_error(self, operation: &str) -> PipelineError {
        match self {
            Self::Cancelled { .. } => PipelineError::cancelled(operation),
            Self::Exhausted { source, .. } | Self::Permanent { source, .. } => source,
        }
    }
}

/// Run `op` under `policy`, retrying classified transient failures.
///
/// `op` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: F,
) -> Result<Retried<T>, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    with_retry_observed(policy, cancel, op, |_, _, _| {}).await
}

/// Like [`with_retry`], calling `on_retry(attempt, error, delay)` before each backoff sleep
pub async fn with_retry_observed<T, F, Fut, O>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
    mut on_retry: O,
) -> Result<Retried<T>, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    O: FnMut(u32, &PipelineError, Duration),
{
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            result = op(attempt) => result,
        };

        let err = match outcome {
            Ok(value) => {
                debug!(attempt, "Operation succeeded");
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(err) => classify(err),
        };

        if err.cancelled {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        // Exhausted by a nested retry loop already
        if err.retries_exhausted {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: err,
            });
        }
        if !err.retryable {
            return Err(RetryError::Permanent {
                attempts: attempt,
                source: err,
            });
        }
        if !policy.should_retry(attempt) {
            warn!(attempt, error = %err, "Retries exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: err.exhausted(),
            });
        }

        let delay = policy.backoff_for(attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
        on_retry(attempt, &err, delay);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
