//! Poll loop for asynchronous upstream jobs.
//!
//! After a submission has been accepted, the status endpoint is polled at an
//! increasing interval until it reports success, reports failure, or the
//! overall timeout elapses. Each individual poll goes through the retry
//! engine; the submission itself is never repeated from here. The overall
//! timeout is reported as exhausted, so an enclosing retry loop gives up too
//! instead of starting another submission.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TorchConfig;
use crate::error::PipelineError;

use super::retry::{with_retry, RetryPolicy};

/// Result of one status poll
#[derive(Debug)]
pub enum PollStatus<T> {
    /// Not finished yet; poll again later
    Pending,

    /// Finished with a result
    Done(T),

    /// The upstream job reported a terminal failure
    Failed(PipelineError),
}

/// Interval growth and per-poll retry settings
#[derive(Debug, Clone)]
pub struct PollSchedule {
    pub initial: Duration,
    pub max: Duration,
    pub retry: RetryPolicy,
}

impl PollSchedule {
    pub fn new(initial: Duration, max: Duration, retry: RetryPolicy) -> Self {
        Self {
            initial,
            max: max.max(initial),
            retry,
        }
    }

    pub fn from_torch(config: &TorchConfig, retry: RetryPolicy) -> Self {
        Self::new(
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_millis(config.max_poll_interval_ms),
            retry,
        )
    }

    /// Interval following `current`: doubled, capped at `max`
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// Poll `poll_fn` until it is done, failed, cancelled or `timeout` elapses
pub async fn poll_until<T, F, Fut>(
    cancel: &CancellationToken,
    schedule: &PollSchedule,
    timeout: Duration,
    operation: &str,
    mut poll_fn: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<PollStatus<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut interval = schedule.initial;
    let mut polls = 0u32;

    loop {
        polls += 1;
        let polled = tokio::select! {
            biased;
            result = with_retry(&schedule.retry, cancel, |_| poll_fn()) => result,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(PipelineError::timeout(operation, timeout).exhausted());
            }
        };

        match polled.map_err(|e| e.into_pipeline_error(operation))?.value {
            PollStatus::Done(value) => {
                debug!(operation, polls, "Poll finished");
                return Ok(value);
            }
            PollStatus::Failed(err) => return Err(err),
            PollStatus::Pending => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PipelineError::timeout(operation, timeout).exhausted());
        }
        let wait = interval.min(deadline - now);
        debug!(operation, polls, wait_ms = wait.as_millis() as u64, "Still pending");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::cancelled(operation)),
            _ = tokio::time::sleep(wait) => {}
        }
        interval = schedule.next(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::error::ErrorCategory;

    fn schedule() -> PollSchedule {
        PollSchedule::new(
            Duration::from_millis(1000),
            Duration::from_millis(4000),
            RetryPolicy::new(3, 100, 1000),
        )
    }

    #[test]
    fn test_interval_doubles_up_to_max() {
        let s = schedule();
        assert_eq!(s.next(Duration::from_millis(1000)), Duration::from_millis(2000));
        assert_eq!(s.next(Duration::from_millis(2000)), Duration::from_millis(4000));
        assert_eq!(s.next(Duration::from_millis(4000)), Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_done() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let value = poll_until(&cancel, &schedule(), Duration::from_secs(600), "extraction", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Ok(PollStatus::Pending)
                } else {
                    Ok(PollStatus::Done("manifest"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "manifest");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1000 + 2000 + 4000
        assert!(start.elapsed() >= Duration::from_millis(7000));
        assert!(start.elapsed() < Duration::from_millis(8000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_poll_failure_is_retried() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let value = poll_until(&cancel, &schedule(), Duration::from_secs(600), "extraction", || {
            let calls = calls.clone();
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(PipelineError::service_status("TORCH", 503, "").into()),
                    _ => Ok(PollStatus::Done(7)),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_failure_stops_polling() {
        let cancel = CancellationToken::new();

        let err = poll_until(&cancel, &schedule(), Duration::from_secs(600), "extraction", || async {
            Ok::<PollStatus<()>, anyhow::Error>(PollStatus::Failed(PipelineError::service_status(
                "TORCH", 422, "bad CRTDL",
            )))
        })
        .await
        .unwrap_err();

        assert_eq!(err.category, ErrorCategory::Service);
        assert!(!err.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_timeout() {
        let cancel = CancellationToken::new();

        let err = poll_until(&cancel, &schedule(), Duration::from_secs(10), "extraction", || async {
            Ok::<PollStatus<()>, anyhow::Error>(PollStatus::Pending)
        })
        .await
        .unwrap_err();

        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.retries_exhausted);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried_by_an_enclosing_loop() {
        let cancel = CancellationToken::new();
        let submissions = Arc::new(AtomicU32::new(0));
        let outer = RetryPolicy::new(3, 100, 1000);

        let err = with_retry(&outer, &cancel, |_| {
            let submissions = submissions.clone();
            let cancel = cancel.clone();
            async move {
                submissions.fetch_add(1, Ordering::SeqCst);
                let value = poll_until(&cancel, &schedule(), Duration::from_secs(1), "extraction", || async {
                    Ok::<PollStatus<()>, anyhow::Error>(PollStatus::Pending)
                })
                .await?;
                Ok::<_, anyhow::Error>(value)
            }
        })
        .await
        .unwrap_err();

        assert_eq!(submissions.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), 1);
        let err = err.into_pipeline_error("extraction");
        assert!(err.retries_exhausted);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_while_waiting() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let err = poll_until(&cancel, &schedule(), Duration::from_secs(600), "extraction", || async {
            Ok::<PollStatus<()>, anyhow::Error>(PollStatus::Pending)
        })
        .await
        .unwrap_err();

        assert!(err.cancelled);
    }
}
