use crate::config::{parse_opt_var, parse_var, ConfigError};
use crate::storage::StorageError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff policy for remote-store calls.
///
/// The first retry happens immediately, every later one waits `step` longer
/// than the previous, up to `max_delay`. Without a deadline the policy never
/// gives up on a transient error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub step: Duration,
    pub max_delay: Duration,
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            step: Duration::from_secs(parse_var("S3_RETRY_STEP_SECS", 10)?),
            max_delay: Duration::from_secs(parse_var("S3_RETRY_MAX_DELAY_SECS", 60)?),
            deadline: parse_opt_var("S3_RETRY_DEADLINE_SECS")?.map(Duration::from_secs),
        })
    }

    /// Delay slept after the `failures`-th consecutive transient failure.
    pub fn delay_after(&self, failures: u32) -> Duration {
        self.step
            .saturating_mul(failures.saturating_sub(1))
            .min(self.max_delay)
    }
}

/// Retries remote-store operations on transient errors.
///
/// Non-transient errors are returned immediately. The loop can be abandoned
/// through the cancellation token or the policy deadline.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Backoff {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn run<T, F, Fut>(&self, op: &str, mut operation: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let started = Instant::now();
        let mut failures = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let error = match operation().await {
                Ok(value) => {
                    if failures > 0 {
                        debug!(op, failures, "storage call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            failures += 1;
            let delay = self.policy.delay_after(failures);

            if let Some(deadline) = self.policy.deadline {
                if started.elapsed() + delay >= deadline {
                    warn!(op, failures, error = %error, "retry deadline reached, giving up");
                    return Err(StorageError::DeadlineExceeded(deadline));
                }
            }

            warn!(
                op,
                attempt = failures,
                delay_secs = delay.as_secs(),
                error = %error,
                "transient storage failure, retrying"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transient() -> StorageError {
        StorageError::Transient("connection refused".to_string())
    }

    #[test]
    fn test_delay_ladder_is_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=9).map(|n| policy.delay_after(n).as_secs()).collect();
        assert_eq!(delays, vec![0, 10, 20, 30, 40, 50, 60, 60, 60]);
    }

    #[test]
    fn test_from_env_rejects_unparsable_deadline() {
        std::env::set_var("S3_RETRY_DEADLINE_SECS", "soon");
        let result = RetryPolicy::from_env();
        std::env::remove_var("S3_RETRY_DEADLINE_SECS");

        assert!(matches!(
            result,
            Err(ConfigError::Invalid { name: "S3_RETRY_DEADLINE_SECS", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let backoff = Backoff::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let started = Instant::now();

        let result = backoff
            .run("head_object", || {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst);
                    if count < 9 {
                        Err(transient())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 10);
        // 0 + 10 + 20 + 30 + 40 + 50 + 60 + 60 + 60
        assert_eq!(started.elapsed(), Duration::from_secs(330));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_error_is_not_retried() {
        let backoff = Backoff::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result: Result<(), _> = backoff
            .run("get_object", || {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(StorageError::NotFound("missing.jpg".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retrying() {
        let policy = RetryPolicy {
            deadline: Some(Duration::from_secs(25)),
            ..RetryPolicy::default()
        };
        let backoff = Backoff::new(policy, CancellationToken::new());

        let result: Result<(), _> = backoff.run("head_bucket", || async { Err(transient()) }).await;

        assert!(matches!(
            result,
            Err(StorageError::DeadlineExceeded(d)) if d == Duration::from_secs(25)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let backoff = Backoff::new(RetryPolicy::default(), cancel.clone());
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let canceller = tokio::spawn(async move {
            sleep(Duration::from_secs(15)).await;
            cancel.cancel();
        });

        let result: Result<(), _> = backoff
            .run("put_object", || {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;

        canceller.await.unwrap();
        assert!(matches!(result, Err(StorageError::Cancelled)));
        // Attempts at t=0, t=0 and t=10, then cancelled while waiting 20s
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
