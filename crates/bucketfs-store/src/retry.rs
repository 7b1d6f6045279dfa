//! Retry with exponential backoff for object-store requests.
//!
//! The base sleep at least doubles on every attempt, a random jitter of up
//! to +100% is added, each individual sleep is capped at the configured
//! maximum, and the whole loop is bounded by both the attempt budget and
//! the caller's deadline. Only errors classified retryable by
//! [`StoreError::is_retryable`] are absorbed; everything else is returned
//! on first sight.

use std::future::Future;
use std::time::Duration;

use bucketfs_core::domain::StoreError;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff and budget parameters for one request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First backoff sleep.
    pub initial_delay: Duration,
    /// Cap on any individual sleep.
    pub max_sleep: Duration,
    /// Maximum attempts (including the first). 0 means bounded only by the
    /// deadline.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_sleep: Duration::from_secs(60),
            max_attempts: 0,
        }
    }
}

impl RetryPolicy {
    /// Policy from the configured knobs.
    pub fn new(max_sleep: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_sleep,
            max_attempts,
        }
    }

    /// Runs `op` until it succeeds, fails non-retryably, exhausts the
    /// attempt budget, or would sleep past `deadline`.
    ///
    /// The deadline is an upper bound across all attempts, never a
    /// per-attempt reset.
    pub async fn run<T, F, Fut>(
        &self,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut base = self.initial_delay;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            if self.max_attempts > 0 && attempt >= self.max_attempts {
                warn!(attempt, error = %error, "retry budget exhausted");
                return Err(error);
            }

            let jitter: f64 = rand::thread_rng().gen_range(1.0..2.0);
            let sleep = base.mul_f64(jitter).min(self.max_sleep);

            if let Some(deadline) = deadline {
                if Instant::now() + sleep >= deadline {
                    warn!(attempt, error = %error, "deadline reached, giving up retries");
                    return Err(error);
                }
            }

            debug!(
                attempt,
                sleep_ms = sleep.as_millis() as u64,
                error = %error,
                "transient error, backing off"
            );
            tokio::time::sleep(sleep).await;
            base = (base * 2).min(self.max_sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_without_retry() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<u32, StoreError> = policy
            .run(None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_until_success() {
        let policy = RetryPolicy::new(Duration::from_secs(60), 0);
        let calls = AtomicU32::new(0);
        let result = policy
            .run(None, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(StoreError::Network("reset".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_returned_immediately() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = policy
            .run(None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(StoreError::PreconditionFailed {
                        name: "x".into(),
                        expected: 1,
                    })
                }
            })
            .await;
        assert!(matches!(
            result,
            Err(StoreError::PreconditionFailed { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_budget_is_honored() {
        let policy = RetryPolicy::new(Duration::from_secs(60), 3);
        let calls = AtomicU32::new(0);
        let result: Result<(), StoreError> = policy
            .run(None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Network("down".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_total_retrying() {
        let policy = RetryPolicy::new(Duration::from_secs(60), 0);
        let deadline = Instant::now() + Duration::from_secs(5);
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result: Result<(), StoreError> = policy
            .run(Some(deadline), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::Server {
                    status: 503,
                    message: "unavailable".into(),
                }) }
            })
            .await;
        assert!(result.is_err());
        assert!(Instant::now() - start <= Duration::from_secs(6));
        // With a 1 s initial delay doubling each time, only a few attempts
        // fit under the 5 s deadline.
        assert!(calls.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_individual_sleep_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(2), 6);
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let _: Result<(), StoreError> = policy
            .run(None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::RateLimited("slow down".into())) }
            })
            .await;
        // 5 sleeps all capped at 2 s: total at most ~10 s.
        assert!(Instant::now() - start <= Duration::from_secs(11));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }
}
