//! Explicit retry policies handed to each stage.

use crate::config::RetryConfig;
use crate::error::{PipelineError, Result};
use std::future::Future;
use std::time::{Duration, Instant};

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retriable error, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if !e.is_retriable() {
                        return Err(e);
                    }
                    if attempt >= self.max_attempts {
                        tracing::error!("{} failed after {} attempts: {}", operation, attempt, e);
                        return Err(e);
                    }

                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        "{} attempt {} failed: {}, retrying in {}ms",
                        operation,
                        attempt,
                        e,
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

/// Run one attempt under a deadline, turning expiry into [`PipelineError::Timeout`].
pub(crate) async fn with_deadline<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout {
            operation: operation.to_string(),
            elapsed: started.elapsed(),
        }),
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.multiplier,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PipelineError::TransientStorage("503".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast(4)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::TransientNetwork("reset".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_validation_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast(5)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::validation("c1", "bad"))
            })
            .await;
        assert!(matches!(result, Err(PipelineError::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_turns_stall_into_timeout() {
        let stalled = std::future::pending::<Result<()>>();
        let err = with_deadline(Duration::from_millis(5), "export to memory://x", stalled)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { .. }));
        assert!(err.is_retriable());
        assert!(err.to_string().starts_with("export to memory://x timed out"));

        let value = with_deadline(Duration::from_secs(1), "op", async { Ok(3) }).await;
        assert_eq!(value.unwrap(), 3);
    }
}
