//! Bounded exponential backoff and per-call deadlines

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Result, TransferError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: u32,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after `attempt` (1-based) failed, or `None` once the
    /// ceiling is reached.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let factor = self
            .multiplier
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let delay = self
            .initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff);

        Some(delay.min(self.max_backoff))
    }

    /// Run `op` until it succeeds, fails non-transiently, or the attempt
    /// ceiling is reached. Each attempt is bounded by `deadline`.
    pub async fn run<T, F, Fut>(&self, operation: &str, deadline: Duration, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match with_deadline(deadline, op()).await {
                Err(err) if err.is_transient() => match self.delay_after(attempt) {
                    Some(delay) => {
                        warn!(
                            operation,
                            attempt,
                            max_attempts = self.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    },
                    None => return Err(exhausted(attempt, err)),
                },
                other => return other,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

/// Bound a single adapter call. Expiry is reported as a transient failure.
pub async fn with_deadline<T, Fut>(deadline: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::DeadlineExceeded(deadline)),
    }
}

pub(crate) fn exhausted(attempts: u32, last: TransferError) -> TransferError {
    TransferError::RetriesExhausted {
        attempts,
        last: Box::new(last),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_after(4), Some(Duration::from_millis(800)));
        assert_eq!(policy.delay_after(5), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.delay_after(9), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.delay_after(10), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy(3)
            .run("head", Duration::from_secs(1), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransferError::transient("503"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_at_ceiling() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = policy(2)
            .run("head", Duration::from_secs(1), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TransferError::SourceUnreachable("refused".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = policy(5)
            .run("head", Duration::from_secs(1), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TransferError::SourceAuthFailed("401".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::SourceAuthFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_is_transient() {
        let err = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, TransferError::DeadlineExceeded(_)));
        assert!(err.is_transient());
    }
}
