//! Bounded retry with timeouts for external model calls.
//!
//! Every attempt runs under `tokio::time::timeout`. Timeouts and
//! [`ProviderError::Transient`] failures are retried with exponential
//! backoff (`base × 2^attempt`, exponent capped at 5); a
//! [`ProviderError::Permanent`] failure stops immediately.

use std::future::Future;
use std::time::Duration;

use docchat_core::embedding::ProviderError;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Upper bound for a single attempt.
    pub timeout: Duration,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, timeout: Duration, base_backoff: Duration) -> Self {
        Self {
            max_retries,
            timeout,
            base_backoff,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
pub async fn with_retry<T, F, Fut>(
    service: &'static str,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut last = ProviderError::Transient("no attempt made".to_string());

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.backoff(attempt);
            tracing::warn!(
                service,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last,
                "retrying"
            );
            tokio::time::sleep(delay).await;
        }

        match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if !err.is_transient() => return Err(Error::upstream(service, &err)),
            Ok(Err(err)) => last = err,
            Err(_) => {
                last = ProviderError::Transient(format!(
                    "timed out after {}ms",
                    policy.timeout.as_millis()
                ))
            }
        }
    }

    Err(Error::upstream(service, &last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(200),
            Duration::from_millis(1),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(9), Duration::from_millis(3200));
    }

    #[tokio::test]
    async fn transient_then_success() {
        let calls = &AtomicU32::new(0);
        let out = with_retry("embedding", &fast(3), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProviderError::Transient("503".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_stops_immediately() {
        let calls = &AtomicU32::new(0);
        let err = with_retry("llm", &fast(5), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ProviderError::Permanent("401".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            Error::Upstream {
                transient: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stuck_call_times_out() {
        let policy = RetryPolicy::new(1, Duration::from_millis(20), Duration::from_millis(1));
        let err = with_retry("llm", &policy, || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), ProviderError>(())
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("timed out"));
    }
}
