//! Retry with exponential backoff and cooperative cancellation.
//!
//! Classification happens before any sleep: non-retryable errors surface
//! immediately with a single attempt consumed. The shutdown token is checked
//! before each backoff sleep and also wakes the sleep itself.

use crate::error::{FetchError, FetchResult};
use oi_core::ErrorKind;
use oi_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. Default: 3.
    pub max_attempts: u32,
    /// Delay before the second attempt. Default: 1s.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Upper bound for any single delay. Default: 60s.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay after the `failed_attempt`-th failure (1-based).
    ///
    /// base * 2^(n-1), scaled by the kind's factor, capped at `max_delay`.
    pub fn delay_for(&self, failed_attempt: u32, kind: ErrorKind) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.as_secs_f64() * f64::from(1u32 << exponent);
        let scaled = raw * kind.backoff_factor();
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Run `op` until it succeeds, fails permanently, exhausts the policy, or
/// the token is cancelled.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    endpoint: &str,
    mut op: F,
) -> FetchResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = FetchResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        Metrics::request_attempt(endpoint);

        let err = match op(attempt).await {
            Ok(value) => {
                debug!(endpoint, attempt, "Request succeeded");
                return Ok(value);
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            error!(endpoint, attempt, kind = %err.kind(), error = %err, "Non-retryable failure");
            return Err(err);
        }

        if attempt >= max_attempts {
            error!(endpoint, attempts = attempt, error = %err, "Retries exhausted");
            return Err(FetchError::Exhausted {
                endpoint: endpoint.to_string(),
                attempts: attempt,
                last: Box::new(err),
            });
        }

        if shutdown.is_cancelled() {
            warn!(endpoint, attempts = attempt, "Shutdown requested, abandoning retries");
            return Err(FetchError::Cancelled {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        let kind = err.kind();
        let delay = policy.delay_for(attempt, kind);
        Metrics::retry_scheduled(kind.as_str());
        warn!(
            endpoint,
            attempt,
            max_attempts,
            kind = %kind,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Request failed, backing off"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shutdown.cancelled() => {
                warn!(endpoint, attempts = attempt, "Shutdown requested during backoff");
                return Err(FetchError::Cancelled {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_delay_schedule() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1, ErrorKind::Network), Duration::from_secs(1));
        assert_eq!(p.delay_for(2, ErrorKind::Network), Duration::from_secs(2));
        assert_eq!(p.delay_for(3, ErrorKind::Network), Duration::from_secs(4));
        assert_eq!(p.delay_for(2, ErrorKind::RateLimit), Duration::from_secs(4));
        assert_eq!(p.delay_for(2, ErrorKind::Timeout), Duration::from_secs(3));
        assert_eq!(p.delay_for(10, ErrorKind::Network), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let token = CancellationToken::new();
        let result = retry_with_backoff(&fast_policy(3), &token, "/t", |attempt| async move {
            if attempt < 3 {
                Err(FetchError::Server {
                    status: 502,
                    body: String::new(),
                })
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_reports_attempts() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = retry_with_backoff(&fast_policy(3), &token, "/t", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(FetchError::Network("reset".to_string())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_single_attempt() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = retry_with_backoff(&fast_policy(5), &token, "/t", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(FetchError::Client {
                    status: 400,
                    code: None,
                    body: "bad".to_string(),
                })
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_after_three_timeouts_reports_cancelled() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let t = token.clone();
        let err = retry_with_backoff(&fast_policy(5), &token, "/t", move |attempt| {
            c.fetch_add(1, Ordering::SeqCst);
            if attempt == 3 {
                t.cancel();
            }
            async { Err::<(), _>(FetchError::Timeout("5s".to_string())) }
        })
        .await
        .unwrap_err();

        assert!(err.is_cancelled(), "expected cancelled, got {err}");
        assert_eq!(err.attempts(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_wakes_backoff_sleep() {
        let token = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
        };
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t.cancel();
        });
        let started = std::time::Instant::now();
        let err = retry_with_backoff(&policy, &token, "/t", |_| async {
            Err::<(), _>(FetchError::Network("down".to_string()))
        })
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
