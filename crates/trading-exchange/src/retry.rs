//! Retry with jittered exponential back-off.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use trading_core::error::ExchangeError;

/// Back-off settings for retried calls and reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; 0 means unlimited
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random spread applied to each delay, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether another attempt is allowed after `attempts` have run.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `retry` with jitter applied.
    pub fn delay(&self, retry: u32) -> Duration {
        let backoff = self.backoff(retry);
        if self.jitter <= 0.0 {
            return backoff;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        backoff.mul_f64(factor)
    }

    /// Delay after `error`; a server-supplied retry-after wins.
    pub fn delay_for(&self, retry: u32, error: &ExchangeError) -> Duration {
        match error.retry_after_ms() {
            Some(ms) => Duration::from_millis(ms),
            None => self.delay(retry),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && policy.allows(attempts) => {
                let delay = policy.delay_for(attempts - 1, &e);
                warn!(
                    operation,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 0.0)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(0, Duration::from_millis(100), Duration::from_secs(1), 0.0);
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(60), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1000), Duration::from_secs(10), 0.25);
        for _ in 0..100 {
            let delay = policy.delay(0);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_retry_after_overrides() {
        let policy = fast();
        let limited = ExchangeError::RateLimited { retry_after_ms: 750 };
        assert_eq!(policy.delay_for(0, &limited), Duration::from_millis(750));
        assert_eq!(
            policy.delay_for(1, &ExchangeError::Timeout("slow".into())),
            Duration::from_millis(2)
        );
    }

    #[test]
    fn test_attempt_limits() {
        assert!(fast().allows(2));
        assert!(!fast().allows(3));
        assert!(!RetryPolicy::none().allows(1));
        assert!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 0.0).allows(1_000));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast(), "test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(ExchangeError::Connection("reset".into()))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&fast(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ExchangeError::Api {
                status: 503,
                message: "unavailable".into(),
            })
        })
        .await;

        assert!(matches!(result, Err(ExchangeError::Api { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&fast(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ExchangeError::Authentication("bad key".into()))
        })
        .await;

        assert!(matches!(result, Err(ExchangeError::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
