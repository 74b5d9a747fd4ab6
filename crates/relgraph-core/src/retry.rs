//! Bounded retry with exponential backoff for external dependencies
//!
//! Each attempt runs under a timeout; elapsed attempts surface as [`Error::Timeout`].
//! Only errors for which [`Error::is_retryable`] holds are retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Retry limits for one dependency call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

/// Delay before attempt `attempt + 1` (1-based), with up to 10% jitter
pub fn calculate_backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay.as_millis() as u64;
    let exp = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(policy.max_delay.as_millis() as u64);

    let jitter = capped / 10;
    let extra = if jitter > 0 {
        rand::thread_rng().gen_range(0..jitter)
    } else {
        0
    };
    Duration::from_millis(capped + extra)
}

/// Run `op` until it succeeds, fails permanently, or attempts run out
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    dependency: &str,
    timeout: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(dependency.to_string(), timeout.as_millis() as u64)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let backoff = calculate_backoff(policy, attempt);
                warn!(
                    dependency = dependency,
                    attempt = attempt,
                    wait_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Dependency call failed, retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn test_calculate_backoff() {
        let p = policy();
        let first = calculate_backoff(&p, 1).as_millis();
        assert!((100..110).contains(&first));

        let second = calculate_backoff(&p, 2).as_millis();
        assert!((200..220).contains(&second));

        let capped = calculate_backoff(&p, 10).as_millis();
        assert!((1_000..1_100).contains(&capped));
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            max_attempts: 0,
            base_delay_ms: 50,
            max_delay_ms: 10,
        };
        let p = RetryPolicy::from(&config);
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.max_delay, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = retry_with_backoff(&policy(), "oracle", Duration::from_secs(5), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transient("oracle", "503"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<()> =
            retry_with_backoff(&policy(), "vector_index", Duration::from_secs(5), || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::transient("vector_index", "connection reset"))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::TransientDependency { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<()> = retry_with_backoff(&policy(), "oracle", Duration::from_secs(5), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::Validation("bad request".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<u32> =
            retry_with_backoff(&policy(), "vector_index", Duration::from_millis(50), || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Ok(1)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
