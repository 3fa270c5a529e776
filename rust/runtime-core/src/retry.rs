// rust/runtime-core/src/retry.rs

//! Exponential backoff with jitter.
//!
//! Used by the TCP transport to reconnect to peers that are down or
//! restarting. Peers may stay away for as long as the cluster tolerates a
//! pause, so the reconnect policy is usually unbounded and only the delay
//! is capped.

use std::time::Duration;

use rand::Rng;

use crate::config::MonitorConfig;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts; `None` retries forever.
    pub max_retries: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential backoff).
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&MonitorConfig> for RetryConfig {
    /// Reconnect policy for peer links: unbounded, starting at a tenth of
    /// the heartbeat interval and never waiting longer than one interval,
    /// so a restarted peer is reached before it could be declared lost.
    fn from(monitor: &MonitorConfig) -> Self {
        let interval = monitor.heartbeat_interval();
        Self {
            max_retries: None,
            initial_delay: (interval / 10).max(Duration::from_millis(1)),
            max_delay: interval,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Creates a retry configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter {
            capped * (1.0 + rand::rng().random_range(0.0..0.25))
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    /// Returns true if another retry is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_retries.map_or(true, |max| attempt < max)
    }
}

/// Outcome of one attempt of a retryable operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Operation succeeded.
    Ok(T),
    /// Operation failed but can be retried.
    Retry(E),
    /// Operation failed and should not be retried.
    Fail(E),
}

/// Execute an async operation with retries.
pub async fn retry_async<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = RetryResult<T, E>>,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            RetryResult::Ok(value) => return Ok(value),
            RetryResult::Fail(error) => return Err(error),
            RetryResult::Retry(error) => {
                if !config.should_retry(attempt) {
                    return Err(error);
                }
                tokio::time::sleep(config.delay_for_attempt(attempt)).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: Option<u32>) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_should_retry() {
        let config = RetryConfig::default();
        assert!(config.should_retry(0));
        assert!(config.should_retry(4));
        assert!(!config.should_retry(5));

        assert!(!RetryConfig::no_retry().should_retry(0));
        assert!(fast(None).should_retry(u32::MAX));
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped_for_unbounded_attempts() {
        let config = fast(None);
        assert_eq!(config.delay_for_attempt(1_000), Duration::from_millis(4));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_millis(4));
    }

    #[test]
    fn test_delay_with_jitter() {
        let config = RetryConfig {
            jitter: true,
            ..Default::default()
        };
        for _ in 0..20 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_from_monitor_config() {
        let monitor = MonitorConfig {
            heartbeat_interval_ms: 200,
            ..Default::default()
        };
        let config = RetryConfig::from(&monitor);
        assert!(config.max_retries.is_none());
        assert_eq!(config.initial_delay, Duration::from_millis(20));
        assert_eq!(config.max_delay, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_retry_async_eventual_success() {
        let attempts = AtomicU32::new(0);
        let result = retry_async(&fast(Some(5)), |_| {
            let count = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    RetryResult::Retry::<i32, _>("not yet")
                } else {
                    RetryResult::Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_async_fail_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result = retry_async(&fast(Some(5)), |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { RetryResult::Fail::<i32, _>("fatal") }
        })
        .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_async_exhausted() {
        let result = retry_async(&fast(Some(2)), |attempt| async move {
            RetryResult::Retry::<i32, _>(attempt)
        })
        .await;

        // Initial attempt + 2 retries; the last error carries attempt 2.
        assert_eq!(result, Err(2));
    }
}
