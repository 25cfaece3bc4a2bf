//! Bounded retry of transient cluster failures
//!
//! Every client operation goes through [`retry_transient`]. Only
//! [`ClusterError::Unreachable`] is retried; everything else is returned on
//! the first attempt.

use crate::backoff::ExponentialBackoff;
use crate::error::ClusterError;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Retry settings for transient API failures
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    #[must_use]
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Run `operation`, retrying `Unreachable` with exponential backoff
///
/// Returns the last error once `max_attempts` is exhausted.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, ClusterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClusterError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut backoff = ExponentialBackoff::new(config.initial_delay, config.max_delay);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = backoff.next_backoff();
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Cluster operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_transient() {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Cluster operation failed after max retries"
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry_transient(&fast(3), "get", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClusterError::Unreachable("connection refused".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = retry_transient(&fast(2), "get", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ClusterError::Unreachable("timeout".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ClusterError::Unreachable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_does_not_retry_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = retry_transient(&fast(5), "apply", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ClusterError::Conflict("exists".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ClusterError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
