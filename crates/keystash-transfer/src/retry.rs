//! Retry logic with exponential backoff for remote file operations.
//!
//! Only failures the protocol adapter classified as transient are repeated;
//! everything else is returned after the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{ProtocolError, StoreError};

/// Outcome of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded.
    Success(T),
    /// Gave up: either the error was fatal or all attempts were used.
    Exhausted {
        /// The last error that occurred.
        last_error: ProtocolError,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T> RetryOutcome<T> {
    /// Converts to a `Result`, wrapping a failure with the operation name and path.
    pub fn into_result(self, operation: &'static str, path: &str) -> crate::error::Result<T> {
        match self {
            RetryOutcome::Success(value) => Ok(value),
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => Err(StoreError::Remote {
                operation,
                path: path.to_string(),
                attempts,
                source: last_error,
            }),
        }
    }
}

/// Executor for retry operations.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The policy in effect.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic.
    ///
    /// Runs the operation up to `max_attempts` times. Before retry `n` the
    /// executor sleeps `initial_backoff * backoff_multiplier^(n-1)`, capped at
    /// `max_backoff`, so the default policy waits 2s, 4s, 8s, 16s.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) => {
                    if !is_retryable(&e) || attempt >= max_attempts {
                        return RetryOutcome::Exhausted {
                            last_error: e,
                            attempts: attempt,
                        };
                    }
                    let backoff = self.compute_backoff(attempt - 1);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient remote failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Execute with retry and wrap a final failure as [`StoreError::Remote`].
    pub async fn run<F, Fut, T>(
        &self,
        operation_name: &'static str,
        path: &str,
        operation: F,
    ) -> crate::error::Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        self.execute(operation)
            .await
            .into_result(operation_name, path)
    }

    /// Compute the exponential backoff duration for a given retry index.
    ///
    /// Computes: `initial_backoff * backoff_multiplier^retry`, capped at `max_backoff`.
    fn compute_backoff(&self, retry: u32) -> Duration {
        let base_delay_ms = self.config.initial_backoff.as_millis() as f64;
        let max_delay_ms = self.config.max_backoff.as_millis() as f64;

        let computed = base_delay_ms * self.config.backoff_multiplier.powi(retry as i32);
        Duration::from_millis(computed.min(max_delay_ms) as u64)
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Check if an error is retryable.
///
/// Connection loss, server unavailability and timeouts are transient; missing
/// paths, permission problems and anything unclassified are not.
pub fn is_retryable(error: &ProtocolError) -> bool {
    error.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transient() -> ProtocolError {
        ProtocolError::new(ProtocolErrorKind::Unavailable, "421 try again later")
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&transient()));
        assert!(is_retryable(&ProtocolError::new(
            ProtocolErrorKind::ConnectionLost,
            "reset"
        )));
        assert!(!is_retryable(&ProtocolError::new(
            ProtocolErrorKind::NotFound,
            "no such file"
        )));
        assert!(!is_retryable(&ProtocolError::new(
            ProtocolErrorKind::Other,
            "550"
        )));
    }

    #[test]
    fn test_compute_backoff() {
        let executor = RetryExecutor::default();
        assert_eq!(executor.compute_backoff(0), Duration::from_secs(2));
        assert_eq!(executor.compute_backoff(1), Duration::from_secs(4));
        assert_eq!(executor.compute_backoff(2), Duration::from_secs(8));
        assert_eq!(executor.compute_backoff(3), Duration::from_secs(16));

        let capped = RetryExecutor::new(RetryConfig {
            max_backoff: Duration::from_secs(5),
            ..Default::default()
        });
        assert_eq!(capped.config().max_backoff, Duration::from_secs(5));
        assert_eq!(capped.compute_backoff(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let executor = RetryExecutor::default();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome = executor
            .execute(move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok::<_, ProtocolError>("success")
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Success("success")));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_on_fourth_attempt_with_backoff() {
        let executor = RetryExecutor::default();
        let counter = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let counter_clone = Arc::clone(&counter);
        let outcome = executor
            .execute(move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if count < 4 {
                        Err(transient())
                    } else {
                        Ok("stored")
                    }
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Success("stored")));
        assert_eq!(counter.load(Ordering::Relaxed), 4);
        // 2s + 4s + 8s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(14), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(15), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_after_max_attempts() {
        let executor = RetryExecutor::default();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome: RetryOutcome<()> = executor
            .execute(move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(transient())
                }
            })
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Exhausted {
                attempts: 5,
                ..
            }
        ));
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_retry_no_retry_on_fatal_error() {
        let executor = RetryExecutor::default();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let result: crate::error::Result<()> = executor
            .run("download", "a/b.bin", move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(ProtocolError::new(
                        ProtocolErrorKind::PermissionDenied,
                        "Permission denied",
                    ))
                }
            })
            .await;

        assert_eq!(counter.load(Ordering::Relaxed), 1);
        match result {
            Err(StoreError::Remote {
                operation,
                path,
                attempts,
                source,
            }) => {
                assert_eq!(operation, "download");
                assert_eq!(path, "a/b.bin");
                assert_eq!(attempts, 1);
                assert_eq!(source.kind, ProtocolErrorKind::PermissionDenied);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
