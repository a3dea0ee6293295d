//! Publish seam between connections and the broker bridge.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Publish failures, split by whether trying again can help.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// Transient failure: transport error, timeout, broker overloaded.
    #[error("Publish failed (retryable): {0}")]
    Retryable(String),

    /// The broker rejected the request; retrying will not change that.
    #[error("Publish rejected: {0}")]
    Fatal(String),
}

impl PublishError {
    /// Whether the operation may succeed if repeated.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Retryable(_))
    }
}

/// Sends encoded messages to the shared topic.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one encoded message.
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError>;
}

/// Retry policy for retryable publish failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    /// Base delay; attempt `n` waits `n * backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    #[must_use]
    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

/// Publish, retrying retryable failures per `policy`.
///
/// # Errors
///
/// Returns the first fatal error, or the last retryable error once the
/// retries are used up.
pub async fn publish_with_retry<P: Publisher + ?Sized>(
    publisher: &P,
    payload: Bytes,
    policy: &RetryPolicy,
) -> Result<(), PublishError> {
    let mut attempt = 0u32;
    loop {
        match publisher.publish(payload.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < policy.retries => {
                attempt += 1;
                debug!(attempt, error = %e, "Retrying publish");
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with `error` for the first `failures` calls.
    struct Flaky {
        failures: u32,
        error: PublishError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Publisher for Flaky {
        async fn publish(&self, _payload: Bytes) -> Result<(), PublishError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    fn flaky(failures: u32, error: PublishError) -> Flaky {
        Flaky {
            failures,
            error,
            calls: AtomicU32::new(0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_recovers() {
        let publisher = flaky(2, PublishError::Retryable("503".into()));
        let policy = RetryPolicy::default();

        publish_with_retry(&publisher, Bytes::from_static(b"{}"), &policy)
            .await
            .unwrap();
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let publisher = flaky(10, PublishError::Retryable("timeout".into()));
        let policy = RetryPolicy {
            retries: 2,
            backoff: Duration::from_millis(50),
        };

        let err = publish_with_retry(&publisher, Bytes::from_static(b"{}"), &policy)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_not_retried() {
        let publisher = flaky(10, PublishError::Fatal("400 Bad Request".into()));

        let err = publish_with_retry(&publisher, Bytes::from_static(b"{}"), &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }
}
