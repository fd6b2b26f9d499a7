//! Retry utilities with exponential backoff and jitter.
//!
//! Writes against a shared MeshRootCertificate race with every other component
//! that owns a use case, so optimistic-concurrency conflicts are routine. The
//! helpers here retry a fallible async operation while a caller-supplied
//! predicate classifies the error as transient.
//!
//! # Example
//!
//! ```ignore
//! use meshroot::retry::{retry_on_conflict, RetryConfig};
//!
//! let mrc = retry_on_conflict(&RetryConfig::default(), "update_status", || async {
//!     let mut mrc = client.get_mesh_root_certificate(&name).await?;
//!     mrc.status.state = MrcState::Active;
//!     client.update_mesh_root_certificate_status(mrc).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::errors::Error;

/// Configuration for retry behavior on transient errors.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub initial_backoff: Duration,
    /// Cap for exponential growth
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 for doubling)
    pub backoff_multiplier: f64,
    /// Fraction of the backoff randomized in both directions (0.0 disables jitter)
    pub jitter: f64,
}

impl Default for RetryConfig {
    /// Short, bounded backoff suited to conflict retries against a resource store.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Retry config for calls against remote certificate providers.
    pub fn for_provider() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self { max_attempts: attempts.max(1), ..Default::default() }
    }

    /// Calculate the backoff duration for a given attempt number (0-indexed), without jitter.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let multiplier = self.backoff_multiplier.powi(attempt as i32 - 1);
        let backoff_ms = self.initial_backoff.as_millis() as f64 * multiplier;
        let capped_ms = backoff_ms.min(self.max_backoff.as_millis() as f64);

        Duration::from_millis(capped_ms as u64)
    }

    fn jittered(&self, backoff: Duration) -> Duration {
        if self.jitter <= 0.0 || backoff.is_zero() {
            return backoff;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..(1.0 + self.jitter));
        Duration::from_secs_f64(backoff.as_secs_f64() * factor)
    }
}

/// Execute `operation` until it succeeds, `should_retry` rejects its error, or the
/// attempts are exhausted. The last error is returned unchanged.
pub async fn retry_when<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;

                if !should_retry(&e) {
                    return Err(e);
                }

                if attempt >= max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let backoff = config.jittered(config.backoff_for_attempt(attempt));
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Retry `operation` while it fails with an optimistic-concurrency conflict.
///
/// The operation must re-read the resource it writes on every attempt; a
/// conflict means the copy it held is out of date.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_when(config, operation_name, Error::is_conflict, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_for_attempt() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(config.backoff_for_attempt(0), Duration::ZERO);
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(300));
        assert_eq!(config.backoff_for_attempt(9), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_conflict_is_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_on_conflict(&fast(), "test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::conflict("MeshRootCertificate", "mrc"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_conflict_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), Error> = retry_on_conflict(&fast(), "test", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::not_found("MeshRootCertificate", "mrc"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), Error> = retry_on_conflict(&fast(), "test", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::conflict("MeshRootCertificate", "mrc"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
