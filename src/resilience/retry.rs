// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Used below the circuit breaker for transient failures inside a single
//! backend call (opening the SQLite file, HTTP requests to the remote
//! store). The breaker only sees the final outcome.
//!
//! # Example
//!
//! ```
//! use memory_service::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//!
//! // Query: quick retry, then fail
//! let query = RetryConfig::query();
//! assert_eq!(query.max_attempts, 3);
//!
//! // Derived from backend settings
//! let remote = RetryConfig::linear(3, Duration::from_millis(500));
//! assert_eq!(remote.factor, 1.0);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for opening connections
/// - [`RetryConfig::query()`] - Quick retry for individual operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Fast-fail retry for opening a backend.
    /// Attempts 5 times with exponential backoff, failing after ~3 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    /// 3 attempts with fast backoff - if it fails, let caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Constant delay between a fixed number of attempts.
    #[must_use]
    pub fn linear(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: delay,
            max_delay: delay,
            factor: 1.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Retry after the configured backoff
    Retry,
    /// Retry after a server-provided delay (e.g. `Retry-After`)
    RetryAfter(Duration),
    /// Permanent failure, give up now
    Stop,
}

/// Retry every error until attempts run out.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with(operation_name, config, |_| RetryHint::Retry, operation).await
}

/// Retry with per-error classification.
pub async fn retry_with<F, Fut, T, E, C>(
    operation_name: &str,
    config: &RetryConfig,
    classify: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    C: Fn(&E) -> RetryHint,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                let wait = match classify(&err) {
                    RetryHint::Stop => return Err(err),
                    RetryHint::Retry => delay,
                    RetryHint::RetryAfter(after) => after,
                };
                if attempts >= max_attempts {
                    return Err(err);
                }

                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, max_attempts, err, wait
                );

                sleep(wait).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn flaky(fail_first: usize, calls: &AtomicUsize) -> Result<u32, MemoryError> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < fail_first {
            Err(MemoryError::backend("sqlite", "connect", format!("locked ({n})")))
        } else {
            Ok(7)
        }
    }

    #[tokio::test]
    async fn test_first_try_does_not_sleep() {
        let calls = &AtomicUsize::new(0);
        let result = retry("open", &RetryConfig::linear(3, Duration::from_secs(60)), || async move {
            flaky(0, calls)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let calls = &AtomicUsize::new(0);
        let result = retry("open", &RetryConfig::test(), || async move { flaky(2, calls) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error_when_exhausted() {
        let calls = &AtomicUsize::new(0);
        let err = retry("open", &RetryConfig::test(), || async move { flaky(10, calls) })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("locked (2)"));
    }

    #[tokio::test]
    async fn test_stop_hint_gives_up_immediately() {
        let calls = &AtomicUsize::new(0);
        let result = retry_with(
            "remote_add",
            &RetryConfig::test(),
            |e: &MemoryError| {
                if matches!(e, MemoryError::Configuration(_)) { RetryHint::Stop } else { RetryHint::Retry }
            },
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MemoryError::Configuration("bad api key".into()))
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_overrides_backoff() {
        let calls = &AtomicUsize::new(0);
        let started = tokio::time::Instant::now();
        let result = retry_with(
            "remote_search",
            &RetryConfig::linear(2, Duration::from_secs(30)),
            |_| RetryHint::RetryAfter(Duration::from_secs(2)),
            || async move { flaky(1, calls) },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_presets_and_floor() {
        assert_eq!(RetryConfig::startup().max_attempts, 5);
        assert_eq!(RetryConfig::default().max_attempts, 3);
        assert_eq!(RetryConfig::linear(0, Duration::from_millis(1)).max_attempts, 1);
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        let config = RetryConfig::startup();
        let second = config.next_delay(config.initial_delay);
        assert_eq!(second, Duration::from_millis(400));
        let capped = (0..10).fold(second, |d, _| config.next_delay(d));
        assert_eq!(capped, config.max_delay);

        let flat = RetryConfig::linear(3, Duration::from_millis(250));
        assert_eq!(flat.next_delay(flat.initial_delay), Duration::from_millis(250));
    }
}
