// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-backend circuit breaker.
//!
//! Protects the service from hammering a storage backend that is already
//! failing. Wraps async operations, tracks consecutive failures and the
//! overall failure rate, and "trips" when either crosses its threshold.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Backend unhealthy, requests fail fast without any I/O
//! - HalfOpen: Recovery window elapsed, trial requests allowed
//!
//! ```text
//!            failures ≥ threshold
//!            or failure rate ≥ limit
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │ ▲
//!     │ successes ≥                    │ │ any failure
//!     │ success_threshold   recovery   ▼ │
//!     └──────────────────── HalfOpen ◀──┘
//!                           timeout elapsed
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open)
    pub recovery_timeout: Duration,
    /// Failure percentage that trips the circuit once `failure_threshold` calls were seen
    pub failure_rate_threshold: f64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            failure_rate_threshold: 50.0,
        }
    }
}

impl CircuitConfig {
    /// Aggressive config for critical paths (trips faster, recovers cautiously)
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(120),
            failure_rate_threshold: 30.0,
        }
    }

    /// Lenient config for less critical paths (tolerates more failures)
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
            failure_rate_threshold: 80.0,
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
            failure_rate_threshold: 50.0,
        }
    }
}

/// Mutable breaker state, updated under one lock per call outcome.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u64,
    consecutive_successes: u64,
    /// Requests counted toward the failure rate since the last close
    window_requests: u64,
    window_failures: u64,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            window_requests: 0,
            window_failures: 0,
            opened_at: None,
            last_failure_at: None,
            last_success_at: None,
        }
    }

    fn clear_counters(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.window_requests = 0;
        self.window_failures = 0;
    }
}

/// Point-in-time view of a breaker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub successful_requests: u64,
    pub rejected_requests: u64,
    pub failure_rate: f64,
    pub state_changes: u64,
    pub times_opened: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    state_changes: AtomicU64,
    opens: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            state_changes: AtomicU64::new(0),
            opens: AtomicU64::new(0),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Get current circuit state.
    ///
    /// An open breaker whose recovery timeout has elapsed still reports
    /// `Open` until the next call moves it to half-open.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call issued now would be let through.
    #[must_use]
    pub fn allows_calls(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.recovery_elapsed(&inner),
        }
    }

    fn recovery_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout)
    }

    /// Execute an async operation through the circuit breaker
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation.
    /// The closure is never invoked when the call is rejected.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| true).await
    }

    /// Like [`call`](Self::call), but only errors for which `is_failure`
    /// returns true are counted against the backend. Other errors pass
    /// through without touching the state machine.
    pub async fn call_classified<F, Fut, T, E, C>(
        &self,
        f: F,
        is_failure: C,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        if !self.admit() {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
            crate::metrics::record_circuit_breaker_call(&self.name, "rejected");
            return Err(CircuitError::Rejected);
        }

        match f().await {
            Ok(result) => {
                self.record_success();
                debug!(circuit = %self.name, "Circuit call succeeded");
                crate::metrics::record_circuit_breaker_call(&self.name, "success");
                Ok(result)
            }
            Err(e) => {
                if is_failure(&e) {
                    self.record_failure();
                    debug!(circuit = %self.name, "Circuit call failed");
                    crate::metrics::record_circuit_breaker_call(&self.name, "failure");
                } else {
                    debug!(circuit = %self.name, "Circuit call returned a non-backend error");
                    crate::metrics::record_circuit_breaker_call(&self.name, "ignored");
                }
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Admission check. Moves Open → HalfOpen once the recovery timeout elapsed.
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.recovery_elapsed(&inner) {
                    inner.consecutive_successes = 0;
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful guarded call.
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.consecutive_successes += 1;
        inner.consecutive_failures = 0;
        inner.window_requests += 1;
        inner.last_success_at = Some(Utc::now());

        if inner.state == CircuitState::HalfOpen
            && inner.consecutive_successes >= u64::from(self.config.success_threshold)
        {
            inner.clear_counters();
            inner.opened_at = None;
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    /// Record a failed guarded call.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.window_requests += 1;
        inner.window_failures += 1;
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                // Trial failed: straight back to open with a fresh timer
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed if self.should_trip(&inner) => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn should_trip(&self, inner: &BreakerInner) -> bool {
        let threshold = u64::from(self.config.failure_threshold);
        if inner.consecutive_failures >= threshold {
            return true;
        }
        if inner.window_requests >= threshold && inner.window_requests > 0 {
            let rate = inner.window_failures as f64 / inner.window_requests as f64 * 100.0;
            return rate >= self.config.failure_rate_threshold;
        }
        false
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        self.state_changes.fetch_add(1, Ordering::Relaxed);
        if to == CircuitState::Open {
            self.opens.fetch_add(1, Ordering::Relaxed);
            warn!(circuit = %self.name, from = %from, "Circuit breaker opened");
        } else {
            info!(circuit = %self.name, from = %from, to = %to, "Circuit breaker state changed");
        }
        crate::metrics::set_circuit_state(&self.name, to as u8);
    }

    /// Manual override: close the breaker and clear failure counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.clear_counters();
        inner.opened_at = None;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Manual override: open the breaker now (recovery timer starts now).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.opened_at = Some(Instant::now());
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Get total number of calls (including rejected ones)
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Number of transitions into the open state
    #[must_use]
    pub fn times_opened(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Get failure rate over executed calls (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let executed = self.successes() + self.failures();
        if executed == 0 {
            return 0.0;
        }
        self.failures() as f64 / executed as f64
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_requests: self.calls_total(),
            failed_requests: self.failures(),
            successful_requests: self.successes(),
            rejected_requests: self.rejections(),
            failure_rate: self.failure_rate(),
            state_changes: self.state_changes.load(Ordering::Relaxed),
            times_opened: self.times_opened(),
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
        }
    }

    /// Reset all metrics
    pub fn reset_metrics(&self) {
        self.calls_total.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
        self.state_changes.store(0, Ordering::Relaxed);
        self.opens.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
