//! Public types for the memory service orchestrator.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::BackendHealth;
use crate::resilience::circuit_breaker::CircuitSnapshot;

/// Service lifecycle state.
///
/// Use [`super::MemoryService::state()`] to check the current state or
/// [`super::MemoryService::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    /// Constructed, no backend selected yet
    Created,
    /// Walking the fallback chain for a first healthy backend
    Initializing,
    /// Serving operations through the active backend
    Running,
    /// Releasing backend resources
    ShuttingDown,
    /// Cleaned up; `initialize()` may be called again
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Service-level operation counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceMetrics {
    /// Logical operations accepted (a failover retry is not counted twice)
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Changes of active backend, manual or automatic
    pub backend_switches: u64,
    /// Calls rejected by an open breaker plus transitions into OPEN
    pub circuit_breaker_activations: u64,
    /// Automatic promotions after a failed call
    pub failovers: u64,
    /// Wall-clock time of the last successful `initialize()`
    pub initialization_ms: Option<u64>,
}

impl ServiceMetrics {
    /// `successful / (successful + failed)`, 1.0 before any completed operation.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let completed = self.successful_operations + self.failed_operations;
        if completed == 0 {
            1.0
        } else {
            self.successful_operations as f64 / completed as f64
        }
    }
}

/// Snapshot returned by [`super::MemoryService::get_service_health()`].
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub state: ServiceState,
    pub initialized: bool,
    pub active_backend: Option<String>,
    pub fallback_chain: Vec<String>,
    /// Per-backend request tracking, with `is_healthy` refreshed by a live probe
    pub backends: Vec<BackendHealth>,
    pub circuit_breakers: Vec<CircuitSnapshot>,
    pub metrics: ServiceMetrics,
    /// Per backend and operation, ordered by backend then operation
    pub performance: Vec<OperationPerformance>,
}

impl ServiceHealth {
    /// Number of backends whose latest probe succeeded.
    #[must_use]
    pub fn healthy_backends(&self) -> usize {
        self.backends.iter().filter(|b| b.is_healthy).count()
    }

    /// Mean last response time across backends that have served a request.
    #[must_use]
    pub fn average_response_time_ms(&self) -> f64 {
        let samples: Vec<f64> = self
            .backends
            .iter()
            .filter(|b| b.total_requests > 0)
            .map(|b| b.response_time_ms)
            .collect();
        if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        }
    }
}

/// Latency samples kept per operation for the percentile estimate.
const PERFORMANCE_WINDOW: usize = 100;

/// Latency and outcome summary for one operation on one backend.
///
/// Only calls that reached the backend are counted; breaker rejections
/// are not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationPerformance {
    pub backend: String,
    pub operation: String,
    pub count: u64,
    pub successes: u64,
    pub avg_ms: f64,
    /// Over the last 100 calls
    pub p95_ms: f64,
    pub max_ms: f64,
}

impl OperationPerformance {
    /// `successes / count`, 1.0 before any call.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            1.0
        } else {
            self.successes as f64 / self.count as f64
        }
    }
}

/// Running totals behind one [`OperationPerformance`].
#[derive(Debug, Default)]
pub(super) struct OperationTracker {
    count: u64,
    successes: u64,
    total_ms: f64,
    max_ms: f64,
    recent: VecDeque<f64>,
}

impl OperationTracker {
    pub(super) fn record(&mut self, success: bool, elapsed_ms: f64) {
        self.count += 1;
        if success {
            self.successes += 1;
        }
        self.total_ms += elapsed_ms;
        self.max_ms = self.max_ms.max(elapsed_ms);
        if self.recent.len() == PERFORMANCE_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(elapsed_ms);
    }

    pub(super) fn snapshot(&self, backend: &str, operation: &str) -> OperationPerformance {
        let mut sorted: Vec<f64> = self.recent.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let p95_ms = match sorted.len() {
            0 => 0.0,
            n => sorted[(n * 95).div_ceil(100) - 1],
        };
        OperationPerformance {
            backend: backend.to_string(),
            operation: operation.to_string(),
            count: self.count,
            successes: self.successes,
            avg_ms: if self.count == 0 { 0.0 } else { self.total_ms / self.count as f64 },
            p95_ms,
            max_ms: self.max_ms,
        }
    }
}

/// Lock-free counters behind [`ServiceMetrics`].
#[derive(Debug, Default)]
pub(super) struct ServiceCounters {
    pub(super) total: AtomicU64,
    pub(super) successful: AtomicU64,
    pub(super) failed: AtomicU64,
    pub(super) switches: AtomicU64,
    pub(super) failovers: AtomicU64,
    pub(super) initialization_ms: AtomicU64,
}

impl ServiceCounters {
    pub(super) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.switches.store(0, Ordering::Relaxed);
        self.failovers.store(0, Ordering::Relaxed);
    }
}
