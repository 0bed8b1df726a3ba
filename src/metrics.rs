// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the memory service.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `memory_service_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: sqlite, document, memory, remote
//! - `operation`: add_memory, search_memories, get_memory_stats, ...
//! - `status`: success, error, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a backend operation outcome
pub fn record_operation(backend: &str, operation: &str, status: &str) {
    counter!(
        "memory_service_operations_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(backend: &str, operation: &str, duration: Duration) {
    histogram!(
        "memory_service_operation_seconds",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "memory_service_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record entries evicted from the in-process backend
pub fn record_backend_evictions(backend: &str, count: usize) {
    counter!(
        "memory_service_backend_evictions_total",
        "backend" => backend.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with category for alerting
pub fn record_error(backend: &str, operation: &str, error_type: &str) {
    counter!(
        "memory_service_errors_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record an operation that exceeded its deadline
pub fn record_timeout(operation: &str) {
    counter!(
        "memory_service_timeouts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKERS & FAILOVER
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "memory_service_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record circuit breaker state change (0 = closed, 1 = half_open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "memory_service_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record a change of active backend
pub fn record_backend_switch(from: &str, to: &str, reason: &str) {
    counter!(
        "memory_service_backend_switches_total",
        "from" => from.to_string(),
        "to" => to.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// OPTIMIZER - Limiter, cache, batching, tuning
// ═══════════════════════════════════════════════════════════════════════════

/// Record result cache lookup (hit or miss)
pub fn record_cache_lookup(hit: bool) {
    counter!(
        "memory_service_cache_lookups_total",
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Set current result cache size
pub fn set_cache_entries(entries: usize) {
    gauge!("memory_service_cache_entries").set(entries as f64);
}

/// Record entries removed by the cache sweep
pub fn record_cache_expired(count: usize) {
    counter!("memory_service_cache_expired_total").increment(count as u64);
}

/// Set the concurrency limit currently in force
pub fn set_concurrency_limit(limit: usize) {
    gauge!("memory_service_concurrency_limit").set(limit as f64);
}

/// Record the size of a bulk batch
pub fn record_batch_size(count: usize) {
    histogram!("memory_service_batch_size").record(count as f64);
}

/// Record an auto-tuning adjustment
pub fn record_tuning_adjustment(parameter: &str) {
    counter!(
        "memory_service_tuning_adjustments_total",
        "parameter" => parameter.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SERVICE STATE & HEALTH
// ═══════════════════════════════════════════════════════════════════════════

/// Set service lifecycle state (for dashboards)
pub fn set_service_state(state: &str) {
    gauge!(
        "memory_service_state",
        "state" => state.to_string()
    )
    .set(1.0);
}

/// Set overall health level (0 = healthy, 1 = warning, 2 = critical, 3 = unknown)
pub fn set_health_level(level: u8) {
    gauge!("memory_service_health_level").set(level as f64);
}

/// Record a failure swallowed by the release-ready layer
pub fn record_fallback_activation(operation: &str) {
    counter!(
        "memory_service_fallback_activations_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    backend: String,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(backend: impl Into<String>, operation: &'static str) -> Self {
        Self {
            backend: backend.into(),
            operation,
            start: Instant::now(),
        }
    }

    /// Time elapsed so far
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(&self.backend, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests verify the API compiles and doesn't panic.
    // No recorder is installed, so every call is a no-op.

    #[test]
    fn test_record_operation() {
        record_operation("sqlite", "add_memory", "success");
        record_operation("remote", "search_memories", "error");
        record_latency("document", "get_memory", Duration::from_millis(3));
    }

    #[test]
    fn test_error_and_timeout_counters() {
        record_error("sqlite", "add_memory", "backend");
        record_timeout("search_memories");
    }

    #[test]
    fn test_circuit_breaker_metrics() {
        set_circuit_state("sqlite", 0);
        set_circuit_state("remote", 2);
        record_circuit_breaker_call("sqlite", "success");
        record_circuit_breaker_call("remote", "rejected");
        record_backend_switch("remote", "sqlite", "failover");
    }

    #[test]
    fn test_optimizer_metrics() {
        record_cache_lookup(true);
        record_cache_lookup(false);
        set_cache_entries(12);
        record_cache_expired(3);
        set_concurrency_limit(8);
        record_batch_size(3);
        record_tuning_adjustment("operation_timeout");
    }

    #[test]
    fn test_health_metrics() {
        set_service_state("Running");
        set_health_level(1);
        set_backend_healthy("memory", true);
        record_backend_evictions("memory", 2);
        record_fallback_activation("add_memory");
    }

    #[test]
    fn test_latency_timer() {
        let timer = LatencyTimer::new("memory", "get_memory");
        std::thread::sleep(Duration::from_micros(10));
        assert!(timer.elapsed() >= Duration::from_micros(10));
        // Timer recorded on drop
    }
}
