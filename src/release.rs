//! Release-ready wrapper that never returns an error.
//!
//! CLI and agent workflows call memory collection as a side concern: losing
//! a memory must not abort the surrounding work. [`ReleaseReadyMemory`]
//! turns every failure from the [`MemoryService`] into `None`, an empty list
//! or empty stats, logs the root cause at `error` level and counts it as a
//! fallback activation.
//!
//! ```rust,no_run
//! use memory_service::{MemoryCategory, MemoryService, MemoryServiceConfig, NewMemory, ReleaseReadyMemory};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), memory_service::MemoryError> {
//! let service = Arc::new(MemoryService::new(MemoryServiceConfig::default())?);
//! let memory = ReleaseReadyMemory::new(service);
//!
//! // Initializes on first use; `None` if storage is unavailable
//! if let Some(id) = memory.add_memory("p1", NewMemory::new("Ship it", MemoryCategory::Team)).await {
//!     println!("stored {id}");
//! }
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::MemoryError;
use crate::models::{MemoryItem, MemoryQuery, MemoryStats, NewMemory};
use crate::resilience::retry::{retry, RetryConfig};
use crate::service::{MemoryService, ServiceHealth};

/// Wrapper counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReleaseMetrics {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Failures converted into an empty result
    pub fallback_activations: u64,
}

#[derive(Debug, Default)]
struct ReleaseCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    fallbacks: AtomicU64,
}

pub struct ReleaseReadyMemory {
    service: Arc<MemoryService>,
    init_retry: RetryConfig,
    counters: ReleaseCounters,
}

impl ReleaseReadyMemory {
    /// Wrap `service`. Initialization is attempted up to 3 times, one second
    /// apart, on first use.
    pub fn new(service: Arc<MemoryService>) -> Self {
        Self {
            service,
            init_retry: RetryConfig::linear(3, Duration::from_secs(1)),
            counters: ReleaseCounters::default(),
        }
    }

    #[must_use]
    pub fn with_init_retry(mut self, retry: RetryConfig) -> Self {
        self.init_retry = retry;
        self
    }

    #[must_use]
    pub fn service(&self) -> &Arc<MemoryService> {
        &self.service
    }

    /// Initialize the service if it is not running. Returns whether it is.
    pub async fn initialize(&self) -> bool {
        if self.service.is_running() {
            return true;
        }
        info!("Initializing memory service for release-ready access");
        match retry("memory_service_initialize", &self.init_retry, || self.service.initialize()).await {
            Ok(()) => {
                info!(
                    backend = self.service.active_backend_name().as_deref().unwrap_or("none"),
                    "Memory service ready"
                );
                true
            }
            Err(e) => {
                error!(error = %e, "Memory service could not be initialized, memory collection skipped");
                false
            }
        }
    }

    /// Store a memory. `None` when storage is unavailable.
    pub async fn add_memory(&self, project: &str, memory: NewMemory) -> Option<String> {
        let outcome = match self.ready("add_memory").await {
            Ok(()) => self.service.add_memory(project, memory).await,
            Err(e) => Err(e),
        };
        self.settle("add_memory", project, outcome)
    }

    pub async fn get_memory(&self, project: &str, id: &str) -> Option<MemoryItem> {
        let outcome = match self.ready("get_memory").await {
            Ok(()) => self.service.get_memory(project, id).await,
            Err(e) => Err(e),
        };
        self.settle("get_memory", project, outcome).flatten()
    }

    /// Search. Empty when storage is unavailable.
    pub async fn search_memories(&self, project: &str, query: &MemoryQuery) -> Vec<MemoryItem> {
        let outcome = match self.ready("search_memories").await {
            Ok(()) => self.service.search_memories(project, query).await,
            Err(e) => Err(e),
        };
        self.settle("search_memories", project, outcome).unwrap_or_default()
    }

    /// Statistics, or empty statistics (backend `"none"`) on failure.
    pub async fn get_memory_stats(&self, project: &str) -> MemoryStats {
        let outcome = match self.ready("get_memory_stats").await {
            Ok(()) => self.service.get_memory_stats(project).await,
            Err(e) => Err(e),
        };
        self.settle("get_memory_stats", project, outcome)
            .unwrap_or_else(|| MemoryStats::empty(project, "none"))
    }

    pub async fn get_service_health(&self) -> ServiceHealth {
        self.service.get_service_health().await
    }

    /// Running with an active backend.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.service.is_running() && self.service.active_backend_name().is_some()
    }

    #[must_use]
    pub fn metrics(&self) -> ReleaseMetrics {
        let c = &self.counters;
        ReleaseMetrics {
            total_operations: c.total.load(Ordering::Relaxed),
            successful_operations: c.successful.load(Ordering::Relaxed),
            failed_operations: c.failed.load(Ordering::Relaxed),
            fallback_activations: c.fallbacks.load(Ordering::Relaxed),
        }
    }

    pub async fn cleanup(&self) {
        self.service.cleanup().await;
    }

    async fn ready(&self, operation: &'static str) -> Result<(), MemoryError> {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        if self.initialize().await {
            Ok(())
        } else {
            debug!(operation, "Skipping operation, memory service unavailable");
            Err(MemoryError::NotInitialized)
        }
    }

    fn settle<T>(&self, operation: &'static str, project: &str, outcome: Result<T, MemoryError>) -> Option<T> {
        match outcome {
            Ok(value) => {
                self.counters.successful.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_fallback_activation(operation);
                error!(
                    operation,
                    project,
                    error = %e,
                    error_kind = e.kind(),
                    "Memory operation failed, continuing without it"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for ReleaseReadyMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseReadyMemory")
            .field("service", &self.service)
            .field("metrics", &self.metrics())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryBackend, MemoryBackend};
    use crate::config::MemoryServiceConfig;
    use crate::models::MemoryCategory;

    fn memory_backend() -> Arc<dyn MemoryBackend> {
        Arc::new(InMemoryBackend::default())
    }

    fn wrapper(backends: Vec<Arc<dyn MemoryBackend>>) -> ReleaseReadyMemory {
        let service = Arc::new(MemoryService::with_backends(MemoryServiceConfig::default(), backends));
        ReleaseReadyMemory::new(service).with_init_retry(RetryConfig::test())
    }

    #[tokio::test]
    async fn test_initializes_lazily() {
        let memory = wrapper(vec![memory_backend()]);
        assert!(!memory.is_healthy());

        let id = memory
            .add_memory("p1", NewMemory::new("lazy", MemoryCategory::Project))
            .await
            .unwrap();
        assert!(memory.is_healthy());
        assert_eq!(memory.get_memory("p1", &id).await.unwrap().content, "lazy");
        assert_eq!(memory.search_memories("p1", &MemoryQuery::new("lazy")).await.len(), 1);
        assert_eq!(memory.get_memory_stats("p1").await.total, 1);

        let metrics = memory.metrics();
        assert_eq!(metrics.total_operations, 4);
        assert_eq!(metrics.successful_operations, 4);
        assert_eq!(metrics.fallback_activations, 0);
    }

    #[tokio::test]
    async fn test_open_breaker_degrades_to_none() {
        let memory = wrapper(vec![memory_backend()]);
        assert!(memory.initialize().await);
        memory.service().force_open_circuit("memory").unwrap();

        let id = memory
            .add_memory("p1", NewMemory::new("dropped", MemoryCategory::Error))
            .await;
        assert!(id.is_none());
        assert!(memory.search_memories("p1", &MemoryQuery::new("")).await.is_empty());

        let metrics = memory.metrics();
        assert_eq!(metrics.failed_operations, 2);
        assert_eq!(metrics.fallback_activations, 2);
    }

    #[tokio::test]
    async fn test_unavailable_storage_never_errors() {
        let memory = wrapper(Vec::new());
        assert!(!memory.initialize().await);
        assert!(memory
            .add_memory("p1", NewMemory::new("x", MemoryCategory::Project))
            .await
            .is_none());
        let stats = memory.get_memory_stats("p1").await;
        assert_eq!(stats.total, 0);
        assert_eq!(stats.backend, "none");
        assert_eq!(memory.metrics().fallback_activations, 2);
    }
}
