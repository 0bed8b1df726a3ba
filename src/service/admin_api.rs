//! Operator controls: backend switching, chain order, breakers, health,
//! metrics and backups.

use chrono::Utc;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::MemoryError;
use crate::resilience::circuit_breaker::CircuitSnapshot;

use super::types::{OperationPerformance, ServiceHealth, ServiceMetrics};
use super::MemoryService;

impl MemoryService {
    /// Make `name` the active backend, initializing it first if needed.
    ///
    /// The target must exist and pass a health check. Data is not migrated.
    #[tracing::instrument(skip(self))]
    pub async fn switch_backend(&self, name: &str) -> Result<(), MemoryError> {
        let index = self
            .index_of(name)
            .ok_or_else(|| MemoryError::UnknownBackend(name.to_string()))?;
        let backend = &self.backends[index];

        if !backend.is_initialized() {
            backend.initialize().await?;
        }
        if !backend.health_check().await {
            return Err(MemoryError::backend(name, "switch_backend", "health check failed"));
        }
        self.promote(index, "manual");
        Ok(())
    }

    /// Replace the priority order. Every name must be a known backend.
    ///
    /// The active backend is left alone even if it is no longer listed.
    pub fn set_fallback_chain(&self, chain: Vec<String>) -> Result<(), MemoryError> {
        if chain.is_empty() {
            return Err(MemoryError::Configuration("fallback chain cannot be empty".into()));
        }
        if let Some(unknown) = chain.iter().find(|name| self.index_of(name).is_none()) {
            return Err(MemoryError::UnknownBackend(unknown.clone()));
        }
        let mut deduped: Vec<String> = Vec::with_capacity(chain.len());
        for name in chain {
            if !deduped.contains(&name) {
                deduped.push(name);
            }
        }
        info!(chain = ?deduped, "Fallback chain updated");
        *self.chain.lock() = deduped;
        Ok(())
    }

    /// Close one backend's breaker, or every breaker when `name` is `None`.
    pub fn reset_circuit_breaker(&self, name: Option<&str>) -> Result<(), MemoryError> {
        match name {
            Some(name) => {
                let breaker = self
                    .breaker(name)
                    .ok_or_else(|| MemoryError::UnknownBackend(name.to_string()))?;
                breaker.reset();
            }
            None => self.breakers.values().for_each(|b| b.reset()),
        }
        info!(backend = name.unwrap_or("all"), "Circuit breaker reset");
        Ok(())
    }

    /// Open a backend's breaker now, as if it had just tripped.
    pub fn force_open_circuit(&self, name: &str) -> Result<(), MemoryError> {
        let breaker = self
            .breaker(name)
            .ok_or_else(|| MemoryError::UnknownBackend(name.to_string()))?;
        breaker.force_open();
        warn!(backend = %name, "Circuit breaker forced open");
        Ok(())
    }

    /// Breaker snapshots in construction order.
    #[must_use]
    pub fn circuit_breaker_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.backends
            .iter()
            .filter_map(|b| self.breaker(b.name()))
            .map(|b| b.snapshot())
            .collect()
    }

    /// Service counters.
    #[must_use]
    pub fn metrics(&self) -> ServiceMetrics {
        let c = &self.counters;
        let activations = self
            .breakers
            .values()
            .map(|b| b.rejections() + b.times_opened())
            .sum();
        let init_ms = c.initialization_ms.load(Ordering::Relaxed);
        ServiceMetrics {
            total_operations: c.total.load(Ordering::Relaxed),
            successful_operations: c.successful.load(Ordering::Relaxed),
            failed_operations: c.failed.load(Ordering::Relaxed),
            backend_switches: c.switches.load(Ordering::Relaxed),
            circuit_breaker_activations: activations,
            failovers: c.failovers.load(Ordering::Relaxed),
            initialization_ms: (init_ms > 0 || self.is_running()).then_some(init_ms),
        }
    }

    /// Zero service counters and breaker metrics. Breaker states are kept.
    pub fn reset_metrics(&self) {
        self.counters.reset();
        self.performance.clear();
        for breaker in self.breakers.values() {
            breaker.reset_metrics();
        }
        info!("Service metrics reset");
    }

    /// Service health with a live probe of every initialized backend.
    ///
    /// Probes refresh `is_healthy` and `last_checked_at` only; request
    /// counters are left to real operations.
    pub async fn get_service_health(&self) -> ServiceHealth {
        let mut backends = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            let name = backend.name();
            let started = Instant::now();
            let healthy = backend.is_initialized() && backend.health_check().await;
            let probe_ms = started.elapsed().as_secs_f64() * 1000.0;

            let snapshot = match self.health.get_mut(name) {
                Some(mut tracked) => {
                    tracked.is_healthy = healthy;
                    tracked.last_checked_at = Some(Utc::now());
                    if tracked.total_requests == 0 {
                        tracked.response_time_ms = probe_ms;
                    }
                    tracked.clone()
                }
                None => continue,
            };
            crate::metrics::set_backend_healthy(name, healthy);
            backends.push(snapshot);
        }

        ServiceHealth {
            state: self.state(),
            initialized: self.is_running(),
            active_backend: self.active_backend_name(),
            fallback_chain: self.fallback_chain(),
            backends,
            circuit_breakers: self.circuit_breaker_snapshots(),
            metrics: self.metrics(),
            performance: self.performance_summary(),
        }
    }

    /// Latency and success summary per backend and operation.
    #[must_use]
    pub fn performance_summary(&self) -> Vec<OperationPerformance> {
        let mut summary: Vec<OperationPerformance> = self
            .performance
            .iter()
            .map(|entry| {
                let (backend, operation) = entry.key();
                entry.value().snapshot(backend, operation)
            })
            .collect();
        summary.sort_by(|a, b| (&a.backend, &a.operation).cmp(&(&b.backend, &b.operation)));
        summary
    }

    /// Whole-store copy of one backend to `path`.
    #[tracing::instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn create_backup(&self, backend: &str, path: &Path) -> Result<(), MemoryError> {
        let index = self
            .index_of(backend)
            .ok_or_else(|| MemoryError::UnknownBackend(backend.to_string()))?;
        self.backends[index].create_backup(path).await
    }

    /// Replace one backend's store with the copy at `path`.
    #[tracing::instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn restore_backup(&self, backend: &str, path: &Path) -> Result<(), MemoryError> {
        let index = self
            .index_of(backend)
            .ok_or_else(|| MemoryError::UnknownBackend(backend.to_string()))?;
        self.backends[index].restore_backup(path).await
    }
}

#[cfg(test)]
mod tests {
    use crate::backends::{InMemoryBackend, MemoryBackend};
    use crate::config::{InMemoryConfig, MemoryServiceConfig};
    use crate::error::MemoryError;
    use crate::models::{MemoryCategory, NewMemory};
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::service::MemoryService;
    use std::sync::Arc;

    /// Two in-memory stores with distinct names so they can be told apart.
    struct Named(&'static str, InMemoryBackend);

    #[async_trait::async_trait]
    impl MemoryBackend for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn is_initialized(&self) -> bool {
            self.1.is_initialized()
        }
        async fn initialize(&self) -> Result<(), MemoryError> {
            self.1.initialize().await
        }
        async fn health_check(&self) -> bool {
            self.1.health_check().await
        }
        async fn add_memory(&self, p: &str, m: &NewMemory) -> Result<String, MemoryError> {
            self.1.add_memory(p, m).await
        }
        async fn get_memory(&self, p: &str, id: &str) -> Result<Option<crate::MemoryItem>, MemoryError> {
            self.1.get_memory(p, id).await
        }
        async fn update_memory(&self, p: &str, id: &str, u: &crate::MemoryUpdate) -> Result<bool, MemoryError> {
            self.1.update_memory(p, id, u).await
        }
        async fn delete_memory(&self, p: &str, id: &str) -> Result<bool, MemoryError> {
            self.1.delete_memory(p, id).await
        }
        async fn search_memories(&self, p: &str, q: &crate::MemoryQuery) -> Result<Vec<crate::MemoryItem>, MemoryError> {
            self.1.search_memories(p, q).await
        }
        async fn get_memory_stats(&self, p: &str) -> Result<crate::MemoryStats, MemoryError> {
            self.1.get_memory_stats(p).await
        }
        async fn get_all_projects(&self) -> Result<Vec<String>, MemoryError> {
            self.1.get_all_projects().await
        }
        async fn cleanup(&self) {
            self.1.cleanup().await
        }
    }

    fn pair() -> MemoryService {
        let a: Arc<dyn MemoryBackend> = Arc::new(Named("a", InMemoryBackend::new(InMemoryConfig::default())));
        let b: Arc<dyn MemoryBackend> = Arc::new(Named("b", InMemoryBackend::new(InMemoryConfig::default())));
        MemoryService::with_backends(MemoryServiceConfig::default(), vec![a, b])
    }

    #[tokio::test]
    async fn test_switch_backend_validates_and_counts() {
        let service = pair();
        service.initialize().await.unwrap();
        assert_eq!(service.active_backend_name().as_deref(), Some("a"));

        let err = service.switch_backend("nope").await.unwrap_err();
        assert_eq!(err, MemoryError::UnknownBackend("nope".into()));

        // Lazily initializes the target
        service.switch_backend("b").await.unwrap();
        assert_eq!(service.active_backend_name().as_deref(), Some("b"));
        assert_eq!(service.metrics().backend_switches, 1);

        // Switching to the active backend is a no-op
        service.switch_backend("b").await.unwrap();
        assert_eq!(service.metrics().backend_switches, 1);
    }

    #[tokio::test]
    async fn test_switch_does_not_migrate_data() {
        let service = pair();
        service.initialize().await.unwrap();
        let id = service
            .add_memory("p1", NewMemory::new("only in a", MemoryCategory::Project))
            .await
            .unwrap();
        service.switch_backend("b").await.unwrap();
        assert!(service.get_memory("p1", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fallback_chain_validation() {
        let service = pair();
        assert_eq!(service.fallback_chain(), vec!["a", "b"]);
        assert!(matches!(
            service.set_fallback_chain(vec!["b".into(), "zzz".into()]),
            Err(MemoryError::UnknownBackend(_))
        ));
        assert!(service.set_fallback_chain(Vec::new()).is_err());

        service
            .set_fallback_chain(vec!["b".into(), "a".into(), "b".into()])
            .unwrap();
        assert_eq!(service.fallback_chain(), vec!["b", "a"]);

        service.initialize().await.unwrap();
        assert_eq!(service.active_backend_name().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_force_open_and_reset() {
        let service = pair();
        service.force_open_circuit("a").unwrap();
        service.force_open_circuit("b").unwrap();
        let states: Vec<CircuitState> = service
            .circuit_breaker_snapshots()
            .iter()
            .map(|s| s.state)
            .collect();
        assert_eq!(states, vec![CircuitState::Open, CircuitState::Open]);
        assert_eq!(service.metrics().circuit_breaker_activations, 2);

        service.reset_circuit_breaker(Some("a")).unwrap();
        assert_eq!(service.circuit_breaker_snapshots()[0].state, CircuitState::Closed);
        service.reset_circuit_breaker(None).unwrap();
        assert!(service
            .circuit_breaker_snapshots()
            .iter()
            .all(|s| s.state == CircuitState::Closed));
        assert!(service.reset_circuit_breaker(Some("zzz")).is_err());

        service.reset_metrics();
        assert_eq!(service.metrics().circuit_breaker_activations, 0);
    }

    #[tokio::test]
    async fn test_service_health_probes_backends() {
        let service = pair();
        service.initialize().await.unwrap();
        let health = service.get_service_health().await;
        assert!(health.initialized);
        assert_eq!(health.active_backend.as_deref(), Some("a"));
        assert_eq!(health.backends.len(), 2);
        // b was never initialized
        assert!(health.backends[0].is_healthy);
        assert!(!health.backends[1].is_healthy);
        assert_eq!(health.healthy_backends(), 1);
        assert_eq!(health.circuit_breakers.len(), 2);
    }

    #[tokio::test]
    async fn test_performance_summary_per_backend_and_operation() {
        let service = pair();
        service.initialize().await.unwrap();
        assert!(service.get_service_health().await.performance.is_empty());

        for i in 0..3 {
            service
                .add_memory("p1", NewMemory::new(format!("note {i}"), MemoryCategory::Team))
                .await
                .unwrap();
        }
        service.get_memory_stats("p1").await.unwrap();

        let health = service.get_service_health().await;
        let ops: Vec<(&str, &str, u64)> = health
            .performance
            .iter()
            .map(|p| (p.backend.as_str(), p.operation.as_str(), p.count))
            .collect();
        assert_eq!(ops, vec![("a", "add_memory", 3), ("a", "get_memory_stats", 1)]);
        let adds = &health.performance[0];
        assert_eq!(adds.successes, 3);
        assert_eq!(adds.success_rate(), 1.0);
        assert!(adds.max_ms >= adds.avg_ms);
        assert!(adds.p95_ms <= adds.max_ms);

        // Rejected calls never reach the backend
        service.force_open_circuit("a").unwrap();
        let _ = service
            .add_memory("p1", NewMemory::new("rejected on a", MemoryCategory::Team))
            .await;
        let adds_on_a = service
            .performance_summary()
            .into_iter()
            .find(|p| p.backend == "a" && p.operation == "add_memory")
            .unwrap();
        assert_eq!(adds_on_a.count, 3);

        service.reset_metrics();
        assert!(service.performance_summary().is_empty());
    }

    #[tokio::test]
    async fn test_backup_unknown_or_unsupported() {
        let service = pair();
        let path = std::path::Path::new("unused.bak");
        assert!(matches!(
            service.create_backup("zzz", path).await,
            Err(MemoryError::UnknownBackend(_))
        ));
        assert!(matches!(
            service.create_backup("a", path).await,
            Err(MemoryError::Unsupported { .. })
        ));
    }
}
