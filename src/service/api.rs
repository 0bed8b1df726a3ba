//! Memory operations routed through breakers with one-shot failover.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::backends::MemoryBackend;
use crate::error::MemoryError;
use crate::metrics::LatencyTimer;
use crate::models::{MemoryCategory, MemoryItem, MemoryQuery, MemoryStats, MemoryUpdate, NewMemory};
use crate::resilience::circuit_breaker::CircuitError;

use super::types::ServiceCounters;
use super::MemoryService;

impl MemoryService {
    /// Store a memory on the active backend and return its id.
    pub async fn add_memory(&self, project: &str, memory: NewMemory) -> Result<String, MemoryError> {
        let memory = &memory;
        self.execute("add_memory", move |backend| async move {
            backend.add_memory(project, memory).await
        })
        .await
    }

    pub async fn get_memory(&self, project: &str, id: &str) -> Result<Option<MemoryItem>, MemoryError> {
        self.execute("get_memory", move |backend| async move {
            backend.get_memory(project, id).await
        })
        .await
    }

    /// Partial update. `Ok(false)` when the id is unknown to the active backend.
    pub async fn update_memory(
        &self,
        project: &str,
        id: &str,
        update: MemoryUpdate,
    ) -> Result<bool, MemoryError> {
        let update = &update;
        self.execute("update_memory", move |backend| async move {
            backend.update_memory(project, id, update).await
        })
        .await
    }

    pub async fn delete_memory(&self, project: &str, id: &str) -> Result<bool, MemoryError> {
        self.execute("delete_memory", move |backend| async move {
            backend.delete_memory(project, id).await
        })
        .await
    }

    /// Search the active backend. The query is normalized first.
    pub async fn search_memories(
        &self,
        project: &str,
        query: &MemoryQuery,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let query = &query.clone().normalized();
        self.execute("search_memories", move |backend| async move {
            backend.search_memories(project, query).await
        })
        .await
    }

    /// Newest-first listing, optionally limited to one category.
    pub async fn get_project_memories(
        &self,
        project: &str,
        category: Option<MemoryCategory>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let limit = if limit == 0 { crate::models::DEFAULT_QUERY_LIMIT } else { limit };
        self.execute("get_project_memories", move |backend| async move {
            backend.get_project_memories(project, category, limit).await
        })
        .await
    }

    pub async fn get_memory_stats(&self, project: &str) -> Result<MemoryStats, MemoryError> {
        self.execute("get_memory_stats", move |backend| async move {
            backend.get_memory_stats(project).await
        })
        .await
    }

    pub async fn get_all_projects(&self) -> Result<Vec<String>, MemoryError> {
        self.execute("get_all_projects", move |backend| async move {
            backend.get_all_projects().await
        })
        .await
    }

    /// Run one logical operation: active backend first, then at most one
    /// retry on the next usable backend in the chain.
    pub(super) async fn execute<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, MemoryError>
    where
        F: Fn(Arc<dyn MemoryBackend>) -> Fut,
        Fut: Future<Output = Result<T, MemoryError>>,
    {
        if !self.is_running() {
            return Err(MemoryError::NotInitialized);
        }
        ServiceCounters::bump(&self.counters.total);

        let Some(primary) = self.active_backend() else {
            ServiceCounters::bump(&self.counters.failed);
            return Err(MemoryError::NotAvailable {
                attempted: self.fallback_chain(),
            });
        };

        let first_error = match self.guarded(&primary, operation, &op).await {
            Ok(value) => {
                ServiceCounters::bump(&self.counters.successful);
                return Ok(value);
            }
            Err(e) if !e.is_failover_candidate() => {
                ServiceCounters::bump(&self.counters.failed);
                return Err(e);
            }
            Err(e) => e,
        };

        warn!(
            backend = %primary.name(),
            operation,
            error = %first_error,
            "Backend operation failed, looking for a fallback"
        );

        let Some(index) = self.next_usable(primary.name()) else {
            ServiceCounters::bump(&self.counters.failed);
            error!(operation, error = %first_error, "Memory backend chain exhausted");
            return Err(first_error);
        };
        let fallback = Arc::clone(&self.backends[index]);
        if self.promote(index, "failover") {
            ServiceCounters::bump(&self.counters.failovers);
        }

        match self.guarded(&fallback, operation, &op).await {
            Ok(value) => {
                ServiceCounters::bump(&self.counters.successful);
                Ok(value)
            }
            Err(e) => {
                ServiceCounters::bump(&self.counters.failed);
                error!(
                    backend = %fallback.name(),
                    operation,
                    error = %e,
                    "Fallback backend failed too"
                );
                Err(e)
            }
        }
    }

    /// First backend after `failed` in chain order (wrapping) whose breaker
    /// would admit a call.
    fn next_usable(&self, failed: &str) -> Option<usize> {
        let chain = self.fallback_chain();
        let start = chain.iter().position(|name| name == failed).map_or(0, |pos| pos + 1);
        (0..chain.len())
            .map(|offset| &chain[(start + offset) % chain.len()])
            .filter(|name| name.as_str() != failed)
            .find(|name| self.breaker(name).is_some_and(|b| b.allows_calls()))
            .and_then(|name| self.index_of(name))
    }

    /// One call on one backend: breaker admission, lazy initialize, deadline.
    async fn guarded<T, F, Fut>(
        &self,
        backend: &Arc<dyn MemoryBackend>,
        operation: &'static str,
        op: &F,
    ) -> Result<T, MemoryError>
    where
        F: Fn(Arc<dyn MemoryBackend>) -> Fut,
        Fut: Future<Output = Result<T, MemoryError>>,
    {
        let name = backend.name().to_string();
        let Some(breaker) = self.breaker(&name).cloned() else {
            return Err(MemoryError::UnknownBackend(name));
        };
        let deadline = self.operation_timeout();
        let timer = LatencyTimer::new(name.clone(), operation);

        let call = async {
            if !backend.is_initialized() {
                debug!(backend = %name, "Initializing backend on first use");
                if let Err(e) = backend.initialize().await {
                    return Err(e);
                }
            }
            op(Arc::clone(backend)).await
        };
        let result = breaker
            .call_classified(
                || async {
                    match deadline {
                        Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                            Err(MemoryError::Timeout {
                                operation: operation.to_string(),
                                timeout: limit,
                            })
                        }),
                        None => call.await,
                    }
                },
                MemoryError::is_backend_failure,
            )
            .await;
        let elapsed_ms = timer.elapsed().as_secs_f64() * 1000.0;
        drop(timer);

        match result {
            Ok(value) => {
                self.record_health(&name, true, elapsed_ms, None);
                self.record_performance(&name, operation, true, elapsed_ms);
                crate::metrics::record_operation(&name, operation, "success");
                Ok(value)
            }
            Err(CircuitError::Rejected) => {
                crate::metrics::record_operation(&name, operation, "rejected");
                Err(MemoryError::CircuitOpen { backend: name })
            }
            Err(CircuitError::Inner(e)) => {
                self.record_performance(&name, operation, false, elapsed_ms);
                if e.is_backend_failure() {
                    self.record_health(&name, false, elapsed_ms, Some(e.to_string()));
                }
                if matches!(e, MemoryError::Timeout { .. }) {
                    crate::metrics::record_timeout(operation);
                }
                crate::metrics::record_operation(&name, operation, "error");
                crate::metrics::record_error(&name, operation, e.kind());
                Err(e)
            }
        }
    }

    pub(super) fn record_health(&self, backend: &str, success: bool, elapsed_ms: f64, error: Option<String>) {
        if let Some(mut health) = self.health.get_mut(backend) {
            health.record(success, elapsed_ms, error);
        }
        crate::metrics::set_backend_healthy(backend, success);
    }

    fn record_performance(&self, backend: &str, operation: &'static str, success: bool, elapsed_ms: f64) {
        self.performance
            .entry((backend.to_string(), operation))
            .or_default()
            .record(success, elapsed_ms);
    }
}
