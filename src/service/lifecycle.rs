//! Service lifecycle: backend selection at startup and shutdown.

use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::MemoryError;

use super::{MemoryService, ServiceState};

impl MemoryService {
    /// Select the first healthy backend in the fallback chain.
    ///
    /// Backends are initialized and probed in chain order; the first one
    /// that passes becomes active. Later backends stay uninitialized until
    /// a failover or manual switch needs them. Idempotent while running.
    ///
    /// Fails with [`MemoryError::NotAvailable`] listing every backend tried.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), MemoryError> {
        let _guard = self.lifecycle_lock.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let started = Instant::now();
        info!("Initializing memory service...");
        self.set_state(ServiceState::Initializing);

        let mut attempted = Vec::new();
        for name in self.fallback_chain() {
            let Some(index) = self.index_of(&name) else {
                debug!(backend = %name, "Chain entry has no backend, skipping");
                continue;
            };
            attempted.push(name.clone());
            let backend = &self.backends[index];

            let probe_start = Instant::now();
            let outcome = match backend.initialize().await {
                Ok(()) if backend.health_check().await => Ok(()),
                Ok(()) => Err("health check failed after initialize".to_string()),
                Err(e) => Err(e.to_string()),
            };
            let elapsed_ms = probe_start.elapsed().as_secs_f64() * 1000.0;

            match outcome {
                Ok(()) => {
                    self.record_health(&name, true, elapsed_ms, None);
                    self.promote(index, "initialize");
                    let init_ms = started.elapsed().as_millis() as u64;
                    self.counters
                        .initialization_ms
                        .store(init_ms, std::sync::atomic::Ordering::Relaxed);
                    self.set_state(ServiceState::Running);
                    info!(backend = %name, init_ms, "Memory service ready");
                    return Ok(());
                }
                Err(cause) => {
                    warn!(backend = %name, error = %cause, "Backend unavailable at startup");
                    self.record_health(&name, false, elapsed_ms, Some(cause));
                    crate::metrics::record_error(&name, "initialize", "initialization");
                }
            }
        }

        self.set_state(ServiceState::Created);
        error!(attempted = ?attempted, "No memory backend could be initialized");
        Err(MemoryError::NotAvailable { attempted })
    }

    /// Release every backend. Never fails; the service can be initialized again.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self) {
        let _guard = self.lifecycle_lock.lock().await;
        info!("Shutting down memory service...");
        self.set_state(ServiceState::ShuttingDown);

        for backend in &self.backends {
            backend.cleanup().await;
            crate::metrics::set_backend_healthy(backend.name(), false);
            debug!(backend = %backend.name(), "Backend cleaned up");
        }
        self.clear_active();

        self.set_state(ServiceState::Stopped);
        info!("Memory service stopped");
    }
}
