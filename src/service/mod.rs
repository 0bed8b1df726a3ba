// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fallback orchestrator.
//!
//! The [`MemoryService`] holds an ordered fallback chain of backends, one
//! circuit breaker per backend and a single "active backend" pointer:
//! - every operation runs against the active backend through its breaker
//! - on a breaker rejection or backend failure the next usable backend in
//!   the chain (wrapping around) is promoted and the operation is retried
//!   once there
//! - if nothing in the chain is usable the original error is returned
//!
//! Backends are independent stores: nothing written while one backend was
//! active is copied to another after a switch.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Initializing → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use memory_service::{MemoryService, MemoryServiceConfig, MemoryCategory, NewMemory, ServiceState};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), memory_service::MemoryError> {
//! let service = MemoryService::new(MemoryServiceConfig::default())?;
//! assert_eq!(service.state(), ServiceState::Created);
//!
//! service.initialize().await?;
//! let id = service
//!     .add_memory("p1", NewMemory::new("Prefer WAL mode", MemoryCategory::Pattern))
//!     .await?;
//! assert!(service.get_memory("p1", &id).await?.is_some());
//! # Ok(())
//! # }
//! ```

mod types;
mod api;
mod admin_api;
mod lifecycle;

pub use types::{OperationPerformance, ServiceHealth, ServiceMetrics, ServiceState};
use types::{OperationTracker, ServiceCounters};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::backends::MemoryBackend;
use crate::config::MemoryServiceConfig;
use crate::models::BackendHealth;
use crate::resilience::circuit_breaker::CircuitBreaker;

/// Sentinel for "no active backend".
const NO_ACTIVE: usize = usize::MAX;

/// Multi-backend memory service with circuit breaking and failover.
///
/// # Thread Safety
///
/// `Send + Sync`; share it behind an `Arc`. The fallback chain and the
/// active-backend pointer change only under one mutex, while readers of the
/// active backend take a lock-free snapshot.
pub struct MemoryService {
    pub(super) config: RwLock<MemoryServiceConfig>,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<ServiceState>,
    pub(super) state_rx: watch::Receiver<ServiceState>,

    /// Every configured backend, fixed for the service's lifetime
    pub(super) backends: Vec<Arc<dyn MemoryBackend>>,

    /// One breaker per backend, keyed by backend name
    pub(super) breakers: HashMap<String, Arc<CircuitBreaker>>,

    /// Priority order. Guards every change of `active` too.
    pub(super) chain: Mutex<Vec<String>>,

    /// Index into `backends`, or `NO_ACTIVE`
    pub(super) active: AtomicUsize,

    /// Per-backend request tracking
    pub(super) health: DashMap<String, BackendHealth>,

    /// Latency summaries keyed by (backend, operation)
    pub(super) performance: DashMap<(String, &'static str), OperationTracker>,

    pub(super) counters: ServiceCounters,

    /// Per-call deadline in milliseconds (0 = none)
    pub(super) operation_timeout_ms: AtomicU64,

    /// Serializes initialize/cleanup
    pub(super) lifecycle_lock: tokio::sync::Mutex<()>,
}

impl MemoryService {
    /// Build the service and its backends from configuration.
    ///
    /// No I/O happens until [`initialize()`](Self::initialize).
    pub fn new(config: MemoryServiceConfig) -> Result<Self, crate::MemoryError> {
        config.validate()?;
        let backends = crate::backends::build_backends(&config)?;
        let chain = backends.iter().map(|b| b.name().to_string()).collect();
        Ok(Self::assemble(config, backends, chain))
    }

    /// Build the service around pre-constructed backends.
    ///
    /// The given order becomes the fallback chain; `config.fallback_chain`
    /// and the per-backend sections are ignored.
    pub fn with_backends(config: MemoryServiceConfig, backends: Vec<Arc<dyn MemoryBackend>>) -> Self {
        let mut unique: Vec<Arc<dyn MemoryBackend>> = Vec::with_capacity(backends.len());
        for backend in backends {
            if !unique.iter().any(|b| b.name() == backend.name()) {
                unique.push(backend);
            }
        }
        let chain = unique.iter().map(|b| b.name().to_string()).collect();
        Self::assemble(config, unique, chain)
    }

    fn assemble(
        config: MemoryServiceConfig,
        backends: Vec<Arc<dyn MemoryBackend>>,
        chain: Vec<String>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ServiceState::Created);
        let circuit_config = config.circuit_config();

        let breakers = backends
            .iter()
            .map(|b| {
                let name = b.name().to_string();
                (name.clone(), Arc::new(CircuitBreaker::new(name, circuit_config.clone())))
            })
            .collect();
        let health = backends
            .iter()
            .map(|b| (b.name().to_string(), BackendHealth::new(b.name())))
            .collect();
        let timeout_ms = config.operation_timeout().as_millis() as u64;

        info!(chain = ?chain, "Memory service created");
        crate::metrics::set_service_state("Created");

        Self {
            config: RwLock::new(config),
            state: state_tx,
            state_rx,
            backends,
            breakers,
            chain: Mutex::new(chain),
            active: AtomicUsize::new(NO_ACTIVE),
            health,
            performance: DashMap::new(),
            counters: ServiceCounters::default(),
            operation_timeout_ms: AtomicU64::new(timeout_ms),
            lifecycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Get current service state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    /// Whether operations are being served.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Copy of the configuration the service was built with.
    #[must_use]
    pub fn config(&self) -> MemoryServiceConfig {
        self.config.read().clone()
    }

    /// Name of the active backend. Lock-free; may be one switch stale.
    #[must_use]
    pub fn active_backend_name(&self) -> Option<String> {
        self.active_backend().map(|b| b.name().to_string())
    }

    /// Every backend the service holds, in construction order.
    #[must_use]
    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Current priority order.
    #[must_use]
    pub fn fallback_chain(&self) -> Vec<String> {
        self.chain.lock().clone()
    }

    /// Deadline applied to each guarded backend call, if any.
    #[must_use]
    pub fn operation_timeout(&self) -> Option<Duration> {
        match self.operation_timeout_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Change the per-call deadline. `None` disables it.
    pub fn set_operation_timeout(&self, timeout: Option<Duration>) {
        let ms = timeout.map_or(0, |t| (t.as_millis() as u64).max(1));
        self.operation_timeout_ms.store(ms, Ordering::Release);
        info!(timeout_ms = ms, "Operation timeout updated");
    }

    pub(super) fn active_backend(&self) -> Option<Arc<dyn MemoryBackend>> {
        self.backends.get(self.active.load(Ordering::Acquire)).cloned()
    }

    pub(super) fn index_of(&self, name: &str) -> Option<usize> {
        self.backends.iter().position(|b| b.name() == name)
    }

    pub(super) fn breaker(&self, name: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    pub(super) fn set_state(&self, state: ServiceState) {
        let _ = self.state.send(state);
        crate::metrics::set_service_state(&state.to_string());
    }

    /// Make `index` the active backend. Returns false if it already was.
    pub(super) fn promote(&self, index: usize, reason: &str) -> bool {
        let _chain = self.chain.lock();
        let previous = self.active.load(Ordering::Acquire);
        if previous == index {
            return false;
        }
        self.active.store(index, Ordering::Release);

        let from = self
            .backends
            .get(previous)
            .map_or("none", |b| b.name());
        let to = self.backends[index].name();
        // Initial selection is not a switch
        if previous != NO_ACTIVE {
            ServiceCounters::bump(&self.counters.switches);
            crate::metrics::record_backend_switch(from, to, reason);
        }
        info!(from = %from, to = %to, reason = %reason, "Active backend changed");
        true
    }

    pub(super) fn clear_active(&self) {
        let _chain = self.chain.lock();
        self.active.store(NO_ACTIVE, Ordering::Release);
    }
}

impl std::fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryService")
            .field("state", &self.state())
            .field("active_backend", &self.active_backend_name())
            .field("fallback_chain", &self.fallback_chain())
            .finish()
    }
}
