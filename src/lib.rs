//! # Memory Service
//!
//! A multi-backend memory store for project-scoped notes ("memories") with
//! circuit breaking, automatic failover, bounded async execution and health
//! aggregation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ReleaseReadyMemory (never errors)              │
//! │  • None / empty results on failure, root cause logged       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 AsyncOptimizer (optional)                   │
//! │  • Semaphore-bounded concurrency, per-call deadline         │
//! │  • TTL read-through cache, batched adds, auto-tuning        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 MemoryService (orchestrator)                │
//! │  • Ordered fallback chain, one circuit breaker per backend  │
//! │  • One-shot failover to the next usable backend             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────┬───────┴───────┬──────────────┐
//!        ▼             ▼               ▼              ▼
//!     remote        sqlite         document        memory
//!   (HTTP API)   (file + FTS5)   (JSON file)    (TTL + LRU)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use memory_service::{MemoryCategory, MemoryQuery, MemoryService, MemoryServiceConfig, NewMemory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), memory_service::MemoryError> {
//!     let config = MemoryServiceConfig::from_json(r#"{
//!         "fallback_chain": ["sqlite", "document", "memory"],
//!         "sqlite": { "path": "memories.db" }
//!     }"#)?;
//!
//!     let service = MemoryService::new(config)?;
//!     service.initialize().await?;
//!
//!     service
//!         .add_memory("p1", NewMemory::new("Use WAL mode", MemoryCategory::Pattern).with_tags(["sqlite"]))
//!         .await?;
//!
//!     let query = MemoryQuery::new("wal").with_category(MemoryCategory::Pattern);
//!     for item in service.search_memories("p1", &query).await? {
//!         println!("{}: {}", item.id, item.content);
//!     }
//!
//!     service.cleanup().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`service`]: the [`MemoryService`] orchestrator
//! - [`backends`]: the [`MemoryBackend`] contract and its four implementations
//! - [`resilience`]: circuit breakers and retry with backoff
//! - [`optimizer`]: [`AsyncOptimizer`]
//! - [`health`]: [`HealthAggregator`]
//! - [`release`]: [`ReleaseReadyMemory`]

pub mod config;
pub mod error;
pub mod models;
pub mod backends;
pub mod resilience;
pub mod service;
pub mod optimizer;
pub mod health;
pub mod release;
pub mod metrics;

pub use config::MemoryServiceConfig;
pub use error::MemoryError;
pub use models::{
    BackendHealth, MemoryCategory, MemoryItem, MemoryQuery, MemoryStats, MemoryUpdate, NewMemory,
};
pub use backends::{DocumentBackend, InMemoryBackend, MemoryBackend, RemoteBackend, SqliteBackend};
pub use service::{MemoryService, OperationPerformance, ServiceHealth, ServiceMetrics, ServiceState};
pub use optimizer::{AsyncOptimizer, BatchOutcome, OptimizerMetrics, OptimizerSettings, TuningReport};
pub use health::{HealthAggregator, HealthCollector, HealthLevel, HealthReport, HealthTrend};
pub use release::{ReleaseMetrics, ReleaseReadyMemory};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitSnapshot, CircuitState};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
