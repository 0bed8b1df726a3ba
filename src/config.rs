//! Configuration for the memory service.
//!
//! # Example
//!
//! ```
//! use memory_service::MemoryServiceConfig;
//!
//! // Minimal config (uses defaults)
//! let config = MemoryServiceConfig::default();
//! assert_eq!(config.max_concurrent_ops, 8);
//! assert_eq!(config.fallback_chain, vec!["remote", "sqlite", "document", "memory"]);
//!
//! // From JSON, validated
//! let config = MemoryServiceConfig::from_json(r#"{
//!     "fallback_chain": ["sqlite", "memory"],
//!     "sqlite": { "path": "/tmp/memories.db" },
//!     "operation_timeout_secs": 2.5
//! }"#).unwrap();
//! assert_eq!(config.sqlite.path.to_str(), Some("/tmp/memories.db"));
//!
//! // Invalid values are rejected
//! assert!(MemoryServiceConfig::from_json(r#"{ "batch_size": 0 }"#).is_err());
//! ```

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::MemoryError;
use crate::resilience::circuit_breaker::CircuitConfig;

/// Names of the built-in backends, as used in `fallback_chain`.
pub const BACKEND_REMOTE: &str = "remote";
pub const BACKEND_SQLITE: &str = "sqlite";
pub const BACKEND_DOCUMENT: &str = "document";
pub const BACKEND_MEMORY: &str = "memory";

pub const KNOWN_BACKENDS: [&str; 4] = [BACKEND_REMOTE, BACKEND_SQLITE, BACKEND_DOCUMENT, BACKEND_MEMORY];

/// Top-level service configuration.
///
/// All fields have sensible defaults. Backends that are disabled or absent
/// from `fallback_chain` are never constructed.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryServiceConfig {
    /// Backend names in priority order
    #[serde(default = "default_fallback_chain")]
    pub fallback_chain: Vec<String>,

    #[serde(default)]
    pub sqlite: SqliteConfig,
    #[serde(default)]
    pub document: DocumentConfig,
    #[serde(default)]
    pub memory: InMemoryConfig,
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Circuit breaker settings (shared by every backend)
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_breaker_recovery_timeout_secs")]
    pub circuit_breaker_recovery_timeout_secs: f64,
    #[serde(default = "default_circuit_breaker_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    /// Failure rate (percent) that opens the breaker once enough calls are seen
    #[serde(default = "default_circuit_breaker_failure_rate")]
    pub circuit_breaker_failure_rate: f64,

    /// Optimizer settings
    #[serde(default = "default_max_concurrent_ops")]
    pub max_concurrent_ops: usize,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: f64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_true")]
    pub enable_cache: bool,

    /// Health aggregation
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_history_retention_hours")]
    pub health_history_retention_hours: u64,
    #[serde(default = "default_health_error_rate_threshold")]
    pub health_error_rate_threshold: f64,
    #[serde(default = "default_health_circuit_breaker_threshold")]
    pub health_circuit_breaker_threshold: u64,
    #[serde(default = "default_health_response_time_threshold_ms")]
    pub health_response_time_threshold_ms: f64,
}

/// Embedded relational backend (SQLite).
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
    /// Maintain an FTS5 shadow index for ranked search
    #[serde(default = "default_true")]
    pub enable_fts: bool,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

/// Embedded document backend (single JSON collection file).
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_document_path")]
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub pretty: bool,
    #[serde(default = "default_document_query_cache_ttl_secs")]
    pub query_cache_ttl_secs: u64,
}

/// In-process bounded cache backend.
#[derive(Debug, Clone, Deserialize)]
pub struct InMemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_memory_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_true")]
    pub enable_expiration: bool,
    #[serde(default = "default_memory_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_memory_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

/// Remote HTTP semantic store.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_remote_host")]
    pub host: String,
    #[serde(default = "default_remote_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_remote_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_remote_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_remote_health_cache_secs")]
    pub health_cache_secs: u64,
}

fn default_true() -> bool { true }
fn default_fallback_chain() -> Vec<String> {
    KNOWN_BACKENDS.iter().map(|s| s.to_string()).collect()
}
fn default_circuit_breaker_threshold() -> u32 { 5 }
fn default_circuit_breaker_recovery_timeout_secs() -> f64 { 60.0 }
fn default_circuit_breaker_success_threshold() -> u32 { 3 }
fn default_circuit_breaker_failure_rate() -> f64 { 50.0 }
fn default_max_concurrent_ops() -> usize { 8 }
fn default_operation_timeout_secs() -> f64 { 10.0 }
fn default_batch_size() -> usize { 3 }
fn default_cache_ttl_secs() -> f64 { 180.0 } // 3 minutes
fn default_cache_max_entries() -> usize { 1000 }
fn default_health_check_interval_secs() -> u64 { 60 }
fn default_health_history_retention_hours() -> u64 { 24 }
fn default_health_error_rate_threshold() -> f64 { 0.05 }
fn default_health_circuit_breaker_threshold() -> u64 { 3 }
fn default_health_response_time_threshold_ms() -> f64 { 5000.0 }
fn default_sqlite_path() -> PathBuf { PathBuf::from("memory.db") }
fn default_busy_timeout_secs() -> u64 { 5 }
fn default_document_path() -> PathBuf { PathBuf::from("memory.json") }
fn default_document_query_cache_ttl_secs() -> u64 { 60 }
fn default_memory_max_entries() -> usize { 1000 }
fn default_memory_ttl_secs() -> u64 { 3600 }
fn default_memory_cleanup_interval_secs() -> u64 { 60 }
fn default_remote_host() -> String { "localhost".to_string() }
fn default_remote_port() -> u16 { 8002 }
fn default_remote_timeout_secs() -> u64 { 30 }
fn default_remote_max_retries() -> usize { 3 }
fn default_remote_retry_delay_ms() -> u64 { 1000 }
fn default_remote_health_cache_secs() -> u64 { 30 }

impl Default for MemoryServiceConfig {
    fn default() -> Self {
        Self {
            fallback_chain: default_fallback_chain(),
            sqlite: SqliteConfig::default(),
            document: DocumentConfig::default(),
            memory: InMemoryConfig::default(),
            remote: RemoteConfig::default(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_recovery_timeout_secs: default_circuit_breaker_recovery_timeout_secs(),
            circuit_breaker_success_threshold: default_circuit_breaker_success_threshold(),
            circuit_breaker_failure_rate: default_circuit_breaker_failure_rate(),
            max_concurrent_ops: default_max_concurrent_ops(),
            operation_timeout_secs: default_operation_timeout_secs(),
            batch_size: default_batch_size(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
            enable_cache: true,
            health_check_interval_secs: default_health_check_interval_secs(),
            health_history_retention_hours: default_health_history_retention_hours(),
            health_error_rate_threshold: default_health_error_rate_threshold(),
            health_circuit_breaker_threshold: default_health_circuit_breaker_threshold(),
            health_response_time_threshold_ms: default_health_response_time_threshold_ms(),
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_sqlite_path(),
            enable_fts: true,
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_document_path(),
            pretty: true,
            query_cache_ttl_secs: default_document_query_cache_ttl_secs(),
        }
    }
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_memory_max_entries(),
            enable_expiration: true,
            default_ttl_secs: default_memory_ttl_secs(),
            cleanup_interval_secs: default_memory_cleanup_interval_secs(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_remote_host(),
            port: default_remote_port(),
            api_key: None,
            timeout_secs: default_remote_timeout_secs(),
            max_retries: default_remote_max_retries(),
            retry_delay_ms: default_remote_retry_delay_ms(),
            health_cache_secs: default_remote_health_cache_secs(),
        }
    }
}

impl RemoteConfig {
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl MemoryServiceConfig {
    /// Deserialize from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self, MemoryError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| MemoryError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<(), MemoryError> {
        let invalid = |msg: String| Err(MemoryError::Configuration(msg));

        if self.fallback_chain.is_empty() {
            return invalid("fallback_chain must name at least one backend".into());
        }
        if let Some(unknown) = self
            .fallback_chain
            .iter()
            .find(|name| !KNOWN_BACKENDS.contains(&name.as_str()))
        {
            return invalid(format!("fallback_chain names unknown backend '{unknown}'"));
        }
        if !self.fallback_chain.iter().any(|name| self.is_enabled(name)) {
            return invalid("every backend in fallback_chain is disabled".into());
        }
        if self.max_concurrent_ops == 0 {
            return invalid("max_concurrent_ops must be greater than zero".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than zero".into());
        }
        if !(self.operation_timeout_secs > 0.0) {
            return invalid("operation_timeout_secs must be positive".into());
        }
        if !(self.cache_ttl_secs > 0.0) {
            return invalid("cache_ttl_secs must be positive".into());
        }
        if self.circuit_breaker_threshold == 0 || self.circuit_breaker_success_threshold == 0 {
            return invalid("circuit breaker thresholds must be greater than zero".into());
        }
        if !(self.circuit_breaker_recovery_timeout_secs >= 0.0) {
            return invalid("circuit_breaker_recovery_timeout_secs must not be negative".into());
        }
        if !(self.circuit_breaker_failure_rate > 0.0 && self.circuit_breaker_failure_rate <= 100.0) {
            return invalid("circuit_breaker_failure_rate must be within (0, 100]".into());
        }
        if self.memory.enabled && self.memory.max_entries == 0 {
            return invalid("memory.max_entries must be greater than zero".into());
        }
        if self.remote.enabled && self.remote.port == 0 {
            return invalid("remote.port must be non-zero".into());
        }
        if self.health_check_interval_secs == 0 {
            return invalid("health_check_interval_secs must be greater than zero".into());
        }
        Ok(())
    }

    /// Whether the named built-in backend is switched on.
    #[must_use]
    pub fn is_enabled(&self, backend: &str) -> bool {
        match backend {
            BACKEND_SQLITE => self.sqlite.enabled,
            BACKEND_DOCUMENT => self.document.enabled,
            BACKEND_MEMORY => self.memory.enabled,
            BACKEND_REMOTE => self.remote.enabled,
            _ => false,
        }
    }

    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_breaker_threshold,
            success_threshold: self.circuit_breaker_success_threshold,
            recovery_timeout: Duration::from_secs_f64(self.circuit_breaker_recovery_timeout_secs),
            failure_rate_threshold: self.circuit_breaker_failure_rate,
        }
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.operation_timeout_secs)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.cache_ttl_secs)
    }
}
