//! Error taxonomy shared by backends, the orchestrator and the optimizer.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemoryError {
    /// An operation failed inside a specific backend.
    #[error("backend '{backend}' failed during {operation}: {message}")]
    Backend {
        backend: String,
        operation: String,
        message: String,
    },

    /// Setup, schema or connection failure while initializing a backend.
    #[error("backend '{backend}' failed to initialize: {message}")]
    Initialization { backend: String, message: String },

    /// The backend's circuit breaker is open; no I/O was attempted.
    #[error("circuit breaker open for backend '{backend}'")]
    CircuitOpen { backend: String },

    /// Every backend in the fallback chain failed to initialize.
    #[error("no memory backend available (attempted: {})", attempted.join(", "))]
    NotAvailable { attempted: Vec<String> },

    /// The operation exceeded its deadline and was cancelled.
    #[error("operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("memory service is not initialized")]
    NotInitialized,

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("backend '{backend}' does not support {operation}")]
    Unsupported { backend: String, operation: String },
}

impl MemoryError {
    /// Wrap any displayable cause as a backend failure.
    pub fn backend(
        backend: impl Into<String>,
        operation: impl Into<String>,
        cause: impl std::fmt::Display,
    ) -> Self {
        Self::Backend {
            backend: backend.into(),
            operation: operation.into(),
            message: cause.to_string(),
        }
    }

    pub fn initialization(backend: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Initialization {
            backend: backend.into(),
            message: cause.to_string(),
        }
    }

    pub fn unsupported(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            backend: backend.into(),
            operation: operation.into(),
        }
    }

    /// Whether this error counts against a backend's circuit breaker.
    ///
    /// Caller mistakes (bad config, unsupported ops) say nothing about the
    /// health of the backend and are excluded.
    #[must_use]
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::Backend { .. } | Self::Initialization { .. } | Self::Timeout { .. }
        )
    }

    /// Whether the orchestrator may try another backend after this error.
    #[must_use]
    pub fn is_failover_candidate(&self) -> bool {
        self.is_backend_failure() || matches!(self, Self::CircuitOpen { .. })
    }

    /// Short label used for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backend { .. } => "backend",
            Self::Initialization { .. } => "initialization",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NotAvailable { .. } => "not_available",
            Self::Timeout { .. } => "timeout",
            Self::Configuration(_) => "configuration",
            Self::NotInitialized => "not_initialized",
            Self::UnknownBackend(_) => "unknown_backend",
            Self::Unsupported { .. } => "unsupported",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display() {
        let err = MemoryError::backend("sqlite", "add_memory", "disk full");
        assert_eq!(
            err.to_string(),
            "backend 'sqlite' failed during add_memory: disk full"
        );
        assert!(err.is_backend_failure());
        assert_eq!(err.kind(), "backend");
    }

    #[test]
    fn test_not_available_lists_attempts() {
        let err = MemoryError::NotAvailable {
            attempted: vec!["remote".into(), "sqlite".into()],
        };
        assert_eq!(
            err.to_string(),
            "no memory backend available (attempted: remote, sqlite)"
        );
    }

    #[test]
    fn test_classification() {
        let open = MemoryError::CircuitOpen { backend: "a".into() };
        assert!(!open.is_backend_failure());
        assert!(open.is_failover_candidate());

        let timeout = MemoryError::Timeout {
            operation: "search_memories".into(),
            timeout: Duration::from_millis(50),
        };
        assert!(timeout.is_backend_failure());

        let config = MemoryError::Configuration("bad".into());
        assert!(!config.is_failover_candidate());
        assert!(!MemoryError::unsupported("memory", "create_backup").is_failover_candidate());
    }
}
