//! Storage backends implementing the [`MemoryBackend`] contract.
//!
//! | Backend | Persistence | Search |
//! |---------|-------------|--------|
//! | [`SqliteBackend`] | single SQLite file | FTS5 ranked, LIKE fallback |
//! | [`DocumentBackend`] | single JSON collection file | substring |
//! | [`InMemoryBackend`] | none (TTL + LRU) | substring |
//! | [`RemoteBackend`] | behind an HTTP API | remote semantic |

pub mod traits;
pub mod memory;
pub mod sqlite;
pub mod document;
pub mod remote;

pub use traits::MemoryBackend;
pub use memory::InMemoryBackend;
pub use sqlite::SqliteBackend;
pub use document::DocumentBackend;
pub use remote::RemoteBackend;

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{
    MemoryServiceConfig, BACKEND_DOCUMENT, BACKEND_MEMORY, BACKEND_REMOTE, BACKEND_SQLITE,
};
use crate::error::MemoryError;
use crate::models::MemoryItem;

/// Order by `created_at` descending. Stable, so equal timestamps keep input order.
pub(crate) fn sort_newest_first(items: &mut [MemoryItem]) {
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// Build the enabled backends named in the fallback chain, in chain order.
///
/// Construction is cheap and performs no I/O; connections are opened by
/// [`MemoryBackend::initialize`].
pub fn build_backends(
    config: &MemoryServiceConfig,
) -> Result<Vec<Arc<dyn MemoryBackend>>, MemoryError> {
    let mut backends: Vec<Arc<dyn MemoryBackend>> = Vec::new();
    for name in &config.fallback_chain {
        if !config.is_enabled(name) {
            debug!(backend = %name, "Backend disabled, skipping");
            continue;
        }
        if backends.iter().any(|b| b.name() == name) {
            warn!(backend = %name, "Backend listed twice in fallback chain");
            continue;
        }
        let backend: Arc<dyn MemoryBackend> = match name.as_str() {
            BACKEND_SQLITE => Arc::new(SqliteBackend::new(config.sqlite.clone())),
            BACKEND_DOCUMENT => Arc::new(DocumentBackend::new(config.document.clone())),
            BACKEND_MEMORY => Arc::new(InMemoryBackend::new(config.memory.clone())),
            BACKEND_REMOTE => Arc::new(RemoteBackend::new(config.remote.clone())?),
            other => return Err(MemoryError::UnknownBackend(other.to_string())),
        };
        backends.push(backend);
    }
    if backends.is_empty() {
        return Err(MemoryError::Configuration(
            "no enabled backend in fallback_chain".to_string(),
        ));
    }
    Ok(backends)
}
