use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::MemoryError;
use crate::models::{MemoryCategory, MemoryItem, MemoryQuery, MemoryStats, MemoryUpdate, NewMemory};

/// Common contract implemented by every storage engine.
///
/// Every method is scoped by project. Implementations raise
/// [`MemoryError::Backend`] on I/O or protocol errors and never leave a
/// write partially applied.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Stable backend name, used as the fallback-chain key.
    fn name(&self) -> &str;

    /// Whether `similarity_threshold` on queries means anything here.
    fn supports_similarity_search(&self) -> bool {
        false
    }

    /// Capability flags for diagnostics.
    fn features(&self) -> BTreeMap<String, bool> {
        let mut features = BTreeMap::new();
        features.insert("similarity_search".to_string(), self.supports_similarity_search());
        features.insert("backup".to_string(), false);
        features
    }

    fn is_initialized(&self) -> bool;

    /// Set up schema/connection. Idempotent, and callable again after a failure.
    async fn initialize(&self) -> Result<(), MemoryError>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> bool;

    /// Store a new memory and return its id.
    async fn add_memory(&self, project: &str, memory: &NewMemory) -> Result<String, MemoryError>;

    async fn get_memory(&self, project: &str, id: &str) -> Result<Option<MemoryItem>, MemoryError>;

    /// Returns false when the id does not exist in the project.
    async fn update_memory(
        &self,
        project: &str,
        id: &str,
        update: &MemoryUpdate,
    ) -> Result<bool, MemoryError>;

    /// Returns false when the id does not exist in the project.
    async fn delete_memory(&self, project: &str, id: &str) -> Result<bool, MemoryError>;

    async fn search_memories(
        &self,
        project: &str,
        query: &MemoryQuery,
    ) -> Result<Vec<MemoryItem>, MemoryError>;

    /// Newest-first listing, optionally limited to one category.
    async fn get_project_memories(
        &self,
        project: &str,
        category: Option<MemoryCategory>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let mut query = MemoryQuery::new("").with_limit(limit);
        query.category = category;
        self.search_memories(project, &query).await
    }

    async fn get_memory_stats(&self, project: &str) -> Result<MemoryStats, MemoryError>;

    /// Distinct project names, sorted.
    async fn get_all_projects(&self) -> Result<Vec<String>, MemoryError>;

    /// Release connections and background tasks. Never fails.
    async fn cleanup(&self);

    /// Whole-store copy to `path`.
    async fn create_backup(&self, _path: &Path) -> Result<(), MemoryError> {
        Err(MemoryError::unsupported(self.name(), "create_backup"))
    }

    /// Replace the store with the copy at `path` and re-initialize.
    async fn restore_backup(&self, _path: &Path) -> Result<(), MemoryError> {
        Err(MemoryError::unsupported(self.name(), "restore_backup"))
    }
}
