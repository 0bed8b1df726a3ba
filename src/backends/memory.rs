//! In-process bounded backend with expiration.
//!
//! Holds memories in a `DashMap`, evicts the least recently used entry once
//! `max_entries` is reached and drops expired entries on access and on a
//! periodic sweep. Nothing survives a restart; this is the last resort in a
//! fallback chain.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::traits::MemoryBackend;
use super::sort_newest_first;
use crate::config::{InMemoryConfig, BACKEND_MEMORY};
use crate::error::MemoryError;
use crate::models::{MemoryItem, MemoryQuery, MemoryStats, MemoryUpdate, NewMemory};

/// Metadata key that overrides the default TTL (seconds) for one item.
pub const TTL_METADATA_KEY: &str = "ttl";

struct Entry {
    item: MemoryItem,
    expires_at: Option<Instant>,
    /// Logical clock value of the last access (LRU ordering)
    last_access: AtomicU64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

pub struct InMemoryBackend {
    config: InMemoryConfig,
    data: Arc<DashMap<String, Entry>>,
    clock: AtomicU64,
    /// Serializes inserts so eviction and insertion stay consistent
    write_lock: Mutex<()>,
    initialized: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    evictions: AtomicU64,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            config,
            data: Arc::new(DashMap::new()),
            clock: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            sweeper: Mutex::new(None),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get current item count (including not-yet-swept expired entries)
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Entries dropped to respect `max_entries`
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Clear all items
    pub fn clear(&self) {
        self.data.clear();
    }

    /// Remove expired entries now. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        purge_expired(&self.data)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn ttl_for(&self, memory: &NewMemory) -> Option<Duration> {
        if !self.config.enable_expiration {
            return None;
        }
        let override_secs = memory
            .metadata
            .get(TTL_METADATA_KEY)
            .and_then(|v| v.as_f64())
            .filter(|secs| *secs > 0.0);
        match override_secs {
            Some(secs) => Some(Duration::from_secs_f64(secs)),
            None if self.config.default_ttl_secs > 0 => {
                Some(Duration::from_secs(self.config.default_ttl_secs))
            }
            None => None,
        }
    }

    fn evict_lru(&self) {
        let victim = self
            .data
            .iter()
            .min_by_key(|entry| entry.value().last_access.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());
        if let Some(id) = victim {
            self.data.remove(&id);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_backend_evictions(BACKEND_MEMORY, 1);
            debug!(id = %id, "Evicted least recently used memory");
        }
    }

    /// Live items for a project, touching nothing.
    fn project_items(&self, project: &str) -> Vec<MemoryItem> {
        let now = Instant::now();
        self.data
            .iter()
            .filter(|entry| entry.item.project_name == project && !entry.is_expired(now))
            .map(|entry| entry.item.clone())
            .collect()
    }

    fn ensure_initialized(&self, operation: &str) -> Result<(), MemoryError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(MemoryError::backend(BACKEND_MEMORY, operation, "backend not initialized"))
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

fn purge_expired(data: &DashMap<String, Entry>) -> usize {
    let now = Instant::now();
    let before = data.len();
    data.retain(|_, entry| !entry.is_expired(now));
    before.saturating_sub(data.len())
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    fn name(&self) -> &str {
        BACKEND_MEMORY
    }

    fn features(&self) -> BTreeMap<String, bool> {
        let mut features = BTreeMap::new();
        features.insert("similarity_search".to_string(), false);
        features.insert("backup".to_string(), false);
        features.insert("persistent".to_string(), false);
        features.insert("expiration".to_string(), self.config.enable_expiration);
        features.insert("lru_eviction".to_string(), true);
        features
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    async fn initialize(&self) -> Result<(), MemoryError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.config.enable_expiration && self.config.cleanup_interval_secs > 0 {
            let data = Arc::clone(&self.data);
            let period = Duration::from_secs(self.config.cleanup_interval_secs);
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // first tick fires immediately
                loop {
                    interval.tick().await;
                    let removed = purge_expired(&data);
                    if removed > 0 {
                        debug!(removed, "Expired memories swept");
                    }
                }
            });
            if let Some(old) = self.sweeper.lock().replace(handle) {
                old.abort();
            }
        }
        self.initialized.store(true, Ordering::Release);
        info!(max_entries = self.config.max_entries, "In-memory backend initialized");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    async fn add_memory(&self, project: &str, memory: &NewMemory) -> Result<String, MemoryError> {
        self.ensure_initialized("add_memory")?;
        let id = Uuid::new_v4().to_string();
        let item = memory.clone().into_item(id.clone(), project, Utc::now());
        let expires_at = self.ttl_for(memory).map(|ttl| Instant::now() + ttl);

        let _guard = self.write_lock.lock();
        if self.data.len() >= self.config.max_entries {
            purge_expired(&self.data);
        }
        while !self.data.is_empty() && self.data.len() >= self.config.max_entries {
            self.evict_lru();
        }
        self.data.insert(
            id.clone(),
            Entry {
                item,
                expires_at,
                last_access: AtomicU64::new(self.tick()),
            },
        );
        Ok(id)
    }

    async fn get_memory(&self, project: &str, id: &str) -> Result<Option<MemoryItem>, MemoryError> {
        self.ensure_initialized("get_memory")?;
        let now = Instant::now();
        let expired = match self.data.get(id) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) if entry.item.project_name == project => {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                return Ok(Some(entry.item.clone()));
            }
            _ => false,
        };
        if expired {
            self.data.remove(id);
        }
        Ok(None)
    }

    async fn update_memory(
        &self,
        project: &str,
        id: &str,
        update: &MemoryUpdate,
    ) -> Result<bool, MemoryError> {
        self.ensure_initialized("update_memory")?;
        let now = Instant::now();
        match self.data.get_mut(id) {
            Some(mut entry) if entry.item.project_name == project && !entry.is_expired(now) => {
                update.apply(&mut entry.item, Utc::now());
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_memory(&self, project: &str, id: &str) -> Result<bool, MemoryError> {
        self.ensure_initialized("delete_memory")?;
        Ok(self
            .data
            .remove_if(id, |_, entry| entry.item.project_name == project)
            .is_some())
    }

    async fn search_memories(
        &self,
        project: &str,
        query: &MemoryQuery,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        self.ensure_initialized("search_memories")?;
        let mut matches: Vec<MemoryItem> = self
            .project_items(project)
            .into_iter()
            .filter(|item| query.matches(item))
            .collect();
        sort_newest_first(&mut matches);
        let page = query.paginate(matches);
        for item in &page {
            if let Some(entry) = self.data.get(&item.id) {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
            }
        }
        Ok(page)
    }

    async fn get_memory_stats(&self, project: &str) -> Result<MemoryStats, MemoryError> {
        self.ensure_initialized("get_memory_stats")?;
        let items = self.project_items(project);
        Ok(MemoryStats::from_items(project, BACKEND_MEMORY, &items)
            .with_detail("max_entries", self.config.max_entries as u64)
            .with_detail("entries", self.data.len() as u64)
            .with_detail("evictions", self.evictions()))
    }

    async fn get_all_projects(&self) -> Result<Vec<String>, MemoryError> {
        self.ensure_initialized("get_all_projects")?;
        let now = Instant::now();
        let mut projects: Vec<String> = self
            .data
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.item.project_name.clone())
            .collect();
        projects.sort();
        projects.dedup();
        Ok(projects)
    }

    async fn cleanup(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.data.clear();
        self.initialized.store(false, Ordering::Release);
        info!("In-memory backend cleaned up");
    }
}

impl Drop for InMemoryBackend {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemoryCategory;
    use serde_json::json;

    async fn backend_with(config: InMemoryConfig) -> InMemoryBackend {
        let backend = InMemoryBackend::new(config);
        backend.initialize().await.unwrap();
        backend
    }

    fn note(content: &str) -> NewMemory {
        NewMemory::new(content, MemoryCategory::Project)
    }

    #[tokio::test]
    async fn test_new_backend_is_empty() {
        let backend = InMemoryBackend::default();
        assert!(backend.is_empty());
        assert!(!backend.is_initialized());
        assert!(!backend.health_check().await);
    }

    #[tokio::test]
    async fn test_operations_before_initialize_fail() {
        let backend = InMemoryBackend::default();
        let err = backend.add_memory("p1", &note("x")).await.unwrap_err();
        assert!(err.is_backend_failure());
    }

    #[tokio::test]
    async fn test_add_and_get_roundtrip() {
        let backend = backend_with(InMemoryConfig::default()).await;
        let mut metadata = crate::models::Metadata::new();
        metadata.insert("source".into(), json!("review"));
        let memory = NewMemory::new("Prefer small PRs", MemoryCategory::Team)
            .with_tags(["process"])
            .with_metadata(metadata.clone());

        let id = backend.add_memory("p1", &memory).await.unwrap();
        let item = backend.get_memory("p1", &id).await.unwrap().unwrap();
        assert_eq!(item.content, "Prefer small PRs");
        assert_eq!(item.category, MemoryCategory::Team);
        assert_eq!(item.tags, vec!["process"]);
        assert_eq!(item.metadata, metadata);

        // Project scoping is a hard filter
        assert!(backend.get_memory("p2", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let backend = backend_with(InMemoryConfig::default()).await;
        let id = backend.add_memory("p1", &note("to delete")).await.unwrap();
        assert!(!backend.delete_memory("p2", &id).await.unwrap());
        assert!(backend.delete_memory("p1", &id).await.unwrap());
        assert!(backend.get_memory("p1", &id).await.unwrap().is_none());
        assert!(!backend.delete_memory("p1", &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_recently_used() {
        let backend = backend_with(InMemoryConfig {
            max_entries: 2,
            ..Default::default()
        })
        .await;
        let first = backend.add_memory("p1", &note("first")).await.unwrap();
        let second = backend.add_memory("p1", &note("second")).await.unwrap();

        // Touch `first` so `second` becomes least recently used
        backend.get_memory("p1", &first).await.unwrap();
        let third = backend.add_memory("p1", &note("third")).await.unwrap();

        assert_eq!(backend.len(), 2);
        assert!(backend.get_memory("p1", &first).await.unwrap().is_some());
        assert!(backend.get_memory("p1", &second).await.unwrap().is_none());
        assert!(backend.get_memory("p1", &third).await.unwrap().is_some());
        assert_eq!(backend.evictions(), 1);
    }

    #[tokio::test]
    async fn test_per_item_ttl_expires() {
        let backend = backend_with(InMemoryConfig::default()).await;
        let mut metadata = crate::models::Metadata::new();
        metadata.insert(TTL_METADATA_KEY.into(), json!(0.05));
        let id = backend
            .add_memory("p1", &note("short lived").with_metadata(metadata))
            .await
            .unwrap();
        let keeper = backend.add_memory("p1", &note("default ttl")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(backend.get_memory("p1", &id).await.unwrap().is_none());
        assert!(backend.get_memory("p1", &keeper).await.unwrap().is_some());
        assert_eq!(backend.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_search_filters_and_orders_newest_first() {
        let backend = backend_with(InMemoryConfig::default()).await;
        backend
            .add_memory("p1", &NewMemory::new("pattern one", MemoryCategory::Pattern).with_tags(["Rust"]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        backend
            .add_memory("p1", &NewMemory::new("pattern two", MemoryCategory::Pattern))
            .await
            .unwrap();
        backend
            .add_memory("p1", &NewMemory::new("an error", MemoryCategory::Error))
            .await
            .unwrap();
        backend
            .add_memory("p2", &NewMemory::new("pattern elsewhere", MemoryCategory::Pattern))
            .await
            .unwrap();

        let query = MemoryQuery::new("pattern").with_category(MemoryCategory::Pattern);
        let results = backend.search_memories("p1", &query).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, "pattern two");

        let tagged = backend
            .search_memories("p1", &MemoryQuery::new("").with_tags(["rust"]))
            .await
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].content, "pattern one");
    }

    #[tokio::test]
    async fn test_update_and_stats() {
        let backend = backend_with(InMemoryConfig::default()).await;
        let id = backend.add_memory("p1", &note("draft")).await.unwrap();
        backend.add_memory("p1", &NewMemory::new("bug", MemoryCategory::Error)).await.unwrap();

        let updated = backend
            .update_memory("p1", &id, &MemoryUpdate::new().content("final"))
            .await
            .unwrap();
        assert!(updated);
        assert!(!backend
            .update_memory("p1", "missing", &MemoryUpdate::new().content("x"))
            .await
            .unwrap());
        assert_eq!(backend.get_memory("p1", &id).await.unwrap().unwrap().content, "final");

        let stats = backend.get_memory_stats("p1").await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.categories.get("error"), Some(&1));
        assert_eq!(stats.backend, "memory");
        assert_eq!(backend.get_all_projects().await.unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_backup_is_unsupported() {
        let backend = backend_with(InMemoryConfig::default()).await;
        let err = backend
            .create_backup(std::path::Path::new("/tmp/never"))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_releases_state() {
        let backend = backend_with(InMemoryConfig::default()).await;
        backend.add_memory("p1", &note("x")).await.unwrap();
        backend.cleanup().await;
        assert!(backend.is_empty());
        assert!(!backend.health_check().await);
        // Re-initialize after cleanup
        backend.initialize().await.unwrap();
        assert!(backend.health_check().await);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let backend = Arc::new(backend_with(InMemoryConfig::default()).await);
        let mut handles = vec![];

        for batch in 0..10 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    backend
                        .add_memory("p1", &note(&format!("batch-{batch}-item-{i}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(backend.len(), 100);
    }
}
