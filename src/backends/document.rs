//! Embedded document backend: one JSON collection file.
//!
//! The whole collection is held in memory and rewritten on every mutation
//! through a temp file + rename, so the file on disk is always a complete
//! document. Searches are cached per `(project, query)` for
//! `query_cache_ttl_secs`; any write to a project drops that project's
//! cached results.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sort_newest_first;
use super::traits::MemoryBackend;
use crate::config::{DocumentConfig, BACKEND_DOCUMENT};
use crate::error::MemoryError;
use crate::models::{MemoryItem, MemoryQuery, MemoryStats, MemoryUpdate, NewMemory};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Collection {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    memories: Vec<MemoryItem>,
}

struct CachedQuery {
    project: String,
    stored_at: Instant,
    items: Vec<MemoryItem>,
}

pub struct DocumentBackend {
    config: DocumentConfig,
    collection: RwLock<Option<Collection>>,
    initialized: AtomicBool,
    query_cache: DashMap<String, CachedQuery>,
}

fn doc_error(operation: &str, err: impl std::fmt::Display) -> MemoryError {
    MemoryError::backend(BACKEND_DOCUMENT, operation, err)
}

impl DocumentBackend {
    #[must_use]
    pub fn new(config: DocumentConfig) -> Self {
        Self {
            config,
            collection: RwLock::new(None),
            initialized: AtomicBool::new(false),
            query_cache: DashMap::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of cached query results (live or not yet pruned).
    #[must_use]
    pub fn cached_queries(&self) -> usize {
        self.query_cache.len()
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.config.query_cache_ttl_secs)
    }

    fn cache_key(project: &str, query: &MemoryQuery) -> Option<String> {
        // Age windows are relative to "now", so their results go stale on their own
        if query.has_age_window() {
            return None;
        }
        serde_json::to_string(query)
            .ok()
            .map(|encoded| format!("{project}\u{1f}{encoded}"))
    }

    fn cached(&self, key: &str) -> Option<Vec<MemoryItem>> {
        let entry = self.query_cache.get(key)?;
        if entry.stored_at.elapsed() < self.cache_ttl() {
            Some(entry.items.clone())
        } else {
            None
        }
    }

    fn store_cached(&self, key: String, project: &str, items: &[MemoryItem]) {
        let ttl = self.cache_ttl();
        if ttl.is_zero() {
            return;
        }
        self.query_cache.retain(|_, cached| cached.stored_at.elapsed() < ttl);
        self.query_cache.insert(
            key,
            CachedQuery {
                project: project.to_string(),
                stored_at: Instant::now(),
                items: items.to_vec(),
            },
        );
    }

    fn invalidate_project(&self, project: &str) {
        self.query_cache.retain(|_, cached| cached.project != project);
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.config.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    fn encode(&self, collection: &Collection) -> Result<Vec<u8>, serde_json::Error> {
        if self.config.pretty {
            serde_json::to_vec_pretty(collection)
        } else {
            serde_json::to_vec(collection)
        }
    }

    /// Write the full collection via temp file + rename.
    async fn persist(&self, operation: &str, collection: &Collection) -> Result<(), MemoryError> {
        let bytes = self.encode(collection).map_err(|e| doc_error(operation, e))?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| doc_error(operation, e))?;
        tokio::fs::rename(&tmp, &self.config.path)
            .await
            .map_err(|e| doc_error(operation, e))?;
        Ok(())
    }

    async fn load(path: &Path) -> Result<Collection, String> {
        let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Collection {
                version: FORMAT_VERSION,
                memories: Vec::new(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| format!("corrupt document file: {e}"))
    }

    /// Run `mutate` on a copy of the collection, persist it, then publish it.
    /// A failed write leaves both the file and the in-memory state untouched.
    async fn write_with<T>(
        &self,
        operation: &str,
        project: &str,
        mutate: impl FnOnce(&mut Collection) -> Option<T>,
    ) -> Result<Option<T>, MemoryError> {
        let mut guard = self.collection.write().await;
        let current = guard
            .as_ref()
            .ok_or_else(|| doc_error(operation, "backend not initialized"))?;
        let mut next = current.clone();
        let Some(result) = mutate(&mut next) else {
            return Ok(None);
        };
        self.persist(operation, &next).await?;
        *guard = Some(next);
        drop(guard);
        self.invalidate_project(project);
        Ok(Some(result))
    }

    async fn project_items(&self, operation: &str, project: &str) -> Result<Vec<MemoryItem>, MemoryError> {
        let guard = self.collection.read().await;
        let collection = guard
            .as_ref()
            .ok_or_else(|| doc_error(operation, "backend not initialized"))?;
        Ok(collection
            .memories
            .iter()
            .filter(|item| item.project_name == project)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MemoryBackend for DocumentBackend {
    fn name(&self) -> &str {
        BACKEND_DOCUMENT
    }

    fn features(&self) -> BTreeMap<String, bool> {
        let mut features = BTreeMap::new();
        features.insert("similarity_search".to_string(), false);
        features.insert("backup".to_string(), true);
        features.insert("persistent".to_string(), true);
        features.insert("query_cache".to_string(), self.config.query_cache_ttl_secs > 0);
        features
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[tracing::instrument(skip(self), fields(path = %self.config.path.display()))]
    async fn initialize(&self) -> Result<(), MemoryError> {
        let mut guard = self.collection.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let path = &self.config.path;
        let collection = if tokio::fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path)
                .await
                .map_err(|e| MemoryError::initialization(BACKEND_DOCUMENT, e))?
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| MemoryError::initialization(BACKEND_DOCUMENT, e))?;
                }
            }
            let empty = Collection {
                version: FORMAT_VERSION,
                memories: Vec::new(),
            };
            self.persist("initialize", &empty)
                .await
                .map_err(|e| MemoryError::initialization(BACKEND_DOCUMENT, e))?;
            empty
        };

        info!(memories = collection.memories.len(), "Document backend initialized");
        *guard = Some(collection);
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let ready = self.collection.read().await.is_some();
        ready && tokio::fs::try_exists(&self.config.path).await.unwrap_or(false)
    }

    async fn add_memory(&self, project: &str, memory: &NewMemory) -> Result<String, MemoryError> {
        let id = Uuid::new_v4().to_string();
        let item = memory.clone().into_item(id.clone(), project, Utc::now());
        self.write_with("add_memory", project, |collection| {
            collection.memories.push(item);
            Some(())
        })
        .await?;
        debug!(id = %id, project = %project, "Memory stored");
        Ok(id)
    }

    async fn get_memory(&self, project: &str, id: &str) -> Result<Option<MemoryItem>, MemoryError> {
        let guard = self.collection.read().await;
        let collection = guard
            .as_ref()
            .ok_or_else(|| doc_error("get_memory", "backend not initialized"))?;
        Ok(collection
            .memories
            .iter()
            .find(|item| item.id == id && item.project_name == project)
            .cloned())
    }

    async fn update_memory(
        &self,
        project: &str,
        id: &str,
        update: &MemoryUpdate,
    ) -> Result<bool, MemoryError> {
        let now = Utc::now();
        let updated = self
            .write_with("update_memory", project, |collection| {
                let item = collection
                    .memories
                    .iter_mut()
                    .find(|item| item.id == id && item.project_name == project)?;
                update.apply(item, now);
                Some(())
            })
            .await?;
        Ok(updated.is_some())
    }

    async fn delete_memory(&self, project: &str, id: &str) -> Result<bool, MemoryError> {
        let deleted = self
            .write_with("delete_memory", project, |collection| {
                let index = collection
                    .memories
                    .iter()
                    .position(|item| item.id == id && item.project_name == project)?;
                collection.memories.remove(index);
                Some(())
            })
            .await?;
        Ok(deleted.is_some())
    }

    async fn search_memories(
        &self,
        project: &str,
        query: &MemoryQuery,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let key = Self::cache_key(project, query);
        if let Some(hit) = key.as_deref().and_then(|k| self.cached(k)) {
            return Ok(hit);
        }

        // Cache under the read lock so a concurrent write's invalidation
        // always lands after the insert
        let guard = self.collection.read().await;
        let collection = guard
            .as_ref()
            .ok_or_else(|| doc_error("search_memories", "backend not initialized"))?;
        let mut matches: Vec<MemoryItem> = collection
            .memories
            .iter()
            .filter(|item| item.project_name == project && query.matches(item))
            .cloned()
            .collect();
        sort_newest_first(&mut matches);
        let page = query.paginate(matches);

        if let Some(key) = key {
            self.store_cached(key, project, &page);
        }
        drop(guard);
        Ok(page)
    }

    async fn get_memory_stats(&self, project: &str) -> Result<MemoryStats, MemoryError> {
        let items = self.project_items("get_memory_stats", project).await?;
        Ok(MemoryStats::from_items(project, BACKEND_DOCUMENT, &items)
            .with_detail("database_path", self.config.path.display().to_string())
            .with_detail("cached_queries", self.cached_queries() as u64))
    }

    async fn get_all_projects(&self) -> Result<Vec<String>, MemoryError> {
        let guard = self.collection.read().await;
        let collection = guard
            .as_ref()
            .ok_or_else(|| doc_error("get_all_projects", "backend not initialized"))?;
        let mut projects: Vec<String> = collection
            .memories
            .iter()
            .map(|item| item.project_name.clone())
            .collect();
        projects.sort();
        projects.dedup();
        Ok(projects)
    }

    async fn cleanup(&self) {
        let mut guard = self.collection.write().await;
        self.initialized.store(false, Ordering::Release);
        *guard = None;
        drop(guard);
        self.query_cache.clear();
        info!("Document backend closed");
    }

    async fn create_backup(&self, path: &Path) -> Result<(), MemoryError> {
        // Hold the read lock so no write lands mid-copy
        let _guard = self.collection.read().await;
        if !tokio::fs::try_exists(&self.config.path).await.unwrap_or(false) {
            return Err(doc_error(
                "create_backup",
                format!("document file not found: {}", self.config.path.display()),
            ));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| doc_error("create_backup", e))?;
            }
        }
        tokio::fs::copy(&self.config.path, path)
            .await
            .map_err(|e| doc_error("create_backup", e))?;
        info!(backup = %path.display(), "Document backup created");
        Ok(())
    }

    async fn restore_backup(&self, path: &Path) -> Result<(), MemoryError> {
        // Validate before touching the live file
        let restored = Self::load(path)
            .await
            .map_err(|e| doc_error("restore_backup", e))?;

        let mut guard = self.collection.write().await;
        self.persist("restore_backup", &restored).await?;
        let count = restored.memories.len();
        *guard = Some(restored);
        drop(guard);
        self.query_cache.clear();

        if count == 0 {
            warn!(backup = %path.display(), "Restored an empty document collection");
        }
        info!(backup = %path.display(), memories = count, "Document collection restored");
        Ok(())
    }
}
