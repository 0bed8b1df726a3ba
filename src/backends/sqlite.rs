// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Embedded relational backend (SQLite).
//!
//! One database file, one connection (I/O against the file is serialized):
//!
//! ```sql
//! CREATE TABLE memories (
//!   id TEXT PRIMARY KEY,
//!   project_name TEXT NOT NULL,
//!   content TEXT NOT NULL,
//!   category TEXT NOT NULL,
//!   tags TEXT NOT NULL,       -- JSON array
//!   metadata TEXT NOT NULL,   -- JSON object
//!   created_at TEXT NOT NULL, -- RFC 3339, fixed width (sorts as text)
//!   updated_at TEXT NOT NULL
//! )
//! ```
//!
//! ## Full-text search
//!
//! When enabled, an external-content FTS5 table `memories_fts(content, tags)`
//! shadows `memories` and is kept in sync by insert/update/delete triggers.
//! Text queries then rank by `bm25`. If the SQLite build lacks FTS5 the
//! backend logs a warning and falls back to `LIKE` matching ordered by
//! `created_at DESC`.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::traits::MemoryBackend;
use crate::config::{SqliteConfig, BACKEND_SQLITE};
use crate::error::MemoryError;
use crate::models::{
    format_timestamp, parse_timestamp, MemoryCategory, MemoryItem, MemoryQuery, MemoryStats,
    MemoryUpdate, Metadata, NewMemory,
};
use crate::resilience::retry::{retry, RetryConfig};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS memories (
        id TEXT PRIMARY KEY,
        project_name TEXT NOT NULL,
        content TEXT NOT NULL,
        category TEXT NOT NULL,
        tags TEXT NOT NULL DEFAULT '[]',
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_memories_project ON memories(project_name)",
    "CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category)",
    "CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_memories_project_category ON memories(project_name, category)",
    r#"
    CREATE TABLE IF NOT EXISTS schema_info (
        version INTEGER PRIMARY KEY,
        applied_at TEXT NOT NULL
    )
    "#,
];

const FTS_SCHEMA: &[&str] = &[
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
        content, tags, content='memories', content_rowid='rowid'
    )
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS memories_fts_insert AFTER INSERT ON memories BEGIN
        INSERT INTO memories_fts(rowid, content, tags) VALUES (new.rowid, new.content, new.tags);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS memories_fts_delete AFTER DELETE ON memories BEGIN
        INSERT INTO memories_fts(memories_fts, rowid, content, tags)
        VALUES ('delete', old.rowid, old.content, old.tags);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS memories_fts_update AFTER UPDATE ON memories BEGIN
        INSERT INTO memories_fts(memories_fts, rowid, content, tags)
        VALUES ('delete', old.rowid, old.content, old.tags);
        INSERT INTO memories_fts(rowid, content, tags) VALUES (new.rowid, new.content, new.tags);
    END
    "#,
];

fn db_error(operation: &str, err: impl std::fmt::Display) -> MemoryError {
    MemoryError::backend(BACKEND_SQLITE, operation, err)
}

pub struct SqliteBackend {
    config: SqliteConfig,
    pool: RwLock<Option<SqlitePool>>,
    fts_enabled: AtomicBool,
    /// Serializes initialize/restore so the pool is opened once
    init_lock: tokio::sync::Mutex<()>,
}

impl SqliteBackend {
    #[must_use]
    pub fn new(config: SqliteConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
            fts_enabled: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Whether ranked full-text search is active.
    #[must_use]
    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled.load(Ordering::Acquire)
    }

    fn pool(&self, operation: &str) -> Result<SqlitePool, MemoryError> {
        self.pool
            .read()
            .clone()
            .ok_or_else(|| db_error(operation, "database not initialized"))
    }

    async fn open(&self) -> Result<SqlitePool, MemoryError> {
        if let Some(parent) = self.config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| MemoryError::initialization(BACKEND_SQLITE, e))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.config.path)
            .create_if_missing(true)
            // WAL: readers don't block the writer, single fsync per commit
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(self.config.busy_timeout_secs));

        retry("sqlite_connect", &RetryConfig::startup(), || async {
            SqlitePoolOptions::new()
                .max_connections(1)
                .acquire_timeout(Duration::from_secs(10))
                .connect_with(options.clone())
                .await
                .map_err(|e| MemoryError::initialization(BACKEND_SQLITE, e))
        })
        .await
    }

    async fn init_schema(&self, pool: &SqlitePool) -> Result<(), MemoryError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| MemoryError::initialization(BACKEND_SQLITE, e))?;
        }
        sqlx::query("INSERT OR IGNORE INTO schema_info (version, applied_at) VALUES (?, ?)")
            .bind(SCHEMA_VERSION)
            .bind(format_timestamp(&Utc::now()))
            .execute(pool)
            .await
            .map_err(|e| MemoryError::initialization(BACKEND_SQLITE, e))?;

        let fts = self.config.enable_fts && self.init_fts(pool).await;
        self.fts_enabled.store(fts, Ordering::Release);
        Ok(())
    }

    /// Create the FTS5 shadow table. Returns false if FTS5 is unavailable.
    async fn init_fts(&self, pool: &SqlitePool) -> bool {
        let existed = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'memories_fts'",
        )
        .fetch_optional(pool)
        .await
        .map(|row| row.is_some())
        .unwrap_or(false);

        for statement in FTS_SCHEMA {
            if let Err(e) = sqlx::query(statement).execute(pool).await {
                warn!(error = %e, "FTS5 unavailable, falling back to LIKE search");
                return false;
            }
        }

        // Index rows that were written before the shadow table existed
        if !existed {
            if let Err(e) = sqlx::query("INSERT INTO memories_fts(memories_fts) VALUES ('rebuild')")
                .execute(pool)
                .await
            {
                warn!(error = %e, "FTS5 rebuild failed, falling back to LIKE search");
                return false;
            }
        }
        true
    }

    fn row_to_item(row: &SqliteRow) -> Result<MemoryItem, MemoryError> {
        let text = |col: &str| -> Result<String, MemoryError> {
            row.try_get::<String, _>(col).map_err(|e| db_error("decode", e))
        };
        let timestamp = |col: &str| -> Result<chrono::DateTime<Utc>, MemoryError> {
            let raw = text(col)?;
            parse_timestamp(&raw)
                .ok_or_else(|| db_error("decode", format!("invalid {col} '{raw}'")))
        };

        let tags: Vec<String> =
            serde_json::from_str(&text("tags")?).map_err(|e| db_error("decode", e))?;
        let metadata: Metadata =
            serde_json::from_str(&text("metadata")?).map_err(|e| db_error("decode", e))?;

        Ok(MemoryItem {
            id: text("id")?,
            project_name: text("project_name")?,
            content: text("content")?,
            category: MemoryCategory::parse(&text("category")?),
            tags,
            metadata,
            created_at: timestamp("created_at")?,
            updated_at: timestamp("updated_at")?,
        })
    }

    fn encode_json<T: serde::Serialize>(operation: &str, value: &T) -> Result<String, MemoryError> {
        serde_json::to_string(value).map_err(|e| db_error(operation, e))
    }
}

/// Quote each whitespace-separated term as an FTS5 prefix query, ANDed.
fn fts_expression(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split_whitespace()
        .map(|term| format!("\"{}\"*", term.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// `%text%` with LIKE wildcards escaped (ESCAPE '\').
fn like_pattern(text: &str) -> String {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[async_trait]
impl MemoryBackend for SqliteBackend {
    fn name(&self) -> &str {
        BACKEND_SQLITE
    }

    fn features(&self) -> BTreeMap<String, bool> {
        let mut features = BTreeMap::new();
        features.insert("similarity_search".to_string(), false);
        features.insert("full_text_search".to_string(), self.fts_enabled());
        features.insert("backup".to_string(), true);
        features.insert("persistent".to_string(), true);
        features.insert("transactions".to_string(), true);
        features
    }

    fn is_initialized(&self) -> bool {
        self.pool.read().is_some()
    }

    #[tracing::instrument(skip(self), fields(path = %self.config.path.display()))]
    async fn initialize(&self) -> Result<(), MemoryError> {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        let pool = self.open().await?;
        if let Err(e) = self.init_schema(&pool).await {
            pool.close().await;
            return Err(e);
        }
        *self.pool.write() = Some(pool);

        info!(fts = self.fts_enabled(), "SQLite backend initialized");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let Ok(pool) = self.pool("health_check") else {
            return false;
        };
        match sqlx::query("SELECT 1").fetch_one(&pool).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "SQLite health check failed");
                false
            }
        }
    }

    async fn add_memory(&self, project: &str, memory: &NewMemory) -> Result<String, MemoryError> {
        let pool = self.pool("add_memory")?;
        let id = Uuid::new_v4().to_string();
        let now = format_timestamp(&Utc::now());

        sqlx::query(
            "INSERT INTO memories (id, project_name, content, category, tags, metadata, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(project)
        .bind(&memory.content)
        .bind(memory.category.as_str())
        .bind(Self::encode_json("add_memory", &memory.tags)?)
        .bind(Self::encode_json("add_memory", &memory.metadata)?)
        .bind(&now)
        .bind(&now)
        .execute(&pool)
        .await
        .map_err(|e| db_error("add_memory", e))?;

        debug!(id = %id, project = %project, "Memory stored");
        Ok(id)
    }

    async fn get_memory(&self, project: &str, id: &str) -> Result<Option<MemoryItem>, MemoryError> {
        let pool = self.pool("get_memory")?;
        let row = sqlx::query("SELECT * FROM memories WHERE id = ? AND project_name = ?")
            .bind(id)
            .bind(project)
            .fetch_optional(&pool)
            .await
            .map_err(|e| db_error("get_memory", e))?;
        row.as_ref().map(Self::row_to_item).transpose()
    }

    async fn update_memory(
        &self,
        project: &str,
        id: &str,
        update: &MemoryUpdate,
    ) -> Result<bool, MemoryError> {
        let pool = self.pool("update_memory")?;
        let mut tx = pool.begin().await.map_err(|e| db_error("update_memory", e))?;

        let row = sqlx::query("SELECT * FROM memories WHERE id = ? AND project_name = ?")
            .bind(id)
            .bind(project)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("update_memory", e))?;
        let Some(row) = row else {
            return Ok(false);
        };

        let mut item = Self::row_to_item(&row)?;
        update.apply(&mut item, Utc::now());

        sqlx::query(
            "UPDATE memories SET content = ?, category = ?, tags = ?, metadata = ?, updated_at = ? \
             WHERE id = ? AND project_name = ?",
        )
        .bind(&item.content)
        .bind(item.category.as_str())
        .bind(Self::encode_json("update_memory", &item.tags)?)
        .bind(Self::encode_json("update_memory", &item.metadata)?)
        .bind(format_timestamp(&item.updated_at))
        .bind(id)
        .bind(project)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("update_memory", e))?;

        tx.commit().await.map_err(|e| db_error("update_memory", e))?;
        Ok(true)
    }

    async fn delete_memory(&self, project: &str, id: &str) -> Result<bool, MemoryError> {
        let pool = self.pool("delete_memory")?;
        let result = sqlx::query("DELETE FROM memories WHERE id = ? AND project_name = ?")
            .bind(id)
            .bind(project)
            .execute(&pool)
            .await
            .map_err(|e| db_error("delete_memory", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn search_memories(
        &self,
        project: &str,
        query: &MemoryQuery,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let pool = self.pool("search_memories")?;
        let text = query.query.trim();
        let fts = if self.fts_enabled() { fts_expression(text) } else { None };

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT memories.* FROM memories");
        if let Some(ref expression) = fts {
            qb.push(" JOIN memories_fts ON memories.rowid = memories_fts.rowid");
            qb.push(" WHERE memories_fts MATCH ").push_bind(expression.clone());
            qb.push(" AND memories.project_name = ").push_bind(project.to_string());
        } else {
            qb.push(" WHERE memories.project_name = ").push_bind(project.to_string());
            if !text.is_empty() {
                let pattern = like_pattern(text);
                qb.push(" AND (memories.content LIKE ").push_bind(pattern.clone());
                qb.push(" ESCAPE '\\' OR memories.tags LIKE ").push_bind(pattern);
                qb.push(" ESCAPE '\\')");
            }
        }
        if let Some(category) = query.category {
            qb.push(" AND memories.category = ").push_bind(category.as_str());
        }
        if fts.is_some() {
            qb.push(" ORDER BY bm25(memories_fts)");
        } else {
            qb.push(" ORDER BY memories.created_at DESC, memories.rowid DESC");
        }

        // Tag and age filters run in Rust, so pagination must wait for them
        let post_filter = !query.tags.is_empty() || query.has_age_window();
        if !post_filter {
            qb.push(" LIMIT ").push_bind(i64::try_from(query.limit).unwrap_or(i64::MAX));
            qb.push(" OFFSET ").push_bind(i64::try_from(query.offset).unwrap_or(i64::MAX));
        }

        let rows = qb
            .build()
            .fetch_all(&pool)
            .await
            .map_err(|e| db_error("search_memories", e))?;
        let items = rows
            .iter()
            .map(Self::row_to_item)
            .collect::<Result<Vec<_>, _>>()?;

        if post_filter {
            let filtered = items
                .into_iter()
                .filter(|item| item.has_all_tags(&query.tags) && query.matches_age(item))
                .collect();
            Ok(query.paginate(filtered))
        } else {
            let page = MemoryQuery { offset: 0, ..query.clone() };
            Ok(page.paginate(items))
        }
    }

    async fn get_memory_stats(&self, project: &str) -> Result<MemoryStats, MemoryError> {
        let pool = self.pool("get_memory_stats")?;

        let rows = sqlx::query(
            "SELECT category, COUNT(*) AS n FROM memories WHERE project_name = ? GROUP BY category",
        )
        .bind(project)
        .fetch_all(&pool)
        .await
        .map_err(|e| db_error("get_memory_stats", e))?;

        let mut stats = MemoryStats::empty(project, BACKEND_SQLITE);
        for row in &rows {
            let category: String = row.try_get("category").map_err(|e| db_error("get_memory_stats", e))?;
            let count: i64 = row.try_get("n").map_err(|e| db_error("get_memory_stats", e))?;
            let key = MemoryCategory::parse(&category).as_str().to_string();
            *stats.categories.entry(key).or_insert(0) += count as u64;
            stats.total += count as u64;
        }

        let bounds = sqlx::query(
            "SELECT MAX(created_at) AS most_recent, MIN(created_at) AS oldest FROM memories WHERE project_name = ?",
        )
        .bind(project)
        .fetch_one(&pool)
        .await
        .map_err(|e| db_error("get_memory_stats", e))?;
        stats.most_recent = bounds
            .try_get::<Option<String>, _>("most_recent")
            .ok()
            .flatten()
            .and_then(|ts| parse_timestamp(&ts));
        stats.oldest = bounds
            .try_get::<Option<String>, _>("oldest")
            .ok()
            .flatten()
            .and_then(|ts| parse_timestamp(&ts));

        Ok(stats
            .with_detail("fts_enabled", self.fts_enabled())
            .with_detail("database_path", self.config.path.display().to_string()))
    }

    async fn get_all_projects(&self) -> Result<Vec<String>, MemoryError> {
        let pool = self.pool("get_all_projects")?;
        let rows = sqlx::query("SELECT DISTINCT project_name FROM memories ORDER BY project_name")
            .fetch_all(&pool)
            .await
            .map_err(|e| db_error("get_all_projects", e))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("project_name").map_err(|e| db_error("get_all_projects", e)))
            .collect()
    }

    async fn cleanup(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            info!("SQLite backend closed");
        }
    }

    async fn create_backup(&self, path: &Path) -> Result<(), MemoryError> {
        if let Ok(pool) = self.pool("create_backup") {
            // Fold the WAL into the main file so a plain copy is complete
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&pool)
                .await
                .map_err(|e| db_error("create_backup", e))?;
        }
        if !tokio::fs::try_exists(&self.config.path).await.unwrap_or(false) {
            return Err(db_error(
                "create_backup",
                format!("database file not found: {}", self.config.path.display()),
            ));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| db_error("create_backup", e))?;
            }
        }
        tokio::fs::copy(&self.config.path, path)
            .await
            .map_err(|e| db_error("create_backup", e))?;
        info!(backup = %path.display(), "SQLite backup created");
        Ok(())
    }

    async fn restore_backup(&self, path: &Path) -> Result<(), MemoryError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(db_error(
                "restore_backup",
                format!("backup file not found: {}", path.display()),
            ));
        }

        {
            let _guard = self.init_lock.lock().await;
            let pool = self.pool.write().take();
            if let Some(pool) = pool {
                pool.close().await;
            }
            // Stale WAL/SHM files would be replayed over the restored copy
            for suffix in ["-wal", "-shm"] {
                let mut sidecar = self.config.path.clone().into_os_string();
                sidecar.push(suffix);
                match tokio::fs::remove_file(&sidecar).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(db_error("restore_backup", e)),
                }
            }
            tokio::fs::copy(path, &self.config.path)
                .await
                .map_err(|e| db_error("restore_backup", e))?;
        }

        self.initialize().await?;
        info!(backup = %path.display(), "SQLite database restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_backend(dir: &TempDir, enable_fts: bool) -> SqliteBackend {
        let backend = SqliteBackend::new(SqliteConfig {
            path: dir.path().join("memories.db"),
            enable_fts,
            ..Default::default()
        });
        backend.initialize().await.unwrap();
        backend
    }

    fn memory(content: &str, category: MemoryCategory, tags: &[&str]) -> NewMemory {
        NewMemory::new(content, category).with_tags(tags.iter().copied())
    }

    #[test]
    fn test_fts_expression_quotes_terms() {
        assert_eq!(fts_expression("  "), None);
        assert_eq!(fts_expression("retry backoff").unwrap(), "\"retry\"* \"backoff\"*");
        assert_eq!(fts_expression("say \"hi\"").unwrap(), "\"say\"* \"\"\"hi\"\"\"*");
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("100%_done"), "%100\\%\\_done%");
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir, true).await;
        backend.initialize().await.unwrap();
        assert!(backend.is_initialized());
        assert!(backend.health_check().await);
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_fields() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir, true).await;
        let mut metadata = Metadata::new();
        metadata.insert("ticket".into(), json!("MEM-12"));
        metadata.insert("nested".into(), json!({"weight": 3}));
        let new = memory("Use WAL journal mode", MemoryCategory::Pattern, &["sqlite", "perf"])
            .with_metadata(metadata.clone());

        let id = backend.add_memory("p1", &new).await.unwrap();
        let item = backend.get_memory("p1", &id).await.unwrap().unwrap();
        assert_eq!(item.content, new.content);
        assert_eq!(item.category, MemoryCategory::Pattern);
        assert_eq!(item.tags, vec!["sqlite", "perf"]);
        assert_eq!(item.metadata, metadata);
        assert!(backend.get_memory("other", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fts_search_and_trigger_sync() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir, true).await;
        assert!(backend.fts_enabled());

        let id = backend
            .add_memory("p1", &memory("Exponential backoff for retries", MemoryCategory::Pattern, &[]))
            .await
            .unwrap();
        backend
            .add_memory("p1", &memory("Team standup at nine", MemoryCategory::Team, &[]))
            .await
            .unwrap();

        let hits = backend.search_memories("p1", &MemoryQuery::new("backoff")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);

        // Prefix matching
        let hits = backend.search_memories("p1", &MemoryQuery::new("expon")).await.unwrap();
        assert_eq!(hits.len(), 1);

        // Update trigger re-indexes content
        backend
            .update_memory("p1", &id, &MemoryUpdate::new().content("Jittered delays"))
            .await
            .unwrap();
        assert!(backend.search_memories("p1", &MemoryQuery::new("backoff")).await.unwrap().is_empty());
        assert_eq!(backend.search_memories("p1", &MemoryQuery::new("jittered")).await.unwrap().len(), 1);

        // Delete trigger removes it from the index
        assert!(backend.delete_memory("p1", &id).await.unwrap());
        assert!(backend.search_memories("p1", &MemoryQuery::new("jittered")).await.unwrap().is_empty());
        assert!(backend.get_memory("p1", &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_like_search_when_fts_disabled() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir, false).await;
        assert!(!backend.fts_enabled());

        backend
            .add_memory("p1", &memory("Connection pool exhausted", MemoryCategory::Error, &["db"]))
            .await
            .unwrap();
        backend
            .add_memory("p1", &memory("100% coverage goal", MemoryCategory::Team, &[]))
            .await
            .unwrap();

        let hits = backend.search_memories("p1", &MemoryQuery::new("POOL")).await.unwrap();
        assert_eq!(hits.len(), 1);
        let hits = backend.search_memories("p1", &MemoryQuery::new("100%")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].category, MemoryCategory::Team);
    }

    #[tokio::test]
    async fn test_category_tag_and_pagination_filters() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir, true).await;
        for i in 0..6 {
            let tags: &[&str] = if i % 2 == 0 { &["Even"] } else { &[] };
            backend
                .add_memory("p1", &memory(&format!("pattern {i}"), MemoryCategory::Pattern, tags))
                .await
                .unwrap();
        }
        backend
            .add_memory("p1", &memory("an error", MemoryCategory::Error, &["even"]))
            .await
            .unwrap();

        let query = MemoryQuery::new("").with_category(MemoryCategory::Pattern);
        let all = backend.search_memories("p1", &query).await.unwrap();
        assert_eq!(all.len(), 6);
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        let page = backend
            .search_memories("p1", &query.clone().with_limit(2).with_offset(1))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, all[1].id);

        let even = backend
            .search_memories("p1", &query.clone().with_tags(["even"]).with_limit(2))
            .await
            .unwrap();
        assert_eq!(even.len(), 2);
        assert!(even.iter().all(|m| m.category == MemoryCategory::Pattern));
    }

    #[tokio::test]
    async fn test_oversized_limit_and_offset_are_clamped() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir, false).await;
        for i in 0..3 {
            backend
                .add_memory("p1", &memory(&format!("note {i}"), MemoryCategory::Team, &[]))
                .await
                .unwrap();
        }

        let past_the_end = MemoryQuery::new("").with_offset(usize::MAX);
        assert!(backend.search_memories("p1", &past_the_end).await.unwrap().is_empty());

        let unbounded = MemoryQuery::new("").with_limit(usize::MAX);
        assert_eq!(backend.search_memories("p1", &unbounded).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_age_window_applies_before_limit() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir, false).await;
        let pool = backend.pool("test").unwrap();
        let old = format_timestamp(&(Utc::now() - chrono::Duration::hours(2)));
        for i in 0..3 {
            let id = backend
                .add_memory("p1", &memory(&format!("old {i}"), MemoryCategory::Project, &[]))
                .await
                .unwrap();
            sqlx::query("UPDATE memories SET created_at = ? WHERE id = ?")
                .bind(&old)
                .bind(&id)
                .execute(&pool)
                .await
                .unwrap();
        }
        backend.add_memory("p1", &memory("fresh", MemoryCategory::Project, &[])).await.unwrap();

        let query = MemoryQuery::new("").with_age_window(Some(3600), None).with_limit(2);
        let hits = backend.search_memories("p1", &query).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|m| m.content.starts_with("old")));
    }

    #[tokio::test]
    async fn test_stats_and_projects() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir, true).await;
        backend.add_memory("beta", &memory("b", MemoryCategory::Team, &[])).await.unwrap();
        backend.add_memory("alpha", &memory("a1", MemoryCategory::Error, &[])).await.unwrap();
        backend.add_memory("alpha", &memory("a2", MemoryCategory::Error, &[])).await.unwrap();

        let stats = backend.get_memory_stats("alpha").await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.categories.get("error"), Some(&2));
        assert!(stats.most_recent >= stats.oldest);
        assert_eq!(stats.details.get("fts_enabled"), Some(&json!(true)));

        let empty = backend.get_memory_stats("nobody").await.unwrap();
        assert_eq!(empty.total, 0);
        assert!(empty.most_recent.is_none());

        assert_eq!(backend.get_all_projects().await.unwrap(), vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_fts_index_rebuilt_for_existing_rows() {
        let dir = TempDir::new().unwrap();
        {
            let plain = open_backend(&dir, false).await;
            plain
                .add_memory("p1", &memory("written before fts", MemoryCategory::Project, &[]))
                .await
                .unwrap();
            plain.cleanup().await;
        }
        let backend = open_backend(&dir, true).await;
        let hits = backend.search_memories("p1", &MemoryQuery::new("before")).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir, true).await;
        let kept = backend
            .add_memory("p1", &memory("kept", MemoryCategory::Project, &[]))
            .await
            .unwrap();

        let backup = dir.path().join("backups").join("memories.bak");
        backend.create_backup(&backup).await.unwrap();
        assert!(backup.exists());

        let lost = backend
            .add_memory("p1", &memory("after backup", MemoryCategory::Project, &[]))
            .await
            .unwrap();
        backend.restore_backup(&backup).await.unwrap();

        assert!(backend.get_memory("p1", &kept).await.unwrap().is_some());
        assert!(backend.get_memory("p1", &lost).await.unwrap().is_none());
        assert_eq!(backend.search_memories("p1", &MemoryQuery::new("kept")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_missing_backup_fails() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir, false).await;
        let err = backend
            .restore_backup(&dir.path().join("missing.bak"))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Backend { .. }));
        // Still usable
        assert!(backend.health_check().await);
    }

    #[tokio::test]
    async fn test_operations_after_cleanup_fail() {
        let dir = TempDir::new().unwrap();
        let backend = open_backend(&dir, false).await;
        backend.cleanup().await;
        assert!(!backend.health_check().await);
        assert!(backend
            .add_memory("p1", &memory("x", MemoryCategory::Project, &[]))
            .await
            .is_err());
    }
}
