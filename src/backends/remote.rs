//! Remote semantic memory service over HTTP.
//!
//! Projects map to remote "spaces" (`space_name`). Category and tags travel
//! inside the remote metadata object and are lifted back out on read.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | health | `GET /health` |
//! | add | `POST /memories` |
//! | search | `GET /memories/search` |
//! | list | `GET /memories` |
//! | get / update / delete | `GET` / `PUT` / `DELETE /memories/{id}` |
//! | stats | `GET /memories/stats` |
//! | projects | `GET /spaces` |
//!
//! Transport errors, 5xx and `429 Too Many Requests` are retried; any other
//! HTTP error fails immediately.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::traits::MemoryBackend;
use crate::config::{RemoteConfig, BACKEND_REMOTE};
use crate::error::MemoryError;
use crate::models::{
    parse_timestamp, MemoryCategory, MemoryItem, MemoryQuery, MemoryStats, MemoryUpdate,
    Metadata, NewMemory, DEFAULT_SIMILARITY_THRESHOLD,
};
use crate::resilience::retry::{retry_with, RetryConfig, RetryHint};

const USER_AGENT: &str = concat!("memory-service/", env!("CARGO_PKG_VERSION"));

/// Metadata keys owned by this client; stripped when converting back.
const RESERVED_KEYS: &[&str] = &["category", "tags", "project", "created_at", "updated_at", "framework"];

#[derive(Debug)]
enum RemoteError {
    Transport(String),
    RateLimited(Option<Duration>),
    Unauthorized,
    NotFound,
    Status(u16, String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::RateLimited(_) => f.write_str("rate limited (HTTP 429)"),
            Self::Unauthorized => f.write_str("authentication failed (HTTP 401)"),
            Self::NotFound => f.write_str("not found (HTTP 404)"),
            Self::Status(code, body) => write!(f, "HTTP {code}: {body}"),
        }
    }
}

impl RemoteError {
    fn retry_hint(&self) -> RetryHint {
        match self {
            Self::Transport(_) => RetryHint::Retry,
            Self::RateLimited(Some(after)) => RetryHint::RetryAfter(*after),
            Self::RateLimited(None) => RetryHint::Retry,
            Self::Status(code, _) if *code >= 500 => RetryHint::Retry,
            _ => RetryHint::Stop,
        }
    }

    fn into_memory_error(self, operation: &str) -> MemoryError {
        MemoryError::backend(BACKEND_REMOTE, operation, self)
    }
}

pub struct RemoteBackend {
    config: RemoteConfig,
    base_url: Url,
    http: reqwest::Client,
    retry: RetryConfig,
    initialized: AtomicBool,
    /// Last probe result and when it was taken
    health: Mutex<Option<(Instant, bool)>>,
}

impl RemoteBackend {
    /// Build the client. Performs no I/O.
    pub fn new(config: RemoteConfig) -> Result<Self, MemoryError> {
        let base_url = Url::parse(&config.base_url())
            .map_err(|e| MemoryError::Configuration(format!("invalid remote url: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(ref key) = config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| MemoryError::Configuration(format!("invalid api key: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MemoryError::Configuration(e.to_string()))?;

        let retry = RetryConfig::linear(config.max_retries, Duration::from_millis(config.retry_delay_ms));

        Ok(Self {
            config,
            base_url,
            http,
            retry,
            initialized: AtomicBool::new(false),
            health: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, MemoryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| MemoryError::Configuration("remote url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_once(
        &self,
        method: Method,
        url: Url,
        params: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, RemoteError> {
        let mut request = self.http.request(method, url).query(params);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED => return Err(RemoteError::Unauthorized),
            StatusCode::NOT_FOUND => return Err(RemoteError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => {
                let after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(RemoteError::RateLimited(after));
            }
            _ => {}
        }

        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(RemoteError::Status(status.as_u16(), text));
        }
        // Not every endpoint answers with JSON
        Ok(serde_json::from_str(&text).unwrap_or_else(|_| json!({ "status": "success", "data": text })))
    }

    async fn request(
        &self,
        operation: &str,
        method: Method,
        segments: &[&str],
        params: Vec<(&str, String)>,
        body: Option<Value>,
    ) -> Result<Value, RemoteError> {
        let url = self
            .endpoint(segments)
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        retry_with(
            operation,
            &self.retry,
            RemoteError::retry_hint,
            || self.send_once(method.clone(), url.clone(), &params, body.as_ref()),
        )
        .await
    }

    fn ensure_initialized(&self, operation: &str) -> Result<(), MemoryError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(MemoryError::backend(BACKEND_REMOTE, operation, "client not initialized"))
        }
    }

    async fn probe(&self) -> bool {
        let Ok(url) = self.endpoint(&["health"]) else {
            return false;
        };
        match self.http.get(url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!(error = %e, "Remote health probe failed");
                false
            }
        }
    }

    fn list_items(value: &Value, project: &str) -> Vec<MemoryItem> {
        value
            .get("memories")
            .and_then(Value::as_array)
            .map(|memories| {
                memories
                    .iter()
                    .filter_map(|raw| match from_remote(raw, project) {
                        Ok(item) => Some(item),
                        Err(e) => {
                            warn!(error = %e, "Skipping unreadable remote memory");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Request body for a new memory.
fn to_remote(project: &str, memory: &NewMemory) -> Value {
    let mut metadata = memory.metadata.clone();
    metadata.insert("category".into(), json!(memory.category.as_str()));
    metadata.insert("tags".into(), json!(memory.tags));
    metadata.insert("project".into(), json!(project));
    metadata.insert("created_at".into(), json!(Utc::now().to_rfc3339()));
    metadata.insert("framework".into(), json!("memory-service"));
    json!({
        "content": memory.content,
        "space_name": project,
        "metadata": metadata,
    })
}

/// Request body for a partial update.
fn update_to_remote(project: &str, id: &str, update: &MemoryUpdate) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("id".into(), json!(id));
    body.insert("space_name".into(), json!(project));
    if let Some(ref content) = update.content {
        body.insert("content".into(), json!(content));
    }
    if update.tags.is_some() || update.metadata.is_some() || update.category.is_some() {
        let mut metadata = update.metadata.clone().unwrap_or_default();
        if let Some(ref tags) = update.tags {
            metadata.insert("tags".into(), json!(tags));
        }
        if let Some(category) = update.category {
            metadata.insert("category".into(), json!(category.as_str()));
        }
        metadata.insert("updated_at".into(), json!(Utc::now().to_rfc3339()));
        body.insert("metadata".into(), Value::Object(metadata));
    }
    Value::Object(body)
}

/// Convert a remote record. The project is the one asked for, not whatever
/// the server echoes back.
fn from_remote(raw: &Value, project: &str) -> Result<MemoryItem, String> {
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or("missing id")?
        .to_string();
    let content = raw.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
    let mut metadata: Metadata = raw
        .get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let category = metadata
        .get("category")
        .and_then(Value::as_str)
        .map(MemoryCategory::parse)
        .unwrap_or(MemoryCategory::Project);
    let tags: Vec<String> = metadata
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| tags.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let timestamp = |key: &str| {
        raw.get(key)
            .or_else(|| metadata.get(key))
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    };
    let created_at = timestamp("created_at").unwrap_or_else(Utc::now);
    let updated_at = timestamp("updated_at").unwrap_or(created_at);

    for key in RESERVED_KEYS {
        metadata.remove(*key);
    }

    Ok(MemoryItem {
        id,
        project_name: project.to_string(),
        content,
        category,
        tags,
        metadata,
        created_at,
        updated_at,
    })
}

fn stats_from_remote(project: &str, value: &Value) -> MemoryStats {
    let mut stats = MemoryStats::empty(project, BACKEND_REMOTE);
    let Some(raw) = value.get("stats") else {
        return stats;
    };
    if let Some(categories) = raw.get("categories").and_then(Value::as_object) {
        for (name, count) in categories {
            let count = count.as_u64().unwrap_or(0);
            *stats
                .categories
                .entry(MemoryCategory::parse(name).as_str().to_string())
                .or_insert(0) += count;
        }
    }
    stats.total = raw
        .get("total")
        .and_then(Value::as_u64)
        .unwrap_or_else(|| stats.categories.values().sum());
    stats.most_recent = raw.get("most_recent").and_then(Value::as_str).and_then(parse_timestamp);
    stats.oldest = raw.get("oldest").and_then(Value::as_str).and_then(parse_timestamp);
    stats
}

#[async_trait]
impl MemoryBackend for RemoteBackend {
    fn name(&self) -> &str {
        BACKEND_REMOTE
    }

    fn supports_similarity_search(&self) -> bool {
        true
    }

    fn features(&self) -> BTreeMap<String, bool> {
        let mut features = BTreeMap::new();
        features.insert("similarity_search".to_string(), true);
        features.insert("backup".to_string(), false);
        features.insert("persistent".to_string(), true);
        features.insert("authentication".to_string(), self.config.api_key.is_some());
        features
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    #[tracing::instrument(skip(self), fields(url = %self.base_url))]
    async fn initialize(&self) -> Result<(), MemoryError> {
        if self.is_initialized() {
            return Ok(());
        }
        let healthy = self.probe().await;
        *self.health.lock() = Some((Instant::now(), healthy));
        if !healthy {
            return Err(MemoryError::initialization(
                BACKEND_REMOTE,
                format!("service at {} is not healthy", self.base_url),
            ));
        }
        self.initialized.store(true, Ordering::Release);
        info!("Remote backend initialized");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        if !self.is_initialized() {
            return false;
        }
        let ttl = Duration::from_secs(self.config.health_cache_secs);
        if let Some((at, healthy)) = *self.health.lock() {
            if at.elapsed() < ttl {
                return healthy;
            }
        }
        let healthy = self.probe().await;
        *self.health.lock() = Some((Instant::now(), healthy));
        healthy
    }

    async fn add_memory(&self, project: &str, memory: &NewMemory) -> Result<String, MemoryError> {
        self.ensure_initialized("add_memory")?;
        let body = to_remote(project, memory);
        let response = self
            .request("add_memory", Method::POST, &["memories"], Vec::new(), Some(body))
            .await
            .map_err(|e| e.into_memory_error("add_memory"))?;
        response
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| MemoryError::backend(BACKEND_REMOTE, "add_memory", "service returned no id"))
    }

    async fn get_memory(&self, project: &str, id: &str) -> Result<Option<MemoryItem>, MemoryError> {
        self.ensure_initialized("get_memory")?;
        let params = vec![("space_name", project.to_string())];
        match self.request("get_memory", Method::GET, &["memories", id], params, None).await {
            Ok(Value::Null) => Ok(None),
            Ok(raw) => from_remote(&raw, project)
                .map(Some)
                .map_err(|e| MemoryError::backend(BACKEND_REMOTE, "get_memory", e)),
            Err(RemoteError::NotFound) => Ok(None),
            Err(e) => Err(e.into_memory_error("get_memory")),
        }
    }

    async fn update_memory(
        &self,
        project: &str,
        id: &str,
        update: &MemoryUpdate,
    ) -> Result<bool, MemoryError> {
        self.ensure_initialized("update_memory")?;
        let body = update_to_remote(project, id, update);
        match self
            .request("update_memory", Method::PUT, &["memories", id], Vec::new(), Some(body))
            .await
        {
            Ok(response) => Ok(response.get("success").and_then(Value::as_bool).unwrap_or(true)),
            Err(RemoteError::NotFound) => Ok(false),
            Err(e) => Err(e.into_memory_error("update_memory")),
        }
    }

    async fn delete_memory(&self, project: &str, id: &str) -> Result<bool, MemoryError> {
        self.ensure_initialized("delete_memory")?;
        let params = vec![("space_name", project.to_string())];
        match self
            .request("delete_memory", Method::DELETE, &["memories", id], params, None)
            .await
        {
            Ok(response) => Ok(response.get("success").and_then(Value::as_bool).unwrap_or(true)),
            Err(RemoteError::NotFound) => Ok(false),
            Err(e) => Err(e.into_memory_error("delete_memory")),
        }
    }

    async fn search_memories(
        &self,
        project: &str,
        query: &MemoryQuery,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        self.ensure_initialized("search_memories")?;
        let mut params = vec![
            ("query", query.query.clone()),
            ("space_name", project.to_string()),
            ("include_metadata", query.include_metadata.to_string()),
        ];
        if let Some(category) = query.category {
            params.push(("category", category.as_str().to_string()));
        }
        if !query.tags.is_empty() {
            params.push(("tags", query.tags.join(",")));
        }
        if (query.similarity_threshold - DEFAULT_SIMILARITY_THRESHOLD).abs() > f64::EPSILON {
            params.push(("similarity_threshold", query.similarity_threshold.to_string()));
        }

        // The service has no offset, so over-fetch and page locally. The age
        // window is applied here, so widen the fetch until the page fills or
        // the service runs out of rows.
        let wanted = query.offset.saturating_add(query.limit);
        let mut fetch = wanted.max(1);
        loop {
            let mut request_params = params.clone();
            request_params.push(("limit", fetch.to_string()));
            let response = self
                .request("search_memories", Method::GET, &["memories", "search"], request_params, None)
                .await
                .map_err(|e| e.into_memory_error("search_memories"))?;
            let returned = response
                .get("memories")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let matches: Vec<MemoryItem> = Self::list_items(&response, project)
                .into_iter()
                .filter(|item| query.matches_age(item))
                .collect();

            let exhausted = returned < fetch || fetch == usize::MAX;
            if !query.has_age_window() || exhausted || matches.len() >= wanted {
                debug!(project = %project, found = matches.len(), fetched = returned, "Remote search complete");
                return Ok(query.paginate(matches));
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    async fn get_project_memories(
        &self,
        project: &str,
        category: Option<MemoryCategory>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        self.ensure_initialized("get_project_memories")?;
        let mut params = vec![("space_name", project.to_string()), ("limit", limit.to_string())];
        if let Some(category) = category {
            params.push(("category", category.as_str().to_string()));
        }
        let response = self
            .request("get_project_memories", Method::GET, &["memories"], params, None)
            .await
            .map_err(|e| e.into_memory_error("get_project_memories"))?;
        let mut items = Self::list_items(&response, project);
        items.truncate(limit);
        Ok(items)
    }

    async fn get_memory_stats(&self, project: &str) -> Result<MemoryStats, MemoryError> {
        self.ensure_initialized("get_memory_stats")?;
        let params = vec![("space_name", project.to_string())];
        let response = self
            .request("get_memory_stats", Method::GET, &["memories", "stats"], params, None)
            .await
            .map_err(|e| e.into_memory_error("get_memory_stats"))?;
        let api_version = response
            .get("api_version")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Ok(stats_from_remote(project, &response)
            .with_detail("service_url", self.base_url.to_string())
            .with_detail("similarity_search", true)
            .with_detail("api_version", api_version))
    }

    async fn get_all_projects(&self) -> Result<Vec<String>, MemoryError> {
        self.ensure_initialized("get_all_projects")?;
        let response = self
            .request("get_all_projects", Method::GET, &["spaces"], Vec::new(), None)
            .await
            .map_err(|e| e.into_memory_error("get_all_projects"))?;
        let mut projects: Vec<String> = response
            .get("spaces")
            .and_then(Value::as_array)
            .map(|spaces| {
                spaces
                    .iter()
                    .filter_map(|space| space.get("name").and_then(Value::as_str))
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        projects.sort();
        projects.dedup();
        Ok(projects)
    }

    async fn cleanup(&self) {
        self.initialized.store(false, Ordering::Release);
        *self.health.lock() = None;
        info!("Remote backend closed");
    }
}
