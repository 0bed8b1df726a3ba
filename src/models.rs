//! Core data model: memory records, queries, statistics and backend health.
//!
//! # Example
//!
//! ```
//! use memory_service::{MemoryCategory, MemoryQuery, NewMemory};
//!
//! // Unknown categories normalize to Project
//! assert_eq!(MemoryCategory::parse("Pattern"), MemoryCategory::Pattern);
//! assert_eq!(MemoryCategory::parse("nonsense"), MemoryCategory::Project);
//!
//! let memory = NewMemory::new("Use WAL mode for sqlite", MemoryCategory::Pattern)
//!     .with_tags(["sqlite", "performance", "sqlite"]);
//! assert_eq!(memory.tags, vec!["sqlite", "performance"]);
//!
//! // Non-positive limits fall back to the default page size
//! let query = MemoryQuery::new("wal").with_limit(0);
//! assert_eq!(query.limit, 10);
//! ```

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// String-keyed map of arbitrary JSON values attached to a memory.
pub type Metadata = serde_json::Map<String, Value>;

pub const DEFAULT_QUERY_LIMIT: usize = 10;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;

/// Closed set of memory categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MemoryCategory {
    Project,
    Pattern,
    Team,
    Error,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 4] = [Self::Project, Self::Pattern, Self::Team, Self::Error];

    /// Case-insensitive parse; anything unrecognized becomes `Project`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pattern" => Self::Pattern,
            "team" => Self::Team,
            "error" => Self::Error,
            _ => Self::Project,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Pattern => "pattern",
            Self::Team => "team",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for MemoryCategory {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<MemoryCategory> for String {
    fn from(value: MemoryCategory) -> Self {
        value.as_str().to_string()
    }
}

/// Canonical timestamp encoding. Fixed width so text ordering matches time ordering.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse RFC 3339, falling back to naive ISO-8601 (interpreted as UTC).
#[must_use]
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// A stored memory record scoped to a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub project_name: String,
    pub content: String,
    pub category: MemoryCategory,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryItem {
    /// Seconds elapsed since the record was created.
    #[must_use]
    pub fn age_seconds(&self) -> f64 {
        let elapsed = Utc::now().signed_duration_since(self.created_at);
        elapsed.num_milliseconds() as f64 / 1000.0
    }

    /// Case-insensitive substring match over content, tags and metadata values.
    /// An empty needle matches everything.
    #[must_use]
    pub fn matches_text(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        if self.content.to_lowercase().contains(&needle) {
            return true;
        }
        if self.tags.iter().any(|tag| tag.to_lowercase().contains(&needle)) {
            return true;
        }
        self.metadata.values().any(|value| {
            let text = match value {
                Value::String(s) => s.to_lowercase(),
                other => other.to_string().to_lowercase(),
            };
            text.contains(&needle)
        })
    }

    /// True when every requested tag is present (case-insensitive).
    #[must_use]
    pub fn has_all_tags(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|want| {
            let want = want.to_lowercase();
            self.tags.iter().any(|tag| tag.to_lowercase() == want)
        })
    }
}

/// Payload for creating a memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMemory {
    pub content: String,
    pub category: MemoryCategory,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewMemory {
    pub fn new(content: impl Into<String>, category: MemoryCategory) -> Self {
        Self {
            content: content.into(),
            category,
            tags: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    /// Set tags, dropping duplicates while keeping first-seen order.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = dedupe_tags(tags.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Materialize into a stored record.
    #[must_use]
    pub fn into_item(self, id: String, project: &str, now: DateTime<Utc>) -> MemoryItem {
        MemoryItem {
            id,
            project_name: project.to_string(),
            content: self.content,
            category: self.category,
            tags: self.tags,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

fn dedupe_tags(tags: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// Partial update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUpdate {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub category: Option<MemoryCategory>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl MemoryUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    #[must_use]
    pub fn category(mut self, category: MemoryCategory) -> Self {
        self.category = Some(category);
        self
    }

    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(dedupe_tags(tags.into_iter().map(Into::into)));
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.category.is_none()
            && self.tags.is_none()
            && self.metadata.is_none()
    }

    /// Apply to an item in place and bump `updated_at`.
    pub fn apply(&self, item: &mut MemoryItem, now: DateTime<Utc>) {
        if let Some(ref content) = self.content {
            item.content = content.clone();
        }
        if let Some(category) = self.category {
            item.category = category;
        }
        if let Some(ref tags) = self.tags {
            item.tags = tags.clone();
        }
        if let Some(ref metadata) = self.metadata {
            item.metadata = metadata.clone();
        }
        item.updated_at = now;
    }
}

fn default_limit() -> usize { DEFAULT_QUERY_LIMIT }
fn default_similarity_threshold() -> f64 { DEFAULT_SIMILARITY_THRESHOLD }
fn default_include_metadata() -> bool { true }

/// Search parameters.
///
/// `limit`/`offset` are applied by backends only after every filter,
/// including the age window, has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub category: Option<MemoryCategory>,
    /// All listed tags must be present (case-insensitive).
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    /// Only meaningful for backends that support similarity search.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_include_metadata")]
    pub include_metadata: bool,
    #[serde(default)]
    pub min_age_seconds: Option<u64>,
    #[serde(default)]
    pub max_age_seconds: Option<u64>,
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            category: None,
            tags: Vec::new(),
            limit: default_limit(),
            offset: 0,
            similarity_threshold: default_similarity_threshold(),
            include_metadata: default_include_metadata(),
            min_age_seconds: None,
            max_age_seconds: None,
        }
    }
}

impl MemoryQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_category(mut self, category: MemoryCategory) -> Self {
        self.category = Some(category);
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self.normalized()
    }

    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self.normalized()
    }

    #[must_use]
    pub fn with_age_window(mut self, min_seconds: Option<u64>, max_seconds: Option<u64>) -> Self {
        self.min_age_seconds = min_seconds;
        self.max_age_seconds = max_seconds;
        self
    }

    #[must_use]
    pub fn without_metadata(mut self) -> Self {
        self.include_metadata = false;
        self
    }

    /// Clamp out-of-range values back to their defaults.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.limit == 0 {
            self.limit = DEFAULT_QUERY_LIMIT;
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) || self.similarity_threshold.is_nan() {
            self.similarity_threshold = DEFAULT_SIMILARITY_THRESHOLD;
        }
        self
    }

    #[must_use]
    pub fn has_age_window(&self) -> bool {
        self.min_age_seconds.is_some() || self.max_age_seconds.is_some()
    }

    /// Age-window post-filter.
    #[must_use]
    pub fn matches_age(&self, item: &MemoryItem) -> bool {
        if !self.has_age_window() {
            return true;
        }
        let age = item.age_seconds();
        if let Some(max) = self.max_age_seconds {
            if age > max as f64 {
                return false;
            }
        }
        if let Some(min) = self.min_age_seconds {
            if age < min as f64 {
                return false;
            }
        }
        true
    }

    /// Category, tag, text and age filters. Project scoping is the caller's job.
    #[must_use]
    pub fn matches(&self, item: &MemoryItem) -> bool {
        if let Some(category) = self.category {
            if item.category != category {
                return false;
            }
        }
        item.has_all_tags(&self.tags) && item.matches_text(&self.query) && self.matches_age(item)
    }

    /// Apply offset/limit to an already filtered and ordered result set,
    /// stripping metadata when it was not requested.
    #[must_use]
    pub fn paginate(&self, items: Vec<MemoryItem>) -> Vec<MemoryItem> {
        let limit = if self.limit == 0 { DEFAULT_QUERY_LIMIT } else { self.limit };
        items
            .into_iter()
            .skip(self.offset)
            .take(limit)
            .map(|mut item| {
                if !self.include_metadata {
                    item.metadata = Metadata::new();
                }
                item
            })
            .collect()
    }
}

/// Per-project statistics reported by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub project: String,
    pub total: u64,
    pub categories: BTreeMap<String, u64>,
    pub most_recent: Option<DateTime<Utc>>,
    pub oldest: Option<DateTime<Utc>>,
    pub backend: String,
    /// Backend-specific extras (database path, FTS status, service url...)
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}

impl MemoryStats {
    pub fn empty(project: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            total: 0,
            categories: BTreeMap::new(),
            most_recent: None,
            oldest: None,
            backend: backend.into(),
            details: BTreeMap::new(),
        }
    }

    /// Summarize a project's items.
    pub fn from_items<'a>(
        project: &str,
        backend: &str,
        items: impl IntoIterator<Item = &'a MemoryItem>,
    ) -> Self {
        let mut stats = Self::empty(project, backend);
        for item in items {
            stats.total += 1;
            *stats.categories.entry(item.category.as_str().to_string()).or_insert(0) += 1;
            stats.most_recent = Some(match stats.most_recent {
                Some(ts) if ts >= item.created_at => ts,
                _ => item.created_at,
            });
            stats.oldest = Some(match stats.oldest {
                Some(ts) if ts <= item.created_at => ts,
                _ => item.created_at,
            });
        }
        stats
    }

    #[must_use]
    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Rolling health snapshot for one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub backend_name: String,
    pub is_healthy: bool,
    pub response_time_ms: f64,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl BackendHealth {
    pub fn new(backend_name: impl Into<String>) -> Self {
        Self {
            backend_name: backend_name.into(),
            is_healthy: true,
            response_time_ms: 0.0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            successful_requests: 0,
            last_checked_at: None,
            last_error: None,
        }
    }

    /// Fold one request outcome into the snapshot.
    pub fn record(&mut self, success: bool, response_time_ms: f64, error: Option<String>) {
        self.total_requests += 1;
        self.response_time_ms = response_time_ms;
        self.last_checked_at = Some(Utc::now());
        if success {
            self.successful_requests += 1;
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            self.is_healthy = true;
            self.last_error = None;
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            self.is_healthy = false;
            self.last_error = error;
        }
    }

    /// `successful / total`, or 1.0 before any request.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }
}
