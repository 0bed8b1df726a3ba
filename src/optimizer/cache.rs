// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-through result cache for the optimizer.
//!
//! Entries expire after a fixed TTL and are bounded by a maximum count with
//! oldest-first eviction. Writes never invalidate: a search cached just
//! before an `add_memory` keeps being served until it expires.
//!
//! ```text
//! lookup(key)
//!     │
//!     ├─→ present and younger than TTL → hit
//!     ├─→ present but expired          → drop entry, miss
//!     └─→ absent                       → miss
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::models::{MemoryItem, MemoryQuery, MemoryStats};

/// A cached operation result.
#[derive(Debug, Clone)]
pub enum CachedResult {
    Search(Vec<MemoryItem>),
    Stats(MemoryStats),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    stored_at: Instant,
    value: CachedResult,
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct ResultCacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because their TTL passed
    pub expired: u64,
    /// Entries dropped to make room
    pub evicted: u64,
    pub entry_count: usize,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

/// TTL-bounded concurrent result cache.
pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    /// Insertion order for eviction (oldest first)
    order: Mutex<VecDeque<String>>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
}

/// Key for a cached search: every field that changes the result set.
///
/// Encoded as a JSON array so no project name or query text can collide
/// with another field boundary.
pub fn search_key(project: &str, query: &MemoryQuery) -> String {
    let mut tags = query.tags.clone();
    tags.sort();
    json!([
        "search",
        project,
        query.query,
        query.category.map(|c| c.as_str()),
        query.limit,
        query.offset,
        tags,
        query.min_age_seconds,
        query.max_age_seconds,
        query.include_metadata,
        query.similarity_threshold,
    ])
    .to_string()
}

pub fn stats_key(project: &str) -> String {
    json!(["stats", project]).to_string()
}

impl ResultCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a live entry. Expired entries are dropped on the way.
    pub fn get(&self, key: &str) -> Option<CachedResult> {
        if let Some(entry) = self.entries.get(key) {
            if entry.stored_at.elapsed() <= self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup(true);
                return Some(entry.value.clone());
            }
            drop(entry); // Release read lock before removing
            if self.entries.remove(key).is_some() {
                self.expired.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(false);
        None
    }

    pub fn insert(&self, key: String, value: CachedResult) {
        let mut order = self.order.lock();
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.max_entries {
                let Some(oldest) = order.pop_front() else {
                    break;
                };
                if self.entries.remove(&oldest).is_some() {
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                }
            }
            order.push_back(key.clone());
        }
        self.entries.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                value,
            },
        );
        crate::metrics::set_cache_entries(self.entries.len());
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.stored_at.elapsed() <= self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.order.lock().retain(|key| self.entries.contains_key(key));
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            crate::metrics::record_cache_expired(removed);
        }
        crate::metrics::set_cache_entries(self.entries.len());
        removed
    }

    pub fn clear(&self) {
        let mut order = self.order.lock();
        self.entries.clear();
        order.clear();
        crate::metrics::set_cache_entries(0);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> ResultCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        ResultCacheStats {
            hits,
            misses,
            expired: self.expired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            entry_count: self.entries.len(),
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.expired.store(0, Ordering::Relaxed);
        self.evicted.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemoryCategory;

    fn stats(project: &str) -> CachedResult {
        CachedResult::Stats(MemoryStats::empty(project, "memory"))
    }

    #[test]
    fn test_search_key_ignores_tag_order() {
        let a = MemoryQuery::new("wal").with_tags(["b", "a"]);
        let b = MemoryQuery::new("wal").with_tags(["a", "b"]);
        assert_eq!(search_key("p1", &a), search_key("p1", &b));
    }

    #[test]
    fn test_search_key_distinguishes_fields() {
        let base = MemoryQuery::new("wal");
        let keys = [
            search_key("p1", &base),
            search_key("p2", &base),
            search_key("p1", &MemoryQuery::new("fsync")),
            search_key("p1", &base.clone().with_category(MemoryCategory::Error)),
            search_key("p1", &base.clone().with_limit(3)),
            search_key("p1", &base.clone().with_offset(3)),
            search_key("p1", &base.clone().with_similarity_threshold(0.9)),
            stats_key("p1"),
        ];
        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn test_separator_in_project_cannot_alias_another_project() {
        assert_ne!(
            search_key("a|b", &MemoryQuery::new("")),
            search_key("a", &MemoryQuery::new("b|"))
        );
        assert_ne!(
            search_key("a\",\"b", &MemoryQuery::new("")),
            search_key("a", &MemoryQuery::new("b"))
        );
        assert_ne!(stats_key("a|b"), stats_key("a"));
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.insert("a".into(), stats("a"));
        cache.insert("b".into(), stats("b"));
        // Re-inserting an existing key does not evict
        cache.insert("a".into(), stats("a"));
        assert_eq!(cache.len(), 2);

        cache.insert("c".into(), stats("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = ResultCache::new(Duration::from_secs(10), 100);
        cache.insert("k".into(), stats("p1"));
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expired, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = ResultCache::new(Duration::from_secs(10), 100);
        cache.insert("old".into(), stats("p1"));
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.insert("new".into(), stats("p2"));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("new").is_some());
    }
}
