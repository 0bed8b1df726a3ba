//! Async execution optimizer.
//!
//! Sits in front of a [`MemoryService`] and adds:
//! - a semaphore bounding in-flight operations (callers queue for a permit)
//! - the per-call deadline, pushed down into the service so a timeout is
//!   cancelled inside the breaker and counted as a backend failure
//! - a read-through TTL cache for searches and stats
//! - bulk adds split into `batch_size` groups run concurrently
//! - [`auto_tune()`](AsyncOptimizer::auto_tune) driven by rolling metrics
//!
//! Cached results are not invalidated by writes and may be stale for up to
//! one TTL.

pub mod cache;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MemoryServiceConfig;
use crate::error::MemoryError;
use crate::models::{MemoryItem, MemoryQuery, MemoryStats, NewMemory};
use crate::service::MemoryService;

use cache::{CachedResult, ResultCache};

/// Ceiling for timeouts raised by auto-tuning.
pub const MAX_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Auto-tuning never drops concurrency below this.
pub const MIN_CONCURRENCY: usize = 2;

const TIMEOUT_RATE_THRESHOLD: f64 = 0.1;
const SLOW_OPERATION_THRESHOLD: Duration = Duration::from_secs(5);
const SUCCESS_RATE_THRESHOLD: f64 = 0.8;

/// Tunable optimizer parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizerSettings {
    pub max_concurrent_ops: usize,
    pub operation_timeout: Duration,
    pub batch_size: usize,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    pub enable_cache: bool,
}

impl OptimizerSettings {
    pub fn from_config(config: &MemoryServiceConfig) -> Self {
        Self {
            max_concurrent_ops: config.max_concurrent_ops.max(1),
            operation_timeout: config.operation_timeout(),
            batch_size: config.batch_size.max(1),
            cache_ttl: config.cache_ttl(),
            cache_max_entries: config.cache_max_entries,
            enable_cache: config.enable_cache,
        }
    }
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self::from_config(&MemoryServiceConfig::default())
    }
}

/// Per-item results of [`AsyncOptimizer::add_memories_batch`], in input order.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<Result<String, MemoryError>>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchOutcome {
    /// Ids of the items that were stored.
    pub fn ids(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter_map(|r| r.as_deref().ok())
            .collect()
    }
}

/// Optimizer metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerMetrics {
    /// Operations dispatched to the service (cache hits excluded)
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub timeout_operations: u64,
    /// Reads answered from the cache
    pub cached_operations: u64,
    /// Mean duration of successful operations
    pub average_operation_ms: f64,
    pub max_operation_ms: f64,
    pub cache_hit_rate: f64,
    pub cache_entries: usize,
    pub settings: OptimizerSettings,
}

impl OptimizerMetrics {
    /// Share of dispatched operations that hit their deadline.
    #[must_use]
    pub fn timeout_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        self.timeout_operations as f64 / self.total_operations as f64
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 1.0;
        }
        self.successful_operations as f64 / self.total_operations as f64
    }
}

/// Outcome of one [`AsyncOptimizer::auto_tune`] pass.
#[derive(Debug, Clone, Serialize)]
pub struct TuningReport {
    pub before: OptimizerSettings,
    pub after: OptimizerSettings,
    pub adjustments: Vec<String>,
}

impl TuningReport {
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.adjustments.is_empty()
    }
}

#[derive(Debug, Default)]
struct OptimizerCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    cached: AtomicU64,
    /// Sum of successful operation durations in microseconds
    busy_us: AtomicU64,
    max_us: AtomicU64,
}

impl OptimizerCounters {
    fn reset(&self) {
        for counter in [
            &self.total,
            &self.successful,
            &self.failed,
            &self.timeouts,
            &self.cached,
            &self.busy_us,
            &self.max_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

pub struct AsyncOptimizer {
    service: Arc<MemoryService>,
    settings: RwLock<OptimizerSettings>,
    /// Swapped wholesale by auto-tuning; in-flight permits drain on the old one
    limiter: RwLock<Arc<Semaphore>>,
    /// Batches hold it shared; auto-tuning takes it exclusively
    batch_gate: tokio::sync::RwLock<()>,
    cache: Arc<ResultCache>,
    counters: OptimizerCounters,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncOptimizer {
    /// Wrap `service`. The service's per-call deadline is set to
    /// `settings.operation_timeout`.
    pub fn new(service: Arc<MemoryService>, settings: OptimizerSettings) -> Self {
        service.set_operation_timeout(Some(settings.operation_timeout));
        crate::metrics::set_concurrency_limit(settings.max_concurrent_ops);
        info!(
            max_concurrent_ops = settings.max_concurrent_ops,
            batch_size = settings.batch_size,
            cache_ttl_secs = settings.cache_ttl.as_secs_f64(),
            "Async optimizer created"
        );
        Self {
            limiter: RwLock::new(Arc::new(Semaphore::new(settings.max_concurrent_ops.max(1)))),
            cache: Arc::new(ResultCache::new(settings.cache_ttl, settings.cache_max_entries)),
            settings: RwLock::new(settings),
            service,
            batch_gate: tokio::sync::RwLock::new(()),
            counters: OptimizerCounters::default(),
            sweeper: Mutex::new(None),
        }
    }

    /// Build with settings taken from the service's own configuration.
    pub fn from_service(service: Arc<MemoryService>) -> Self {
        let settings = OptimizerSettings::from_config(&service.config());
        Self::new(service, settings)
    }

    #[must_use]
    pub fn service(&self) -> &Arc<MemoryService> {
        &self.service
    }

    #[must_use]
    pub fn settings(&self) -> OptimizerSettings {
        self.settings.read().clone()
    }

    /// Permits currently free on the limiter.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.limiter.read().available_permits()
    }

    pub async fn add_memory(&self, project: &str, memory: NewMemory) -> Result<String, MemoryError> {
        self.run("add_memory", self.service.add_memory(project, memory)).await
    }

    pub async fn get_memory(&self, project: &str, id: &str) -> Result<Option<MemoryItem>, MemoryError> {
        self.run("get_memory", self.service.get_memory(project, id)).await
    }

    /// Search through the cache. Only successful results are cached.
    pub async fn search_memories(
        &self,
        project: &str,
        query: &MemoryQuery,
    ) -> Result<Vec<MemoryItem>, MemoryError> {
        let query = query.clone().normalized();
        let key = cache::search_key(project, &query);
        if let Some(CachedResult::Search(items)) = self.cached(&key) {
            return Ok(items);
        }

        let items = self
            .run("search_memories", self.service.search_memories(project, &query))
            .await?;
        if self.cache_enabled() {
            self.cache.insert(key, CachedResult::Search(items.clone()));
        }
        Ok(items)
    }

    /// Project statistics through the cache.
    pub async fn get_memory_stats(&self, project: &str) -> Result<MemoryStats, MemoryError> {
        let key = cache::stats_key(project);
        if let Some(CachedResult::Stats(stats)) = self.cached(&key) {
            return Ok(stats);
        }

        let stats = self
            .run("get_memory_stats", self.service.get_memory_stats(project))
            .await?;
        if self.cache_enabled() {
            self.cache.insert(key, CachedResult::Stats(stats.clone()));
        }
        Ok(stats)
    }

    /// Store many memories. Items run `batch_size` at a time, each through
    /// the limiter; one failure never fails its siblings.
    pub async fn add_memories_batch(&self, project: &str, memories: Vec<NewMemory>) -> BatchOutcome {
        let _gate = self.batch_gate.read().await;
        let batch_size = self.settings.read().batch_size.max(1);
        let mut results = Vec::with_capacity(memories.len());

        for group in memories.chunks(batch_size) {
            crate::metrics::record_batch_size(group.len());
            let outcomes = join_all(
                group
                    .iter()
                    .cloned()
                    .map(|memory| self.add_memory(project, memory)),
            )
            .await;
            results.extend(outcomes);
        }

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let failed = results.len() - succeeded;
        if failed > 0 {
            warn!(project, succeeded, failed, "Batch add finished with failures");
        } else {
            debug!(project, succeeded, "Batch add finished");
        }
        BatchOutcome {
            results,
            succeeded,
            failed,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> OptimizerMetrics {
        let c = &self.counters;
        let successful = c.successful.load(Ordering::Relaxed);
        let busy_us = c.busy_us.load(Ordering::Relaxed);
        let cache_stats = self.cache.stats();
        OptimizerMetrics {
            total_operations: c.total.load(Ordering::Relaxed),
            successful_operations: successful,
            failed_operations: c.failed.load(Ordering::Relaxed),
            timeout_operations: c.timeouts.load(Ordering::Relaxed),
            cached_operations: c.cached.load(Ordering::Relaxed),
            average_operation_ms: if successful == 0 {
                0.0
            } else {
                busy_us as f64 / successful as f64 / 1000.0
            },
            max_operation_ms: c.max_us.load(Ordering::Relaxed) as f64 / 1000.0,
            cache_hit_rate: cache_stats.hit_rate,
            cache_entries: cache_stats.entry_count,
            settings: self.settings(),
        }
    }

    pub fn reset_metrics(&self) {
        self.counters.reset();
        self.cache.reset_stats();
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Adjust settings from the metrics gathered so far:
    /// - timeout rate above 10%: timeout × 1.5, capped at 30s
    /// - mean latency above 5s: concurrency halved, floor 2
    /// - success rate below 80%: batch size minus one, floor 1
    ///
    /// Waits for in-flight batches. When anything changed the limiter is
    /// rebuilt, the service deadline updated and the metrics restarted.
    #[tracing::instrument(skip(self))]
    pub async fn auto_tune(&self) -> TuningReport {
        let _gate = self.batch_gate.write().await;
        let metrics = self.metrics();
        let before = self.settings();
        let mut after = before.clone();
        let mut adjustments = Vec::new();

        if metrics.total_operations == 0 {
            debug!("No operations recorded yet, nothing to tune");
            return TuningReport {
                before,
                after,
                adjustments,
            };
        }

        if metrics.timeout_rate() > TIMEOUT_RATE_THRESHOLD {
            let raised = before.operation_timeout.mul_f64(1.5).min(MAX_OPERATION_TIMEOUT);
            if raised != before.operation_timeout {
                after.operation_timeout = raised;
                adjustments.push(format!("Increased timeout to {:.1}s", raised.as_secs_f64()));
                crate::metrics::record_tuning_adjustment("operation_timeout");
            }
        }

        if metrics.average_operation_ms > SLOW_OPERATION_THRESHOLD.as_secs_f64() * 1000.0 {
            let reduced = (before.max_concurrent_ops / 2).max(MIN_CONCURRENCY);
            if reduced != before.max_concurrent_ops {
                after.max_concurrent_ops = reduced;
                adjustments.push(format!("Reduced concurrency to {reduced}"));
                crate::metrics::record_tuning_adjustment("max_concurrent_ops");
            }
        }

        if metrics.success_rate() < SUCCESS_RATE_THRESHOLD {
            let reduced = before.batch_size.saturating_sub(1).max(1);
            if reduced != before.batch_size {
                after.batch_size = reduced;
                adjustments.push(format!("Reduced batch size to {reduced}"));
                crate::metrics::record_tuning_adjustment("batch_size");
            }
        }

        if !adjustments.is_empty() {
            *self.limiter.write() = Arc::new(Semaphore::new(after.max_concurrent_ops));
            *self.settings.write() = after.clone();
            self.service.set_operation_timeout(Some(after.operation_timeout));
            self.counters.reset();
            crate::metrics::set_concurrency_limit(after.max_concurrent_ops);
            info!(adjustments = ?adjustments, "Performance tuning applied");
        }

        TuningReport {
            before,
            after,
            adjustments,
        }
    }

    /// Spawn the periodic sweep of expired cache entries (every half TTL).
    /// Calling it again replaces the running sweeper.
    pub fn start_cache_sweeper(&self) {
        let cache = Arc::clone(&self.cache);
        let period = (cache.ttl() / 2).max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!(removed, "Expired cache entries swept");
                }
            }
        });
        if let Some(old) = self.sweeper.lock().replace(handle) {
            old.abort();
        }
    }

    /// Stop background work and drop cached results.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.cache.clear();
        info!("Async optimizer stopped");
    }

    fn cache_enabled(&self) -> bool {
        self.settings.read().enable_cache
    }

    fn cached(&self, key: &str) -> Option<CachedResult> {
        if !self.cache_enabled() {
            return None;
        }
        let hit = self.cache.get(key)?;
        self.counters.cached.fetch_add(1, Ordering::Relaxed);
        Some(hit)
    }

    /// Run one operation under a limiter permit and record its outcome.
    async fn run<T, Fut>(&self, operation: &'static str, call: Fut) -> Result<T, MemoryError>
    where
        Fut: Future<Output = Result<T, MemoryError>>,
    {
        let limiter = Arc::clone(&self.limiter.read());
        let _permit = limiter
            .acquire_owned()
            .await
            .map_err(|_| MemoryError::NotInitialized)?;

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = call.await;
        let elapsed_us = started.elapsed().as_micros() as u64;

        match &result {
            Ok(_) => {
                self.counters.successful.fetch_add(1, Ordering::Relaxed);
                self.counters.busy_us.fetch_add(elapsed_us, Ordering::Relaxed);
                self.counters.max_us.fetch_max(elapsed_us, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if matches!(e, MemoryError::Timeout { .. }) {
                    self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                debug!(operation, error = %e, "Optimized operation failed");
            }
        }
        result
    }
}

impl Drop for AsyncOptimizer {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for AsyncOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOptimizer")
            .field("settings", &self.settings())
            .field("cache", &self.cache)
            .finish()
    }
}
