//! Health aggregation over the memory service.
//!
//! A [`HealthAggregator`] turns [`MemoryService::get_service_health`] plus
//! any registered [`HealthCollector`]s into a classified [`HealthReport`]:
//!
//! | Metric | Healthy when | Otherwise |
//! |---|---|---|
//! | `service_initialized` | service running | Critical |
//! | `active_backend` | a backend is active | Warning |
//! | `operation_success_rate` | ≥ 1 - error rate threshold | Warning |
//! | `circuit_breaker_activations` | below threshold | Warning |
//! | `healthy_backends` | at least one | Critical |
//! | `average_response_time` | below threshold | Warning |
//!
//! Per-backend alerts are raised on long failure streaks, slow responses and
//! low uptime, and resolve once the backend has strung together a few
//! successes. Reports are kept for the retention window and feed
//! [`trend()`](HealthAggregator::trend).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MemoryServiceConfig;
use crate::models::BackendHealth;
use crate::service::{MemoryService, ServiceHealth};

/// Overall or per-metric health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl HealthLevel {
    /// Numeric score used for trend analysis.
    #[must_use]
    pub fn score(self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Warning => 0.5,
            Self::Critical => 0.0,
            Self::Unknown => 0.25,
        }
    }

    fn gauge(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Warning => 1,
            Self::Critical => 2,
            Self::Unknown => 3,
        }
    }
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One evaluated metric.
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetric {
    pub name: String,
    pub value: Value,
    pub threshold: Option<f64>,
    pub level: HealthLevel,
    pub message: String,
}

impl HealthMetric {
    fn new(name: &str, value: Value, threshold: Option<f64>, level: HealthLevel, message: String) -> Self {
        Self {
            name: name.to_string(),
            value,
            threshold,
            level,
            message,
        }
    }
}

/// Health reported by an external collector.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorReport {
    pub source: String,
    pub level: HealthLevel,
    pub message: String,
}

impl CollectorReport {
    pub fn new(source: impl Into<String>, level: HealthLevel, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            level,
            message: message.into(),
        }
    }
}

/// Extra health source consulted on every check.
#[async_trait]
pub trait HealthCollector: Send + Sync {
    fn name(&self) -> &str;

    async fn collect_health(&self) -> Vec<CollectorReport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ConsecutiveFailures,
    SlowResponse,
    LowUptime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Medium,
    High,
}

/// A per-backend alert. Active until `resolved_at` is set.
#[derive(Debug, Clone, Serialize)]
pub struct BackendAlert {
    pub backend: String,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl BackendAlert {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Classification limits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthThresholds {
    /// Tolerated share of failed operations (0.05 = 5%)
    pub error_rate: f64,
    /// Breaker activations at or above this are a warning
    pub circuit_breaker_activations: u64,
    /// Mean backend response time above this is a warning
    pub response_time_ms: f64,
    pub alert_consecutive_failures: u64,
    pub alert_response_time_ms: f64,
    pub alert_min_uptime: f64,
    /// Requests a backend must have served before uptime is judged
    pub alert_uptime_min_requests: u64,
    /// Consecutive successes that resolve a backend's alerts
    pub alert_resolve_successes: u64,
}

impl HealthThresholds {
    pub fn from_config(config: &MemoryServiceConfig) -> Self {
        Self {
            error_rate: config.health_error_rate_threshold,
            circuit_breaker_activations: config.health_circuit_breaker_threshold,
            response_time_ms: config.health_response_time_threshold_ms,
            ..Self::default()
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.05,
            circuit_breaker_activations: 3,
            response_time_ms: 5000.0,
            alert_consecutive_failures: 5,
            alert_response_time_ms: 10_000.0,
            alert_min_uptime: 0.95,
            alert_uptime_min_requests: 10,
            alert_resolve_successes: 3,
        }
    }
}

/// Result of one health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthLevel,
    pub metrics: Vec<HealthMetric>,
    pub collectors: Vec<CollectorReport>,
    pub critical_issues: Vec<String>,
    pub warnings: Vec<String>,
    /// Alerts active when the report was generated
    pub active_alerts: Vec<BackendAlert>,
    pub generated_at: DateTime<Utc>,
    pub check_duration_ms: f64,
}

impl HealthReport {
    pub fn metric(&self, name: &str) -> Option<&HealthMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

/// Direction of health over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTrend {
    Improving,
    Stable,
    Degrading,
    InsufficientData,
}

/// Minimum score difference between the two halves of a window.
const TREND_BAND: f64 = 0.2;

/// Compare the mean score of the newer half of `levels` against the older half.
pub fn trend_of(levels: &[HealthLevel]) -> HealthTrend {
    if levels.len() < 2 {
        return HealthTrend::InsufficientData;
    }
    let (older, newer) = levels.split_at(levels.len() / 2);
    let mean = |half: &[HealthLevel]| half.iter().map(|l| l.score()).sum::<f64>() / half.len() as f64;
    let (older, newer) = (mean(older), mean(newer));
    if newer > older + TREND_BAND {
        HealthTrend::Improving
    } else if newer < older - TREND_BAND {
        HealthTrend::Degrading
    } else {
        HealthTrend::Stable
    }
}

pub struct HealthAggregator {
    service: Arc<MemoryService>,
    thresholds: HealthThresholds,
    interval: Duration,
    retention: chrono::Duration,
    collectors: RwLock<Vec<Arc<dyn HealthCollector>>>,
    history: Mutex<VecDeque<HealthReport>>,
    alerts: Mutex<Vec<BackendAlert>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthAggregator {
    /// Thresholds, interval and retention come from the service's config.
    pub fn new(service: Arc<MemoryService>) -> Self {
        let config = service.config();
        let interval = Duration::from_secs(config.health_check_interval_secs.max(1));
        let retention = Duration::from_secs(config.health_history_retention_hours * 3600);
        Self::with_settings(service, HealthThresholds::from_config(&config), interval, retention)
    }

    pub fn with_settings(
        service: Arc<MemoryService>,
        thresholds: HealthThresholds,
        interval: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            service,
            thresholds,
            interval,
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::hours(24)),
            collectors: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    pub fn register_collector(&self, collector: Arc<dyn HealthCollector>) {
        info!(collector = %collector.name(), "Health collector registered");
        self.collectors.write().push(collector);
    }

    /// Run one check, store it in history and return it.
    #[tracing::instrument(skip(self))]
    pub async fn check_health(&self) -> HealthReport {
        let started = Instant::now();
        let health = self.service.get_service_health().await;
        let metrics = self.evaluate(&health);

        let collectors: Vec<Arc<dyn HealthCollector>> = self.collectors.read().clone();
        let mut collected = Vec::new();
        for collector in collectors {
            collected.extend(collector.collect_health().await);
        }

        let active_alerts = self.update_alerts(&health.backends);

        let mut critical_issues = Vec::new();
        let mut warnings = Vec::new();
        for metric in &metrics {
            match metric.level {
                HealthLevel::Critical => critical_issues.push(metric.message.clone()),
                HealthLevel::Warning => warnings.push(metric.message.clone()),
                _ => {}
            }
        }
        for report in &collected {
            let line = format!("{}: {}", report.source, report.message);
            match report.level {
                HealthLevel::Critical => critical_issues.push(line),
                HealthLevel::Warning => warnings.push(line),
                _ => {}
            }
        }
        warnings.extend(active_alerts.iter().map(|a| format!("{}: {}", a.backend, a.message)));

        let overall = if !critical_issues.is_empty() {
            HealthLevel::Critical
        } else if !warnings.is_empty() {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };

        let report = HealthReport {
            overall,
            metrics,
            collectors: collected,
            critical_issues,
            warnings,
            active_alerts,
            generated_at: Utc::now(),
            check_duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        };

        crate::metrics::set_health_level(overall.gauge());
        match overall {
            HealthLevel::Critical => warn!(issues = ?report.critical_issues, "Memory system health critical"),
            HealthLevel::Warning => info!(warnings = report.warnings.len(), "Memory system health degraded"),
            _ => debug!(duration_ms = report.check_duration_ms, "Health check completed"),
        }

        self.push_history(report.clone());
        report
    }

    fn evaluate(&self, health: &ServiceHealth) -> Vec<HealthMetric> {
        let t = &self.thresholds;
        let mut metrics = Vec::with_capacity(6);

        metrics.push(HealthMetric::new(
            "service_initialized",
            json!(health.initialized),
            None,
            if health.initialized { HealthLevel::Healthy } else { HealthLevel::Critical },
            format!("Memory service state: {}", health.state),
        ));

        metrics.push(HealthMetric::new(
            "active_backend",
            json!(health.active_backend),
            None,
            if health.active_backend.is_some() { HealthLevel::Healthy } else { HealthLevel::Warning },
            format!("Active backend: {}", health.active_backend.as_deref().unwrap_or("none")),
        ));

        let success_rate = health.metrics.success_rate();
        let floor = 1.0 - t.error_rate;
        metrics.push(HealthMetric::new(
            "operation_success_rate",
            json!(success_rate),
            Some(floor),
            if success_rate >= floor { HealthLevel::Healthy } else { HealthLevel::Warning },
            format!("Success rate: {:.2}%", success_rate * 100.0),
        ));

        let activations = health.metrics.circuit_breaker_activations;
        metrics.push(HealthMetric::new(
            "circuit_breaker_activations",
            json!(activations),
            Some(t.circuit_breaker_activations as f64),
            if activations < t.circuit_breaker_activations { HealthLevel::Healthy } else { HealthLevel::Warning },
            format!("Circuit breaker activations: {activations}"),
        ));

        let healthy = health.healthy_backends();
        let total = health.backends.len();
        metrics.push(HealthMetric::new(
            "healthy_backends",
            json!(healthy),
            None,
            if healthy > 0 { HealthLevel::Healthy } else { HealthLevel::Critical },
            format!("Healthy backends: {healthy}/{total}"),
        ));

        let response_ms = health.average_response_time_ms();
        metrics.push(HealthMetric::new(
            "average_response_time",
            json!(response_ms),
            Some(t.response_time_ms),
            if response_ms <= t.response_time_ms { HealthLevel::Healthy } else { HealthLevel::Warning },
            format!("Average response time: {response_ms:.1}ms"),
        ));

        metrics
    }

    /// Raise, dedupe and resolve per-backend alerts. Returns the active ones.
    fn update_alerts(&self, backends: &[BackendHealth]) -> Vec<BackendAlert> {
        let t = &self.thresholds;
        let now = Utc::now();
        let mut alerts = self.alerts.lock();

        for backend in backends {
            let name = backend.backend_name.as_str();
            let mut raise = |kind: AlertKind, severity: AlertSeverity, message: String| {
                let exists = alerts
                    .iter()
                    .any(|a| a.backend == name && a.kind == kind && a.is_active());
                if !exists {
                    warn!(backend = %name, alert = ?kind, detail = %message, "Backend health alert");
                    alerts.push(BackendAlert {
                        backend: name.to_string(),
                        kind,
                        severity,
                        message,
                        raised_at: now,
                        resolved_at: None,
                    });
                }
            };

            if backend.consecutive_failures >= t.alert_consecutive_failures {
                raise(
                    AlertKind::ConsecutiveFailures,
                    AlertSeverity::High,
                    format!("{} consecutive failures", backend.consecutive_failures),
                );
            }
            if backend.response_time_ms > t.alert_response_time_ms {
                raise(
                    AlertKind::SlowResponse,
                    AlertSeverity::Medium,
                    format!("response time {:.0}ms exceeds threshold", backend.response_time_ms),
                );
            }
            if backend.total_requests >= t.alert_uptime_min_requests
                && backend.success_rate() < t.alert_min_uptime
            {
                raise(
                    AlertKind::LowUptime,
                    AlertSeverity::High,
                    format!("uptime {:.1}% below threshold", backend.success_rate() * 100.0),
                );
            }

            if backend.is_healthy && backend.consecutive_successes >= t.alert_resolve_successes {
                let mut resolved = 0;
                for alert in alerts.iter_mut().filter(|a| a.backend == name && a.is_active()) {
                    alert.resolved_at = Some(now);
                    resolved += 1;
                }
                if resolved > 0 {
                    info!(backend = %name, resolved, "Backend alerts resolved");
                }
            }
        }

        let cutoff = now - self.retention;
        alerts.retain(|a| a.resolved_at.map_or(true, |at| at > cutoff));
        alerts.iter().filter(|a| a.is_active()).cloned().collect()
    }

    fn push_history(&self, report: HealthReport) {
        let cutoff = report.generated_at - self.retention;
        let mut history = self.history.lock();
        history.push_back(report);
        while history.front().is_some_and(|r| r.generated_at < cutoff) {
            history.pop_front();
        }
    }

    #[must_use]
    pub fn latest(&self) -> Option<HealthReport> {
        self.history.lock().back().cloned()
    }

    /// Reports generated within `window` of now, oldest first.
    #[must_use]
    pub fn history(&self, window: Duration) -> Vec<HealthReport> {
        let Ok(window) = chrono::Duration::from_std(window) else {
            return self.history.lock().iter().cloned().collect();
        };
        let cutoff = Utc::now() - window;
        self.history
            .lock()
            .iter()
            .filter(|r| r.generated_at >= cutoff)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn trend(&self, window: Duration) -> HealthTrend {
        let levels: Vec<HealthLevel> = self.history(window).iter().map(|r| r.overall).collect();
        trend_of(&levels)
    }

    /// Every alert still retained, active or resolved.
    #[must_use]
    pub fn alerts(&self) -> Vec<BackendAlert> {
        self.alerts.lock().clone()
    }

    /// Spawn the periodic check loop. Calling it again restarts the loop.
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(aggregator) = weak.upgrade() else {
                    break;
                };
                aggregator.check_health().await;
            }
        });
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
        info!(interval_secs = period.as_secs(), "Health monitoring started");
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("Health monitoring stopped");
        }
    }
}

impl Drop for HealthAggregator {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryBackend, MemoryBackend};

    fn service() -> Arc<MemoryService> {
        let backend: Arc<dyn MemoryBackend> = Arc::new(InMemoryBackend::default());
        Arc::new(MemoryService::with_backends(MemoryServiceConfig::default(), vec![backend]))
    }

    fn report_at(level: HealthLevel, at: DateTime<Utc>) -> HealthReport {
        HealthReport {
            overall: level,
            metrics: Vec::new(),
            collectors: Vec::new(),
            critical_issues: Vec::new(),
            warnings: Vec::new(),
            active_alerts: Vec::new(),
            generated_at: at,
            check_duration_ms: 0.0,
        }
    }

    struct Fixed(HealthLevel);

    #[async_trait]
    impl HealthCollector for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn collect_health(&self) -> Vec<CollectorReport> {
            vec![CollectorReport::new("agent-1", self.0, "collector says so")]
        }
    }

    #[test]
    fn test_level_scores() {
        assert_eq!(HealthLevel::Healthy.score(), 1.0);
        assert_eq!(HealthLevel::Warning.score(), 0.5);
        assert_eq!(HealthLevel::Critical.score(), 0.0);
        assert_eq!(HealthLevel::Unknown.score(), 0.25);
        assert_eq!(HealthLevel::Critical.to_string(), "critical");
    }

    #[test]
    fn test_trend_bands() {
        use HealthLevel::*;
        assert_eq!(trend_of(&[]), HealthTrend::InsufficientData);
        assert_eq!(trend_of(&[Healthy]), HealthTrend::InsufficientData);
        assert_eq!(trend_of(&[Critical, Critical, Healthy, Healthy]), HealthTrend::Improving);
        assert_eq!(trend_of(&[Healthy, Healthy, Warning, Critical]), HealthTrend::Degrading);
        // 0.5 vs 0.58: inside the band
        assert_eq!(trend_of(&[Warning, Warning, Warning, Healthy, Unknown]), HealthTrend::Stable);
    }

    #[tokio::test]
    async fn test_uninitialized_service_is_critical() {
        let aggregator = HealthAggregator::new(service());
        let report = aggregator.check_health().await;
        assert_eq!(report.overall, HealthLevel::Critical);
        assert_eq!(report.metric("service_initialized").unwrap().level, HealthLevel::Critical);
        assert_eq!(report.metric("healthy_backends").unwrap().level, HealthLevel::Critical);
        assert_eq!(report.metrics.len(), 6);
    }

    #[tokio::test]
    async fn test_running_service_is_healthy() {
        let service = service();
        service.initialize().await.unwrap();
        let aggregator = HealthAggregator::new(Arc::clone(&service));

        let report = aggregator.check_health().await;
        assert_eq!(report.overall, HealthLevel::Healthy, "{:?}", report.warnings);
        assert!(report.critical_issues.is_empty());
        assert_eq!(aggregator.latest().unwrap().overall, HealthLevel::Healthy);
    }

    #[tokio::test]
    async fn test_breaker_activations_warn() {
        let service = service();
        service.initialize().await.unwrap();
        for _ in 0..3 {
            service.force_open_circuit("memory").unwrap();
            service.reset_circuit_breaker(Some("memory")).unwrap();
        }
        let aggregator = HealthAggregator::new(service);
        let report = aggregator.check_health().await;
        assert_eq!(report.overall, HealthLevel::Warning);
        assert_eq!(
            report.metric("circuit_breaker_activations").unwrap().level,
            HealthLevel::Warning
        );
    }

    #[tokio::test]
    async fn test_collector_levels_feed_overall() {
        let service = service();
        service.initialize().await.unwrap();
        let aggregator = HealthAggregator::new(service);

        aggregator.register_collector(Arc::new(Fixed(HealthLevel::Warning)));
        assert_eq!(aggregator.check_health().await.overall, HealthLevel::Warning);

        aggregator.register_collector(Arc::new(Fixed(HealthLevel::Critical)));
        let report = aggregator.check_health().await;
        assert_eq!(report.overall, HealthLevel::Critical);
        assert_eq!(report.collectors.len(), 2);
    }

    #[test]
    fn test_alerts_raise_once_and_resolve() {
        let aggregator = HealthAggregator::new(service());
        let mut backend = BackendHealth::new("sqlite");
        for _ in 0..5 {
            backend.record(false, 12_000.0, Some("disk I/O error".into()));
        }

        let active = aggregator.update_alerts(std::slice::from_ref(&backend));
        let kinds: Vec<AlertKind> = active.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::ConsecutiveFailures, AlertKind::SlowResponse]);

        // Same condition again does not duplicate
        assert_eq!(aggregator.update_alerts(std::slice::from_ref(&backend)).len(), 2);

        for _ in 0..5 {
            backend.record(true, 5.0, None);
        }
        // 5 of 10 succeeded: low uptime is raised, then everything resolves
        assert!(aggregator.update_alerts(std::slice::from_ref(&backend)).is_empty());
        let all = aggregator.alerts();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|a| !a.is_active()));
    }

    #[test]
    fn test_history_window_and_trend() {
        let aggregator = HealthAggregator::new(service());
        let now = Utc::now();
        aggregator.push_history(report_at(HealthLevel::Healthy, now - chrono::Duration::hours(3)));
        aggregator.push_history(report_at(HealthLevel::Critical, now - chrono::Duration::minutes(20)));
        aggregator.push_history(report_at(HealthLevel::Critical, now - chrono::Duration::minutes(10)));
        aggregator.push_history(report_at(HealthLevel::Healthy, now));
        aggregator.push_history(report_at(HealthLevel::Healthy, now));

        assert_eq!(aggregator.history(Duration::from_secs(3600)).len(), 4);
        assert_eq!(aggregator.history(Duration::from_secs(24 * 3600)).len(), 5);
        assert_eq!(aggregator.trend(Duration::from_secs(3600)), HealthTrend::Improving);
        assert_eq!(aggregator.trend(Duration::from_secs(60)), HealthTrend::Stable);
    }

    #[test]
    fn test_history_retention_drops_old_reports() {
        let aggregator = HealthAggregator::with_settings(
            service(),
            HealthThresholds::default(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        let now = Utc::now();
        aggregator.push_history(report_at(HealthLevel::Healthy, now - chrono::Duration::hours(2)));
        aggregator.push_history(report_at(HealthLevel::Warning, now));
        assert_eq!(aggregator.history(Duration::from_secs(24 * 3600)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_collects_reports() {
        let service = service();
        service.initialize().await.unwrap();
        let aggregator = Arc::new(HealthAggregator::with_settings(
            service,
            HealthThresholds::default(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        ));
        aggregator.start();
        tokio::time::sleep(Duration::from_secs(125)).await;
        aggregator.shutdown();
        // Ticks at 0s, 60s and 120s
        assert_eq!(aggregator.history(Duration::from_secs(3600)).len(), 3);
    }
}
