//! End-to-end tests over the real file-backed backends.
//!
//! Every test builds the service from configuration with its stores inside
//! a fresh temp directory, so runs never share state.
//!
//! Run with: `cargo test --test end_to_end`

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use memory_service::{
    AsyncOptimizer, HealthAggregator, HealthLevel, MemoryCategory, MemoryError, MemoryQuery,
    MemoryService, MemoryServiceConfig, MemoryUpdate, NewMemory, OptimizerSettings,
    ReleaseReadyMemory, RetryConfig, ServiceState,
};

// =============================================================================
// Helpers
// =============================================================================

fn config_in(dir: &TempDir, chain: &[&str]) -> MemoryServiceConfig {
    let mut config = MemoryServiceConfig {
        fallback_chain: chain.iter().map(|s| s.to_string()).collect(),
        ..MemoryServiceConfig::default()
    };
    config.sqlite.path = dir.path().join("memories.db");
    config.document.path = dir.path().join("docs").join("memories.json");
    config
}

async fn start(config: MemoryServiceConfig) -> Arc<MemoryService> {
    let service = Arc::new(MemoryService::new(config).expect("valid config"));
    service.initialize().await.expect("initialize");
    service
}

async fn seed(service: &MemoryService, project: &str) -> Vec<String> {
    let memories = [
        NewMemory::new("Retry pattern with jittered backoff", MemoryCategory::Pattern)
            .with_tags(["resilience", "network"]),
        NewMemory::new("Builder pattern for config structs", MemoryCategory::Pattern)
            .with_tags(["api"]),
        NewMemory::new("Circuit breaker pattern per backend", MemoryCategory::Pattern)
            .with_tags(["resilience"]),
        NewMemory::new("Sqlite busy errors under load", MemoryCategory::Error)
            .with_tags(["sqlite"]),
        NewMemory::new("Document store lost writes on crash", MemoryCategory::Error),
    ];
    let mut ids = Vec::new();
    for memory in memories {
        ids.push(service.add_memory(project, memory).await.expect("add"));
    }
    ids
}

// =============================================================================
// Configured chain
// =============================================================================

#[tokio::test]
async fn sqlite_chain_round_trip() {
    let dir = TempDir::new().unwrap();
    let service = start(config_in(&dir, &["sqlite", "document", "memory"])).await;
    assert_eq!(service.active_backend_name().as_deref(), Some("sqlite"));

    let ids = seed(&service, "p1").await;
    assert_eq!(ids.len(), 5);

    let found = service
        .search_memories(
            "p1",
            &MemoryQuery::new("PATTERN").with_category(MemoryCategory::Pattern).with_limit(10),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 3);
    assert!(found.iter().all(|m| m.category == MemoryCategory::Pattern));

    let tagged = service
        .search_memories("p1", &MemoryQuery::new("").with_tags(["resilience"]))
        .await
        .unwrap();
    assert_eq!(tagged.len(), 2);

    let stats = service.get_memory_stats("p1").await.unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.categories.get("pattern"), Some(&3));
    assert_eq!(stats.categories.get("error"), Some(&2));
    assert_eq!(stats.backend, "sqlite");

    // Projects are isolated
    assert!(service.get_memory("p2", &ids[0]).await.unwrap().is_none());
    assert_eq!(service.get_memory_stats("p2").await.unwrap().total, 0);

    service.cleanup().await;
    assert_eq!(service.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn sqlite_data_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir, &["sqlite"]);

    let service = start(config.clone()).await;
    let id = service
        .add_memory("p1", NewMemory::new("durable note", MemoryCategory::Team))
        .await
        .unwrap();
    service
        .update_memory("p1", &id, MemoryUpdate::new().tags(["kept"]))
        .await
        .unwrap();
    service.cleanup().await;

    let reopened = start(config).await;
    let item = reopened.get_memory("p1", &id).await.unwrap().unwrap();
    assert_eq!(item.content, "durable note");
    assert_eq!(item.tags, vec!["kept"]);
    reopened.cleanup().await;
}

#[tokio::test]
async fn document_chain_round_trip() {
    let dir = TempDir::new().unwrap();
    let service = start(config_in(&dir, &["document", "memory"])).await;
    assert_eq!(service.active_backend_name().as_deref(), Some("document"));

    seed(&service, "p1").await;
    let found = service
        .search_memories("p1", &MemoryQuery::new("pattern").with_limit(2))
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(service.get_all_projects().await.unwrap(), vec!["p1"]);
    assert!(dir.path().join("docs").join("memories.json").exists());
}

#[tokio::test]
async fn unusable_first_backend_is_skipped_at_startup() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir, &["sqlite", "memory"]);
    // A directory cannot be opened as a database file
    config.sqlite.path = dir.path().to_path_buf();

    let service = start(config).await;
    assert_eq!(service.active_backend_name().as_deref(), Some("memory"));
    let health = service.get_service_health().await;
    assert!(!health.backends.iter().find(|b| b.backend_name == "sqlite").unwrap().is_healthy);
}

#[tokio::test]
async fn manual_switch_between_real_backends() {
    let dir = TempDir::new().unwrap();
    let service = start(config_in(&dir, &["sqlite", "document"])).await;
    service
        .add_memory("p1", NewMemory::new("only in sqlite", MemoryCategory::Project))
        .await
        .unwrap();

    service.switch_backend("document").await.unwrap();
    assert_eq!(service.get_memory_stats("p1").await.unwrap().total, 0);

    let err = service.switch_backend("remote").await.unwrap_err();
    assert_eq!(err, MemoryError::UnknownBackend("remote".into()));
}

// =============================================================================
// Backup and restore
// =============================================================================

#[tokio::test]
async fn sqlite_backup_and_restore() {
    let dir = TempDir::new().unwrap();
    let service = start(config_in(&dir, &["sqlite"])).await;
    let ids = seed(&service, "p1").await;
    let backup = dir.path().join("backups").join("memories.db.bak");

    service.create_backup("sqlite", &backup).await.unwrap();
    assert!(backup.exists());

    service.delete_memory("p1", &ids[0]).await.unwrap();
    assert_eq!(service.get_memory_stats("p1").await.unwrap().total, 4);

    service.restore_backup("sqlite", &backup).await.unwrap();
    assert_eq!(service.get_memory_stats("p1").await.unwrap().total, 5);
    assert!(service.get_memory("p1", &ids[0]).await.unwrap().is_some());
}

#[tokio::test]
async fn document_backup_and_restore() {
    let dir = TempDir::new().unwrap();
    let service = start(config_in(&dir, &["document"])).await;
    seed(&service, "p1").await;
    let backup = dir.path().join("memories.json.bak");

    service.create_backup("document", &backup).await.unwrap();
    service
        .add_memory("p1", NewMemory::new("after backup", MemoryCategory::Team))
        .await
        .unwrap();
    assert_eq!(service.get_memory_stats("p1").await.unwrap().total, 6);

    service.restore_backup("document", &backup).await.unwrap();
    assert_eq!(service.get_memory_stats("p1").await.unwrap().total, 5);
}

#[tokio::test]
async fn restore_from_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    let service = start(config_in(&dir, &["sqlite"])).await;
    let err = service
        .restore_backup("sqlite", &dir.path().join("nope.db"))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Backend { .. }));
}

// =============================================================================
// Layers on top of the service
// =============================================================================

#[tokio::test]
async fn optimizer_batch_over_sqlite() {
    let dir = TempDir::new().unwrap();
    let service = start(config_in(&dir, &["sqlite"])).await;
    let optimizer = AsyncOptimizer::new(
        Arc::clone(&service),
        OptimizerSettings {
            batch_size: 2,
            ..OptimizerSettings::default()
        },
    );

    let batch = (0..5)
        .map(|i| NewMemory::new(format!("batched note {i}"), MemoryCategory::Project))
        .collect();
    let outcome = optimizer.add_memories_batch("p1", batch).await;
    assert_eq!(outcome.succeeded, 5);
    assert_eq!(outcome.ids().len(), 5);

    let stats = optimizer.get_memory_stats("p1").await.unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(optimizer.metrics().successful_operations, 6);
}

#[tokio::test]
async fn release_wrapper_degrades_when_backend_is_forced_open() {
    let dir = TempDir::new().unwrap();
    let service = Arc::new(MemoryService::new(config_in(&dir, &["sqlite"])).unwrap());
    let memory = ReleaseReadyMemory::new(Arc::clone(&service))
        .with_init_retry(RetryConfig::linear(1, Duration::from_millis(1)));

    assert!(memory
        .add_memory("p1", NewMemory::new("stored", MemoryCategory::Project))
        .await
        .is_some());

    service.force_open_circuit("sqlite").unwrap();
    let dropped = memory
        .add_memory("p1", NewMemory::new("dropped", MemoryCategory::Project))
        .await;
    assert!(dropped.is_none());

    let metrics = memory.metrics();
    assert_eq!(metrics.total_operations, 2);
    assert_eq!(metrics.successful_operations, 1);
    assert_eq!(metrics.fallback_activations, 1);

    service.reset_circuit_breaker(Some("sqlite")).unwrap();
    assert_eq!(memory.get_memory_stats("p1").await.total, 1);
}

#[tokio::test]
async fn health_report_for_running_service() {
    let dir = TempDir::new().unwrap();
    let service = start(config_in(&dir, &["sqlite", "memory"])).await;
    seed(&service, "p1").await;

    let aggregator = HealthAggregator::new(Arc::clone(&service));
    let report = aggregator.check_health().await;
    assert_eq!(report.overall, HealthLevel::Healthy);
    assert!(report.critical_issues.is_empty());
    assert_eq!(aggregator.latest().map(|r| r.overall), Some(HealthLevel::Healthy));
}
