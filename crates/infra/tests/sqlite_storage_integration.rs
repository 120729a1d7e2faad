//! SqliteStorage against real database files

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tidemark_core::ports::{Collection, StorageAdapter, StorageError};
use tidemark_core::testing::ScriptedExecutor;
use tidemark_core::{EngineContext, MemoryStorage, OperationQueue};
use tidemark_domain::{NewOperation, OperationStatus, QueueConfig};
use tidemark_infra::{SqliteStorage, StorageConfig};

fn config_in(dir: &TempDir, name: &str) -> StorageConfig {
    StorageConfig { path: Some(dir.path().join(name)), ..StorageConfig::default() }
}

async fn open(config: &StorageConfig) -> SqliteStorage {
    let storage = SqliteStorage::open(config).expect("storage opened");
    storage.initialize().await.expect("schema created");
    storage
}

#[tokio::test]
async fn records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir, "engine.db");

    {
        let storage = open(&config).await;
        storage.store(Collection::Operations, "op-1", json!({"id": "op-1"})).await.unwrap();
        storage.set_setting("tidemark.offline_state", json!({"isOnline": false})).await.unwrap();
    }

    let storage = open(&config).await;
    assert_eq!(storage.path(), config.path.as_deref());
    assert_eq!(
        storage.retrieve(Collection::Operations, "op-1").await.unwrap(),
        Some(json!({"id": "op-1"}))
    );
    assert_eq!(
        storage.get_setting("tidemark.offline_state").await.unwrap(),
        Some(json!({"isOnline": false}))
    );
}

#[tokio::test]
async fn restore_replaces_everything() {
    let dir = TempDir::new().unwrap();
    let source = open(&config_in(&dir, "source.db")).await;
    source.store(Collection::Operations, "op-1", json!({"n": 1})).await.unwrap();
    source.store(Collection::Cache, "weather", json!({"temp": 21})).await.unwrap();
    source.store(Collection::Conflicts, "c-1", json!({"id": "c-1"})).await.unwrap();
    source.set_setting("theme", json!("dark")).await.unwrap();

    let target = open(&config_in(&dir, "target.db")).await;
    target.store(Collection::Cache, "stale", json!(true)).await.unwrap();
    target.set_setting("stale", json!(1)).await.unwrap();

    let backup = source.backup().await.unwrap();
    target.restore(&backup).await.unwrap();

    for collection in Collection::ALL {
        assert_eq!(
            target.retrieve_all(collection).await.unwrap(),
            source.retrieve_all(collection).await.unwrap(),
            "collection {collection}"
        );
    }
    assert_eq!(target.retrieve(Collection::Cache, "stale").await.unwrap(), None);
    assert_eq!(target.get_setting("stale").await.unwrap(), None);
    assert_eq!(target.get_setting("theme").await.unwrap(), Some(json!("dark")));
}

#[tokio::test]
async fn snapshots_move_between_adapters() {
    let dir = TempDir::new().unwrap();
    let sqlite = open(&config_in(&dir, "engine.db")).await;
    sqlite.store(Collection::SyncBatches, "b-1", json!({"size": 3})).await.unwrap();

    let memory = MemoryStorage::new();
    memory.restore(&sqlite.backup().await.unwrap()).await.unwrap();
    assert_eq!(memory.len(Collection::SyncBatches), 1);

    memory.set_setting("origin", json!("memory")).await.unwrap();
    sqlite.restore(&memory.backup().await.unwrap()).await.unwrap();
    assert_eq!(sqlite.get_setting("origin").await.unwrap(), Some(json!("memory")));
}

#[tokio::test]
async fn invalid_backup_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let storage = open(&config_in(&dir, "engine.db")).await;
    storage.store(Collection::Cache, "k", json!("v")).await.unwrap();

    let err = storage.restore(&[0x1f, 0x8b, 0x00]).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidBackup(_)));
    assert_eq!(storage.retrieve(Collection::Cache, "k").await.unwrap(), Some(json!("v")));
}

#[tokio::test]
async fn concurrent_writers_share_the_pool() {
    let dir = TempDir::new().unwrap();
    let storage = open(&config_in(&dir, "engine.db")).await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let storage = storage.clone();
        tasks.push(tokio::spawn(async move {
            storage.store(Collection::Cache, &format!("key-{i:02}"), json!(i)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let rows = storage.retrieve_all(Collection::Cache).await.unwrap();
    assert_eq!(rows.len(), 20);
    assert_eq!(rows[0], ("key-00".to_string(), json!(0)));
    assert_eq!(rows[19], ("key-19".to_string(), json!(19)));
}

#[tokio::test]
async fn queue_recovers_operations_after_restart() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir, "engine.db");
    let queue_config = QueueConfig { auto_drain: false, ..QueueConfig::default() };
    let executor = Arc::new(ScriptedExecutor::succeeding());

    let ids = {
        let (ctx, _scheduler) = EngineContext::manual(1_700_000_000_000);
        let queue = OperationQueue::new(
            queue_config.clone(),
            ctx,
            Arc::new(open(&config).await),
            executor.clone(),
        );
        queue.initialize().await.unwrap();
        let a = queue.add(NewOperation::new("todo.create", json!({"title": "a"}))).await.unwrap();
        let b = queue.add(NewOperation::new("todo.create", json!({"title": "b"}))).await.unwrap();
        queue.shutdown();
        [a, b]
    };

    let (ctx, _scheduler) = EngineContext::manual(1_700_000_060_000);
    let queue = OperationQueue::new(queue_config, ctx, Arc::new(open(&config).await), executor);
    queue.initialize().await.unwrap();

    assert_eq!(queue.len(), 2);
    for id in &ids {
        let op = queue.get(id).expect("operation reloaded");
        assert_eq!(op.status, OperationStatus::Pending);
    }
}
