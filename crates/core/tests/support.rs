//! Shared fixtures for the core integration tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tidemark_common::{ExponentialBackoff, ManualScheduler};
use tidemark_core::cache::OfflineCache;
use tidemark_core::ports::NoopBackgroundChannel;
use tidemark_core::testing::{ManualConnectivity, ScriptedExecutor};
use tidemark_core::{
    EngineContext, MemoryStorage, OfflineEngine, OperationQueue, SyncCoordinator,
};
use tidemark_domain::{
    CacheConfig, ConnectionQuality, ConnectivityStatus, EngineConfig, EventKind, NewOperation,
    Priority, QueueConfig, SyncConfig,
};

/// Epoch millis every virtual clock starts at
pub const START_MS: u64 = 1_700_000_000_000;

/// Queue config without the periodic drain and with a jitter-free backoff
pub fn queue_config() -> QueueConfig {
    QueueConfig {
        auto_drain: false,
        backoff: ExponentialBackoff::fixed(Duration::from_secs(1), 2.0, Duration::from_secs(30)),
        ..QueueConfig::default()
    }
}

pub fn sync_config() -> SyncConfig {
    SyncConfig { auto_sync: false, ..SyncConfig::default() }
}

/// Queue, cache and sync coordinator sharing one store and virtual clock
pub struct Components {
    pub ctx: EngineContext,
    pub scheduler: ManualScheduler,
    pub storage: Arc<MemoryStorage>,
    pub executor: Arc<ScriptedExecutor>,
    pub queue: OperationQueue,
    pub cache: OfflineCache,
    pub sync: SyncCoordinator,
}

impl Components {
    pub fn new(executor: ScriptedExecutor) -> Self {
        Self::with_configs(executor, queue_config(), CacheConfig::default(), sync_config())
    }

    pub fn with_configs(
        executor: ScriptedExecutor,
        queue: QueueConfig,
        cache: CacheConfig,
        sync: SyncConfig,
    ) -> Self {
        let (ctx, scheduler) = EngineContext::manual(START_MS);
        let storage = Arc::new(MemoryStorage::new());
        let executor = Arc::new(executor);
        let queue = OperationQueue::new(queue, ctx.clone(), storage.clone(), executor.clone());
        let cache = OfflineCache::new(cache, ctx.clone(), storage.clone());
        let sync =
            SyncCoordinator::new(sync, ctx.clone(), storage.clone(), queue.clone(), executor.clone());
        sync.set_online(true);
        Self { ctx, scheduler, storage, executor, queue, cache, sync }
    }

    pub async fn initialized(executor: ScriptedExecutor) -> Self {
        let components = Self::new(executor);
        components.queue.initialize().await.expect("queue should initialize");
        components.cache.initialize().await.expect("cache should initialize");
        components.sync.initialize().await.expect("sync should initialize");
        components
    }

    /// Number of recorded events of `kind`
    pub fn events_of(&self, kind: EventKind) -> usize {
        self.ctx.events.history().iter().filter(|record| record.event.kind() == kind).count()
    }
}

/// Engine over memory storage with test-driven connectivity
pub struct EngineHarness {
    pub engine: OfflineEngine,
    pub scheduler: ManualScheduler,
    pub storage: Arc<MemoryStorage>,
    pub executor: Arc<ScriptedExecutor>,
    pub connectivity: Arc<ManualConnectivity>,
}

impl EngineHarness {
    pub fn new(initial: ConnectivityStatus) -> Self {
        let config = EngineConfig {
            queue: queue_config(),
            sync: sync_config(),
            ..EngineConfig::default()
        };
        let (ctx, scheduler) = EngineContext::manual(START_MS);
        let storage = Arc::new(MemoryStorage::new());
        let executor = Arc::new(ScriptedExecutor::succeeding());
        let connectivity = Arc::new(ManualConnectivity::new(initial));
        let engine = OfflineEngine::new(
            config,
            ctx,
            storage.clone(),
            executor.clone(),
            connectivity.clone(),
            Arc::new(NoopBackgroundChannel),
        );
        Self { engine, scheduler, storage, executor, connectivity }
    }

    pub async fn online() -> Self {
        let harness = Self::new(ConnectivityStatus::online(ConnectionQuality::Good));
        harness.engine.initialize().await.expect("engine should initialize");
        harness
    }

    pub fn events_of(&self, kind: EventKind) -> usize {
        self.engine
            .context()
            .events
            .history()
            .iter()
            .filter(|record| record.event.kind() == kind)
            .count()
    }

    /// Let spawned listener tasks observe pending channel updates
    pub async fn settle(&self) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }
}

pub fn op(op_type: &str) -> NewOperation {
    NewOperation::new(op_type, json!({ "type": op_type }))
}

pub fn op_with_priority(op_type: &str, priority: Priority) -> NewOperation {
    op(op_type).with_priority(priority)
}
