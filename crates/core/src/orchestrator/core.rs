//! The engine handle hosts talk to
//!
//! [`OfflineEngine`] owns the aggregate [`OfflineState`], turns connectivity
//! readings into online/offline transitions and fronts the queue, cache and
//! sync coordinator. State is published through a `watch` channel and only
//! changes (and persists) on actual differences.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tidemark_common::time::{once, repeating};
use tidemark_common::TaskHandle;
use tidemark_domain::constants::{
    DIAGNOSTICS_CACHE_KEY, SETTINGS_DIAGNOSTICS_PROBE, SETTINGS_OFFLINE_STATE,
};
use tidemark_domain::{
    CacheStrategy, Conflict, ConflictResolution, ConnectivityStatus, EngineConfig, EngineEvent,
    EventKind, NewOperation, OfflineState, StorageSnapshot, SyncOptions, SyncReport,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::backup::Backup;
use super::diagnostics::{CheckResult, Diagnostics, DiagnosticsReport, EngineStats};
use super::errors::{EngineError, EngineResult, ErrorKind};
use super::metrics::{EngineMetrics, MetricsSnapshot};
use crate::cache::{Fallback, GetOptions, OfflineCache, PrefetchOptions, SetOptions};
use crate::context::EngineContext;
use crate::events::Subscription;
use crate::guard::FlagGuard;
use crate::ports::{
    BackgroundChannel, BackgroundMessage, ConflictResolver, ConnectivityMonitor, RemoteExecutor,
    StorageAdapter,
};
use crate::queue::OperationQueue;
use crate::sync::{ResolutionSummary, SyncCoordinator};

struct EngineInner {
    config: EngineConfig,
    ctx: EngineContext,
    storage: Arc<dyn StorageAdapter>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    channel: Arc<dyn BackgroundChannel>,
    queue: OperationQueue,
    cache: OfflineCache,
    sync: SyncCoordinator,
    ready: OnceCell<()>,
    destroyed: AtomicBool,
    channel_open: AtomicBool,
    probing: AtomicBool,
    state: watch::Sender<OfflineState>,
    metrics: EngineMetrics,
    timers: Mutex<Vec<TaskHandle>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Offline-first engine: queue, cache and sync behind one handle
///
/// Construct with [`OfflineEngine::new`] (or the infra crate's builder),
/// call [`initialize`](Self::initialize) before use and
/// [`destroy`](Self::destroy) when done. Clones share state.
#[derive(Clone)]
pub struct OfflineEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for OfflineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineEngine")
            .field("initialized", &self.is_initialized())
            .field("destroyed", &self.is_destroyed())
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

impl OfflineEngine {
    pub fn new(
        config: EngineConfig,
        ctx: EngineContext,
        storage: Arc<dyn StorageAdapter>,
        executor: Arc<dyn RemoteExecutor>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        channel: Arc<dyn BackgroundChannel>,
    ) -> Self {
        let queue = OperationQueue::new(
            config.queue.clone(),
            ctx.clone(),
            Arc::clone(&storage),
            Arc::clone(&executor),
        );
        let cache = OfflineCache::new(config.cache.clone(), ctx.clone(), Arc::clone(&storage));
        let sync = SyncCoordinator::new(
            config.sync.clone(),
            ctx.clone(),
            Arc::clone(&storage),
            queue.clone(),
            executor,
        );
        let metrics = EngineMetrics::new(ctx.clock.now(), config.orchestrator.latency_smoothing);
        let (state, _) = watch::channel(OfflineState::default());

        Self {
            inner: Arc::new(EngineInner {
                config,
                ctx,
                storage,
                connectivity,
                channel,
                queue,
                cache,
                sync,
                ready: OnceCell::new(),
                destroyed: AtomicBool::new(false),
                channel_open: AtomicBool::new(false),
                probing: AtomicBool::new(false),
                state,
                metrics,
                timers: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    fn upgrade(weak: &Weak<EngineInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &EngineContext {
        &self.inner.ctx
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.inner.queue
    }

    pub fn cache(&self) -> &OfflineCache {
        &self.inner.cache
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.inner.sync
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bring up storage and every component, restore persisted state and
    /// start listening for connectivity changes
    ///
    /// Safe to call repeatedly and concurrently; only the first call does
    /// the work and the others wait for it.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> EngineResult<()> {
        self.ensure_not_destroyed()?;
        self.inner.ready.get_or_try_init(|| self.start()).await?;
        Ok(())
    }

    async fn start(&self) -> EngineResult<()> {
        let inner = &self.inner;
        inner.storage.initialize().await?;
        futures::try_join!(
            async { inner.queue.initialize().await.map_err(EngineError::from) },
            async { inner.cache.initialize().await.map_err(EngineError::from) },
            async { inner.sync.initialize().await.map_err(EngineError::from) },
        )?;

        self.restore_state().await;
        self.apply_initial_connectivity(inner.connectivity.current());
        self.subscribe_events();
        self.spawn_connectivity_listener();
        self.start_timers();
        self.open_channel();
        self.persist_state().await;

        let state = self.get_state();
        info!(
            online = state.is_online,
            pending = state.pending_operations,
            cache_entries = state.storage.cache_entries,
            "offline engine initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.ready.initialized()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    fn ensure_not_destroyed(&self) -> EngineResult<()> {
        if self.is_destroyed() {
            Err(EngineError::destroyed())
        } else {
            Ok(())
        }
    }

    fn ensure_ready(&self) -> EngineResult<()> {
        self.ensure_not_destroyed()?;
        if self.is_initialized() {
            Ok(())
        } else {
            Err(EngineError::not_initialized())
        }
    }

    /// Stop timers and listeners, shut every component down and persist the
    /// final state. Idempotent.
    #[instrument(skip(self))]
    pub async fn destroy(&self) -> EngineResult<()> {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for timer in self.inner.timers.lock().drain(..) {
            timer.cancel();
        }
        for listener in self.inner.listeners.lock().drain(..) {
            listener.abort();
        }
        for subscription in self.inner.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        self.inner.channel_open.store(false, Ordering::Release);

        self.inner.queue.shutdown();
        self.inner.cache.shutdown();
        self.inner.sync.shutdown();

        if self.is_initialized() {
            self.refresh_state();
            self.persist_state().await;
        }
        info!("offline engine destroyed");
        Ok(())
    }

    async fn restore_state(&self) {
        if !self.inner.config.orchestrator.persist_state {
            return;
        }
        match self.inner.storage.get_setting(SETTINGS_OFFLINE_STATE).await {
            Ok(Some(value)) => match serde_json::from_value::<OfflineState>(value) {
                Ok(saved) => {
                    self.update_state(|state| state.last_sync_time = saved.last_sync_time);
                    debug!(last_sync_time = ?saved.last_sync_time, "restored persisted state");
                }
                Err(e) => warn!(error = %e, "ignoring unreadable persisted state"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "could not read persisted state"),
        }
    }

    async fn persist_state(&self) {
        if !self.inner.config.orchestrator.persist_state {
            return;
        }
        let state = self.get_state();
        let result = match serde_json::to_value(&state) {
            Ok(value) => self
                .inner
                .storage
                .set_setting(SETTINGS_OFFLINE_STATE, value)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = result {
            warn!(error = %e, "could not persist engine state");
        }
    }

    fn subscribe_events(&self) {
        let weak = Arc::downgrade(&self.inner);
        let subscription = self.inner.ctx.events.on_any(move |event| {
            let Some(engine) = OfflineEngine::upgrade(&weak) else {
                return;
            };
            engine.inner.metrics.record_event(event);
            if !matches!(
                event.kind(),
                EventKind::OfflineDetected | EventKind::OnlineDetected | EventKind::NetworkQualityChanged
            ) {
                engine.refresh_state();
            }
        });
        self.inner.subscriptions.lock().push(subscription);
    }

    fn start_timers(&self) {
        let config = &self.inner.config.orchestrator;
        let mut timers = self.inner.timers.lock();

        if !config.probe_interval.is_zero() {
            let weak = Arc::downgrade(&self.inner);
            timers.push(self.inner.ctx.scheduler.schedule_repeating(
                "engine.probe",
                config.probe_interval,
                repeating(move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(engine) = OfflineEngine::upgrade(&weak) {
                            engine.check_connectivity().await;
                        }
                    }
                }),
            ));
        }

        if !config.metrics_interval.is_zero() {
            let weak = Arc::downgrade(&self.inner);
            timers.push(self.inner.ctx.scheduler.schedule_repeating(
                "engine.metrics",
                config.metrics_interval,
                repeating(move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(engine) = OfflineEngine::upgrade(&weak) {
                            engine.capture_metrics().await;
                        }
                    }
                }),
            ));
        }
    }

    async fn capture_metrics(&self) -> MetricsSnapshot {
        let snapshot =
            self.inner.metrics.snapshot(self.inner.ctx.clock.now(), self.inner.ctx.now_ms());
        self.refresh_state();
        self.persist_state().await;
        debug!(
            uptime_ms = snapshot.uptime_ms,
            offline_ms = snapshot.offline_ms,
            syncs = snapshot.syncs_completed,
            average_sync_ms = snapshot.average_sync_ms,
            "metrics snapshot"
        );
        snapshot
    }

    // -----------------------------------------------------------------------
    // Connectivity
    // -----------------------------------------------------------------------

    fn apply_initial_connectivity(&self, status: ConnectivityStatus) {
        let now = self.inner.ctx.now_ms();
        self.update_state(|state| {
            state.is_online = status.reachable;
            state.connection_quality = status.quality;
            state.network.quality = status.quality;
            state.network.last_checked = Some(now);
            state.network.latency_ms = status.latency_ms;
            state.network.offline_since = (!status.reachable).then_some(now);
        });
        self.inner.sync.set_online(status.reachable);
        if !status.reachable {
            self.inner.queue.pause();
            self.inner.metrics.went_offline(self.inner.ctx.clock.now());
        }
        self.refresh_state();
    }

    fn spawn_connectivity_listener(&self) {
        let mut changes = self.inner.connectivity.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let listener = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let status = *changes.borrow_and_update();
                let Some(engine) = OfflineEngine::upgrade(&weak) else {
                    break;
                };
                engine.report_connectivity(status).await;
            }
        });
        self.inner.listeners.lock().push(listener);
    }

    /// Run one active probe and apply its result
    pub async fn check_connectivity(&self) -> Option<ConnectivityStatus> {
        let _guard = FlagGuard::try_acquire(&self.inner.probing)?;
        let status = self.inner.connectivity.probe().await;
        self.report_connectivity(status).await;
        Some(status)
    }

    /// Apply a connectivity reading from a native signal or a probe
    ///
    /// Only a change of reachability flips the online state; sync failures
    /// never do.
    pub async fn report_connectivity(&self, status: ConnectivityStatus) {
        if self.is_destroyed() || !self.is_initialized() {
            return;
        }
        let now = self.inner.ctx.now_ms();
        let mut previous = None;
        self.update_state(|state| {
            previous = Some((state.is_online, state.connection_quality));
            state.is_online = status.reachable;
            state.connection_quality = status.quality;
            state.network.quality = status.quality;
            state.network.last_checked = Some(now);
            if status.latency_ms.is_some() {
                state.network.latency_ms = status.latency_ms;
            }
        });
        let Some((was_online, previous_quality)) = previous else {
            return;
        };

        if previous_quality != status.quality {
            debug!(from = %previous_quality, to = %status.quality, "connection quality changed");
            self.inner.ctx.events.emit(EngineEvent::NetworkQualityChanged {
                from: previous_quality,
                to: status.quality,
            });
        }
        match (was_online, status.reachable) {
            (true, false) => self.went_offline(now).await,
            (false, true) => self.came_online(now).await,
            _ => {}
        }
    }

    async fn went_offline(&self, now: u64) {
        self.inner.queue.pause();
        self.inner.sync.set_online(false);
        self.inner.metrics.went_offline(self.inner.ctx.clock.now());
        self.update_state(|state| state.network.offline_since = Some(now));

        warn!("connectivity lost, queue paused");
        self.inner.ctx.events.emit(EngineEvent::OfflineDetected { at: now });
        self.persist_state().await;
    }

    async fn came_online(&self, now: u64) {
        self.inner.queue.resume();
        self.inner.sync.set_online(true);
        let outage = self.inner.metrics.came_online(self.inner.ctx.clock.now());
        self.update_state(|state| state.network.offline_since = None);

        let offline_for_ms = outage.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        info!(offline_for_ms = ?offline_for_ms, "connectivity restored");
        self.inner.ctx.events.emit(EngineEvent::OnlineDetected { at: now, offline_for_ms });
        self.persist_state().await;

        if self.inner.config.orchestrator.sync_on_reconnect {
            self.schedule_reconnect_sync();
        }
    }

    fn schedule_reconnect_sync(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = self.inner.ctx.scheduler.schedule_once(
            "engine.reconnect_sync",
            Duration::ZERO,
            once(move || async move {
                let Some(engine) = OfflineEngine::upgrade(&weak) else {
                    return;
                };
                match engine.sync_now(SyncOptions::default()).await {
                    Ok(report) => debug!(synced = report.synced_items, "reconnect sync finished"),
                    Err(e) if e.recoverable => debug!(error = %e, "reconnect sync skipped"),
                    Err(e) => warn!(error = %e, "reconnect sync failed"),
                }
            }),
        );
        let mut timers = self.inner.timers.lock();
        timers.retain(|timer| !timer.is_cancelled());
        timers.push(handle);
    }

    // -----------------------------------------------------------------------
    // Background channel
    // -----------------------------------------------------------------------

    fn open_channel(&self) {
        let channel = &self.inner.channel;
        if !self.inner.config.orchestrator.enable_background_channel || !channel.is_available() {
            debug!("background channel unavailable, continuing without it");
            return;
        }
        self.inner.channel_open.store(true, Ordering::Release);
        let mut listeners = self.inner.listeners.lock();

        if let Some(mut incoming) = channel.incoming() {
            let weak = Arc::downgrade(&self.inner);
            listeners.push(tokio::spawn(async move {
                loop {
                    match incoming.recv().await {
                        Ok(message) => {
                            let Some(engine) = OfflineEngine::upgrade(&weak) else {
                                break;
                            };
                            engine.handle_background(message).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "background channel lagged, messages dropped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        let mut changes = self.inner.state.subscribe();
        let weak = Arc::downgrade(&self.inner);
        listeners.push(tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let state = changes.borrow_and_update().clone();
                let Some(engine) = OfflineEngine::upgrade(&weak) else {
                    break;
                };
                engine.notify_peers(BackgroundMessage::StateChanged { state }).await;
            }
        }));
        info!("background channel open");
    }

    async fn handle_background(&self, message: BackgroundMessage) {
        match message {
            BackgroundMessage::SyncRequested => {
                if self.get_state().is_online {
                    if let Err(e) = self.sync_now(SyncOptions::default()).await {
                        debug!(error = %e, "peer-requested sync not run");
                    }
                }
            }
            BackgroundMessage::OperationQueued { operation_id } => {
                debug!(operation_id = %operation_id, "peer queued an operation");
            }
            BackgroundMessage::StateChanged { state } => {
                debug!(online = state.is_online, pending = state.pending_operations, "peer state changed");
            }
            BackgroundMessage::Event { event } => {
                debug!(event = %event.kind(), "peer event");
            }
        }
    }

    async fn notify_peers(&self, message: BackgroundMessage) {
        if !self.inner.channel_open.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.inner.channel.send(message).await {
            debug!(error = %e, "background message not delivered");
        }
    }

    /// Ask peer instances to run a sync pass
    pub async fn request_peer_sync(&self) -> EngineResult<()> {
        self.ensure_ready()?;
        self.notify_peers(BackgroundMessage::SyncRequested).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn get_state(&self) -> OfflineState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that sees every actual state change
    pub fn subscribe_state(&self) -> watch::Receiver<OfflineState> {
        self.inner.state.subscribe()
    }

    /// Mutate the state, notifying watchers only if something changed
    fn update_state<F>(&self, mutate: F) -> bool
    where
        F: FnOnce(&mut OfflineState),
    {
        self.inner.state.send_if_modified(|state| {
            let before = state.clone();
            mutate(state);
            *state != before
        })
    }

    /// Recompute the derived fields from the components
    fn refresh_state(&self) -> bool {
        let queue = self.inner.queue.stats();
        let cache = self.inner.cache.stats();
        let sync = self.inner.sync.status();
        self.update_state(|state| {
            state.pending_operations = queue.outstanding();
            state.failed_operations = queue.failed;
            state.is_syncing = sync.is_syncing;
            state.sync_progress = sync.progress;
            state.last_sync_time = sync.last_sync_time.or(state.last_sync_time);
            state.storage = StorageSnapshot {
                cache_entries: cache.entries,
                cache_size_bytes: cache.total_bytes,
                cache_max_bytes: cache.max_bytes,
                queue_size: queue.total,
            };
        })
    }

    // -----------------------------------------------------------------------
    // Queue and sync
    // -----------------------------------------------------------------------

    #[instrument(skip(self, operation), fields(op_type = %operation.op_type))]
    pub async fn queue_operation(&self, operation: NewOperation) -> EngineResult<String> {
        self.ensure_ready()?;
        let id = self.inner.queue.add(operation).await?;
        self.notify_peers(BackgroundMessage::OperationQueued { operation_id: id.clone() }).await;
        Ok(id)
    }

    /// Run a sync pass now
    ///
    /// Fails with a recoverable [`ErrorKind::Network`] error while offline.
    /// A failed pass never changes the online state.
    #[instrument(skip(self, options))]
    pub async fn sync_now(&self, options: SyncOptions) -> EngineResult<SyncReport> {
        self.ensure_ready()?;
        if !self.get_state().is_online {
            return Err(EngineError::offline());
        }
        let result = self.inner.sync.sync_now(options).await;
        self.refresh_state();
        self.persist_state().await;
        Ok(result?)
    }

    /// Drop every queued operation
    pub async fn clear_queue(&self) -> EngineResult<usize> {
        self.ensure_ready()?;
        let removed = self.inner.queue.clear().await?;
        self.refresh_state();
        Ok(removed)
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Option<ConflictResolution>,
    ) -> EngineResult<ConflictResolution> {
        self.ensure_ready()?;
        let resolution = self.inner.sync.resolve_conflict(conflict_id, resolution).await?;
        self.refresh_state();
        Ok(resolution)
    }

    /// Resolve every pending conflict with the automatic strategy or a
    /// registered resolver
    pub async fn resolve_conflicts(&self) -> EngineResult<ResolutionSummary> {
        self.ensure_ready()?;
        let summary = self.inner.sync.resolve_all().await?;
        self.refresh_state();
        Ok(summary)
    }

    pub fn pending_conflicts(&self) -> Vec<Conflict> {
        self.inner.sync.pending_conflicts()
    }

    pub fn register_resolver(&self, op_type: impl Into<String>, resolver: Arc<dyn ConflictResolver>) {
        self.inner.sync.register_resolver(op_type, resolver);
    }

    // -----------------------------------------------------------------------
    // Cache
    // -----------------------------------------------------------------------

    pub async fn cache_get(&self, key: &str, options: GetOptions) -> EngineResult<Option<Value>> {
        self.ensure_ready()?;
        let value = self.inner.cache.get(key, options).await?;
        self.refresh_state();
        Ok(value)
    }

    pub async fn cache_set(&self, key: &str, value: Value, options: SetOptions) -> EngineResult<()> {
        self.ensure_ready()?;
        self.inner.cache.set(key, value, options).await?;
        self.refresh_state();
        Ok(())
    }

    pub async fn cache_remove(&self, key: &str) -> EngineResult<bool> {
        self.ensure_ready()?;
        let removed = self.inner.cache.remove(key).await?;
        self.refresh_state();
        Ok(removed)
    }

    pub async fn cache_clear(&self) -> EngineResult<usize> {
        self.ensure_ready()?;
        let removed = self.inner.cache.clear().await?;
        self.refresh_state();
        Ok(removed)
    }

    pub fn cache_prefetch(
        &self,
        key: &str,
        source: Fallback,
        options: PrefetchOptions,
    ) -> EngineResult<bool> {
        self.ensure_ready()?;
        Ok(self.inner.cache.prefetch(key, source, options)?)
    }

    // -----------------------------------------------------------------------
    // Events, stats and diagnostics
    // -----------------------------------------------------------------------

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.inner.ctx.events.on(kind, handler)
    }

    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.inner.ctx.events.on_any(handler)
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            queue: self.inner.queue.stats(),
            cache: self.inner.cache.stats(),
            sync: self.inner.sync.status(),
            metrics: self.inner.metrics.snapshot(self.inner.ctx.clock.now(), self.inner.ctx.now_ms()),
        }
    }

    pub fn get_diagnostics(&self) -> Diagnostics {
        Diagnostics {
            initialized: self.is_initialized(),
            destroyed: self.is_destroyed(),
            background_channel: self.inner.channel_open.load(Ordering::Acquire),
            state: self.get_state(),
            stats: self.get_stats(),
            recent_events: self.inner.ctx.events.history(),
        }
    }

    /// Snapshot from the last metrics tick, if one ran
    pub fn last_metrics(&self) -> Option<MetricsSnapshot> {
        self.inner.metrics.last_snapshot()
    }

    /// Exercise storage, queue, cache and sync and report per-check results
    #[instrument(skip(self))]
    pub async fn run_diagnostics(&self) -> EngineResult<DiagnosticsReport> {
        self.ensure_ready()?;
        let checks = vec![
            self.timed("storage", self.check_storage()).await,
            self.timed("queue", async { self.check_queue() }).await,
            self.timed("cache", self.check_cache()).await,
            self.timed("sync", async { self.check_sync() }).await,
        ];
        let report = DiagnosticsReport::new(checks, self.inner.ctx.now_ms());
        if report.healthy {
            info!("diagnostics passed");
        } else {
            let failed: Vec<&str> =
                report.checks.iter().filter(|c| !c.passed).map(|c| c.name.as_str()).collect();
            warn!(?failed, "diagnostics failed");
        }
        Ok(report)
    }

    async fn timed<F>(&self, name: &str, check: F) -> CheckResult
    where
        F: Future<Output = Result<(), String>>,
    {
        let started = self.inner.ctx.clock.now();
        let outcome = check.await;
        let elapsed = self.inner.ctx.clock.now().saturating_duration_since(started);
        CheckResult::new(name, outcome, u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }

    async fn check_storage(&self) -> Result<(), String> {
        let storage = self.inner.storage.as_ref();
        let probe = json!({ "at": self.inner.ctx.now_ms() });
        storage
            .set_setting(SETTINGS_DIAGNOSTICS_PROBE, probe.clone())
            .await
            .map_err(|e| e.to_string())?;
        let read = storage.get_setting(SETTINGS_DIAGNOSTICS_PROBE).await.map_err(|e| e.to_string())?;
        storage.remove_setting(SETTINGS_DIAGNOSTICS_PROBE).await.map_err(|e| e.to_string())?;
        if read.as_ref() == Some(&probe) {
            Ok(())
        } else {
            Err("setting read back differs from what was written".to_string())
        }
    }

    fn check_queue(&self) -> Result<(), String> {
        if self.inner.queue.is_shut_down() {
            return Err("queue is shut down".to_string());
        }
        let stats = self.inner.queue.stats();
        if stats.total == self.inner.queue.len() {
            Ok(())
        } else {
            Err(format!("stats report {} operations, index holds {}", stats.total, self.inner.queue.len()))
        }
    }

    async fn check_cache(&self) -> Result<(), String> {
        let cache = &self.inner.cache;
        let probe = json!({ "at": self.inner.ctx.now_ms() });
        let set_options = SetOptions::default()
            .with_strategy(CacheStrategy::CacheOnly)
            .with_ttl(Duration::from_secs(60));
        cache.set(DIAGNOSTICS_CACHE_KEY, probe.clone(), set_options).await.map_err(|e| e.to_string())?;
        let read = cache
            .get(DIAGNOSTICS_CACHE_KEY, GetOptions::default().with_strategy(CacheStrategy::CacheOnly))
            .await
            .map_err(|e| e.to_string())?;
        cache.remove(DIAGNOSTICS_CACHE_KEY).await.map_err(|e| e.to_string())?;
        if read.as_ref() == Some(&probe) {
            Ok(())
        } else {
            Err("cache read back differs from what was written".to_string())
        }
    }

    fn check_sync(&self) -> Result<(), String> {
        if self.inner.sync.is_shut_down() {
            return Err("sync coordinator is shut down".to_string());
        }
        let status = self.inner.sync.status();
        if (0.0..=1.0).contains(&status.progress) {
            Ok(())
        } else {
            Err(format!("sync progress out of range: {}", status.progress))
        }
    }

    // -----------------------------------------------------------------------
    // Backup
    // -----------------------------------------------------------------------

    /// Snapshot every collection and setting
    #[instrument(skip(self))]
    pub async fn create_backup(&self) -> EngineResult<Backup> {
        self.ensure_ready()?;
        self.persist_state().await;
        let data = self.inner.storage.backup().await?;
        let created_at = DateTime::<Utc>::from(self.inner.ctx.clock.system_time());
        info!(bytes = data.len(), "backup created");
        Ok(Backup::new(created_at, data))
    }

    /// Replace storage with `backup` and reload every component from it
    #[instrument(skip(self, backup), fields(version = backup.version))]
    pub async fn restore_backup(&self, backup: &Backup) -> EngineResult<()> {
        self.ensure_ready()?;
        if !backup.is_supported() {
            return Err(EngineError::new(
                ErrorKind::Storage,
                format!("unsupported backup version {}", backup.version),
                false,
            ));
        }
        if self.inner.sync.is_syncing() {
            return Err(EngineError::new(ErrorKind::Sync, "cannot restore while a sync is running", true));
        }

        self.inner.storage.restore(&backup.data).await?;
        let inner = &self.inner;
        let (operations, cache_entries, conflicts) = futures::try_join!(
            async { inner.queue.reload().await.map_err(EngineError::from) },
            async { inner.cache.reload().await.map_err(EngineError::from) },
            async { inner.sync.reload().await.map_err(EngineError::from) },
        )?;
        self.restore_state().await;
        self.refresh_state();
        info!(operations, cache_entries, conflicts, "backup restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tidemark_common::ManualScheduler;
    use tidemark_domain::{ConnectionQuality, QueueConfig};

    use super::*;
    use crate::ports::NoopBackgroundChannel;
    use crate::storage::MemoryStorage;
    use crate::testing::{FailingStorage, ManualConnectivity, ScriptedExecutor};

    struct Fixture {
        engine: OfflineEngine,
        executor: Arc<ScriptedExecutor>,
        connectivity: Arc<ManualConnectivity>,
        scheduler: ManualScheduler,
    }

    fn config() -> EngineConfig {
        EngineConfig {
            queue: QueueConfig { auto_drain: false, ..QueueConfig::default() },
            ..EngineConfig::default()
        }
    }

    fn fixture_with(storage: Arc<dyn StorageAdapter>, initial: ConnectivityStatus) -> Fixture {
        let (ctx, scheduler) = EngineContext::manual(1_000_000);
        let executor = Arc::new(ScriptedExecutor::succeeding());
        let connectivity = Arc::new(ManualConnectivity::new(initial));
        let engine = OfflineEngine::new(
            config(),
            ctx,
            storage,
            executor.clone(),
            connectivity.clone(),
            Arc::new(NoopBackgroundChannel),
        );
        Fixture { engine, executor, connectivity, scheduler }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryStorage::new()), ConnectivityStatus::online(ConnectionQuality::Good))
    }

    fn count(engine: &OfflineEngine, kind: EventKind) -> usize {
        engine.context().events.history().iter().filter(|r| r.event.kind() == kind).count()
    }

    #[tokio::test]
    async fn calls_before_initialize_are_rejected() {
        let f = fixture();
        let err = f.engine.queue_operation(NewOperation::new("a", json!(1))).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotInitialized);
    }

    #[tokio::test]
    async fn concurrent_initialize_runs_once() {
        let f = fixture();
        let (a, b) = tokio::join!(f.engine.initialize(), f.engine.initialize());
        a.unwrap();
        b.unwrap();
        assert!(f.engine.is_initialized());
        assert!(f.engine.get_state().is_online);
        assert_eq!(f.engine.context().events.handler_count(), 1);
    }

    #[tokio::test]
    async fn probe_drives_offline_and_online_transitions() {
        let f = fixture();
        f.engine.initialize().await.unwrap();
        f.engine.queue_operation(NewOperation::new("note.create", json!({"n": 1}))).await.unwrap();

        f.connectivity.push_probe_result(ConnectivityStatus::offline());
        f.scheduler.advance(Duration::from_secs(10)).await;

        let state = f.engine.get_state();
        assert!(!state.is_online);
        assert_eq!(state.network.offline_since, Some(1_010_000));
        assert!(f.engine.queue().is_paused());
        assert_eq!(count(&f.engine, EventKind::OfflineDetected), 1);

        f.connectivity.push_probe_result(ConnectivityStatus::online(ConnectionQuality::Excellent));
        f.scheduler.advance(Duration::from_secs(10)).await;
        f.scheduler.run_due().await;

        assert!(f.engine.get_state().is_online);
        assert!(!f.engine.queue().is_paused());
        assert_eq!(f.executor.call_count(), 1);
        let online = f
            .engine
            .context()
            .events
            .history()
            .into_iter()
            .find_map(|r| match r.event {
                EngineEvent::OnlineDetected { offline_for_ms, .. } => Some(offline_for_ms),
                _ => None,
            });
        assert_eq!(online, Some(Some(10_000)));
        assert_eq!(f.engine.get_state().pending_operations, 0);
    }

    #[tokio::test]
    async fn failed_sync_does_not_flip_online_state() {
        let f = fixture();
        f.engine.initialize().await.unwrap();
        f.engine.queue_operation(NewOperation::new("a", json!(1))).await.unwrap();
        f.executor.fail_transport(1);

        let err = f.engine.sync_now(SyncOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(f.engine.get_state().is_online);
        assert!(!f.engine.get_state().is_syncing);
        assert_eq!(count(&f.engine, EventKind::OfflineDetected), 0);
        assert_eq!(count(&f.engine, EventKind::SyncFailed), 1);
    }

    #[tokio::test]
    async fn sync_while_offline_is_recoverable() {
        let f = fixture_with(Arc::new(MemoryStorage::new()), ConnectivityStatus::offline());
        f.engine.initialize().await.unwrap();
        assert!(f.engine.queue().is_paused());

        let err = f.engine.sync_now(SyncOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(err.recoverable);
        assert_eq!(f.executor.call_count(), 0);
    }

    #[tokio::test]
    async fn quality_change_is_announced() {
        let f = fixture();
        f.engine.initialize().await.unwrap();
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        let _sub = f.engine.on(EventKind::NetworkQualityChanged, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        f.engine.report_connectivity(ConnectivityStatus::online(ConnectionQuality::Poor)).await;
        f.engine.report_connectivity(ConnectivityStatus::online(ConnectionQuality::Poor)).await;

        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert_eq!(f.engine.get_state().connection_quality, ConnectionQuality::Poor);
        assert_eq!(count(&f.engine, EventKind::OfflineDetected), 0);
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_persists_state() {
        let storage = Arc::new(MemoryStorage::new());
        let f = fixture_with(storage.clone(), ConnectivityStatus::online(ConnectionQuality::Good));
        f.engine.initialize().await.unwrap();
        f.engine.queue_operation(NewOperation::new("a", json!(1))).await.unwrap();

        f.engine.destroy().await.unwrap();
        f.engine.destroy().await.unwrap();

        let err = f.engine.cache_get("k", GetOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Destroyed);
        assert_eq!(f.scheduler.pending_tasks(), 0);
        let saved = storage.get_setting(SETTINGS_OFFLINE_STATE).await.unwrap().unwrap();
        assert_eq!(saved["pendingOperations"], json!(1));
    }

    #[tokio::test]
    async fn diagnostics_report_each_subsystem() {
        let storage = Arc::new(FailingStorage::new());
        let f = fixture_with(storage.clone(), ConnectivityStatus::online(ConnectionQuality::Good));
        f.engine.initialize().await.unwrap();

        let report = f.engine.run_diagnostics().await.unwrap();
        assert!(report.healthy, "{report:?}");
        assert_eq!(report.checks.len(), 4);

        storage.fail_writes(true);
        let report = f.engine.run_diagnostics().await.unwrap();
        assert!(!report.healthy);
        assert!(!report.check("storage").unwrap().passed);
        assert!(!report.check("cache").unwrap().passed);
        assert!(report.check("queue").unwrap().passed);
        assert!(report.check("sync").unwrap().passed);
    }

    #[tokio::test]
    async fn backup_round_trip_restores_queue_and_cache() {
        let f = fixture();
        f.engine.initialize().await.unwrap();
        let id = f.engine.queue_operation(NewOperation::new("a", json!({"v": 1}))).await.unwrap();
        f.engine.cache_set("profile", json!({"name": "Ada"}), SetOptions::default()).await.unwrap();

        let backup = f.engine.create_backup().await.unwrap();
        f.engine.clear_queue().await.unwrap();
        f.engine.cache_clear().await.unwrap();
        assert_eq!(f.engine.get_state().pending_operations, 0);

        f.engine.restore_backup(&backup).await.unwrap();
        assert!(f.engine.queue().get(&id).is_some());
        assert_eq!(
            f.engine.cache_get("profile", GetOptions::default()).await.unwrap(),
            Some(json!({"name": "Ada"}))
        );
        assert_eq!(f.engine.get_state().pending_operations, 1);
    }

    #[tokio::test]
    async fn unsupported_backup_is_rejected() {
        let f = fixture();
        f.engine.initialize().await.unwrap();
        let mut backup = f.engine.create_backup().await.unwrap();
        backup.version += 1;
        let err = f.engine.restore_backup(&backup).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Storage);
        assert!(!err.recoverable);
    }

    #[tokio::test]
    async fn last_sync_time_survives_restart() {
        let storage = Arc::new(MemoryStorage::new());
        let f = fixture_with(storage.clone(), ConnectivityStatus::online(ConnectionQuality::Good));
        f.engine.initialize().await.unwrap();
        f.engine.queue_operation(NewOperation::new("a", json!(1))).await.unwrap();
        f.engine.sync_now(SyncOptions::default()).await.unwrap();
        let synced_at = f.engine.get_state().last_sync_time;
        assert_eq!(synced_at, Some(1_000_000));
        f.engine.destroy().await.unwrap();

        let restarted = fixture_with(storage, ConnectivityStatus::online(ConnectionQuality::Good));
        restarted.engine.initialize().await.unwrap();
        assert_eq!(restarted.engine.get_state().last_sync_time, synced_at);
    }

    #[tokio::test]
    async fn metrics_tick_counts_events() {
        let f = fixture();
        f.engine.initialize().await.unwrap();
        f.engine.queue_operation(NewOperation::new("a", json!(1))).await.unwrap();
        f.engine.sync_now(SyncOptions::default()).await.unwrap();

        f.scheduler.advance(Duration::from_secs(30)).await;
        let snapshot = f.engine.last_metrics().unwrap();
        assert_eq!(snapshot.operations_queued, 1);
        assert_eq!(snapshot.operations_completed, 1);
        assert_eq!(snapshot.syncs_completed, 1);
        assert_eq!(snapshot.uptime_ms, 30_000);
    }
}
