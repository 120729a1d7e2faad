//! Batched sync passes and conflict bookkeeping

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tidemark_common::time::repeating;
use tidemark_common::TaskHandle;
use tidemark_domain::{
    Conflict, ConflictResolution, EngineEvent, Operation, ResolutionStrategy, SyncBatch,
    SyncConfig, SyncOptions, SyncReport,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::conflict;
use super::errors::{SyncError, SyncResult};
use crate::context::EngineContext;
use crate::guard::PassGuard;
use crate::ports::{Collection, ConflictResolver, ExecutionOutcome, RemoteExecutor, StorageAdapter};
use crate::queue::{OperationQueue, QueueError, QueueResult};
use crate::storage::{load_records, put_record};

/// Snapshot of the coordinator for state and diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    /// Share of the current (or last) pass already processed, 0.0 to 1.0
    pub progress: f64,
    pub last_sync_time: Option<u64>,
    pub last_report: Option<SyncReport>,
    pub pending_conflicts: usize,
    pub is_online: bool,
}

/// Outcome of resolving every pending conflict
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionSummary {
    pub resolved: Vec<(String, ConflictResolution)>,
    /// Conflicts left pending, with the reason
    pub unresolved: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Tracking {
    progress: f64,
    last_sync_time: Option<u64>,
    last_report: Option<SyncReport>,
}

struct SyncInner {
    config: SyncConfig,
    ctx: EngineContext,
    storage: Arc<dyn StorageAdapter>,
    queue: OperationQueue,
    executor: Arc<dyn RemoteExecutor>,
    resolvers: DashMap<String, Arc<dyn ConflictResolver>>,
    conflicts: RwLock<BTreeMap<String, Conflict>>,
    tracking: Mutex<Tracking>,
    /// Live sync passes; a forced pass can overlap a running one
    passes: AtomicUsize,
    online: AtomicBool,
    initialized: AtomicBool,
    shut_down: AtomicBool,
    auto_task: Mutex<Option<TaskHandle>>,
}

/// Handle to the sync coordinator; clones share state
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<SyncInner>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("is_syncing", &self.is_syncing())
            .field("pending_conflicts", &self.inner.conflicts.read().len())
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        ctx: EngineContext,
        storage: Arc<dyn StorageAdapter>,
        queue: OperationQueue,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                config,
                ctx,
                storage,
                queue,
                executor,
                resolvers: DashMap::new(),
                conflicts: RwLock::new(BTreeMap::new()),
                tracking: Mutex::new(Tracking::default()),
                passes: AtomicUsize::new(0),
                online: AtomicBool::new(true),
                initialized: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                auto_task: Mutex::new(None),
            }),
        }
    }

    fn upgrade(weak: &Weak<SyncInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Load pending conflicts, discard batch records left by a previous run
    /// and start auto-sync. Later calls are no-ops.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> SyncResult<()> {
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.load_state().await {
            self.inner.initialized.store(false, Ordering::Release);
            return Err(e);
        }
        if self.inner.config.auto_sync && !self.inner.config.auto_sync_interval.is_zero() {
            self.start_auto_sync();
        }
        info!(pending_conflicts = self.inner.conflicts.read().len(), "sync coordinator initialized");
        Ok(())
    }

    /// Re-read conflicts from storage, e.g. after a restore
    pub async fn reload(&self) -> SyncResult<usize> {
        self.ensure_running()?;
        self.load_state().await?;
        Ok(self.inner.conflicts.read().len())
    }

    async fn load_state(&self) -> SyncResult<()> {
        let storage = self.inner.storage.as_ref();
        let conflicts: Vec<Conflict> = load_records(storage, Collection::Conflicts).await?;
        *self.inner.conflicts.write() =
            conflicts.into_iter().map(|c| (c.id.clone(), c)).collect();

        let leftovers = storage.retrieve_all(Collection::SyncBatches).await?.len();
        if leftovers > 0 {
            storage.clear(Collection::SyncBatches).await?;
            warn!(leftovers, "discarded sync batches from an interrupted pass");
        }
        Ok(())
    }

    pub fn start_auto_sync(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = self.inner.ctx.scheduler.schedule_repeating(
            "sync.auto",
            self.inner.config.auto_sync_interval,
            repeating(move || {
                let weak = weak.clone();
                async move {
                    if let Some(coordinator) = SyncCoordinator::upgrade(&weak) {
                        coordinator.auto_sync_tick().await;
                    }
                }
            }),
        );
        if let Some(previous) = self.inner.auto_task.lock().replace(handle) {
            previous.cancel();
        }
    }

    pub fn stop_auto_sync(&self) {
        if let Some(handle) = self.inner.auto_task.lock().take() {
            handle.cancel();
        }
    }

    async fn auto_sync_tick(&self) {
        if !self.is_online() || self.is_syncing() || !self.inner.queue.has_eligible() {
            return;
        }
        match self.sync_now(SyncOptions::default()).await {
            Ok(report) => debug!(synced = report.synced_items, "auto-sync pass finished"),
            Err(SyncError::InProgress) => {}
            Err(e) => warn!(error = %e, "auto-sync pass failed"),
        }
    }

    /// Stop auto-sync. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_auto_sync();
        info!("sync coordinator shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if self.is_shut_down() {
            Err(SyncError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Reachability as last reported by the orchestrator
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.passes.load(Ordering::Acquire) > 0
    }

    // -----------------------------------------------------------------------
    // Sync passes
    // -----------------------------------------------------------------------

    /// Push every eligible operation to the remote executor in batches
    ///
    /// Fails with [`SyncError::InProgress`] when another pass is running and
    /// `force` is unset. A transport or protocol failure releases the
    /// unprocessed operations back to the queue and aborts the pass.
    #[instrument(skip(self, options), fields(force = options.force))]
    pub async fn sync_now(&self, options: SyncOptions) -> SyncResult<SyncReport> {
        self.ensure_running()?;
        let _guard = match PassGuard::try_acquire(&self.inner.passes) {
            Some(guard) => guard,
            None if options.force => PassGuard::join(&self.inner.passes),
            None => {
                debug!("sync already running");
                return Err(SyncError::InProgress);
            }
        };

        let started = self.inner.ctx.clock.now();
        let timestamp = self.inner.ctx.now_ms();
        let claimed = match self.inner.queue.claim_eligible(options.types.as_deref()).await {
            Ok(claimed) => claimed,
            Err(e) => {
                let e = SyncError::from(e);
                error!(error = %e, "could not claim operations for sync");
                self.inner.ctx.events.emit(EngineEvent::SyncFailed { error: e.to_string() });
                return Err(e);
            }
        };

        let mut report = SyncReport::empty(timestamp);
        if claimed.is_empty() {
            debug!("nothing to sync");
            self.finish(report.clone());
            return Ok(report);
        }

        let total = claimed.len();
        let batch_size = self.inner.config.batch_size.max(1);
        info!(pending = total, batch_size, "sync started");
        self.inner.tracking.lock().progress = 0.0;
        self.inner.ctx.events.emit(EngineEvent::SyncStarted { pending: total });

        for (index, batch) in claimed.chunks(batch_size).enumerate() {
            if let Err(e) = self.run_batch(batch, &mut report).await {
                let unprocessed: Vec<String> =
                    claimed[index * batch_size..].iter().map(|op| op.id.clone()).collect();
                match self.inner.queue.release(&unprocessed).await {
                    Ok(released) => debug!(released, "released unprocessed operations"),
                    Err(release_error) => {
                        warn!(error = %release_error, "could not release claimed operations")
                    }
                }
                error!(error = %e, batch = index, "sync pass aborted");
                self.inner.ctx.events.emit(EngineEvent::SyncFailed { error: e.to_string() });
                return Err(e);
            }
            let processed = report.processed();
            self.inner.tracking.lock().progress = processed as f64 / total as f64;
        }

        report.duration_ms = u64::try_from(
            self.inner.ctx.clock.now().saturating_duration_since(started).as_millis(),
        )
        .unwrap_or(u64::MAX);
        report.success = report.failed_items == 0 && report.conflicts.is_empty();

        info!(
            synced = report.synced_items,
            failed = report.failed_items,
            conflicts = report.conflicts.len(),
            duration_ms = report.duration_ms,
            "sync completed"
        );
        self.finish(report.clone());
        self.inner.ctx.events.emit(EngineEvent::SyncCompleted(report.clone()));
        Ok(report)
    }

    fn finish(&self, report: SyncReport) {
        let mut tracking = self.inner.tracking.lock();
        tracking.progress = 1.0;
        tracking.last_sync_time = Some(report.timestamp);
        tracking.last_report = Some(report);
    }

    async fn run_batch(&self, operations: &[Operation], report: &mut SyncReport) -> SyncResult<()> {
        let batch =
            SyncBatch::new(Uuid::now_v7().to_string(), operations.to_vec(), self.inner.ctx.now_ms());
        let storage = self.inner.storage.as_ref();
        put_record(storage, Collection::SyncBatches, &batch.id, &batch).await?;
        debug!(batch_id = %batch.id, size = batch.len(), priority = %batch.priority, "executing batch");

        let result = self.execute(&batch).await;
        if let Err(e) = storage.remove(Collection::SyncBatches, &batch.id).await {
            warn!(batch_id = %batch.id, error = %e, "could not delete finished batch record");
        }

        for (op, outcome) in batch.operations.iter().zip(result?) {
            self.apply_outcome(op, outcome, report).await?;
        }
        Ok(())
    }

    async fn execute(&self, batch: &SyncBatch) -> SyncResult<Vec<ExecutionOutcome>> {
        let outcomes = self.inner.executor.execute_batch(&batch.operations).await?;
        if outcomes.len() != batch.len() {
            return Err(SyncError::Protocol { expected: batch.len(), actual: outcomes.len() });
        }
        Ok(outcomes)
    }

    async fn apply_outcome(
        &self,
        op: &Operation,
        outcome: ExecutionOutcome,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let queue = &self.inner.queue;
        if outcome.success {
            tolerate_missing(queue.complete(&op.id).await.map(drop))?;
            report.synced_items += 1;
        } else if let Some(remote) = outcome.conflict {
            let conflict = self.record_conflict(op, remote).await?;
            report.conflicts.push(conflict);
        } else {
            let message = outcome.error_message();
            tolerate_missing(queue.record_failure(&op.id, &message).await.map(drop))?;
            report.failed_items += 1;
        }
        Ok(())
    }

    async fn record_conflict(&self, op: &Operation, remote: serde_json::Value) -> SyncResult<Conflict> {
        let conflict = Conflict {
            id: Uuid::now_v7().to_string(),
            operation_id: op.id.clone(),
            op_type: op.op_type.clone(),
            local_data: op.payload.clone(),
            remote_data: remote,
            timestamp: self.inner.ctx.now_ms(),
            resolution: None,
        };
        put_record(self.inner.storage.as_ref(), Collection::Conflicts, &conflict.id, &conflict)
            .await?;
        self.inner.conflicts.write().insert(conflict.id.clone(), conflict.clone());
        tolerate_missing(self.inner.queue.park_conflicted(&op.id, &conflict.id).await.map(drop))?;

        warn!(
            operation_id = %op.id,
            conflict_id = %conflict.id,
            op_type = %op.op_type,
            "conflict detected"
        );
        self.inner.ctx.events.emit(EngineEvent::ConflictDetected(conflict.clone()));
        Ok(conflict)
    }

    // -----------------------------------------------------------------------
    // Conflicts
    // -----------------------------------------------------------------------

    /// Route conflicts of `op_type` to `resolver` when no automatic
    /// strategy applies
    pub fn register_resolver(&self, op_type: impl Into<String>, resolver: Arc<dyn ConflictResolver>) {
        let op_type = op_type.into();
        debug!(op_type = %op_type, "conflict resolver registered");
        self.inner.resolvers.insert(op_type, resolver);
    }

    pub fn unregister_resolver(&self, op_type: &str) -> bool {
        self.inner.resolvers.remove(op_type).is_some()
    }

    /// Unresolved conflicts, oldest id first
    pub fn pending_conflicts(&self) -> Vec<Conflict> {
        self.inner.conflicts.read().values().cloned().collect()
    }

    pub fn get_conflict(&self, id: &str) -> Option<Conflict> {
        self.inner.conflicts.read().get(id).cloned()
    }

    pub async fn resolved_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        Ok(load_records(self.inner.storage.as_ref(), Collection::ResolvedConflicts).await?)
    }

    /// Settle one conflict, with `resolution` if given, otherwise with the
    /// configured strategy or the resolver registered for its type
    #[instrument(skip(self, resolution))]
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Option<ConflictResolution>,
    ) -> SyncResult<ConflictResolution> {
        self.ensure_running()?;
        let conflict = self
            .get_conflict(conflict_id)
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
        let resolution = match resolution {
            Some(explicit) => explicit,
            None => self.automatic_resolution(&conflict).await?,
        };
        self.apply_resolution(conflict, resolution.clone()).await?;
        Ok(resolution)
    }

    /// Attempt every pending conflict without explicit data
    pub async fn resolve_all(&self) -> SyncResult<ResolutionSummary> {
        let mut summary = ResolutionSummary::default();
        for conflict in self.pending_conflicts() {
            match self.resolve_conflict(&conflict.id, None).await {
                Ok(resolution) => summary.resolved.push((conflict.id, resolution)),
                Err(e @ (SyncError::NoResolver(_) | SyncError::Resolver(_))) => {
                    summary.unresolved.push((conflict.id, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    async fn automatic_resolution(&self, conflict: &Conflict) -> SyncResult<ConflictResolution> {
        let strategy = self.inner.config.conflict_strategy;
        let now = self.inner.ctx.now_ms();
        if let Some(data) = conflict::apply(strategy, conflict, &self.inner.config.timestamp_field) {
            return Ok(ConflictResolution { strategy, resolved_data: data, resolved_at: now });
        }

        let resolver = self
            .inner
            .resolvers
            .get(&conflict.op_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SyncError::NoResolver(conflict.op_type.clone()))?;
        let data = resolver
            .resolve(conflict)
            .await
            .map_err(|e| SyncError::Resolver(format!("{e:#}")))?;
        Ok(ConflictResolution {
            strategy: ResolutionStrategy::Custom,
            resolved_data: data,
            resolved_at: now,
        })
    }

    async fn apply_resolution(
        &self,
        mut conflict: Conflict,
        resolution: ConflictResolution,
    ) -> SyncResult<()> {
        let queue = &self.inner.queue;
        let operation_id = conflict.operation_id.clone();
        // Data the server already holds needs no second push
        let applied = if resolution.resolved_data == conflict.remote_data {
            queue.complete(&operation_id).await.map(drop)
        } else {
            queue.requeue_with_payload(&operation_id, resolution.resolved_data.clone()).await.map(drop)
        };
        tolerate_missing(applied)?;

        let strategy = resolution.strategy;
        conflict.resolution = Some(resolution);
        let storage = self.inner.storage.as_ref();
        put_record(storage, Collection::ResolvedConflicts, &conflict.id, &conflict).await?;
        storage.remove(Collection::Conflicts, &conflict.id).await?;
        self.inner.conflicts.write().remove(&conflict.id);

        info!(conflict_id = %conflict.id, operation_id = %operation_id, %strategy, "conflict resolved");
        self.inner.ctx.events.emit(EngineEvent::ConflictResolved {
            conflict_id: conflict.id,
            operation_id,
            strategy,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn status(&self) -> SyncStatus {
        let tracking = self.inner.tracking.lock();
        SyncStatus {
            is_syncing: self.is_syncing(),
            progress: tracking.progress,
            last_sync_time: tracking.last_sync_time,
            last_report: tracking.last_report.clone(),
            pending_conflicts: self.inner.conflicts.read().len(),
            is_online: self.is_online(),
        }
    }
}

/// The operation may have been cleared from the queue while it was remote
fn tolerate_missing(result: QueueResult<()>) -> SyncResult<()> {
    match result {
        Err(QueueError::NotFound(id)) => {
            warn!(operation_id = %id, "operation left the queue during sync");
            Ok(())
        }
        other => Ok(other?),
    }
}
