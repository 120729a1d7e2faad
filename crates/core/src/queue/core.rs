//! Durable, priority-ordered operation queue
//!
//! Operations live in an in-memory index mirrored write-through to the
//! `operations` collection. The drain tick, the sync coordinator and the
//! retry timers all mutate through the same index, and an operation is
//! claimed (`Processing`) before any executor sees it, so it is never
//! executed twice concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tidemark_common::time::{once, repeating};
use tidemark_common::TaskHandle;
use tidemark_domain::{
    EngineEvent, NewOperation, Operation, OperationFilter, OperationStatus, QueueConfig,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::errors::{QueueError, QueueResult};
use super::stats::{QueueCounters, QueueStats};
use crate::context::EngineContext;
use crate::guard::FlagGuard;
use crate::ports::{
    Collection, ExecutionOutcome, RemoteExecutor, StorageAdapter, TransportError,
};
use crate::storage::{load_records, put_record};

/// Metadata key linking a parked operation to its conflict record
pub const CONFLICT_METADATA_KEY: &str = "conflictId";

/// What happened to an operation after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Scheduled for another attempt after `delay`
    Retrying { attempt: u32, delay: Duration },
    /// Retries exhausted; the operation is terminal
    Failed,
}

/// Result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// The pass did not run (paused, shut down, or another pass in flight)
    pub skipped: bool,
}

impl DrainReport {
    fn skipped() -> Self {
        Self { skipped: true, ..Self::default() }
    }
}

struct QueueInner {
    config: QueueConfig,
    ctx: EngineContext,
    storage: Arc<dyn StorageAdapter>,
    executor: Arc<dyn RemoteExecutor>,
    operations: RwLock<HashMap<String, Operation>>,
    next_sequence: AtomicU64,
    counters: QueueCounters,
    draining: AtomicBool,
    paused: AtomicBool,
    initialized: AtomicBool,
    shut_down: AtomicBool,
    drain_task: Mutex<Option<TaskHandle>>,
    /// Retry or cleanup timer per operation; at most one is live at a time
    timers: Mutex<HashMap<String, TaskHandle>>,
}

/// Handle to the operation queue; clones share state
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("len", &self.len())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl OperationQueue {
    pub fn new(
        config: QueueConfig,
        ctx: EngineContext,
        storage: Arc<dyn StorageAdapter>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                ctx,
                storage,
                executor,
                operations: RwLock::new(HashMap::new()),
                next_sequence: AtomicU64::new(0),
                counters: QueueCounters::default(),
                draining: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                drain_task: Mutex::new(None),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn upgrade(weak: &Weak<QueueInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Load persisted operations, recover interrupted ones and start the
    /// drain loop if configured. Later calls are no-ops.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> QueueResult<()> {
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.load_from_storage().await {
            Ok(recovered) => {
                info!(
                    operations = self.len(),
                    recovered,
                    "operation queue initialized"
                );
            }
            Err(e) => {
                self.inner.initialized.store(false, Ordering::Release);
                return Err(e);
            }
        }

        if self.inner.config.auto_drain {
            self.start_drain_loop();
        }
        Ok(())
    }

    /// Re-read every operation from storage, e.g. after a restore
    #[instrument(skip(self))]
    pub async fn reload(&self) -> QueueResult<usize> {
        self.ensure_running()?;
        self.cancel_all_timers();
        let recovered = self.load_from_storage().await?;
        info!(operations = self.len(), recovered, "operation queue reloaded");
        Ok(self.len())
    }

    async fn load_from_storage(&self) -> QueueResult<usize> {
        let stored: Vec<Operation> =
            load_records(self.inner.storage.as_ref(), Collection::Operations).await?;

        let mut index = HashMap::with_capacity(stored.len());
        let mut recovered = Vec::new();
        let mut expired = Vec::new();
        let mut next_sequence = 0;

        for mut op in stored {
            next_sequence = next_sequence.max(op.sequence + 1);
            match op.status {
                // Their executor call or retry timer died with the previous run
                OperationStatus::Processing | OperationStatus::Retrying => {
                    op.status = OperationStatus::Pending;
                    op.next_attempt_at = None;
                    recovered.push(op.clone());
                }
                OperationStatus::Completed | OperationStatus::Cancelled => {
                    expired.push(op.id);
                    continue;
                }
                OperationStatus::Pending | OperationStatus::Failed => {}
            }
            index.insert(op.id.clone(), op);
        }

        *self.inner.operations.write() = index;
        self.inner.next_sequence.fetch_max(next_sequence, Ordering::AcqRel);

        for op in &recovered {
            debug!(operation_id = %op.id, "reset interrupted operation to pending");
            self.persist(op).await?;
        }
        for id in &expired {
            self.inner.storage.remove(Collection::Operations, id).await?;
        }
        Ok(recovered.len())
    }

    /// Start (or restart) the periodic drain
    pub fn start_drain_loop(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = self.inner.ctx.scheduler.schedule_repeating(
            "queue.drain",
            self.inner.config.drain_interval,
            repeating(move || {
                let weak = weak.clone();
                async move {
                    let Some(queue) = OperationQueue::upgrade(&weak) else {
                        return;
                    };
                    if let Err(e) = queue.drain().await {
                        warn!(error = %e, "queue drain failed");
                    }
                }
            }),
        );
        if let Some(previous) = self.inner.drain_task.lock().replace(handle) {
            previous.cancel();
        }
    }

    pub fn stop_drain_loop(&self) {
        if let Some(handle) = self.inner.drain_task.lock().take() {
            handle.cancel();
        }
    }

    /// Stop the drain loop and every pending timer. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_drain_loop();
        self.cancel_all_timers();
        info!("operation queue shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Suspend draining; queued operations stay put
    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::AcqRel) {
            info!("operation queue paused");
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::AcqRel) {
            info!("operation queue resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> QueueResult<()> {
        if self.is_shut_down() {
            Err(QueueError::ShutDown)
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Queries and basic mutation
    // -----------------------------------------------------------------------

    /// Persist a new pending operation and return its id
    ///
    /// When the queue is at capacity the oldest pending operations are
    /// dropped to make room.
    #[instrument(skip(self, new), fields(op_type = %new.op_type, priority = %new.priority))]
    pub async fn add(&self, new: NewOperation) -> QueueResult<String> {
        self.ensure_running()?;

        let now = self.inner.ctx.now_ms();
        let id = Uuid::now_v7().to_string();
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::AcqRel);
        let operation =
            new.into_operation(id.clone(), now, sequence, self.inner.config.default_max_retries);
        let max = self.inner.config.max_queue_size;

        let dropped = {
            let mut ops = self.inner.operations.write();
            let live = ops.values().filter(|op| counts_toward_capacity(op)).count();
            let mut dropped = Vec::new();
            if live >= max {
                let excess = live + 1 - max;
                let mut pending: Vec<&Operation> =
                    ops.values().filter(|op| op.status == OperationStatus::Pending).collect();
                if pending.len() < excess {
                    return Err(QueueError::CapacityExceeded { max });
                }
                pending.sort_by_key(|op| (op.timestamp, op.sequence));
                dropped = pending.iter().take(excess).map(|op| op.id.clone()).collect();
                for victim in &dropped {
                    ops.remove(victim);
                }
            }
            ops.insert(id.clone(), operation.clone());
            dropped
        };

        if let Err(e) = self.persist(&operation).await {
            self.inner.operations.write().remove(&id);
            return Err(e);
        }

        for victim in &dropped {
            warn!(operation_id = %victim, max, "queue full, dropped oldest pending operation");
            self.cancel_timer(victim);
            if let Err(e) = self.inner.storage.remove(Collection::Operations, victim).await {
                warn!(operation_id = %victim, error = %e, "failed to delete dropped operation");
            }
        }

        debug!(operation_id = %id, "operation queued");
        self.inner.ctx.events.emit(EngineEvent::OperationQueued {
            operation_id: id.clone(),
            op_type: operation.op_type,
            priority: operation.priority,
        });
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<Operation> {
        self.inner.operations.read().get(id).cloned()
    }

    /// Matching operations in drain order
    pub fn get_all(&self, filter: &OperationFilter) -> Vec<Operation> {
        let mut ops: Vec<Operation> =
            self.inner.operations.read().values().filter(|op| filter.matches(op)).cloned().collect();
        ops.sort_by_key(Operation::queue_order);
        ops
    }

    pub fn len(&self) -> usize {
        self.inner.operations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.operations.read().is_empty()
    }

    /// Operations still waiting for remote execution
    pub fn outstanding_count(&self) -> usize {
        self.inner
            .operations
            .read()
            .values()
            .filter(|op| {
                matches!(
                    op.status,
                    OperationStatus::Pending | OperationStatus::Processing | OperationStatus::Retrying
                )
            })
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.inner
            .operations
            .read()
            .values()
            .filter(|op| op.status == OperationStatus::Failed)
            .count()
    }

    /// Whether anything is eligible for a drain or sync right now
    pub fn has_eligible(&self) -> bool {
        let now = self.inner.ctx.now_ms();
        self.inner.operations.read().values().any(|op| op.is_drain_eligible(now))
    }

    /// Apply `mutate` to an operation and persist the result
    ///
    /// The id and sequence cannot change, and `retry_count` may not exceed
    /// `max_retries`.
    pub async fn update<F>(&self, id: &str, mutate: F) -> QueueResult<Operation>
    where
        F: FnOnce(&mut Operation),
    {
        self.ensure_running()?;
        let updated = self.modify(id, |op| {
            mutate(op);
            Ok(())
        })?;
        self.persist(&updated).await?;
        Ok(updated)
    }

    /// Delete an operation regardless of status
    pub async fn remove(&self, id: &str) -> QueueResult<bool> {
        self.cancel_timer(id);
        let existed = self.inner.operations.write().remove(id).is_some();
        let stored = self.inner.storage.remove(Collection::Operations, id).await?;
        Ok(existed || stored)
    }

    /// Cancel an operation that has not started processing
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> QueueResult<Operation> {
        self.ensure_running()?;
        let op = self.modify(id, |op| {
            if !op.status.is_cancellable() {
                return Err(invalid(op, "cancel"));
            }
            op.status = OperationStatus::Cancelled;
            op.next_attempt_at = None;
            Ok(())
        })?;
        self.cancel_timer(id);
        self.persist(&op).await?;
        self.schedule_cleanup(id);
        info!(operation_id = %id, "operation cancelled");
        Ok(op)
    }

    /// Drop every operation and timer
    #[instrument(skip(self))]
    pub async fn clear(&self) -> QueueResult<usize> {
        self.cancel_all_timers();
        let removed = std::mem::take(&mut *self.inner.operations.write()).len();
        self.inner.storage.clear(Collection::Operations).await?;
        info!(removed, "operation queue cleared");
        Ok(removed)
    }

    pub fn stats(&self) -> QueueStats {
        let now = self.inner.ctx.now_ms();
        let ops = self.inner.operations.read();
        let mut stats = self.inner.counters.snapshot(ops.values(), now);
        stats.is_paused = self.is_paused();
        stats.is_draining = self.inner.draining.load(Ordering::Acquire);
        stats
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Execute every eligible operation once, most urgent first
    ///
    /// Returns a skipped report when another drain is still running.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> QueueResult<DrainReport> {
        if self.is_shut_down() || self.is_paused() {
            return Ok(DrainReport::skipped());
        }
        let Some(_guard) = FlagGuard::try_acquire(&self.inner.draining) else {
            debug!("drain already in flight, skipping tick");
            return Ok(DrainReport::skipped());
        };

        let now = self.inner.ctx.now_ms();
        let candidates: Vec<String> = {
            let ops = self.inner.operations.read();
            let mut eligible: Vec<&Operation> =
                ops.values().filter(|op| op.is_drain_eligible(now)).collect();
            eligible.sort_by_key(|op| op.queue_order());
            eligible.into_iter().map(|op| op.id.clone()).collect()
        };

        let mut report = DrainReport::default();
        for id in candidates {
            if self.is_paused() || self.is_shut_down() {
                debug!("drain interrupted");
                break;
            }
            // A sync pass may have claimed it since the snapshot
            let Some(op) = self.try_claim(&id) else {
                continue;
            };
            if let Err(e) = self.persist(&op).await {
                warn!(operation_id = %id, error = %e, "failed to persist claim");
            }

            report.attempted += 1;
            let result = self.inner.executor.execute(&op).await;
            match self.settle(&id, result).await {
                Ok(None) => report.completed += 1,
                Ok(Some(FailureDisposition::Retrying { .. })) => report.retried += 1,
                Ok(Some(FailureDisposition::Failed)) => report.failed += 1,
                Err(e) => warn!(operation_id = %id, error = %e, "could not record outcome"),
            }
        }

        if report.attempted > 0 {
            debug!(
                attempted = report.attempted,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                "drain finished"
            );
        }
        Ok(report)
    }

    async fn settle(
        &self,
        id: &str,
        result: Result<ExecutionOutcome, TransportError>,
    ) -> QueueResult<Option<FailureDisposition>> {
        match result {
            Ok(outcome) if outcome.success => self.complete(id).await.map(|_| None),
            Ok(outcome) => self.record_failure(id, &outcome.error_message()).await.map(Some),
            Err(e) => self.record_failure(id, &e.to_string()).await.map(Some),
        }
    }

    fn try_claim(&self, id: &str) -> Option<Operation> {
        let now = self.inner.ctx.now_ms();
        let claimed = {
            let mut ops = self.inner.operations.write();
            let op = ops.get_mut(id)?;
            if !op.is_drain_eligible(now) {
                return None;
            }
            op.status = OperationStatus::Processing;
            op.next_attempt_at = None;
            op.clone()
        };
        self.cancel_timer(id);
        Some(claimed)
    }

    // -----------------------------------------------------------------------
    // Hooks shared with the sync coordinator
    // -----------------------------------------------------------------------

    /// Claim every eligible operation (optionally of the given types) for
    /// processing, in drain order
    #[instrument(skip(self, types))]
    pub async fn claim_eligible(&self, types: Option<&[String]>) -> QueueResult<Vec<Operation>> {
        self.ensure_running()?;
        let now = self.inner.ctx.now_ms();

        let (previous, claimed): (Vec<Operation>, Vec<Operation>) = {
            let mut ops = self.inner.operations.write();
            let mut ids: Vec<_> = ops
                .values()
                .filter(|op| op.is_drain_eligible(now))
                .filter(|op| types.map_or(true, |types| types.iter().any(|t| *t == op.op_type)))
                .map(|op| (op.queue_order(), op.id.clone()))
                .collect();
            ids.sort();
            ids.into_iter()
                .filter_map(|(_, id)| {
                    let op = ops.get_mut(&id)?;
                    let before = op.clone();
                    op.status = OperationStatus::Processing;
                    op.next_attempt_at = None;
                    Some((before, op.clone()))
                })
                .unzip()
        };

        for (written, op) in claimed.iter().enumerate() {
            if let Err(e) = self.persist(op).await {
                warn!(operation_id = %op.id, error = %e, "failed to persist claim, rolling back");
                self.unclaim(&previous, written).await;
                return Err(e);
            }
            self.cancel_timer(&op.id);
        }
        debug!(claimed = claimed.len(), "claimed operations for sync");
        Ok(claimed)
    }

    /// Put claimed operations back the way they were; the first `written`
    /// of them already reached storage as `Processing`
    async fn unclaim(&self, previous: &[Operation], written: usize) {
        {
            let mut ops = self.inner.operations.write();
            for before in previous {
                if let Some(op) = ops.get_mut(&before.id) {
                    if op.status == OperationStatus::Processing {
                        *op = before.clone();
                    }
                }
            }
        }
        for before in &previous[..written] {
            if let Err(e) = self.persist(before).await {
                warn!(operation_id = %before.id, error = %e, "failed to persist claim rollback");
            }
        }
    }

    /// Return claimed operations to `Pending` without counting an attempt
    pub async fn release(&self, ids: &[String]) -> QueueResult<usize> {
        let mut released = Vec::new();
        {
            let mut ops = self.inner.operations.write();
            for id in ids {
                if let Some(op) = ops.get_mut(id) {
                    if op.status == OperationStatus::Processing {
                        op.status = OperationStatus::Pending;
                        released.push(op.clone());
                    }
                }
            }
        }
        for op in &released {
            self.persist(op).await?;
        }
        Ok(released.len())
    }

    /// Mark an operation completed and schedule its removal
    #[instrument(skip(self))]
    pub async fn complete(&self, id: &str) -> QueueResult<Operation> {
        let now = self.inner.ctx.now_ms();
        let op = self.modify(id, |op| {
            if matches!(op.status, OperationStatus::Completed | OperationStatus::Cancelled) {
                return Err(invalid(op, "complete"));
            }
            op.status = OperationStatus::Completed;
            op.completed_at = Some(now);
            op.last_error = None;
            op.next_attempt_at = None;
            op.metadata.remove(CONFLICT_METADATA_KEY);
            Ok(())
        })?;
        self.cancel_timer(id);
        // Memory already holds the outcome; finish bookkeeping before reporting
        let persisted = self.persist(&op).await;

        let latency_ms = now.saturating_sub(op.timestamp);
        self.inner.counters.record_completion(latency_ms);
        debug!(operation_id = %id, latency_ms, "operation completed");
        self.inner.ctx.events.emit(EngineEvent::OperationCompleted {
            operation_id: op.id.clone(),
            op_type: op.op_type.clone(),
            latency_ms,
        });
        self.schedule_cleanup(id);
        persisted?;
        Ok(op)
    }

    /// Count a failed attempt; either schedule a retry or fail terminally
    #[instrument(skip(self, error))]
    pub async fn record_failure(&self, id: &str, error: &str) -> QueueResult<FailureDisposition> {
        let now = self.inner.ctx.now_ms();
        let backoff = &self.inner.config.backoff;
        let mut disposition = FailureDisposition::Failed;

        let op = self.modify(id, |op| {
            if op.status.is_terminal() {
                return Err(invalid(op, "fail"));
            }
            let attempts = op.retry_count.saturating_add(1);
            op.last_error = Some(error.to_string());
            if attempts >= op.max_retries {
                op.retry_count = attempts.min(op.max_retries);
                op.status = OperationStatus::Failed;
                op.next_attempt_at = None;
            } else {
                let delay = backoff.delay(attempts);
                op.retry_count = attempts;
                op.status = OperationStatus::Retrying;
                op.next_attempt_at = Some(now.saturating_add(millis(delay)));
                disposition = FailureDisposition::Retrying { attempt: attempts, delay };
            }
            Ok(())
        })?;
        let persisted = self.persist(&op).await;

        match disposition {
            FailureDisposition::Retrying { attempt, delay } => {
                self.inner.counters.record_retry();
                warn!(
                    operation_id = %id,
                    attempt,
                    delay_ms = millis(delay),
                    error,
                    "operation failed, retry scheduled"
                );
                self.schedule_retry(id, delay);
            }
            FailureDisposition::Failed => {
                self.inner.counters.record_failure();
                error!(operation_id = %id, attempts = op.retry_count, error, "operation failed permanently");
                self.inner.ctx.events.emit(EngineEvent::OperationFailed {
                    operation_id: op.id.clone(),
                    op_type: op.op_type.clone(),
                    error: error.to_string(),
                    attempts: op.retry_count,
                });
            }
        }
        persisted?;
        Ok(disposition)
    }

    /// Hold an operation until its conflict is resolved
    pub async fn park_conflicted(&self, id: &str, conflict_id: &str) -> QueueResult<Operation> {
        let op = self.modify(id, |op| {
            op.status = OperationStatus::Failed;
            op.last_error = Some("conflict".to_string());
            op.next_attempt_at = None;
            op.metadata.insert(CONFLICT_METADATA_KEY.to_string(), Value::from(conflict_id));
            Ok(())
        })?;
        self.cancel_timer(id);
        self.persist(&op).await?;
        debug!(operation_id = %id, conflict_id, "operation parked on conflict");
        Ok(op)
    }

    /// Replace the payload and start the operation over as `Pending`
    pub async fn requeue_with_payload(&self, id: &str, payload: Value) -> QueueResult<Operation> {
        let op = self.modify(id, |op| {
            if matches!(op.status, OperationStatus::Completed | OperationStatus::Cancelled) {
                return Err(invalid(op, "requeue"));
            }
            op.payload = payload;
            op.status = OperationStatus::Pending;
            op.retry_count = 0;
            op.last_error = None;
            op.next_attempt_at = None;
            op.metadata.remove(CONFLICT_METADATA_KEY);
            Ok(())
        })?;
        self.cancel_timer(id);
        self.persist(&op).await?;
        debug!(operation_id = %id, "operation requeued with resolved payload");
        Ok(op)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Mutate in memory only; callers persist the returned copy
    fn modify<F>(&self, id: &str, mutate: F) -> QueueResult<Operation>
    where
        F: FnOnce(&mut Operation) -> QueueResult<()>,
    {
        let mut ops = self.inner.operations.write();
        let current = ops.get(id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let mut candidate = current.clone();
        mutate(&mut candidate)?;

        if candidate.id != current.id || candidate.sequence != current.sequence {
            return Err(QueueError::Invariant("id and sequence are immutable".to_string()));
        }
        if candidate.retry_count > candidate.max_retries {
            return Err(QueueError::Invariant(format!(
                "retry_count {} exceeds max_retries {}",
                candidate.retry_count, candidate.max_retries
            )));
        }
        ops.insert(id.to_string(), candidate.clone());
        Ok(candidate)
    }

    async fn persist(&self, op: &Operation) -> QueueResult<()> {
        put_record(self.inner.storage.as_ref(), Collection::Operations, &op.id, op).await?;
        Ok(())
    }

    fn schedule_retry(&self, id: &str, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let op_id = id.to_string();
        let handle = self.inner.ctx.scheduler.schedule_once(
            "queue.retry",
            delay,
            once(move || async move {
                if let Some(queue) = OperationQueue::upgrade(&weak) {
                    queue.return_to_pending(&op_id).await;
                }
            }),
        );
        self.set_timer(id, handle);
    }

    /// Backoff elapsed: make a retrying operation pending again
    async fn return_to_pending(&self, id: &str) {
        self.inner.timers.lock().remove(id);
        let flipped = {
            let mut ops = self.inner.operations.write();
            match ops.get_mut(id) {
                Some(op) if op.status == OperationStatus::Retrying => {
                    op.status = OperationStatus::Pending;
                    op.next_attempt_at = None;
                    Some(op.clone())
                }
                _ => None,
            }
        };
        if let Some(op) = flipped {
            debug!(operation_id = %id, attempt = op.retry_count, "backoff elapsed, operation pending");
            if let Err(e) = self.persist(&op).await {
                warn!(operation_id = %id, error = %e, "failed to persist retry wake-up");
            }
        }
    }

    fn schedule_cleanup(&self, id: &str) {
        let weak = Arc::downgrade(&self.inner);
        let op_id = id.to_string();
        let handle = self.inner.ctx.scheduler.schedule_once(
            "queue.cleanup",
            self.inner.config.completed_retention,
            once(move || async move {
                if let Some(queue) = OperationQueue::upgrade(&weak) {
                    queue.remove_if_settled(&op_id).await;
                }
            }),
        );
        self.set_timer(id, handle);
    }

    async fn remove_if_settled(&self, id: &str) {
        self.inner.timers.lock().remove(id);
        let settled = self
            .inner
            .operations
            .read()
            .get(id)
            .is_some_and(|op| matches!(op.status, OperationStatus::Completed | OperationStatus::Cancelled));
        if settled {
            if let Err(e) = self.remove(id).await {
                warn!(operation_id = %id, error = %e, "failed to remove settled operation");
            }
        }
    }

    fn set_timer(&self, id: &str, handle: TaskHandle) {
        if let Some(previous) = self.inner.timers.lock().insert(id.to_string(), handle) {
            previous.cancel();
        }
    }

    fn cancel_timer(&self, id: &str) {
        if let Some(handle) = self.inner.timers.lock().remove(id) {
            handle.cancel();
        }
    }

    fn cancel_all_timers(&self) {
        for (_, handle) in self.inner.timers.lock().drain() {
            handle.cancel();
        }
    }
}

fn counts_toward_capacity(op: &Operation) -> bool {
    !matches!(op.status, OperationStatus::Completed | OperationStatus::Cancelled)
}

fn invalid(op: &Operation, action: &'static str) -> QueueError {
    QueueError::InvalidTransition { id: op.id.clone(), status: op.status, action }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tidemark_common::ExponentialBackoff;
    use tidemark_domain::Priority;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::testing::ScriptedExecutor;

    fn config() -> QueueConfig {
        QueueConfig {
            max_queue_size: 10,
            auto_drain: false,
            backoff: ExponentialBackoff::fixed(Duration::from_secs(1), 2.0, Duration::from_secs(30)),
            ..QueueConfig::default()
        }
    }

    fn queue_with(
        config: QueueConfig,
        executor: Arc<ScriptedExecutor>,
    ) -> (OperationQueue, Arc<MemoryStorage>, tidemark_common::ManualScheduler) {
        let (ctx, scheduler) = EngineContext::manual(1_000_000);
        let storage = Arc::new(MemoryStorage::new());
        let queue = OperationQueue::new(config, ctx, storage.clone(), executor);
        (queue, storage, scheduler)
    }

    fn new_op(op_type: &str) -> NewOperation {
        NewOperation::new(op_type, json!({"title": op_type}))
    }

    #[tokio::test]
    async fn add_persists_pending_operation() {
        let (queue, storage, _) = queue_with(config(), Arc::new(ScriptedExecutor::succeeding()));
        let id = queue.add(new_op("todo.create")).await.unwrap();

        let op = queue.get(&id).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.timestamp, 1_000_000);
        assert!(storage.retrieve(Collection::Operations, &id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_pending() {
        let cfg = QueueConfig { max_queue_size: 2, ..config() };
        let (queue, storage, _) = queue_with(cfg, Arc::new(ScriptedExecutor::succeeding()));
        let first = queue.add(new_op("a")).await.unwrap();
        let second = queue.add(new_op("b")).await.unwrap();
        let third = queue.add(new_op("c")).await.unwrap();

        assert!(queue.get(&first).is_none());
        assert!(queue.get(&second).is_some());
        assert!(queue.get(&third).is_some());
        assert!(storage.retrieve(Collection::Operations, &first).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_queue_without_pending_rejects() {
        let cfg = QueueConfig { max_queue_size: 1, ..config() };
        let (queue, _, _) = queue_with(cfg, Arc::new(ScriptedExecutor::succeeding()));
        let id = queue.add(new_op("a")).await.unwrap();
        queue.claim_eligible(None).await.unwrap();

        let err = queue.add(new_op("b")).await.unwrap_err();
        assert!(matches!(err, QueueError::CapacityExceeded { max: 1 }));
        assert_eq!(queue.get(&id).unwrap().status, OperationStatus::Processing);
    }

    #[tokio::test]
    async fn get_all_orders_by_priority_then_time() {
        let (queue, _, scheduler) = queue_with(config(), Arc::new(ScriptedExecutor::succeeding()));
        let low = queue.add(new_op("low").with_priority(Priority::Low)).await.unwrap();
        scheduler.advance(Duration::from_millis(1)).await;
        let critical = queue.add(new_op("crit").with_priority(Priority::Critical)).await.unwrap();
        let normal_a = queue.add(new_op("n1")).await.unwrap();
        let normal_b = queue.add(new_op("n2")).await.unwrap();

        let ids: Vec<_> = queue.get_all(&OperationFilter::all()).into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![critical, normal_a, normal_b, low]);
    }

    #[tokio::test]
    async fn update_rejects_invariant_violations() {
        let (queue, _, _) = queue_with(config(), Arc::new(ScriptedExecutor::succeeding()));
        let id = queue.add(new_op("a")).await.unwrap();

        let err = queue.update(&id, |op| op.retry_count = 99).await.unwrap_err();
        assert!(matches!(err, QueueError::Invariant(_)));

        let updated = queue.update(&id, |op| op.payload = json!({"v": 2})).await.unwrap();
        assert_eq!(updated.payload, json!({"v": 2}));
        assert!(matches!(queue.update("missing", |_| {}).await, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_only_before_processing() {
        let (queue, _, scheduler) = queue_with(config(), Arc::new(ScriptedExecutor::succeeding()));
        let pending = queue.add(new_op("a")).await.unwrap();
        let claimed = queue.add(new_op("b")).await.unwrap();
        queue.update(&claimed, |op| op.status = OperationStatus::Processing).await.unwrap();

        assert_eq!(queue.cancel(&pending).await.unwrap().status, OperationStatus::Cancelled);
        assert!(matches!(
            queue.cancel(&claimed).await,
            Err(QueueError::InvalidTransition { action: "cancel", .. })
        ));

        scheduler.advance(Duration::from_secs(5)).await;
        assert!(queue.get(&pending).is_none());
    }

    #[tokio::test]
    async fn completed_operations_removed_after_grace_window() {
        let executor = Arc::new(ScriptedExecutor::succeeding());
        let (queue, storage, scheduler) = queue_with(config(), executor.clone());
        let id = queue.add(new_op("a")).await.unwrap();

        let report = queue.drain().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(queue.get(&id).unwrap().status, OperationStatus::Completed);

        scheduler.advance(Duration::from_millis(4_999)).await;
        assert!(queue.get(&id).is_some());
        scheduler.advance(Duration::from_millis(1)).await;
        assert!(queue.get(&id).is_none());
        assert!(storage.retrieve(Collection::Operations, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_schedules_backoff_then_pending() {
        let executor = Arc::new(ScriptedExecutor::failing("503"));
        let (queue, _, scheduler) = queue_with(config(), executor.clone());
        let id = queue.add(new_op("a")).await.unwrap();

        let report = queue.drain().await.unwrap();
        assert_eq!(report.retried, 1);
        let op = queue.get(&id).unwrap();
        assert_eq!(op.status, OperationStatus::Retrying);
        assert_eq!(op.retry_count, 1);
        assert_eq!(op.next_attempt_at, Some(1_001_000));
        assert_eq!(op.last_error.as_deref(), Some("503"));

        // Not eligible before the backoff elapses
        assert_eq!(queue.drain().await.unwrap().attempted, 0);

        scheduler.advance(Duration::from_secs(1)).await;
        assert_eq!(queue.get(&id).unwrap().status, OperationStatus::Pending);
    }

    #[tokio::test]
    async fn paused_queue_does_not_drain() {
        let executor = Arc::new(ScriptedExecutor::succeeding());
        let (queue, _, _) = queue_with(config(), executor.clone());
        queue.add(new_op("a")).await.unwrap();

        queue.pause();
        assert!(queue.drain().await.unwrap().skipped);
        assert_eq!(executor.call_count(), 0);

        queue.resume();
        assert_eq!(queue.drain().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn initialize_recovers_interrupted_operations() {
        let executor = Arc::new(ScriptedExecutor::succeeding());
        let (queue, storage, _) = queue_with(config(), executor.clone());
        let processing = queue.add(new_op("a")).await.unwrap();
        let retrying = queue.add(new_op("b")).await.unwrap();
        let done = queue.add(new_op("c")).await.unwrap();
        queue.update(&processing, |op| op.status = OperationStatus::Processing).await.unwrap();
        queue
            .update(&retrying, |op| {
                op.status = OperationStatus::Retrying;
                op.retry_count = 1;
                op.next_attempt_at = Some(u64::MAX);
            })
            .await
            .unwrap();
        queue.update(&done, |op| op.status = OperationStatus::Completed).await.unwrap();

        let (ctx, _) = EngineContext::manual(2_000_000);
        let restarted = OperationQueue::new(config(), ctx, storage.clone(), executor);
        restarted.initialize().await.unwrap();

        assert_eq!(restarted.get(&processing).unwrap().status, OperationStatus::Pending);
        let recovered = restarted.get(&retrying).unwrap();
        assert_eq!(recovered.status, OperationStatus::Pending);
        assert_eq!(recovered.retry_count, 1);
        assert!(recovered.next_attempt_at.is_none());
        assert!(restarted.get(&done).is_none());

        // New ids sort after recovered ones
        let later = restarted.add(new_op("d")).await.unwrap();
        assert!(restarted.get(&later).unwrap().sequence > recovered.sequence);
    }

    #[tokio::test]
    async fn release_returns_claimed_operations() {
        let (queue, _, _) = queue_with(config(), Arc::new(ScriptedExecutor::succeeding()));
        queue.add(new_op("a")).await.unwrap();
        queue.add(new_op("b")).await.unwrap();

        let claimed = queue.claim_eligible(Some(&["a".to_string()])).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let ids: Vec<String> = claimed.iter().map(|op| op.id.clone()).collect();

        assert_eq!(queue.release(&ids).await.unwrap(), 1);
        assert_eq!(queue.get(&ids[0]).unwrap().status, OperationStatus::Pending);
        assert_eq!(queue.get(&ids[0]).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn parked_operation_requeues_with_new_payload() {
        let (queue, _, _) = queue_with(config(), Arc::new(ScriptedExecutor::succeeding()));
        let id = queue.add(new_op("a")).await.unwrap();
        queue.claim_eligible(None).await.unwrap();

        let parked = queue.park_conflicted(&id, "c-1").await.unwrap();
        assert_eq!(parked.status, OperationStatus::Failed);
        assert_eq!(parked.metadata.get(CONFLICT_METADATA_KEY), Some(&json!("c-1")));

        let requeued = queue.requeue_with_payload(&id, json!({"merged": true})).await.unwrap();
        assert_eq!(requeued.status, OperationStatus::Pending);
        assert_eq!(requeued.payload, json!({"merged": true}));
        assert!(requeued.metadata.get(CONFLICT_METADATA_KEY).is_none());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_blocks_adds() {
        let (queue, _, scheduler) = queue_with(
            QueueConfig { auto_drain: true, ..config() },
            Arc::new(ScriptedExecutor::succeeding()),
        );
        queue.initialize().await.unwrap();
        assert_eq!(scheduler.pending_tasks(), 1);

        queue.shutdown();
        queue.shutdown();
        assert_eq!(scheduler.pending_tasks(), 0);
        assert!(matches!(queue.add(new_op("a")).await, Err(QueueError::ShutDown)));
    }

    #[tokio::test]
    async fn stats_reflect_lifecycle() {
        let executor = Arc::new(ScriptedExecutor::succeeding());
        let (queue, _, scheduler) = queue_with(config(), executor);
        queue.add(new_op("a")).await.unwrap();
        scheduler.advance(Duration::from_millis(250)).await;
        queue.add(new_op("b")).await.unwrap();

        let before = queue.stats();
        assert_eq!(before.pending, 2);
        assert_eq!(before.oldest_pending_age_ms, Some(250));

        queue.drain().await.unwrap();
        let after = queue.stats();
        assert_eq!(after.completed, 2);
        assert_eq!(after.total_processed, 2);
        assert!((after.average_latency_ms - 125.0).abs() < f64::EPSILON);
    }
}
