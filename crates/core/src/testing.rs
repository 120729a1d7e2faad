//! Scripted ports for tests
//!
//! Available to this crate's tests and, through the `test-utils` feature, to
//! downstream crates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tidemark_domain::{Conflict, ConnectivityStatus, Operation};
use tokio::sync::{watch, Notify};

use crate::ports::{
    Collection, ConflictResolver, ConnectivityMonitor, ExecutionOutcome, RemoteExecutor,
    StorageAdapter, StorageError, StorageResult, TransportError,
};
use crate::storage::MemoryStorage;

type Responder = Arc<dyn Fn(&Operation, usize) -> ExecutionOutcome + Send + Sync>;

/// Remote executor answering from a closure, with call recording
///
/// The responder receives each operation and its position in the batch.
pub struct ScriptedExecutor {
    responder: Mutex<Responder>,
    transport_failures: AtomicUsize,
    short_batches: AtomicUsize,
    batches: Mutex<Vec<Vec<Operation>>>,
    gate: watch::Sender<bool>,
    entered: Notify,
}

impl std::fmt::Debug for ScriptedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedExecutor").field("calls", &self.call_count()).finish()
    }
}

impl ScriptedExecutor {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Operation, usize) -> ExecutionOutcome + Send + Sync + 'static,
    {
        let (gate, _) = watch::channel(true);
        Self {
            responder: Mutex::new(Arc::new(responder)),
            transport_failures: AtomicUsize::new(0),
            short_batches: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            gate,
            entered: Notify::new(),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_, _| ExecutionOutcome::success())
    }

    pub fn failing(error: &str) -> Self {
        let error = error.to_string();
        Self::new(move |_, _| ExecutionOutcome::failure(error.clone()))
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Operation, usize) -> ExecutionOutcome + Send + Sync + 'static,
    {
        *self.responder.lock() = Arc::new(responder);
    }

    /// The next `count` batch calls fail with a transport error
    pub fn fail_transport(&self, count: usize) {
        self.transport_failures.store(count, Ordering::SeqCst);
    }

    /// The next `count` batch calls return one outcome too few
    pub fn return_short_batches(&self, count: usize) {
        self.short_batches.store(count, Ordering::SeqCst);
    }

    /// Hold every call until [`open`](Self::open)
    pub fn close(&self) {
        self.gate.send_replace(false);
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Wait until a call has entered the executor
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Number of `execute_batch` calls
    pub fn call_count(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(Vec::len).collect()
    }

    /// Ids of every operation sent, in call order
    pub fn executed_ids(&self) -> Vec<String> {
        self.batches.lock().iter().flatten().map(|op| op.id.clone()).collect()
    }

    pub fn executed_types(&self) -> Vec<String> {
        self.batches.lock().iter().flatten().map(|op| op.op_type.clone()).collect()
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute_batch(
        &self,
        operations: &[Operation],
    ) -> Result<Vec<ExecutionOutcome>, TransportError> {
        self.batches.lock().push(operations.to_vec());
        self.entered.notify_one();

        let mut gate = self.gate.subscribe();
        // Only errors if the sender is gone, which cannot happen while &self lives
        let _ = gate.wait_for(|open| *open).await;

        if Self::take_one(&self.transport_failures) {
            return Err(TransportError::new("connection reset"));
        }
        let responder = Arc::clone(&*self.responder.lock());
        let mut outcomes: Vec<ExecutionOutcome> =
            operations.iter().enumerate().map(|(i, op)| responder(op, i)).collect();
        if Self::take_one(&self.short_batches) {
            outcomes.pop();
        }
        Ok(outcomes)
    }
}

/// Connectivity monitor driven by the test
#[derive(Debug)]
pub struct ManualConnectivity {
    sender: watch::Sender<ConnectivityStatus>,
    probe_results: Mutex<VecDeque<ConnectivityStatus>>,
    probes: AtomicUsize,
}

impl ManualConnectivity {
    pub fn new(initial: ConnectivityStatus) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender, probe_results: Mutex::new(VecDeque::new()), probes: AtomicUsize::new(0) }
    }

    /// Publish a status change to subscribers
    pub fn set(&self, status: ConnectivityStatus) {
        self.sender.send_replace(status);
    }

    /// Queue the result of the next probe; without one a probe reports the
    /// current status
    pub fn push_probe_result(&self, status: ConnectivityStatus) {
        self.probe_results.lock().push_back(status);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityMonitor for ManualConnectivity {
    fn current(&self) -> ConnectivityStatus {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.sender.subscribe()
    }

    async fn probe(&self) -> ConnectivityStatus {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let next = self.probe_results.lock().pop_front();
        match next {
            Some(status) => {
                self.sender.send_replace(status);
                status
            }
            None => self.current(),
        }
    }
}

/// Resolver that records the conflicts it saw and answers from a closure
pub struct RecordingResolver {
    answer: Box<dyn Fn(&Conflict) -> anyhow::Result<Value> + Send + Sync>,
    seen: Mutex<Vec<Conflict>>,
}

impl std::fmt::Debug for RecordingResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingResolver").field("seen", &self.seen.lock().len()).finish()
    }
}

impl RecordingResolver {
    pub fn new<F>(answer: F) -> Self
    where
        F: Fn(&Conflict) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self { answer: Box::new(answer), seen: Mutex::new(Vec::new()) }
    }

    /// Always answers with `value`
    pub fn returning(value: Value) -> Self {
        Self::new(move |_| Ok(value.clone()))
    }

    pub fn seen(&self) -> Vec<Conflict> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ConflictResolver for RecordingResolver {
    async fn resolve(&self, conflict: &Conflict) -> anyhow::Result<Value> {
        self.seen.lock().push(conflict.clone());
        (self.answer)(conflict)
    }
}

/// Memory storage whose writes can be switched to fail
#[derive(Debug, Default)]
pub struct FailingStorage {
    inner: MemoryStorage,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl FailingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> StorageResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageAdapter for FailingStorage {
    async fn store(&self, collection: Collection, key: &str, value: Value) -> StorageResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.store(collection, key, value).await
    }

    async fn retrieve(&self, collection: Collection, key: &str) -> StorageResult<Option<Value>> {
        self.check(&self.fail_reads)?;
        self.inner.retrieve(collection, key).await
    }

    async fn retrieve_all(&self, collection: Collection) -> StorageResult<Vec<(String, Value)>> {
        self.check(&self.fail_reads)?;
        self.inner.retrieve_all(collection).await
    }

    async fn remove(&self, collection: Collection, key: &str) -> StorageResult<bool> {
        self.check(&self.fail_writes)?;
        self.inner.remove(collection, key).await
    }

    async fn clear(&self, collection: Collection) -> StorageResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.clear(collection).await
    }

    async fn get_setting(&self, key: &str) -> StorageResult<Option<Value>> {
        self.check(&self.fail_reads)?;
        self.inner.get_setting(key).await
    }

    async fn set_setting(&self, key: &str, value: Value) -> StorageResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.set_setting(key, value).await
    }

    async fn remove_setting(&self, key: &str) -> StorageResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.remove_setting(key).await
    }

    async fn backup(&self) -> StorageResult<Vec<u8>> {
        self.check(&self.fail_reads)?;
        self.inner.backup().await
    }

    async fn restore(&self, data: &[u8]) -> StorageResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.restore(data).await
    }
}
