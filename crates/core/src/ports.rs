//! Port interfaces for the engine's external collaborators
//!
//! Storage, remote execution, connectivity and the background channel are
//! all injected as `Arc<dyn Trait>`. Adapters live in `tidemark-infra`
//! (SQLite, HTTP) or in this crate (in-memory storage, static connectivity).

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tidemark_common::error::{CommonError, ErrorClassification, ErrorSeverity};
use tidemark_common::{impl_error_classification, impl_error_conversion};
use tidemark_domain::constants::{
    COLLECTION_CACHE, COLLECTION_CONFLICTS, COLLECTION_OPERATIONS, COLLECTION_RESOLVED_CONFLICTS,
    COLLECTION_SYNC_BATCHES,
};
use tidemark_domain::{Conflict, ConnectivityStatus, EngineEvent, OfflineState, Operation};
use tokio::sync::{broadcast, watch};

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Logical collections sharing the durable store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Operations,
    Cache,
    SyncBatches,
    Conflicts,
    ResolvedConflicts,
}

impl Collection {
    pub const ALL: [Self; 5] = [
        Self::Operations,
        Self::Cache,
        Self::SyncBatches,
        Self::Conflicts,
        Self::ResolvedConflicts,
    ];

    /// Persisted collection name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Operations => COLLECTION_OPERATIONS,
            Self::Cache => COLLECTION_CACHE,
            Self::SyncBatches => COLLECTION_SYNC_BATCHES,
            Self::Conflicts => COLLECTION_CONFLICTS,
            Self::ResolvedConflicts => COLLECTION_RESOLVED_CONFLICTS,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|collection| collection.as_str() == name)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by storage adapters
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record {collection}/{key}: {message}")]
    Corrupt { collection: Collection, key: String, message: String },

    #[error("invalid backup: {0}")]
    InvalidBackup(String),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl_error_conversion!(StorageError, Common);
impl_error_classification!(StorageError, Common,
    Self::Unavailable(_) => {
        retryable: true,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::Corrupt { .. } => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::InvalidBackup(_) => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    }
);

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable key/value store partitioned into [`Collection`]s plus a flat
/// settings namespace
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Prepare the backing store (create tables, open files)
    async fn initialize(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn store(&self, collection: Collection, key: &str, value: Value) -> StorageResult<()>;

    async fn retrieve(&self, collection: Collection, key: &str) -> StorageResult<Option<Value>>;

    /// Every record in a collection, in key order
    async fn retrieve_all(&self, collection: Collection) -> StorageResult<Vec<(String, Value)>>;

    /// Returns whether a record was removed
    async fn remove(&self, collection: Collection, key: &str) -> StorageResult<bool>;

    async fn clear(&self, collection: Collection) -> StorageResult<()>;

    async fn get_setting(&self, key: &str) -> StorageResult<Option<Value>>;

    async fn set_setting(&self, key: &str, value: Value) -> StorageResult<()>;

    async fn remove_setting(&self, key: &str) -> StorageResult<()>;

    /// Opaque snapshot of every collection and setting
    async fn backup(&self) -> StorageResult<Vec<u8>>;

    /// Replace all contents with a snapshot produced by [`backup`](Self::backup)
    async fn restore(&self, data: &[u8]) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// Remote execution
// ---------------------------------------------------------------------------

/// Per-operation result reported by the remote executor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Remote state when the server reports divergence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<Value>,
}

impl ExecutionOutcome {
    pub fn success() -> Self {
        Self { success: true, error: None, conflict: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), conflict: None }
    }

    pub fn conflict(remote: Value) -> Self {
        Self { success: false, error: Some("conflict".to_string()), conflict: Some(remote) }
    }

    pub fn is_conflict(&self) -> bool {
        !self.success && self.conflict.is_some()
    }

    /// Error text for a failed outcome
    pub fn error_message(&self) -> String {
        self.error.clone().unwrap_or_else(|| "remote execution failed".to_string())
    }
}

/// Whole-batch failure: nothing in the batch is known to have executed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transport failure: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// Executes queued operations against the remote API
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// One outcome per operation, in request order
    async fn execute_batch(
        &self,
        operations: &[Operation],
    ) -> Result<Vec<ExecutionOutcome>, TransportError>;

    async fn execute(&self, operation: &Operation) -> Result<ExecutionOutcome, TransportError> {
        let mut outcomes = self.execute_batch(std::slice::from_ref(operation)).await?;
        outcomes.pop().ok_or_else(|| TransportError::new("executor returned no outcome"))
    }
}

// ---------------------------------------------------------------------------
// Connectivity
// ---------------------------------------------------------------------------

/// Source of reachability signals
#[async_trait]
pub trait ConnectivityMonitor: Send + Sync {
    /// Last known status
    fn current(&self) -> ConnectivityStatus;

    /// Receives every status change the monitor observes
    fn subscribe(&self) -> watch::Receiver<ConnectivityStatus>;

    /// Actively check reachability and publish the result
    async fn probe(&self) -> ConnectivityStatus;
}

/// Monitor whose status only changes through [`set`](Self::set)
///
/// Used when the host feeds connectivity itself, or when no probe endpoint
/// is configured.
#[derive(Debug)]
pub struct StaticConnectivity {
    sender: watch::Sender<ConnectivityStatus>,
}

impl StaticConnectivity {
    pub fn new(initial: ConnectivityStatus) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn online() -> Self {
        Self::new(ConnectivityStatus::online(tidemark_domain::ConnectionQuality::Good))
    }

    pub fn set(&self, status: ConnectivityStatus) {
        self.sender.send_replace(status);
    }
}

#[async_trait]
impl ConnectivityMonitor for StaticConnectivity {
    fn current(&self) -> ConnectivityStatus {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityStatus> {
        self.sender.subscribe()
    }

    async fn probe(&self) -> ConnectivityStatus {
        self.current()
    }
}

// ---------------------------------------------------------------------------
// Background channel
// ---------------------------------------------------------------------------

/// Messages exchanged between engine instances sharing one store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BackgroundMessage {
    /// Another instance changed its aggregate state
    StateChanged { state: OfflineState },
    /// Another instance queued an operation into the shared store
    OperationQueued { operation_id: String },
    /// Ask peers to run a sync pass
    SyncRequested,
    /// Forwarded engine event
    Event { event: EngineEvent },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("background channel unavailable")]
    Unavailable,

    #[error("background channel closed")]
    Closed,
}

/// Optional link to other engine instances (other windows, workers)
#[async_trait]
pub trait BackgroundChannel: Send + Sync {
    fn is_available(&self) -> bool;

    async fn send(&self, message: BackgroundMessage) -> Result<(), ChannelError>;

    /// Stream of messages from peers; `None` when the channel cannot receive
    fn incoming(&self) -> Option<broadcast::Receiver<BackgroundMessage>>;
}

/// Channel used when no background transport is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackgroundChannel;

#[async_trait]
impl BackgroundChannel for NoopBackgroundChannel {
    fn is_available(&self) -> bool {
        false
    }

    async fn send(&self, _message: BackgroundMessage) -> Result<(), ChannelError> {
        Ok(())
    }

    fn incoming(&self) -> Option<broadcast::Receiver<BackgroundMessage>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Conflict resolution
// ---------------------------------------------------------------------------

/// Type-specific resolver consulted when no automatic strategy applies
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    /// Produce the data the conflicted operation should carry forward
    async fn resolve(&self, conflict: &Conflict) -> anyhow::Result<Value>;
}
