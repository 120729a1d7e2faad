//! Sync batches, conflicts and pass reports

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::operation::{Operation, Priority};

/// Operations committed together in one sync pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatch {
    pub id: String,
    /// Snapshots, in execution order
    pub operations: Vec<Operation>,
    pub created_at: u64,
    /// Most urgent member priority
    pub priority: Priority,
}

impl SyncBatch {
    pub fn new(id: String, operations: Vec<Operation>, created_at: u64) -> Self {
        let priority =
            operations.iter().map(|op| op.priority).min().unwrap_or(Priority::default());
        Self { id, operations, created_at, priority }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// How a conflict was (or should be) settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Local payload wins
    ClientWins,
    /// Remote payload wins
    ServerWins,
    /// Larger embedded timestamp wins
    TimestampWins,
    /// Recursive merge, local scalars win
    Merge,
    /// No automatic strategy; explicit data or a registered resolver
    Manual,
    /// Produced by a registered per-type resolver
    Custom,
}

impl ResolutionStrategy {
    /// Strategies that can settle a conflict without caller input
    pub const fn is_automatic(self) -> bool {
        matches!(self, Self::ClientWins | Self::ServerWins | Self::TimestampWins | Self::Merge)
    }
}

crate::impl_domain_status_conversions!(ResolutionStrategy {
    ClientWins => "client-wins",
    ServerWins => "server-wins",
    TimestampWins => "timestamp-wins",
    Merge => "merge",
    Manual => "manual",
    Custom => "custom",
});

/// Outcome attached to a resolved conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    pub resolved_data: Value,
    pub resolved_at: u64,
}

/// Divergence between a queued local change and remote state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub operation_id: String,
    #[serde(rename = "type")]
    pub op_type: String,
    pub local_data: Value,
    pub remote_data: Value,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Aggregate result of one sync pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// No failures and no new conflicts
    pub success: bool,
    pub synced_items: usize,
    pub failed_items: usize,
    pub conflicts: Vec<Conflict>,
    pub duration_ms: u64,
    pub timestamp: u64,
}

impl SyncReport {
    pub fn empty(timestamp: u64) -> Self {
        Self {
            success: true,
            synced_items: 0,
            failed_items: 0,
            conflicts: Vec::new(),
            duration_ms: 0,
            timestamp,
        }
    }

    pub fn processed(&self) -> usize {
        self.synced_items + self.failed_items + self.conflicts.len()
    }
}

/// Parameters for a sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Run even if another pass is in flight
    pub force: bool,
    /// Only sync these operation types
    pub types: Option<Vec<String>>,
}

impl SyncOptions {
    pub fn forced() -> Self {
        Self { force: true, types: None }
    }

    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { force: false, types: Some(types.into_iter().map(Into::into).collect()) }
    }
}
