//! Queued operations
//!
//! An [`Operation`] is a durable intent to mutate remote state. Callers build
//! a [`NewOperation`]; the queue assigns identity, timestamp and retry
//! bookkeeping.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Metadata;

/// Urgency of an operation; lower values drain first
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Priority {
    /// All priorities, most urgent first
    pub const ALL: [Self; 5] = [Self::Critical, Self::High, Self::Normal, Self::Low, Self::Background];

    /// Numeric rank (0 = most urgent)
    pub const fn rank(self) -> u8 {
        self as u8
    }

    /// Priority for a numeric rank
    pub fn from_rank(rank: u8) -> Option<Self> {
        Self::ALL.get(usize::from(rank)).copied()
    }
}

crate::impl_domain_status_conversions!(Priority {
    Critical => "critical",
    High => "high",
    Normal => "normal",
    Low => "low",
    Background => "background",
});

/// Lifecycle of a queued operation
///
/// ```text
/// pending -> processing -> completed
///               |
///               +-> retrying -> pending      (retry_count < max_retries)
///               +-> failed                   (retry_count == max_retries)
/// pending | retrying -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl OperationStatus {
    /// No further transitions happen from a terminal status
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses from which cancellation is still safe
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }
}

crate::impl_domain_status_conversions!(OperationStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Retrying => "retrying",
    Cancelled => "cancelled",
});

/// A durable, queued mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: String,
    pub payload: Value,
    pub status: OperationStatus,
    pub priority: Priority,
    /// Creation time, ms since epoch
    pub timestamp: u64,
    /// Insertion order, breaks timestamp ties
    #[serde(default)]
    pub sequence: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest retry time while `Retrying`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

impl Operation {
    /// Sort key: priority, then timestamp, then insertion order
    pub fn queue_order(&self) -> (Priority, u64, u64) {
        (self.priority, self.timestamp, self.sequence)
    }

    /// Whether a drain at `now_ms` should pick this operation up
    ///
    /// A `Retrying` operation whose backoff has elapsed counts as pending even
    /// if its wake-up task never ran.
    pub fn is_drain_eligible(&self, now_ms: u64) -> bool {
        match self.status {
            OperationStatus::Pending => true,
            OperationStatus::Retrying => self.next_attempt_at.map_or(true, |at| at <= now_ms),
            _ => false,
        }
    }

    /// Retries left before the operation fails terminally
    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}

/// Caller-supplied part of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    #[serde(rename = "type")]
    pub op_type: String,
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    /// Falls back to the queue's configured default
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewOperation {
    pub fn new(op_type: impl Into<String>, payload: Value) -> Self {
        Self {
            op_type: op_type.into(),
            payload,
            priority: Priority::default(),
            max_retries: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Materialize into a pending operation
    pub fn into_operation(
        self,
        id: String,
        timestamp: u64,
        sequence: u64,
        default_max_retries: u32,
    ) -> Operation {
        Operation {
            id,
            op_type: self.op_type,
            payload: self.payload,
            status: OperationStatus::Pending,
            priority: self.priority,
            timestamp,
            sequence,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            metadata: self.metadata,
            last_error: None,
            next_attempt_at: None,
            completed_at: None,
        }
    }
}

/// Selection criteria for queue listings; empty criteria match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationFilter {
    pub statuses: Option<Vec<OperationStatus>>,
    pub types: Option<Vec<String>>,
    pub priorities: Option<Vec<Priority>>,
}

impl OperationFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.statuses.get_or_insert_with(Vec::new).push(status);
        self
    }

    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types.get_or_insert_with(Vec::new).extend(types.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priorities.get_or_insert_with(Vec::new).push(priority);
        self
    }

    pub fn matches(&self, op: &Operation) -> bool {
        self.statuses.as_ref().map_or(true, |s| s.contains(&op.status))
            && self.types.as_ref().map_or(true, |t| t.iter().any(|ty| *ty == op.op_type))
            && self.priorities.as_ref().map_or(true, |p| p.contains(&op.priority))
    }
}
