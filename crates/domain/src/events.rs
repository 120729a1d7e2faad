//! Engine event taxonomy
//!
//! A closed set of events, each with a typed payload. Subscribers register
//! per [`EventKind`] or for everything.

use serde::{Deserialize, Serialize};

use crate::types::{
    Conflict, ConnectionQuality, Priority, ResolutionStrategy, SyncReport,
};

/// Everything the engine reports to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    OfflineDetected {
        at: u64,
    },
    OnlineDetected {
        at: u64,
        /// How long the engine was offline, when known
        offline_for_ms: Option<u64>,
    },
    SyncStarted {
        pending: usize,
    },
    SyncCompleted(SyncReport),
    SyncFailed {
        error: String,
    },
    OperationQueued {
        operation_id: String,
        op_type: String,
        priority: Priority,
    },
    OperationCompleted {
        operation_id: String,
        op_type: String,
        latency_ms: u64,
    },
    /// Terminal failure; fires once per operation
    OperationFailed {
        operation_id: String,
        op_type: String,
        error: String,
        attempts: u32,
    },
    ConflictDetected(Conflict),
    ConflictResolved {
        conflict_id: String,
        operation_id: String,
        strategy: ResolutionStrategy,
    },
    StorageQuotaExceeded {
        used_bytes: u64,
        max_bytes: u64,
        evicted: usize,
    },
    NetworkQualityChanged {
        from: ConnectionQuality,
        to: ConnectionQuality,
    },
}

/// Discriminant of [`EngineEvent`], used for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    OfflineDetected,
    OnlineDetected,
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    OperationQueued,
    OperationCompleted,
    OperationFailed,
    ConflictDetected,
    ConflictResolved,
    StorageQuotaExceeded,
    NetworkQualityChanged,
}

impl EventKind {
    pub const ALL: [Self; 12] = [
        Self::OfflineDetected,
        Self::OnlineDetected,
        Self::SyncStarted,
        Self::SyncCompleted,
        Self::SyncFailed,
        Self::OperationQueued,
        Self::OperationCompleted,
        Self::OperationFailed,
        Self::ConflictDetected,
        Self::ConflictResolved,
        Self::StorageQuotaExceeded,
        Self::NetworkQualityChanged,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OfflineDetected => "OFFLINE_DETECTED",
            Self::OnlineDetected => "ONLINE_DETECTED",
            Self::SyncStarted => "SYNC_STARTED",
            Self::SyncCompleted => "SYNC_COMPLETED",
            Self::SyncFailed => "SYNC_FAILED",
            Self::OperationQueued => "OPERATION_QUEUED",
            Self::OperationCompleted => "OPERATION_COMPLETED",
            Self::OperationFailed => "OPERATION_FAILED",
            Self::ConflictDetected => "CONFLICT_DETECTED",
            Self::ConflictResolved => "CONFLICT_RESOLVED",
            Self::StorageQuotaExceeded => "STORAGE_QUOTA_EXCEEDED",
            Self::NetworkQualityChanged => "NETWORK_QUALITY_CHANGED",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::OfflineDetected { .. } => EventKind::OfflineDetected,
            Self::OnlineDetected { .. } => EventKind::OnlineDetected,
            Self::SyncStarted { .. } => EventKind::SyncStarted,
            Self::SyncCompleted(_) => EventKind::SyncCompleted,
            Self::SyncFailed { .. } => EventKind::SyncFailed,
            Self::OperationQueued { .. } => EventKind::OperationQueued,
            Self::OperationCompleted { .. } => EventKind::OperationCompleted,
            Self::OperationFailed { .. } => EventKind::OperationFailed,
            Self::ConflictDetected(_) => EventKind::ConflictDetected,
            Self::ConflictResolved { .. } => EventKind::ConflictResolved,
            Self::StorageQuotaExceeded { .. } => EventKind::StorageQuotaExceeded,
            Self::NetworkQualityChanged { .. } => EventKind::NetworkQualityChanged,
        }
    }
}

/// An event with the time it was emitted, kept in the diagnostics history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: u64,
    pub event: EngineEvent,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn kind_matches_variant() {
        let event = EngineEvent::NetworkQualityChanged {
            from: ConnectionQuality::Good,
            to: ConnectionQuality::Poor,
        };
        assert_eq!(event.kind(), EventKind::NetworkQualityChanged);
        assert_eq!(EngineEvent::SyncFailed { error: "x".into() }.kind(), EventKind::SyncFailed);
    }

    #[test]
    fn serialized_tag_matches_kind_name() {
        let event = EngineEvent::OperationQueued {
            operation_id: "op-1".into(),
            op_type: "todo.create".into(),
            priority: Priority::High,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!(event.kind().as_str()));
        assert_eq!(value["payload"]["priority"], json!("high"));
    }

    #[test]
    fn every_kind_has_a_distinct_name() {
        let mut names: Vec<_> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), EventKind::ALL.len());
        assert_eq!(EventKind::StorageQuotaExceeded.to_string(), "STORAGE_QUOTA_EXCEEDED");
    }
}
