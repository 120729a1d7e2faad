//! Aggregate engine state and connectivity signals

use serde::{Deserialize, Serialize};

/// Coarse connection quality class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    #[default]
    Offline,
}

crate::impl_domain_status_conversions!(ConnectionQuality {
    Excellent => "excellent",
    Good => "good",
    Poor => "poor",
    Offline => "offline",
});

/// One reading from the connectivity collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityStatus {
    pub reachable: bool,
    pub quality: ConnectionQuality,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

impl ConnectivityStatus {
    pub fn online(quality: ConnectionQuality) -> Self {
        Self { reachable: true, quality, latency_ms: None }
    }

    pub fn offline() -> Self {
        Self { reachable: false, quality: ConnectionQuality::Offline, latency_ms: None }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Network side of [`OfflineState`]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSnapshot {
    pub quality: ConnectionQuality,
    pub last_checked: Option<u64>,
    pub latency_ms: Option<u64>,
    /// Set while offline
    pub offline_since: Option<u64>,
}

/// Storage side of [`OfflineState`]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSnapshot {
    pub cache_entries: usize,
    pub cache_size_bytes: u64,
    pub cache_max_bytes: u64,
    pub queue_size: usize,
}

/// Aggregate state owned by the orchestrator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OfflineState {
    pub is_online: bool,
    pub connection_quality: ConnectionQuality,
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub is_syncing: bool,
    /// 0.0 ..= 1.0 within the current pass
    pub sync_progress: f64,
    pub last_sync_time: Option<u64>,
    pub network: NetworkSnapshot,
    pub storage: StorageSnapshot,
}
