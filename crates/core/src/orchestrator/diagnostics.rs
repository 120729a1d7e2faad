//! Serializable snapshots for hosts to log or display

use serde::{Deserialize, Serialize};
use tidemark_domain::{EventRecord, OfflineState};

use super::metrics::MetricsSnapshot;
use crate::cache::CacheStats;
use crate::queue::QueueStats;
use crate::sync::SyncStatus;

/// Counters from every component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub queue: QueueStats,
    pub cache: CacheStats,
    pub sync: SyncStatus,
    pub metrics: MetricsSnapshot,
}

/// Full picture of the engine, including recent events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub initialized: bool,
    pub destroyed: bool,
    pub background_channel: bool,
    pub state: OfflineState,
    pub stats: EngineStats,
    pub recent_events: Vec<EventRecord>,
}

/// One self-test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
}

impl CheckResult {
    pub(crate) fn new(name: &str, outcome: Result<(), String>, duration_ms: u64) -> Self {
        let (passed, detail) = match outcome {
            Ok(()) => (true, None),
            Err(detail) => (false, Some(detail)),
        };
        Self { name: name.to_string(), passed, detail, duration_ms }
    }
}

/// Result of [`OfflineEngine::run_diagnostics`](super::OfflineEngine::run_diagnostics)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub healthy: bool,
    pub checks: Vec<CheckResult>,
    pub ran_at: u64,
}

impl DiagnosticsReport {
    pub(crate) fn new(checks: Vec<CheckResult>, ran_at: u64) -> Self {
        Self { healthy: checks.iter().all(|c| c.passed), checks, ran_at }
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}
