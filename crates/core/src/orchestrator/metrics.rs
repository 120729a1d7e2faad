//! Engine-level counters fed from the event bus

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tidemark_domain::EngineEvent;

/// Periodic metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub captured_at: u64,
    pub uptime_ms: u64,
    /// Total time spent offline, including the current outage
    pub offline_ms: u64,
    pub syncs_completed: u64,
    pub sync_failures: u64,
    pub operations_queued: u64,
    pub operations_completed: u64,
    pub operations_failed: u64,
    pub conflicts_detected: u64,
    pub quota_exceeded: u64,
    /// Exponentially smoothed sync pass duration
    pub average_sync_ms: f64,
}

#[derive(Debug, Default)]
struct Counters {
    offline_since: Option<Instant>,
    offline_total: Duration,
    syncs_completed: u64,
    sync_failures: u64,
    operations_queued: u64,
    operations_completed: u64,
    operations_failed: u64,
    conflicts_detected: u64,
    quota_exceeded: u64,
    average_sync_ms: Option<f64>,
    last_snapshot: Option<MetricsSnapshot>,
}

#[derive(Debug)]
pub(crate) struct EngineMetrics {
    started: Instant,
    smoothing: f64,
    counters: Mutex<Counters>,
}

impl EngineMetrics {
    pub(crate) fn new(started: Instant, smoothing: f64) -> Self {
        Self { started, smoothing, counters: Mutex::new(Counters::default()) }
    }

    pub(crate) fn record_event(&self, event: &EngineEvent) {
        let mut c = self.counters.lock();
        match event {
            EngineEvent::OperationQueued { .. } => c.operations_queued += 1,
            EngineEvent::OperationCompleted { .. } => c.operations_completed += 1,
            EngineEvent::OperationFailed { .. } => c.operations_failed += 1,
            EngineEvent::ConflictDetected(_) => c.conflicts_detected += 1,
            EngineEvent::StorageQuotaExceeded { .. } => c.quota_exceeded += 1,
            EngineEvent::SyncFailed { .. } => c.sync_failures += 1,
            EngineEvent::SyncCompleted(report) => {
                c.syncs_completed += 1;
                let sample = report.duration_ms as f64;
                c.average_sync_ms = Some(match c.average_sync_ms {
                    Some(current) => self.smoothing.mul_add(sample, (1.0 - self.smoothing) * current),
                    None => sample,
                });
            }
            _ => {}
        }
    }

    /// Start an outage; false if one is already open
    pub(crate) fn went_offline(&self, at: Instant) -> bool {
        let mut c = self.counters.lock();
        if c.offline_since.is_some() {
            return false;
        }
        c.offline_since = Some(at);
        true
    }

    /// Close the open outage and return its length
    pub(crate) fn came_online(&self, at: Instant) -> Option<Duration> {
        let mut c = self.counters.lock();
        let since = c.offline_since.take()?;
        let outage = at.saturating_duration_since(since);
        c.offline_total += outage;
        Some(outage)
    }

    pub(crate) fn snapshot(&self, now: Instant, captured_at: u64) -> MetricsSnapshot {
        let mut c = self.counters.lock();
        let open_outage =
            c.offline_since.map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
        let snapshot = MetricsSnapshot {
            captured_at,
            uptime_ms: millis(now.saturating_duration_since(self.started)),
            offline_ms: millis(c.offline_total + open_outage),
            syncs_completed: c.syncs_completed,
            sync_failures: c.sync_failures,
            operations_queued: c.operations_queued,
            operations_completed: c.operations_completed,
            operations_failed: c.operations_failed,
            conflicts_detected: c.conflicts_detected,
            quota_exceeded: c.quota_exceeded,
            average_sync_ms: c.average_sync_ms.unwrap_or(0.0),
        };
        c.last_snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Snapshot taken by the last metrics tick
    pub(crate) fn last_snapshot(&self) -> Option<MetricsSnapshot> {
        self.counters.lock().last_snapshot.clone()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
