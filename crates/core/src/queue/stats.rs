use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tidemark_domain::{Operation, OperationStatus};

/// Snapshot of queue health
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
    pub cancelled: usize,
    /// Age of the oldest pending or retrying operation
    pub oldest_pending_age_ms: Option<u64>,
    /// Mean time from enqueue to completion
    pub average_latency_ms: f64,
    pub total_processed: u64,
    pub total_retried: u64,
    pub total_failed: u64,
    pub is_paused: bool,
    pub is_draining: bool,
}

impl QueueStats {
    /// Operations that still need remote execution
    pub fn outstanding(&self) -> usize {
        self.pending + self.processing + self.retrying
    }
}

/// Lifetime counters, kept outside the operation map
#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    processed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_samples: AtomicU64,
}

impl QueueCounters {
    pub(crate) fn record_completion(&self, latency_ms: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn average_latency_ms(&self) -> f64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.latency_sum_ms.load(Ordering::Relaxed) as f64 / samples as f64
    }

    /// Build a snapshot from the current operations
    pub(crate) fn snapshot<'a>(
        &self,
        operations: impl Iterator<Item = &'a Operation>,
        now_ms: u64,
    ) -> QueueStats {
        let mut stats = QueueStats {
            average_latency_ms: self.average_latency_ms(),
            total_processed: self.processed.load(Ordering::Relaxed),
            total_retried: self.retried.load(Ordering::Relaxed),
            total_failed: self.failed.load(Ordering::Relaxed),
            ..QueueStats::default()
        };

        let mut oldest: Option<u64> = None;
        for op in operations {
            stats.total += 1;
            match op.status {
                OperationStatus::Pending => stats.pending += 1,
                OperationStatus::Processing => stats.processing += 1,
                OperationStatus::Completed => stats.completed += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Retrying => stats.retrying += 1,
                OperationStatus::Cancelled => stats.cancelled += 1,
            }
            if matches!(op.status, OperationStatus::Pending | OperationStatus::Retrying) {
                oldest = Some(oldest.map_or(op.timestamp, |t| t.min(op.timestamp)));
            }
        }
        stats.oldest_pending_age_ms = oldest.map(|t| now_ms.saturating_sub(t));
        stats
    }
}
