use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Snapshot of cache effectiveness and footprint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses), 0 when nothing was read
    pub hit_rate: f64,
    pub entries: usize,
    pub memory_entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub evictions: u64,
    pub prefetches: u64,
    pub prefetch_failures: u64,
    /// Exponentially smoothed read latency
    pub average_response_ms: f64,
}

/// Result of an expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub expired: usize,
    pub evicted: usize,
    pub remaining: usize,
    pub total_bytes: u64,
    /// Another prune was still running
    pub skipped: bool,
}

#[derive(Debug)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    prefetches: AtomicU64,
    prefetch_failures: AtomicU64,
    smoothing: f64,
    average_response_ms: Mutex<Option<f64>>,
}

impl CacheCounters {
    pub(crate) fn new(smoothing: f64) -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            prefetches: AtomicU64::new(0),
            prefetch_failures: AtomicU64::new(0),
            smoothing,
            average_response_ms: Mutex::new(None),
        }
    }

    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn prefetched(&self, ok: bool) {
        if ok {
            self.prefetches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.prefetch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_response(&self, sample_ms: f64) {
        let mut average = self.average_response_ms.lock();
        *average = Some(match *average {
            Some(current) => self.smoothing.mul_add(sample_ms, (1.0 - self.smoothing) * current),
            None => sample_ms,
        });
    }

    pub(crate) fn fill(&self, stats: &mut CacheStats) {
        stats.hits = self.hits.load(Ordering::Relaxed);
        stats.misses = self.misses.load(Ordering::Relaxed);
        let reads = stats.hits + stats.misses;
        stats.hit_rate = if reads == 0 { 0.0 } else { stats.hits as f64 / reads as f64 };
        stats.evictions = self.evictions.load(Ordering::Relaxed);
        stats.prefetches = self.prefetches.load(Ordering::Relaxed);
        stats.prefetch_failures = self.prefetch_failures.load(Ordering::Relaxed);
        stats.average_response_ms = self.average_response_ms.lock().unwrap_or(0.0);
    }
}
