//! Priority-ordered prefetch queue with bounded concurrency

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use tidemark_domain::{CacheStrategy, Priority};

use super::Fallback;

/// How a prefetched value is fetched and stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchOptions {
    pub priority: Priority,
    pub ttl: Option<Duration>,
    pub strategy: Option<CacheStrategy>,
}

impl PrefetchOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

pub(crate) struct PrefetchJob {
    pub(crate) key: String,
    pub(crate) source: Fallback,
    pub(crate) options: PrefetchOptions,
    seq: u64,
}

impl PartialEq for PrefetchJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PrefetchJob {}

impl PartialOrd for PrefetchJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrefetchJob {
    /// Max-heap order: more urgent priority first, then first queued
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .options
            .priority
            .cmp(&self.options.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Jobs waiting to run plus the keys queued or in flight
#[derive(Default)]
pub(crate) struct PrefetchQueue {
    heap: BinaryHeap<PrefetchJob>,
    keys: HashSet<String>,
    active: usize,
    next_seq: u64,
}

impl PrefetchQueue {
    /// Returns false when the key is already queued or running
    pub(crate) fn push(&mut self, key: String, source: Fallback, options: PrefetchOptions) -> bool {
        if !self.keys.insert(key.clone()) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(PrefetchJob { key, source, options, seq });
        true
    }

    /// Next job if a worker slot is free
    pub(crate) fn start_next(&mut self, concurrency: usize) -> Option<PrefetchJob> {
        if self.active >= concurrency {
            return None;
        }
        let job = self.heap.pop()?;
        self.active += 1;
        Some(job)
    }

    pub(crate) fn finish(&mut self, key: &str) {
        self.keys.remove(key);
        self.active = self.active.saturating_sub(1);
    }

    pub(crate) fn queued(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn active(&self) -> usize {
        self.active
    }

    pub(crate) fn clear(&mut self) {
        for job in self.heap.drain() {
            self.keys.remove(&job.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::fallback;

    fn source() -> Fallback {
        fallback(|| async { Ok(json!(null)) })
    }

    fn push(queue: &mut PrefetchQueue, key: &str, priority: Priority) -> bool {
        queue.push(key.to_string(), source(), PrefetchOptions::default().with_priority(priority))
    }

    #[test]
    fn jobs_start_by_priority_then_fifo() {
        let mut queue = PrefetchQueue::default();
        push(&mut queue, "low", Priority::Low);
        push(&mut queue, "high-1", Priority::High);
        push(&mut queue, "high-2", Priority::High);

        let order: Vec<String> =
            std::iter::from_fn(|| queue.start_next(10)).map(|job| job.key).collect();
        assert_eq!(order, ["high-1", "high-2", "low"]);
    }

    #[test]
    fn concurrency_limit_holds_jobs_back() {
        let mut queue = PrefetchQueue::default();
        for key in ["a", "b", "c"] {
            push(&mut queue, key, Priority::Normal);
        }
        let first = queue.start_next(2).unwrap();
        assert!(queue.start_next(2).is_some());
        assert!(queue.start_next(2).is_none());
        assert_eq!(queue.active(), 2);

        queue.finish(&first.key);
        assert_eq!(queue.start_next(2).unwrap().key, "c");
    }

    #[test]
    fn duplicate_keys_are_ignored_until_finished() {
        let mut queue = PrefetchQueue::default();
        assert!(push(&mut queue, "a", Priority::Normal));
        assert!(!push(&mut queue, "a", Priority::High));

        let job = queue.start_next(1).unwrap();
        assert!(!push(&mut queue, "a", Priority::Normal));
        queue.finish(&job.key);
        assert!(push(&mut queue, "a", Priority::Normal));
        assert_eq!(queue.queued(), 1);
    }
}
