//! Policy-driven cache over the durable `cache` collection
//!
//! Every entry is durable. A bounded in-memory layer holds recently used
//! entries, and a size index covering all durable entries drives LRU
//! eviction without reading them back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tidemark_common::compression;
use tidemark_common::time::{once, repeating};
use tidemark_common::TaskHandle;
use tidemark_domain::{CacheConfig, CacheEntry, CacheStrategy, CachedValue, EngineEvent};
use tracing::{debug, info, instrument, warn};

use super::errors::{CacheError, CacheResult};
use super::prefetch::{PrefetchJob, PrefetchOptions, PrefetchQueue};
use super::stats::{CacheCounters, CacheStats, PruneReport};
use super::{Fallback, GetOptions, SetOptions};
use crate::context::EngineContext;
use crate::guard::FlagGuard;
use crate::ports::{Collection, StorageAdapter, StorageError};
use crate::storage::{get_record, load_records, put_record};

/// What the size index knows about a durable entry
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    size: u64,
    recency: (u64, u64),
    expires_at: u64,
    strategy: CacheStrategy,
    compressed: bool,
}

impl From<&CacheEntry> for IndexEntry {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            size: entry.size_bytes,
            recency: entry.recency(),
            expires_at: entry.expires_at,
            strategy: entry.strategy,
            compressed: entry.is_compressed(),
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    memory: HashMap<String, CacheEntry>,
    index: HashMap<String, IndexEntry>,
    total_bytes: u64,
}

impl CacheState {
    fn upsert_index(&mut self, entry: &CacheEntry) {
        if let Some(old) = self.index.insert(entry.key.clone(), IndexEntry::from(entry)) {
            self.total_bytes = self.total_bytes.saturating_sub(old.size);
        }
        self.total_bytes += entry.size_bytes;
    }

    fn forget(&mut self, key: &str) -> bool {
        self.memory.remove(key);
        match self.index.remove(key) {
            Some(old) => {
                self.total_bytes = self.total_bytes.saturating_sub(old.size);
                true
            }
            None => false,
        }
    }

    /// Keep `entry` in memory, demoting the coldest entries past `limit`
    fn remember(&mut self, entry: CacheEntry, limit: usize) {
        self.memory.insert(entry.key.clone(), entry);
        while self.memory.len() > limit {
            let Some(coldest) =
                self.memory.values().min_by_key(|e| e.recency()).map(|e| e.key.clone())
            else {
                break;
            };
            self.memory.remove(&coldest);
        }
    }

    /// Record a hit on an in-memory entry
    fn touch(&mut self, key: &str, now: u64, sequence: u64) -> Option<CacheEntry> {
        let entry = self.memory.get_mut(key)?;
        entry.hit_count += 1;
        entry.last_accessed_at = now;
        entry.access_sequence = sequence;
        let touched = entry.clone();
        if let Some(indexed) = self.index.get_mut(key) {
            indexed.recency = touched.recency();
        }
        Some(touched)
    }

    /// Least recently accessed keys to drop until usage is at or below
    /// `target`, never choosing `protect`
    fn victims(&self, protect: Option<&str>, target: u64) -> Vec<String> {
        let mut candidates: Vec<(&String, &IndexEntry)> =
            self.index.iter().filter(|(key, _)| Some(key.as_str()) != protect).collect();
        candidates.sort_by_key(|(_, entry)| entry.recency);

        let mut remaining = self.total_bytes;
        let mut victims = Vec::new();
        for (key, entry) in candidates {
            if remaining <= target {
                break;
            }
            remaining = remaining.saturating_sub(entry.size);
            victims.push(key.clone());
        }
        victims
    }
}

enum MemoryLookup {
    Hit(CacheEntry),
    Expired,
    Miss,
}

struct CacheInner {
    config: CacheConfig,
    ctx: EngineContext,
    storage: Arc<dyn StorageAdapter>,
    state: Mutex<CacheState>,
    access_sequence: AtomicU64,
    counters: CacheCounters,
    prefetch: Mutex<PrefetchQueue>,
    pruning: AtomicBool,
    initialized: AtomicBool,
    shut_down: AtomicBool,
    prune_task: Mutex<Option<TaskHandle>>,
}

/// Handle to the offline cache; clones share state
#[derive(Clone)]
pub struct OfflineCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for OfflineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineCache")
            .field("entries", &self.len())
            .field("total_bytes", &self.total_bytes())
            .finish_non_exhaustive()
    }
}

impl OfflineCache {
    pub fn new(config: CacheConfig, ctx: EngineContext, storage: Arc<dyn StorageAdapter>) -> Self {
        let counters = CacheCounters::new(config.latency_smoothing);
        Self {
            inner: Arc::new(CacheInner {
                config,
                ctx,
                storage,
                state: Mutex::new(CacheState::default()),
                access_sequence: AtomicU64::new(0),
                counters,
                prefetch: Mutex::new(PrefetchQueue::default()),
                pruning: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                prune_task: Mutex::new(None),
            }),
        }
    }

    fn upgrade(weak: &Weak<CacheInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Build the size index from storage and start the prune timer.
    /// Later calls are no-ops.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> CacheResult<()> {
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.rebuild_index().await {
            Ok(expired) => info!(
                entries = self.len(),
                total_bytes = self.total_bytes(),
                expired,
                "cache initialized"
            ),
            Err(e) => {
                self.inner.initialized.store(false, Ordering::Release);
                return Err(e);
            }
        }
        if !self.inner.config.prune_interval.is_zero() {
            self.start_prune_loop();
        }
        Ok(())
    }

    /// Drop the memory layer and re-index storage, e.g. after a restore
    #[instrument(skip(self))]
    pub async fn reload(&self) -> CacheResult<usize> {
        self.ensure_running()?;
        self.rebuild_index().await?;
        Ok(self.len())
    }

    async fn rebuild_index(&self) -> CacheResult<usize> {
        let entries: Vec<CacheEntry> =
            load_records(self.inner.storage.as_ref(), Collection::Cache).await?;
        let now = self.inner.ctx.now_ms();

        let mut state = CacheState::default();
        let mut expired = Vec::new();
        let mut max_sequence = 0;
        for entry in entries {
            if entry.is_expired(now) {
                expired.push(entry.key);
                continue;
            }
            max_sequence = max_sequence.max(entry.access_sequence + 1);
            state.upsert_index(&entry);
        }
        *self.inner.state.lock() = state;
        self.inner.access_sequence.fetch_max(max_sequence, Ordering::AcqRel);

        for key in &expired {
            self.inner.storage.remove(Collection::Cache, key).await?;
        }
        self.enforce_budget(None).await;
        Ok(expired.len())
    }

    pub fn start_prune_loop(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = self.inner.ctx.scheduler.schedule_repeating(
            "cache.prune",
            self.inner.config.prune_interval,
            repeating(move || {
                let weak = weak.clone();
                async move {
                    let Some(cache) = OfflineCache::upgrade(&weak) else {
                        return;
                    };
                    if let Err(e) = cache.prune().await {
                        warn!(error = %e, "cache prune failed");
                    }
                }
            }),
        );
        if let Some(previous) = self.inner.prune_task.lock().replace(handle) {
            previous.cancel();
        }
    }

    /// Stop the prune timer and drop queued prefetches. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.inner.prune_task.lock().take() {
            handle.cancel();
        }
        self.inner.prefetch.lock().clear();
        info!("cache shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> CacheResult<()> {
        if self.is_shut_down() {
            Err(CacheError::ShutDown)
        } else {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Store `value` under `key`, evicting least recently used entries when
    /// the size budget is exceeded
    #[instrument(skip(self, value, options), fields(key = %key))]
    pub async fn set(&self, key: &str, value: Value, options: SetOptions) -> CacheResult<()> {
        self.ensure_running()?;

        let config = &self.inner.config;
        let now = self.inner.ctx.now_ms();
        let ttl = options.ttl.unwrap_or(config.default_ttl);
        let (cached, size_bytes) = encode(&value, options.compress)?;

        if size_bytes > config.max_size_bytes {
            return Err(CacheError::QuotaExceeded {
                key: key.to_string(),
                size: size_bytes,
                max: config.max_size_bytes,
            });
        }

        let entry = CacheEntry {
            key: key.to_string(),
            value: cached,
            created_at: now,
            expires_at: now.saturating_add(millis(ttl)),
            strategy: options.strategy.unwrap_or(config.default_strategy),
            hit_count: 0,
            last_accessed_at: now,
            access_sequence: self.next_access(),
            size_bytes,
            metadata: options.metadata,
        };
        put_record(self.inner.storage.as_ref(), Collection::Cache, key, &entry).await?;

        {
            let mut state = self.inner.state.lock();
            state.upsert_index(&entry);
            state.remember(entry, config.memory_max_entries);
        }
        self.enforce_budget(Some(key)).await;

        debug!(size_bytes, ttl_ms = millis(ttl), compressed = options.compress, "cache entry stored");
        Ok(())
    }

    /// Delete one entry; returns whether it existed
    pub async fn remove(&self, key: &str) -> CacheResult<bool> {
        let indexed = self.inner.state.lock().forget(key);
        let stored = self.inner.storage.remove(Collection::Cache, key).await?;
        Ok(indexed || stored)
    }

    /// Delete every entry and queued prefetch
    #[instrument(skip(self))]
    pub async fn clear(&self) -> CacheResult<usize> {
        let removed = std::mem::take(&mut *self.inner.state.lock()).index.len();
        self.inner.prefetch.lock().clear();
        self.inner.storage.clear(Collection::Cache).await?;
        info!(removed, "cache cleared");
        Ok(removed)
    }

    /// Evict down to the target ratio when over budget; returns the number
    /// of evicted entries
    async fn enforce_budget(&self, protect: Option<&str>) -> usize {
        let max = self.inner.config.max_size_bytes;
        let (victims, used_bytes) = {
            let mut state = self.inner.state.lock();
            if state.total_bytes <= max {
                return 0;
            }
            let used = state.total_bytes;
            let target = (max as f64 * self.inner.config.eviction_target_ratio) as u64;
            let victims = state.victims(protect, target);
            for key in &victims {
                state.forget(key);
            }
            (victims, used)
        };

        for key in &victims {
            if let Err(e) = self.inner.storage.remove(Collection::Cache, key).await {
                warn!(key = %key, error = %e, "failed to delete evicted entry");
            }
        }

        let evicted = victims.len();
        self.inner.counters.evicted(evicted);
        warn!(evicted, used_bytes, max_bytes = max, "cache over budget, evicted least recently used");
        self.inner.ctx.events.emit(EngineEvent::StorageQuotaExceeded {
            used_bytes,
            max_bytes: max,
            evicted,
        });
        evicted
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read `key` according to the requested (or stored, or default)
    /// strategy
    #[instrument(skip(self, options), fields(key = %key))]
    pub async fn get(&self, key: &str, options: GetOptions) -> CacheResult<Option<Value>> {
        self.ensure_running()?;
        let started = self.inner.ctx.clock.now();
        let result = self.read(key, &options).await;
        let elapsed = self.inner.ctx.clock.now().saturating_duration_since(started);
        self.inner.counters.record_response(elapsed.as_secs_f64() * 1_000.0);
        result
    }

    async fn read(&self, key: &str, options: &GetOptions) -> CacheResult<Option<Value>> {
        let strategy = options
            .strategy
            .or_else(|| self.inner.state.lock().index.get(key).map(|e| e.strategy))
            .unwrap_or(self.inner.config.default_strategy);

        match strategy {
            CacheStrategy::CacheOnly => self.lookup(key).await,
            CacheStrategy::CacheFirst | CacheStrategy::StaleWhileRevalidate => {
                if let Some(value) = self.lookup(key).await? {
                    let refresh =
                        strategy == CacheStrategy::StaleWhileRevalidate || options.revalidate;
                    if let (true, Some(source)) = (refresh, &options.fallback) {
                        self.schedule_refresh(key, Arc::clone(source), options, strategy);
                    }
                    return Ok(Some(value));
                }
                match &options.fallback {
                    Some(source) => {
                        let value = self.fetch(key, source).await?;
                        self.store_fetched(key, &value, options, strategy).await;
                        Ok(Some(value))
                    }
                    None => Ok(None),
                }
            }
            CacheStrategy::NetworkFirst => {
                let Some(source) = &options.fallback else {
                    return self.lookup(key).await;
                };
                match self.fetch(key, source).await {
                    Ok(value) => {
                        self.store_fetched(key, &value, options, strategy).await;
                        Ok(Some(value))
                    }
                    Err(fetch_error) => match self.lookup(key).await? {
                        Some(value) => {
                            debug!(error = %fetch_error, "network read failed, serving cached value");
                            Ok(Some(value))
                        }
                        None => Err(fetch_error),
                    },
                }
            }
            CacheStrategy::NetworkOnly => {
                let Some(source) = &options.fallback else {
                    return Err(CacheError::MissingFallback(key.to_string()));
                };
                self.fetch(key, source).await.map(Some)
            }
        }
    }

    /// Memory, then storage; expired entries are deleted and miss
    async fn lookup(&self, key: &str) -> CacheResult<Option<Value>> {
        let now = self.inner.ctx.now_ms();
        let sequence = self.next_access();

        let in_memory = {
            let mut state = self.inner.state.lock();
            match state.memory.get(key).map(|entry| entry.is_expired(now)) {
                Some(true) => MemoryLookup::Expired,
                Some(false) => state.touch(key, now, sequence).map_or(MemoryLookup::Miss, MemoryLookup::Hit),
                None => MemoryLookup::Miss,
            }
        };

        match in_memory {
            MemoryLookup::Hit(entry) => return self.serve_hit(entry).await.map(Some),
            MemoryLookup::Expired => {
                self.expire(key).await;
                self.inner.counters.miss();
                return Ok(None);
            }
            MemoryLookup::Miss => {}
        }

        let stored: Option<CacheEntry> =
            match get_record(self.inner.storage.as_ref(), Collection::Cache, key).await {
                Ok(stored) => stored,
                Err(StorageError::Corrupt { message, .. }) => {
                    warn!(key = %key, error = %message, "dropping undecodable cache entry");
                    self.expire(key).await;
                    None
                }
                Err(e) => return Err(e.into()),
            };

        let Some(mut entry) = stored else {
            self.inner.counters.miss();
            return Ok(None);
        };
        if entry.is_expired(now) {
            self.expire(key).await;
            self.inner.counters.miss();
            return Ok(None);
        }

        entry.hit_count += 1;
        entry.last_accessed_at = now;
        entry.access_sequence = sequence;
        {
            let mut state = self.inner.state.lock();
            state.upsert_index(&entry);
            state.remember(entry.clone(), self.inner.config.memory_max_entries);
        }
        self.serve_hit(entry).await.map(Some)
    }

    async fn serve_hit(&self, entry: CacheEntry) -> CacheResult<Value> {
        self.inner.counters.hit();
        if let Err(e) =
            put_record(self.inner.storage.as_ref(), Collection::Cache, &entry.key, &entry).await
        {
            warn!(key = %entry.key, error = %e, "failed to persist cache access");
        }
        decode(&entry)
    }

    async fn expire(&self, key: &str) {
        self.inner.state.lock().forget(key);
        if let Err(e) = self.inner.storage.remove(Collection::Cache, key).await {
            warn!(key = %key, error = %e, "failed to delete expired entry");
        }
        debug!(key = %key, "cache entry expired");
    }

    async fn fetch(&self, key: &str, source: &Fallback) -> CacheResult<Value> {
        source()
            .await
            .map_err(|e| CacheError::Fetch { key: key.to_string(), message: format!("{e:#}") })
    }

    async fn store_fetched(
        &self,
        key: &str,
        value: &Value,
        options: &GetOptions,
        strategy: CacheStrategy,
    ) {
        if strategy == CacheStrategy::NetworkOnly {
            return;
        }
        let set_options = SetOptions {
            strategy: Some(strategy),
            ttl: options.ttl,
            compress: options.compress,
            ..SetOptions::default()
        };
        if let Err(e) = self.set(key, value.clone(), set_options).await {
            warn!(key = %key, error = %e, "could not cache fetched value");
        }
    }

    /// Fetch a fresh value in the background; the caller already has its
    /// (possibly stale) answer
    fn schedule_refresh(
        &self,
        key: &str,
        source: Fallback,
        options: &GetOptions,
        strategy: CacheStrategy,
    ) {
        let compress = options.compress
            || self.inner.state.lock().index.get(key).is_some_and(|entry| entry.compressed);
        let set_options = SetOptions {
            strategy: Some(strategy),
            ttl: options.ttl,
            compress,
            ..SetOptions::default()
        };
        let weak = Arc::downgrade(&self.inner);
        let key = key.to_string();
        self.inner.ctx.scheduler.schedule_once(
            "cache.refresh",
            Duration::ZERO,
            once(move || async move {
                let Some(cache) = OfflineCache::upgrade(&weak) else {
                    return;
                };
                match source().await {
                    Ok(value) => {
                        if let Err(e) = cache.set(&key, value, set_options).await {
                            warn!(key = %key, error = %e, "background refresh could not store");
                        } else {
                            debug!(key = %key, "cache entry revalidated");
                        }
                    }
                    Err(e) => warn!(key = %key, error = %e, "background refresh failed"),
                }
            }),
        );
    }

    // -----------------------------------------------------------------------
    // Prefetch, prune, warmup
    // -----------------------------------------------------------------------

    /// Queue a best-effort background fetch of `key`
    ///
    /// Returns false when the key is already live, queued or in flight.
    #[instrument(skip(self, source, options), fields(key = %key))]
    pub fn prefetch(
        &self,
        key: &str,
        source: Fallback,
        options: PrefetchOptions,
    ) -> CacheResult<bool> {
        self.ensure_running()?;
        if self.contains(key) {
            debug!("already cached, prefetch skipped");
            return Ok(false);
        }
        let queued = self.inner.prefetch.lock().push(key.to_string(), source, options);
        if queued {
            self.pump_prefetch();
        }
        Ok(queued)
    }

    /// Start queued prefetches while worker slots are free
    fn pump_prefetch(&self) {
        loop {
            let job = self.inner.prefetch.lock().start_next(self.inner.config.prefetch_concurrency);
            let Some(job) = job else {
                break;
            };
            let weak = Arc::downgrade(&self.inner);
            self.inner.ctx.scheduler.schedule_once(
                "cache.prefetch",
                Duration::ZERO,
                once(move || async move {
                    if let Some(cache) = OfflineCache::upgrade(&weak) {
                        cache.run_prefetch(job).await;
                    }
                }),
            );
        }
    }

    async fn run_prefetch(&self, job: PrefetchJob) {
        let PrefetchJob { key, source, options, .. } = job;

        let stored = if self.is_shut_down() {
            false
        } else {
            match source().await {
                Ok(value) => {
                    let set_options = SetOptions {
                        strategy: options.strategy,
                        ttl: options.ttl,
                        ..SetOptions::default()
                    };
                    match self.set(&key, value, set_options).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(key = %key, error = %e, "prefetched value not stored");
                            false
                        }
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "prefetch failed");
                    false
                }
            }
        };

        self.inner.counters.prefetched(stored);
        self.inner.prefetch.lock().finish(&key);
        if !self.is_shut_down() {
            self.pump_prefetch();
        }
    }

    /// Remove expired entries and re-enforce the size budget
    #[instrument(skip(self))]
    pub async fn prune(&self) -> CacheResult<PruneReport> {
        self.ensure_running()?;
        let Some(_guard) = FlagGuard::try_acquire(&self.inner.pruning) else {
            return Ok(PruneReport { skipped: true, ..PruneReport::default() });
        };

        let now = self.inner.ctx.now_ms();
        let expired: Vec<String> = {
            let mut state = self.inner.state.lock();
            let expired: Vec<String> = state
                .index
                .iter()
                .filter(|(_, entry)| now > entry.expires_at)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                state.forget(key);
            }
            expired
        };
        for key in &expired {
            if let Err(e) = self.inner.storage.remove(Collection::Cache, key).await {
                warn!(key = %key, error = %e, "failed to delete expired entry");
            }
        }

        let evicted = self.enforce_budget(None).await;
        let (remaining, total_bytes) = {
            let state = self.inner.state.lock();
            (state.index.len(), state.total_bytes)
        };
        if !expired.is_empty() || evicted > 0 {
            info!(expired = expired.len(), evicted, remaining, "cache pruned");
        }
        Ok(PruneReport { expired: expired.len(), evicted, remaining, total_bytes, skipped: false })
    }

    /// Load `keys` from storage into the memory layer, a batch at a time
    #[instrument(skip(self, keys), fields(requested = keys.len()))]
    pub async fn warmup(&self, keys: &[String]) -> CacheResult<usize> {
        self.ensure_running()?;
        let now = self.inner.ctx.now_ms();
        let storage = self.inner.storage.as_ref();
        let mut loaded = 0;

        for batch in keys.chunks(self.inner.config.warmup_batch_size.max(1)) {
            let results = join_all(
                batch.iter().map(|key| get_record::<CacheEntry>(storage, Collection::Cache, key)),
            )
            .await;

            let mut state = self.inner.state.lock();
            for (key, result) in batch.iter().zip(results) {
                match result {
                    Ok(Some(entry)) if !entry.is_expired(now) => {
                        state.upsert_index(&entry);
                        state.remember(entry, self.inner.config.memory_max_entries);
                        loaded += 1;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(key = %key, error = %e, "warmup could not load entry"),
                }
            }
        }
        info!(loaded, "cache warmup finished");
        Ok(loaded)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Whether a live (unexpired) entry exists
    pub fn contains(&self, key: &str) -> bool {
        let now = self.inner.ctx.now_ms();
        self.inner.state.lock().index.get(key).is_some_and(|entry| now <= entry.expires_at)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().index.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.state.lock().total_bytes
    }

    /// Prefetch jobs queued or in flight
    pub fn pending_prefetches(&self) -> usize {
        let prefetch = self.inner.prefetch.lock();
        prefetch.queued() + prefetch.active()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = {
            let state = self.inner.state.lock();
            CacheStats {
                entries: state.index.len(),
                memory_entries: state.memory.len(),
                total_bytes: state.total_bytes,
                max_bytes: self.inner.config.max_size_bytes,
                ..CacheStats::default()
            }
        };
        self.inner.counters.fill(&mut stats);
        stats
    }

    fn next_access(&self) -> u64 {
        self.inner.access_sequence.fetch_add(1, Ordering::AcqRel)
    }
}

/// Encoded value and the bytes it counts against the budget
fn encode(value: &Value, compress: bool) -> CacheResult<(CachedValue, u64)> {
    let bytes = serde_json::to_vec(value)?;
    if compress {
        let text = compression::compress_to_text(&bytes)?;
        let size = text.len() as u64;
        Ok((CachedValue::Gzip(text), size))
    } else {
        Ok((CachedValue::Plain(value.clone()), bytes.len() as u64))
    }
}

fn decode(entry: &CacheEntry) -> CacheResult<Value> {
    match &entry.value {
        CachedValue::Plain(value) => Ok(value.clone()),
        CachedValue::Gzip(text) => {
            let decode_error =
                |message: String| CacheError::Decode { key: entry.key.clone(), message };
            let bytes = compression::decompress_text(text).map_err(|e| decode_error(e.to_string()))?;
            serde_json::from_slice(&bytes).map_err(|e| decode_error(e.to_string()))
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
