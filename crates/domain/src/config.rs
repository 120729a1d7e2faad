//! Engine configuration
//!
//! Every struct deserializes from partial input (`#[serde(default)]`), so a
//! TOML file only needs the keys it overrides. Durations are milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidemark_common::error::{CommonError, CommonResult};
use tidemark_common::{duration_millis, ExponentialBackoff};

use crate::constants::{DEFAULT_EVENT_HISTORY, DEFAULT_MAX_RETRIES, DEFAULT_TIMESTAMP_FIELD};
use crate::types::{CacheStrategy, ResolutionStrategy};

/// Operation queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Oldest pending operations are dropped beyond this size
    pub max_queue_size: usize,
    /// Period of the drain tick
    #[serde(with = "duration_millis")]
    pub drain_interval: Duration,
    /// Grace window before completed operations are removed
    #[serde(with = "duration_millis")]
    pub completed_retention: Duration,
    pub default_max_retries: u32,
    pub backoff: ExponentialBackoff,
    /// Start the periodic drain on initialize
    pub auto_drain: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            drain_interval: Duration::from_secs(5),
            completed_retention: Duration::from_secs(5),
            default_max_retries: DEFAULT_MAX_RETRIES,
            backoff: ExponentialBackoff::default(),
            auto_drain: true,
        }
    }
}

/// Cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Budget across all entries, in bytes
    pub max_size_bytes: u64,
    /// Eviction stops once usage is at or below this share of the budget
    pub eviction_target_ratio: f64,
    /// Entries kept in the in-memory layer
    pub memory_max_entries: usize,
    #[serde(with = "duration_millis")]
    pub default_ttl: Duration,
    pub default_strategy: CacheStrategy,
    #[serde(with = "duration_millis")]
    pub prune_interval: Duration,
    pub prefetch_concurrency: usize,
    pub warmup_batch_size: usize,
    /// Weight of the newest sample in the response-time average
    pub latency_smoothing: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 50 * 1024 * 1024,
            eviction_target_ratio: 0.8,
            memory_max_entries: 500,
            default_ttl: Duration::from_secs(60 * 60),
            default_strategy: CacheStrategy::CacheFirst,
            prune_interval: Duration::from_secs(5 * 60),
            prefetch_concurrency: 3,
            warmup_batch_size: 10,
            latency_smoothing: 0.1,
        }
    }
}

/// Sync coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub auto_sync: bool,
    #[serde(with = "duration_millis")]
    pub auto_sync_interval: Duration,
    /// Applied when a conflict is resolved without explicit data
    pub conflict_strategy: ResolutionStrategy,
    /// Payload field compared by timestamp-wins
    pub timestamp_field: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            auto_sync: true,
            auto_sync_interval: Duration::from_secs(30),
            conflict_strategy: ResolutionStrategy::ClientWins,
            timestamp_field: DEFAULT_TIMESTAMP_FIELD.to_string(),
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(with = "duration_millis")]
    pub probe_interval: Duration,
    #[serde(with = "duration_millis")]
    pub metrics_interval: Duration,
    pub event_history_size: usize,
    pub enable_background_channel: bool,
    /// Start a sync pass when connectivity returns
    pub sync_on_reconnect: bool,
    /// Persist the aggregate state under the settings key
    pub persist_state: bool,
    /// Weight of the newest sample in the sync-duration average
    pub latency_smoothing: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(30),
            event_history_size: DEFAULT_EVENT_HISTORY,
            enable_background_channel: true,
            sync_on_reconnect: true,
            persist_state: true,
            latency_smoothing: 0.2,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub orchestrator: OrchestratorConfig,
}

fn ratio(field: &str, value: f64) -> CommonResult<()> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(CommonError::config_field(field, format!("must be in (0, 1], got {value}")))
    }
}

fn non_zero(field: &str, value: usize) -> CommonResult<()> {
    if value == 0 {
        Err(CommonError::config_field(field, "must be at least 1"))
    } else {
        Ok(())
    }
}

impl EngineConfig {
    /// Reject settings that would break queue, cache or sync invariants
    pub fn validate(&self) -> CommonResult<()> {
        non_zero("queue.max_queue_size", self.queue.max_queue_size)?;
        self.queue.backoff.validate()?;

        if self.cache.max_size_bytes == 0 {
            return Err(CommonError::config_field("cache.max_size_bytes", "must be positive"));
        }
        ratio("cache.eviction_target_ratio", self.cache.eviction_target_ratio)?;
        ratio("cache.latency_smoothing", self.cache.latency_smoothing)?;
        non_zero("cache.memory_max_entries", self.cache.memory_max_entries)?;
        non_zero("cache.prefetch_concurrency", self.cache.prefetch_concurrency)?;
        non_zero("cache.warmup_batch_size", self.cache.warmup_batch_size)?;

        non_zero("sync.batch_size", self.sync.batch_size)?;
        if self.sync.timestamp_field.trim().is_empty() {
            return Err(CommonError::config_field("sync.timestamp_field", "must not be empty"));
        }

        non_zero("orchestrator.event_history_size", self.orchestrator.event_history_size)?;
        ratio("orchestrator.latency_smoothing", self.orchestrator.latency_smoothing)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.drain_interval, Duration::from_secs(5));
        assert_eq!(config.orchestrator.event_history_size, 100);
        assert_eq!(config.sync.timestamp_field, "updatedAt");
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [queue]
            max_queue_size = 50

            [queue.backoff]
            initial_delay = 250
            jitter = false

            [sync]
            batch_size = 4
            conflict_strategy = "timestamp-wins"
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.max_queue_size, 50);
        assert_eq!(config.queue.backoff.initial_delay, Duration::from_millis(250));
        assert!(!config.queue.backoff.jitter);
        assert_eq!(config.sync.batch_size, 4);
        assert_eq!(config.sync.conflict_strategy, ResolutionStrategy::TimestampWins);
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn validate_rejects_zero_batch_size() {
        let mut config = EngineConfig::default();
        config.sync.batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sync.batch_size"));
    }

    #[test]
    fn validate_rejects_out_of_range_ratio() {
        let mut config = EngineConfig::default();
        config.cache.eviction_target_ratio = 1.5;
        assert!(config.validate().is_err());
    }
}
