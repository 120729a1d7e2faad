//! Host-level configuration
//!
//! [`InfraConfig`] wraps the engine settings with the adapter settings the
//! composition root needs (database file, probe endpoint, logging). Every
//! section deserializes from partial input, so a file only lists overrides.

pub mod loader;

use std::path::PathBuf;
use std::time::Duration;

pub use loader::{load, load_from_file, parse_config, probe_config_paths, ConfigLoader};
use serde::{Deserialize, Serialize};
use tidemark_common::duration_millis;
use tidemark_common::error::{CommonError, CommonResult};
use tidemark_domain::EngineConfig;

/// Durable store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file; `None` keeps everything in memory
    pub path: Option<PathBuf>,
    pub pool_size: u32,
    #[serde(with = "duration_millis")]
    pub connection_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub busy_timeout: Duration,
    pub enable_wal: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            pool_size: 4,
            connection_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
            enable_wal: true,
        }
    }
}

/// Reachability probe settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Endpoint hit by the probe; without one connectivity is host-driven
    pub url: Option<String>,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Latency below this is excellent
    #[serde(with = "duration_millis")]
    pub excellent_below: Duration,
    /// Latency below this is good, anything slower is poor
    #[serde(with = "duration_millis")]
    pub good_below: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(5),
            excellent_below: Duration::from_millis(150),
            good_below: Duration::from_millis(600),
        }
    }
}

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

/// Complete host configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraConfig {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub probe: ProbeConfig,
    pub logging: LoggingConfig,
}

impl InfraConfig {
    pub fn validate(&self) -> CommonResult<()> {
        self.engine.validate()?;

        if self.storage.pool_size == 0 {
            return Err(CommonError::config_field("storage.pool_size", "must be at least 1"));
        }
        if self.probe.timeout.is_zero() {
            return Err(CommonError::config_field("probe.timeout", "must be positive"));
        }
        if self.probe.excellent_below > self.probe.good_below {
            return Err(CommonError::config_field(
                "probe.excellent_below",
                "must not exceed probe.good_below",
            ));
        }
        if let Some(url) = &self.probe.url {
            if reqwest::Url::parse(url).is_err() {
                return Err(CommonError::config_field("probe.url", format!("invalid URL '{url}'")));
            }
        }
        if self.logging.level.trim().is_empty() {
            return Err(CommonError::config_field("logging.level", "must not be empty"));
        }
        Ok(())
    }
}
