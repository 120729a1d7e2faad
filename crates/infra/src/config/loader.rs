//! Configuration loader
//!
//! ## Loading Strategy
//! 1. Start from [`InfraConfig::default`]
//! 2. Merge a config file when one is found (TOML or JSON, by extension)
//! 3. Apply `TIDEMARK_*` environment overrides
//! 4. Validate the result
//!
//! A `.env` file in the working directory is loaded first, so overrides can
//! live there during development.
//!
//! ## File Locations
//! 1. The path given to [`ConfigLoader::with_file`]
//! 2. `$TIDEMARK_CONFIG`
//! 3. `./tidemark.toml`, `./tidemark.json`
//! 4. `./config/tidemark.toml`, `./config/tidemark.json`
//!
//! ## Environment Variables
//! - `TIDEMARK_DB_PATH`: database file (`:memory:` keeps the store in memory)
//! - `TIDEMARK_DB_POOL_SIZE`: connection pool size
//! - `TIDEMARK_PROBE_URL`: connectivity probe endpoint
//! - `TIDEMARK_PROBE_TIMEOUT_MS`: probe timeout
//! - `TIDEMARK_LOG_LEVEL`: default tracing filter
//! - `TIDEMARK_LOG_FORMAT`: `pretty` or `json`
//! - `TIDEMARK_MAX_QUEUE_SIZE`: operation queue bound
//! - `TIDEMARK_CACHE_MAX_BYTES`: cache budget
//! - `TIDEMARK_SYNC_BATCH_SIZE`: operations per sync batch
//! - `TIDEMARK_AUTO_SYNC`: periodic sync on/off
//! - `TIDEMARK_AUTO_SYNC_INTERVAL_MS`: periodic sync period
//! - `TIDEMARK_SYNC_ON_RECONNECT`: sync when connectivity returns

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tidemark_common::error::{CommonError, CommonResult};
use tracing::{debug, info};

use super::{InfraConfig, LogFormat};

const CONFIG_PATH_VAR: &str = "TIDEMARK_CONFIG";

/// Builder-style loader; see the module docs for precedence
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    dotenv: bool,
    probe: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self { file: None, dotenv: true, probe: true }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read this file instead of searching; it must exist
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Skip loading `.env`
    #[must_use]
    pub fn without_dotenv(mut self) -> Self {
        self.dotenv = false;
        self
    }

    /// Skip the standard file locations
    #[must_use]
    pub fn without_probing(mut self) -> Self {
        self.probe = false;
        self
    }

    /// # Errors
    /// Returns a config error when a named file is missing or malformed, an
    /// environment override does not parse, or validation fails.
    pub fn load(&self) -> CommonResult<InfraConfig> {
        if self.dotenv {
            match dotenvy::dotenv() {
                Ok(path) => debug!(path = %path.display(), "loaded .env"),
                Err(e) if e.not_found() => {}
                Err(e) => return Err(CommonError::config(format!("invalid .env file: {e}"))),
            }
        }

        let mut config = match self.resolve_path()? {
            Some(path) => load_from_file(&path)?,
            None => {
                debug!("no config file found, using defaults");
                InfraConfig::default()
            }
        };

        apply_env_overrides(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_path(&self) -> CommonResult<Option<PathBuf>> {
        if let Some(path) = &self.file {
            return existing(path.clone()).map(Some);
        }
        if let Some(path) = env_var(CONFIG_PATH_VAR) {
            return existing(PathBuf::from(path)).map(Some);
        }
        Ok(if self.probe { probe_config_paths() } else { None })
    }
}

/// Load with the default loader
///
/// # Errors
/// See [`ConfigLoader::load`].
pub fn load() -> CommonResult<InfraConfig> {
    ConfigLoader::new().load()
}

/// Read and parse a config file without env overrides or validation
///
/// # Errors
/// Returns a config error if the file cannot be read or parsed.
pub fn load_from_file(path: &Path) -> CommonResult<InfraConfig> {
    info!(path = %path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(path).map_err(|e| {
        CommonError::config(format!("failed to read config file {}: {e}", path.display()))
    })?;
    parse_config(&contents, path)
}

/// Parse by file extension; files without one are treated as TOML
///
/// # Errors
/// Returns a config error for malformed content or unknown extensions.
pub fn parse_config(contents: &str, path: &Path) -> CommonResult<InfraConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| CommonError::config(format!("invalid TOML in {}: {e}", path.display()))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| CommonError::config(format!("invalid JSON in {}: {e}", path.display()))),
        other => Err(CommonError::config(format!("unsupported config format: {other}"))),
    }
}

/// First config file found in the working directory, if any
pub fn probe_config_paths() -> Option<PathBuf> {
    std::env::current_dir().ok().and_then(|cwd| probe_config_paths_in(&cwd))
}

fn probe_config_paths_in(base: &Path) -> Option<PathBuf> {
    [
        base.join("tidemark.toml"),
        base.join("tidemark.json"),
        base.join("config").join("tidemark.toml"),
        base.join("config").join("tidemark.json"),
    ]
    .into_iter()
    .find(|path| path.is_file())
}

fn existing(path: PathBuf) -> CommonResult<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(CommonError::config(format!("config file not found: {}", path.display())))
    }
}

fn apply_env_overrides(config: &mut InfraConfig) -> CommonResult<()> {
    if let Some(path) = env_var("TIDEMARK_DB_PATH") {
        config.storage.path = (path != ":memory:").then(|| PathBuf::from(path));
    }
    if let Some(size) = env_parse("TIDEMARK_DB_POOL_SIZE")? {
        config.storage.pool_size = size;
    }
    if let Some(url) = env_var("TIDEMARK_PROBE_URL") {
        config.probe.url = Some(url);
    }
    if let Some(ms) = env_parse("TIDEMARK_PROBE_TIMEOUT_MS")? {
        config.probe.timeout = Duration::from_millis(ms);
    }
    if let Some(level) = env_var("TIDEMARK_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(format) = env_var("TIDEMARK_LOG_FORMAT") {
        config.logging.format = match format.to_ascii_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            other => {
                return Err(CommonError::config_field(
                    "TIDEMARK_LOG_FORMAT",
                    format!("expected 'pretty' or 'json', got '{other}'"),
                ))
            }
        };
    }

    let engine = &mut config.engine;
    if let Some(size) = env_parse("TIDEMARK_MAX_QUEUE_SIZE")? {
        engine.queue.max_queue_size = size;
    }
    if let Some(bytes) = env_parse("TIDEMARK_CACHE_MAX_BYTES")? {
        engine.cache.max_size_bytes = bytes;
    }
    if let Some(size) = env_parse("TIDEMARK_SYNC_BATCH_SIZE")? {
        engine.sync.batch_size = size;
    }
    engine.sync.auto_sync = env_bool("TIDEMARK_AUTO_SYNC", engine.sync.auto_sync);
    if let Some(ms) = env_parse("TIDEMARK_AUTO_SYNC_INTERVAL_MS")? {
        engine.sync.auto_sync_interval = Duration::from_millis(ms);
    }
    engine.orchestrator.sync_on_reconnect =
        env_bool("TIDEMARK_SYNC_ON_RECONNECT", engine.orchestrator.sync_on_reconnect);
    Ok(())
}

/// Non-empty environment variable
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T>(key: &str) -> CommonResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| CommonError::config_field(key, format!("invalid value '{raw}': {e}")))
        })
        .transpose()
}

/// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn env_bool(key: &str, default: bool) -> bool {
    env_var(key)
        .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}
