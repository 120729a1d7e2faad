//! Tracing subscriber setup

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};
use crate::errors::{InfraError, InfraResult};

/// Install the global subscriber
///
/// `RUST_LOG` wins over `config.level` when set. Returns `Ok(false)` when a
/// global subscriber is already installed, so calling this twice is harmless.
///
/// # Errors
/// Returns [`InfraError::Logging`] if the filter directives do not parse.
pub fn init_tracing(config: &LoggingConfig) -> InfraResult<bool> {
    let filter = build_filter(&config.level)?;
    let registry = Registry::default().with(filter);

    let installed = match config.format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init(),
    };
    Ok(installed.is_ok())
}

fn build_filter(default_directives: &str) -> InfraResult<EnvFilter> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default_directives.to_string());
    EnvFilter::try_new(&directives).map_err(|e| InfraError::Logging(format!("'{directives}': {e}")))
}
