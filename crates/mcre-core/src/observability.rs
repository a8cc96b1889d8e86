//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use crate::{McreError, Result};
use tracing_subscriber::EnvFilter;

/// Build the filter from `RUST_LOG` when set, else from the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| McreError::ConfigError(format!("Invalid log filter: {}", e)))
}

/// Install the global `fmt` subscriber described by `config`.
///
/// Fails if the filter is invalid or a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match (config.json_output, config.include_timestamps) {
        (true, true) => builder.json().try_init(),
        (true, false) => builder.json().without_time().try_init(),
        (false, true) => builder.try_init(),
        (false, false) => builder.without_time().try_init(),
    };
    installed.map_err(|e| McreError::ConfigError(format!("Tracing already initialised: {}", e)))
}
