// Structured logging setup for hosts embedding the rate limiter
//
// The library only emits `tracing` events; installing a subscriber is the
// host's call. `init` builds the same fmt subscriber for every format, with
// RUST_LOG taking precedence over the configured level.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Build the env filter for a configured level
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let level: tracing::Level = config
        .level
        .to_lowercase()
        .parse()
        .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))?;

    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    Ok(filter_with_directives(level, &directives))
}

fn filter_with_directives(level: tracing::Level, directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(directives)
}

/// Install a global subscriber; fails if one is already installed
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match config.format.to_lowercase().as_str() {
        "json" => builder.json().try_init(),
        "pretty" => builder.pretty().try_init(),
        _ => builder.compact().try_init(),
    };

    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
