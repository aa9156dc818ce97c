#![forbid(unsafe_code)]

//! Logging initialisation for the Skiff services.
//!
//! Centralises tracing-subscriber setup behind a single entry point so every
//! binary and test harness configures output the same way: an `EnvFilter`
//! honouring `RUST_LOG`, with either pretty or JSON formatting.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter directive when `RUST_LOG` is not provided.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Output format for the installed subscriber.
#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    /// Structured JSON objects, one per line.
    Json,
    /// Human-readable output for local work.
    Pretty,
}

impl LogFormat {
    /// Choose a sensible default for the current build profile.
    #[must_use]
    pub const fn infer() -> Self {
        if cfg!(debug_assertions) {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig<'a> {
    /// Filter directive applied when `RUST_LOG` is unset.
    pub level: &'a str,
    /// Output format selection.
    pub format: LogFormat,
}

impl Default for LoggingConfig<'_> {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL,
            format: LogFormat::infer(),
        }
    }
}

/// Configure and install the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig<'_>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level))
        .context("failed to build log filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
            .context("failed to install JSON tracing subscriber")?,
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true))
            .try_init()
            .context("failed to install tracing subscriber")?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_info_level() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn init_twice_reports_error() {
        let config = LoggingConfig {
            level: "warn",
            format: LogFormat::Pretty,
        };
        // First call may or may not win depending on test ordering; the
        // second call must fail because a subscriber is installed.
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
