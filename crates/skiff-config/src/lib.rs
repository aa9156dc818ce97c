#![forbid(unsafe_code)]

//! Environment-driven configuration for the Skiff services.
//!
//! Every recognised variable has a development default except `DATABASE_URL`
//! (always required) and `JWT_SECRET`, which becomes mandatory when
//! `ENVIRONMENT=production`.

pub mod error;

use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigError, Result};

/// Default HTTP listen port.
pub const DEFAULT_PORT: u16 = 8080;
/// Default swarm listen port handed to the torrent engine.
pub const DEFAULT_TORRENT_PORT: u16 = 6881;
/// Default staging directory for downloaded payloads.
pub const DEFAULT_DOWNLOAD_DIR: &str = "./downloads";
/// Access token lifetime in minutes when `JWT_ACCESS_EXPIRY` is unset.
pub const DEFAULT_ACCESS_EXPIRY_MINUTES: i64 = 15;
/// Refresh token lifetime in days when `JWT_REFRESH_EXPIRY` is unset.
pub const DEFAULT_REFRESH_EXPIRY_DAYS: i64 = 7;
/// Development-only signing secret used outside production.
const DEV_JWT_SECRET: &str = "skiff-dev-secret-do-not-use-in-production";

/// Deployment environment, selected by the `ENVIRONMENT` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Relaxed defaults for local work.
    #[default]
    Development,
    /// Strict defaults: a real `JWT_SECRET` is mandatory.
    Production,
}

impl Environment {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("production") {
            Self::Production
        } else {
            Self::Development
        }
    }

    /// Whether this is a production deployment.
    #[must_use]
    pub const fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Token signing configuration.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// HMAC secret for HS256 signing.
    pub secret: String,
    /// Access token lifetime.
    pub access_expiry: Duration,
    /// Refresh token lifetime.
    pub refresh_expiry: Duration,
}

/// Complete application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP listen port.
    pub port: u16,
    /// Deployment environment.
    pub environment: Environment,
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Optional session-cache connection string. Recognised but the cache
    /// collaborator is wired elsewhere; Skiff itself never connects.
    pub redis_url: Option<String>,
    /// Token signing configuration.
    pub jwt: JwtConfig,
    /// Staging directory for downloaded payloads and archives.
    pub download_dir: PathBuf,
    /// System-wide ceiling hint for simultaneously active torrents.
    pub max_concurrent: usize,
    /// Swarm listen port handed to the engine.
    pub torrent_port: u16,
}

impl AppConfig {
    /// Assemble the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when a required variable is missing or a value fails
    /// to parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Assemble the configuration from an arbitrary lookup function.
    ///
    /// The indirection keeps tests hermetic: they pass a closure over a map
    /// instead of mutating process-global state.
    ///
    /// # Errors
    ///
    /// Returns an error when a required variable is missing or a value fails
    /// to parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let environment = lookup("ENVIRONMENT")
            .map(|value| Environment::parse(&value))
            .unwrap_or_default();

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingEnv {
            name: "DATABASE_URL",
        })?;

        let jwt_secret = match lookup("JWT_SECRET") {
            Some(secret) if !secret.trim().is_empty() => secret,
            _ if environment.is_production() => {
                return Err(ConfigError::MissingEnv { name: "JWT_SECRET" });
            }
            _ => DEV_JWT_SECRET.to_string(),
        };

        let access_minutes = parse_or_default(
            &lookup,
            "JWT_ACCESS_EXPIRY",
            DEFAULT_ACCESS_EXPIRY_MINUTES,
        )?;
        let refresh_days = parse_or_default(
            &lookup,
            "JWT_REFRESH_EXPIRY",
            DEFAULT_REFRESH_EXPIRY_DAYS,
        )?;

        Ok(Self {
            port: parse_or_default(&lookup, "PORT", DEFAULT_PORT)?,
            environment,
            database_url,
            redis_url: lookup("REDIS_URL").filter(|value| !value.is_empty()),
            jwt: JwtConfig {
                secret: jwt_secret,
                access_expiry: Duration::from_secs(minutes_to_secs(access_minutes)),
                refresh_expiry: Duration::from_secs(days_to_secs(refresh_days)),
            },
            download_dir: lookup("DOWNLOAD_DIR")
                .map_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR), PathBuf::from),
            max_concurrent: parse_or_default(&lookup, "MAX_CONCURRENT", 100_usize)?,
            torrent_port: parse_or_default(&lookup, "TORRENT_PORT", DEFAULT_TORRENT_PORT)?,
        })
    }
}

fn minutes_to_secs(minutes: i64) -> u64 {
    u64::try_from(minutes.max(1)).unwrap_or(1) * 60
}

fn days_to_secs(days: i64) -> u64 {
    u64::try_from(days.max(1)).unwrap_or(1) * 24 * 60 * 60
}

fn parse_or_default<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T> {
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            name,
            value: raw,
            reason: "failed to parse",
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |name| map.get(name).map(|value| (*value).to_string())
    }

    #[test]
    fn defaults_apply_outside_production() {
        let config =
            AppConfig::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://localhost/skiff")]))
                .expect("config builds");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.torrent_port, DEFAULT_TORRENT_PORT);
        assert_eq!(config.download_dir, PathBuf::from(DEFAULT_DOWNLOAD_DIR));
        assert_eq!(config.jwt.access_expiry, Duration::from_secs(15 * 60));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn database_url_is_always_required() {
        let err = AppConfig::from_lookup(lookup_from(&[])).expect_err("must fail");
        assert!(matches!(
            err,
            ConfigError::MissingEnv {
                name: "DATABASE_URL"
            }
        ));
    }

    #[test]
    fn production_requires_jwt_secret() {
        let err = AppConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/skiff"),
            ("ENVIRONMENT", "production"),
        ]))
        .expect_err("must fail");
        assert!(matches!(err, ConfigError::MissingEnv { name: "JWT_SECRET" }));
    }

    #[test]
    fn production_accepts_explicit_secret() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/skiff"),
            ("ENVIRONMENT", "Production"),
            ("JWT_SECRET", "super-secret"),
            ("PORT", "9090"),
            ("JWT_ACCESS_EXPIRY", "30"),
            ("JWT_REFRESH_EXPIRY", "14"),
        ]))
        .expect("config builds");
        assert!(config.environment.is_production());
        assert_eq!(config.port, 9090);
        assert_eq!(config.jwt.secret, "super-secret");
        assert_eq!(config.jwt.access_expiry, Duration::from_secs(30 * 60));
        assert_eq!(
            config.jwt.refresh_expiry,
            Duration::from_secs(14 * 24 * 60 * 60)
        );
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/skiff"),
            ("PORT", "not-a-port"),
        ]))
        .expect_err("must fail");
        assert!(matches!(err, ConfigError::InvalidEnv { name: "PORT", .. }));
    }

    #[test]
    fn empty_redis_url_is_treated_as_unset() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/skiff"),
            ("REDIS_URL", ""),
        ]))
        .expect("config builds");
        assert!(config.redis_url.is_none());
    }
}
