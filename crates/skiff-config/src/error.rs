//! Error types for configuration loading.

use thiserror::Error;

/// Result alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while assembling the application configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable was not set.
    #[error("required environment variable {name} is not set")]
    MissingEnv {
        /// Name of the missing variable.
        name: &'static str,
    },
    /// An environment variable was set but could not be parsed.
    #[error("environment variable {name} has invalid value {value:?}: {reason}")]
    InvalidEnv {
        /// Name of the offending variable.
        name: &'static str,
        /// Raw value as found in the environment.
        value: String,
        /// Why the value was rejected.
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_env_names_the_variable() {
        let err = ConfigError::MissingEnv { name: "JWT_SECRET" };
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn invalid_env_includes_value_and_reason() {
        let err = ConfigError::InvalidEnv {
            name: "PORT",
            value: "not-a-port".to_string(),
            reason: "expected an integer",
        };
        let rendered = err.to_string();
        assert!(rendered.contains("PORT"));
        assert!(rendered.contains("not-a-port"));
    }
}
