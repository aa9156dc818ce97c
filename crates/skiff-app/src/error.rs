//! Top-level application errors.
//!
//! Every variant is fatal: the binary exits non-zero when one reaches
//! `main`. Runtime faults after startup are handled (and logged) lower in
//! the stack.

use thiserror::Error;

/// Result alias for application bootstrap.
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Fatal startup failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration could not be assembled from the environment.
    #[error("configuration error: {0}")]
    Config(#[from] skiff_config::ConfigError),
    /// Logging could not be installed.
    #[error("telemetry error: {0}")]
    Telemetry(#[source] anyhow::Error),
    /// The database was unreachable after bounded retries, or migration
    /// failed.
    #[error("store error during {stage}: {source}")]
    Store {
        /// Bootstrap stage that failed.
        stage: &'static str,
        /// Underlying data error.
        #[source]
        source: skiff_data::DataError,
    },
    /// The torrent engine session could not be created.
    #[error("engine error: {0}")]
    Engine(#[from] skiff_engine::EngineError),
    /// The lifecycle core failed to start.
    #[error("core error: {0}")]
    Core(#[from] skiff_core::CoreError),
    /// Binding or serving the HTTP listener failed.
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub(crate) fn store(stage: &'static str) -> impl FnOnce(skiff_data::DataError) -> Self {
        move |source| Self::Store { stage, source }
    }
}
