#![forbid(unsafe_code)]

//! Durable store for Skiff: migrations, connection pooling, and repositories
//! for torrents, download tokens, usage accounting, users, and subscriptions.

pub mod error;
pub mod models;
pub mod plans;
pub mod tokens;
pub mod torrents;
pub mod usage;
pub mod users;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub use error::{DataError, Result};
pub use models::{
    DownloadToken, NewTorrent, Role, Subscription, TorrentFileEntry, TorrentRecord, TorrentStatus,
    UsageAction, User,
};
pub use plans::Plan;

/// Maximum pooled connections.
const POOL_MAX_CONNECTIONS: u32 = 25;
/// Connections kept warm.
const POOL_MIN_CONNECTIONS: u32 = 5;
/// Hard lifetime cap per connection.
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);
/// Idle reap threshold.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Database-backed repository hub.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect a bounded pool to the given PostgreSQL instance.
    ///
    /// # Errors
    ///
    /// Returns an error when the database is unreachable.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .min_connections(POOL_MIN_CONNECTIONS)
            .max_lifetime(POOL_MAX_LIFETIME)
            .idle_timeout(POOL_IDLE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(DataError::query("pool.connect"))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests and embedded use).
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error when a migration fails to execute.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|source| DataError::MigrationFailed { source })?;
        Ok(())
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}
