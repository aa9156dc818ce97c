//! Error types for the lifecycle core.

use thiserror::Error;
use uuid::Uuid;

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the lifecycle core to the HTTP layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The caller's plan does not allow another active download.
    #[error("concurrent download limit of {limit} reached")]
    ConcurrentLimit {
        /// Plan limit that was hit.
        limit: i64,
    },
    /// The caller's plan does not allow more transfer this month.
    #[error("monthly bandwidth limit of {limit} bytes reached")]
    BandwidthLimit {
        /// Plan limit that was hit.
        limit: i64,
    },
    /// The process-wide ceiling on live participants was reached.
    #[error("server is at capacity, try again later")]
    Capacity,
    /// The infohash is already live and owned by another user.
    #[error("torrent already exists")]
    Duplicate {
        /// Record id of the existing owner's record.
        existing_id: Uuid,
    },
    /// The requested record does not exist.
    #[error("torrent not found")]
    NotFound,
    /// The caller does not own the record and is not an admin.
    #[error("access denied")]
    Forbidden,
    /// Tokens can only be minted against finished downloads.
    #[error("torrent is not completed")]
    NotCompleted,
    /// The requested file is not part of the torrent.
    #[error("file {path:?} is not part of the torrent")]
    UnknownFile {
        /// Relative path that was requested.
        path: String,
    },
    /// No packaged archive exists for the record.
    #[error("archive is not available")]
    ArchiveUnavailable,
    /// The download token does not exist.
    #[error("invalid or expired download token")]
    TokenNotFound,
    /// The download token exists but is expired or exhausted.
    #[error("invalid or expired download token")]
    TokenGone,
    /// The caller supplied something unusable (bad magnet, bad metainfo).
    #[error("{message}")]
    InvalidInput {
        /// Public description of the problem.
        message: String,
    },
    /// The swarm engine failed.
    #[error(transparent)]
    Engine(#[from] skiff_engine::EngineError),
    /// The durable store failed.
    #[error(transparent)]
    Store(#[from] skiff_data::DataError),
    /// Filesystem access failed.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_errors_share_a_public_face() {
        // Both map to the same non-revealing message on the wire.
        assert_eq!(
            CoreError::TokenNotFound.to_string(),
            CoreError::TokenGone.to_string()
        );
    }

    #[test]
    fn quota_errors_name_the_limit() {
        assert!(CoreError::ConcurrentLimit { limit: 5 }
            .to_string()
            .contains('5'));
    }
}
