//! Error types for the swarm adapter.

use thiserror::Error;

/// Result alias for adapter operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the swarm adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The supplied magnet URI could not be parsed or lacks a v1 infohash.
    #[error("invalid magnet link: {reason}")]
    InvalidMagnet {
        /// Why the magnet was rejected.
        reason: String,
    },
    /// The supplied metainfo bytes were not a valid torrent description.
    #[error("invalid torrent metainfo: {reason}")]
    InvalidMetainfo {
        /// Why the metainfo was rejected.
        reason: String,
    },
    /// Metadata is not yet known for the torrent, so the operation cannot run.
    #[error("torrent metadata is not available yet")]
    MetadataUnavailable,
    /// The metadata fetch did not finish before the deadline.
    #[error("timed out waiting for torrent metadata")]
    MetadataTimeout,
    /// The requested file path does not exist within the torrent.
    #[error("file {path:?} is not part of the torrent")]
    UnknownFile {
        /// Relative path that was requested.
        path: String,
    },
    /// The underlying engine reported a failure.
    #[error("engine operation failed: {0}")]
    Engine(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_the_offending_path() {
        let err = EngineError::UnknownFile {
            path: "a/b.txt".to_string(),
        };
        assert!(err.to_string().contains("a/b.txt"));
    }
}
