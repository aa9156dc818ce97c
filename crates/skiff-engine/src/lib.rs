#![forbid(unsafe_code)]

//! Engine-agnostic swarm interfaces and the concrete adapter.
//!
//! The lifecycle core never touches the BitTorrent library directly: it
//! speaks [`SwarmClient`] and [`SwarmHandle`], which expose exactly the
//! operations the core needs (add by magnet or metainfo, drop, non-blocking
//! stats, pause/resume, and seekable file readers). [`rqbit::RqbitSwarm`]
//! implements the pair over `librqbit`; [`stub::StubSwarm`] is the scripted
//! in-memory implementation used by tests.

pub mod error;
pub mod rqbit;
pub mod stub;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek};

pub use error::{EngineError, Result};
pub use rqbit::RqbitSwarm;
pub use stub::StubSwarm;

/// Forward read-ahead applied to file readers to favour sequential streaming.
pub const READ_AHEAD_BYTES: usize = 10 * 1024 * 1024;

/// Shared reference to a live swarm participant.
pub type SharedHandle = Arc<dyn SwarmHandle>;

/// Combined trait for seekable async readers handed out by the adapter.
pub trait AsyncReadSeek: AsyncRead + AsyncSeek {}

impl<T: AsyncRead + AsyncSeek + ?Sized> AsyncReadSeek for T {}

/// Seekable reader over a single file within a torrent payload.
pub struct SwarmReader {
    /// The positioned byte stream.
    pub reader: Pin<Box<dyn AsyncReadSeek + Send>>,
    /// Total length of the file in bytes.
    pub length: u64,
}

/// Per-file statistics reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SwarmFileStat {
    /// Path of the file relative to the torrent root.
    pub path: String,
    /// Total size of the file in bytes.
    pub size: u64,
    /// Bytes of the file already downloaded and verified.
    pub completed: u64,
}

/// Non-blocking snapshot of a swarm participant.
///
/// `cumulative_read` / `cumulative_written` are monotonic transfer counters;
/// the updater derives speeds from their deltas between ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwarmStats {
    /// Whether the torrent metainfo is known.
    pub has_metadata: bool,
    /// Total payload size in bytes; zero until metadata is known.
    pub total_bytes: u64,
    /// Bytes downloaded and verified so far.
    pub completed_bytes: u64,
    /// Established peer connections.
    pub peers: u32,
    /// Connected peers that hold the complete payload.
    pub seeds: u32,
    /// Monotonic count of payload bytes fetched from the swarm.
    pub cumulative_read: u64,
    /// Monotonic count of payload bytes served to the swarm.
    pub cumulative_written: u64,
    /// Whether the participant is paused (no peer connections allowed).
    pub is_paused: bool,
    /// Whether every selected byte has been downloaded.
    pub finished: bool,
    /// Terminal engine error, if one occurred.
    pub error: Option<String>,
    /// Per-file listing; empty until metadata is known.
    pub files: Vec<SwarmFileStat>,
}

/// Tuning hints applied to the engine session where the underlying library
/// exposes the corresponding knob. Values are configuration, not constants:
/// `resume` re-applies `established_per_torrent` from here.
#[derive(Debug, Clone, Copy)]
pub struct EngineTuning {
    /// Swarm listen port.
    pub listen_port: u16,
    /// Ceiling on established connections per torrent.
    pub established_per_torrent: u32,
    /// Ceiling on half-open connections per torrent.
    pub half_open: u32,
    /// High-water mark for session-wide connections.
    pub high_water: u32,
    /// Low-water mark for session-wide connections.
    pub low_water: u32,
    /// Whether completed torrents keep seeding.
    pub seed_on_complete: bool,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            established_per_torrent: 50,
            half_open: 25,
            high_water: 500,
            low_water: 50,
            seed_on_complete: false,
        }
    }
}

/// Handle to a single live swarm participant.
#[async_trait]
pub trait SwarmHandle: Send + Sync + std::fmt::Debug {
    /// 40-character lowercase hex infohash.
    fn info_hash(&self) -> String;

    /// Display name, once known (magnet `dn` hint or metainfo name).
    fn name(&self) -> Option<String>;

    /// Resolve once the torrent metainfo is known and initial file checking
    /// finished. Callers bound the wait with their own deadline.
    async fn await_info(&self) -> Result<()>;

    /// Begin (or continue) downloading. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Disallow all peer connections, halting transfer. Reversible.
    async fn pause(&self) -> Result<()>;

    /// Restore the peer ceiling and mark all pieces wanted again.
    async fn resume(&self) -> Result<()>;

    /// Snapshot of transfer state. Contractually non-blocking: safe to call
    /// from the 1 Hz updater.
    fn stats(&self) -> SwarmStats;

    /// Open a seekable reader over one file of the payload.
    ///
    /// Fails when metadata is not yet present or the path is not part of the
    /// torrent. The reader carries a large forward read-ahead
    /// ([`READ_AHEAD_BYTES`]) to favour sequential streaming.
    async fn open_reader(&self, relative_path: &str) -> Result<SwarmReader>;
}

/// Factory and lifecycle owner for swarm participants.
#[async_trait]
pub trait SwarmClient: Send + Sync {
    /// Join a swarm described by a magnet URI.
    ///
    /// Returns as soon as the infohash is known; metadata may still be
    /// resolving (use [`SwarmHandle::await_info`]).
    async fn add_magnet(&self, uri: &str) -> Result<SharedHandle>;

    /// Join a swarm described by raw `.torrent` metainfo bytes. Metadata is
    /// immediately available on the returned handle.
    async fn add_metainfo(&self, bytes: &[u8]) -> Result<SharedHandle>;

    /// Detach from the swarm identified by `info_hash`, invalidating every
    /// reader issued against its handle. Optionally deletes downloaded files.
    async fn remove(&self, info_hash: &str, delete_files: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_defaults_match_baseline() {
        let tuning = EngineTuning::default();
        assert_eq!(tuning.established_per_torrent, 50);
        assert_eq!(tuning.half_open, 25);
        assert_eq!(tuning.high_water, 500);
        assert_eq!(tuning.low_water, 50);
        assert!(!tuning.seed_on_complete);
    }

    #[test]
    fn stats_default_is_empty_and_unresolved() {
        let stats = SwarmStats::default();
        assert!(!stats.has_metadata);
        assert_eq!(stats.total_bytes, 0);
        assert!(stats.files.is_empty());
        assert!(stats.error.is_none());
    }
}
