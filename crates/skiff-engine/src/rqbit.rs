//! `librqbit`-backed implementation of the swarm traits.
//!
//! The session is the single owner of all engine state. Magnet adds return a
//! handle immediately with the infohash parsed from the URI; the session-side
//! resolution continues in a background task and [`SwarmHandle::await_info`]
//! parks until it lands (or fails).

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use librqbit::api::TorrentIdOrHash;
use librqbit::{
    AddTorrent, AddTorrentOptions, AddTorrentResponse, Magnet, ManagedTorrent, Session,
    SessionOptions, TorrentStats, TorrentStatsState,
};
use tokio::io::BufReader;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::{
    EngineTuning, READ_AHEAD_BYTES, SharedHandle, SwarmClient, SwarmFileStat, SwarmHandle,
    SwarmReader, SwarmStats,
};

/// Swarm client backed by a `librqbit` session.
pub struct RqbitSwarm {
    session: Arc<Session>,
}

impl RqbitSwarm {
    /// Create the engine session rooted at `download_dir`.
    ///
    /// DHT persistence and the engine's own session persistence are disabled:
    /// the durable record of what should be live is the database, and the
    /// reloader re-adds participants after restart.
    ///
    /// # Errors
    ///
    /// Returns an error when the session cannot be constructed (e.g. the
    /// listen port is taken or the directory is not writable).
    pub async fn new(download_dir: PathBuf, tuning: EngineTuning) -> Result<Self> {
        let opts = SessionOptions {
            disable_dht: false,
            disable_dht_persistence: true,
            persistence: None,
            listen_port_range: Some(tuning.listen_port..tuning.listen_port.saturating_add(1)),
            ..Default::default()
        };
        let session = Session::new_with_opts(download_dir, opts)
            .await
            .map_err(EngineError::Engine)?;
        Ok(Self { session })
    }

    /// Stop the engine session, detaching from every swarm.
    pub async fn stop(&self) {
        self.session.stop().await;
    }
}

fn add_options() -> AddTorrentOptions {
    AddTorrentOptions {
        overwrite: true,
        ..Default::default()
    }
}

#[async_trait]
impl SwarmClient for RqbitSwarm {
    async fn add_magnet(&self, uri: &str) -> Result<SharedHandle> {
        let magnet = Magnet::parse(uri).map_err(|err| EngineError::InvalidMagnet {
            reason: format!("{err:#}"),
        })?;
        let info_hash = magnet
            .as_id20()
            .ok_or_else(|| EngineError::InvalidMagnet {
                reason: "magnet does not carry a v1 infohash".to_string(),
            })?
            .as_string();

        let handle = Arc::new(RqbitHandle::resolving(self.session.clone(), info_hash));
        let resolving = Arc::clone(&handle);
        let session = self.session.clone();
        let uri = uri.to_string();
        tokio::spawn(async move {
            let response = session
                .add_torrent(AddTorrent::from_url(&uri), Some(add_options()))
                .await;
            match response.map(AddTorrentResponse::into_handle) {
                Ok(Some(engine)) => resolving.attach(engine),
                Ok(None) => resolving.fail("engine returned a list-only response".to_string()),
                Err(err) => resolving.fail(format!("{err:#}")),
            }
        });
        Ok(handle)
    }

    async fn add_metainfo(&self, bytes: &[u8]) -> Result<SharedHandle> {
        let response = self
            .session
            .add_torrent(AddTorrent::from_bytes(bytes.to_vec()), Some(add_options()))
            .await
            .map_err(|err| EngineError::InvalidMetainfo {
                reason: format!("{err:#}"),
            })?;
        let engine = response
            .into_handle()
            .ok_or_else(|| EngineError::InvalidMetainfo {
                reason: "engine returned a list-only response".to_string(),
            })?;
        let info_hash = engine.info_hash().as_string();
        Ok(Arc::new(RqbitHandle::attached(
            self.session.clone(),
            info_hash,
            engine,
        )))
    }

    async fn remove(&self, info_hash: &str, delete_files: bool) -> Result<()> {
        let idx = TorrentIdOrHash::parse(info_hash).map_err(EngineError::Engine)?;
        match self.session.delete(idx, delete_files).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // The session may have forgotten the torrent already (e.g. a
                // failed magnet never produced a live participant).
                warn!(info_hash, error = %err, "engine delete reported an error");
                Ok(())
            }
        }
    }
}

enum AttachState {
    Resolving,
    Ready(Arc<ManagedTorrent>),
    Failed(String),
}

/// Handle over one `librqbit` managed torrent.
pub struct RqbitHandle {
    info_hash: String,
    session: Arc<Session>,
    state: RwLock<AttachState>,
    attach_notify: Notify,
}

impl std::fmt::Debug for RqbitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RqbitHandle")
            .field("info_hash", &self.info_hash)
            .finish()
    }
}

impl RqbitHandle {
    fn resolving(session: Arc<Session>, info_hash: String) -> Self {
        Self {
            info_hash,
            session,
            state: RwLock::new(AttachState::Resolving),
            attach_notify: Notify::new(),
        }
    }

    fn attached(session: Arc<Session>, info_hash: String, engine: Arc<ManagedTorrent>) -> Self {
        Self {
            info_hash,
            session,
            state: RwLock::new(AttachState::Ready(engine)),
            attach_notify: Notify::new(),
        }
    }

    fn attach(&self, engine: Arc<ManagedTorrent>) {
        if let Ok(mut guard) = self.state.write() {
            *guard = AttachState::Ready(engine);
        }
        self.attach_notify.notify_waiters();
    }

    fn fail(&self, reason: String) {
        debug!(info_hash = %self.info_hash, reason, "magnet resolution failed");
        if let Ok(mut guard) = self.state.write() {
            *guard = AttachState::Failed(reason);
        }
        self.attach_notify.notify_waiters();
    }

    fn engine(&self) -> Result<Arc<ManagedTorrent>> {
        match &*self.state.read().map_err(|_| EngineError::Engine(anyhow::anyhow!("handle state poisoned")))? {
            AttachState::Ready(engine) => Ok(Arc::clone(engine)),
            AttachState::Resolving => Err(EngineError::MetadataUnavailable),
            AttachState::Failed(reason) => Err(EngineError::Engine(anyhow::anyhow!(
                "torrent failed: {reason}"
            ))),
        }
    }
}

#[async_trait]
impl SwarmHandle for RqbitHandle {
    fn info_hash(&self) -> String {
        self.info_hash.clone()
    }

    fn name(&self) -> Option<String> {
        self.engine().ok().and_then(|engine| engine.name())
    }

    async fn await_info(&self) -> Result<()> {
        loop {
            // Arm the notification before inspecting state so an attach that
            // races the check is not missed.
            let notified = self.attach_notify.notified();
            match self.engine() {
                Ok(engine) => {
                    engine
                        .wait_until_initialized()
                        .await
                        .map_err(EngineError::Engine)?;
                    return Ok(());
                }
                Err(EngineError::MetadataUnavailable) => notified.await,
                Err(err) => return Err(err),
            }
        }
    }

    async fn start(&self) -> Result<()> {
        let engine = self.engine()?;
        if engine.is_paused() {
            self.session
                .unpause(&engine)
                .await
                .map_err(EngineError::Engine)?;
        }
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        let engine = self.engine()?;
        self.session
            .pause(&engine)
            .await
            .map_err(EngineError::Engine)
    }

    async fn resume(&self) -> Result<()> {
        let engine = self.engine()?;
        self.session
            .unpause(&engine)
            .await
            .map_err(EngineError::Engine)
    }

    fn stats(&self) -> SwarmStats {
        let state = match self.state.read() {
            Ok(guard) => guard,
            Err(_) => return SwarmStats::default(),
        };
        match &*state {
            AttachState::Resolving => SwarmStats::default(),
            AttachState::Failed(reason) => SwarmStats {
                error: Some(reason.clone()),
                ..SwarmStats::default()
            },
            AttachState::Ready(engine) => {
                let stats = engine.stats();
                let files = engine.metadata.load_full().map_or_else(Vec::new, |meta| {
                    meta.file_infos
                        .iter()
                        .enumerate()
                        .map(|(idx, info)| SwarmFileStat {
                            path: info.relative_filename.to_string_lossy().into_owned(),
                            size: info.len,
                            completed: stats.file_progress.get(idx).copied().unwrap_or(0),
                        })
                        .collect()
                });
                let has_metadata = engine.metadata.load_full().is_some();
                convert_stats(&stats, files, has_metadata)
            }
        }
    }

    async fn open_reader(&self, relative_path: &str) -> Result<SwarmReader> {
        let engine = self.engine()?;
        let meta = engine
            .metadata
            .load_full()
            .ok_or(EngineError::MetadataUnavailable)?;
        let file_id = meta
            .file_infos
            .iter()
            .position(|info| info.relative_filename.as_path() == Path::new(relative_path))
            .ok_or_else(|| EngineError::UnknownFile {
                path: relative_path.to_string(),
            })?;
        let stream = engine.stream(file_id).map_err(EngineError::Engine)?;
        let length = stream.len();
        Ok(SwarmReader {
            reader: Box::pin(BufReader::with_capacity(READ_AHEAD_BYTES, stream)),
            length,
        })
    }
}

fn convert_stats(stats: &TorrentStats, files: Vec<SwarmFileStat>, has_metadata: bool) -> SwarmStats {
    let (peers, seeds, cumulative_read, cumulative_written) = stats.live.as_ref().map_or(
        (0, 0, stats.progress_bytes, stats.uploaded_bytes),
        |live| {
            (
                live.snapshot.peer_stats.live as u32,
                // Peers the engine stopped scheduling because they hold
                // nothing we still need, i.e. complete peers.
                live.snapshot.peer_stats.not_needed as u32,
                live.snapshot.fetched_bytes.max(stats.progress_bytes),
                live.snapshot.uploaded_bytes.max(stats.uploaded_bytes),
            )
        },
    );
    SwarmStats {
        has_metadata,
        total_bytes: stats.total_bytes,
        completed_bytes: stats.progress_bytes,
        peers,
        seeds,
        cumulative_read,
        cumulative_written,
        is_paused: matches!(stats.state, TorrentStatsState::Paused),
        finished: stats.finished,
        error: stats.error.clone(),
        files,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_stats(state: TorrentStatsState) -> TorrentStats {
        TorrentStats {
            state,
            error: None,
            progress_bytes: 512,
            uploaded_bytes: 128,
            total_bytes: 1024,
            finished: false,
            file_progress: vec![512],
            live: None,
        }
    }

    #[test]
    fn paused_state_maps_to_is_paused() {
        let converted = convert_stats(&base_stats(TorrentStatsState::Paused), Vec::new(), true);
        assert!(converted.is_paused);
        assert_eq!(converted.completed_bytes, 512);
        assert_eq!(converted.total_bytes, 1024);
    }

    #[test]
    fn missing_live_stats_fall_back_to_totals() {
        let converted = convert_stats(
            &base_stats(TorrentStatsState::Initializing),
            Vec::new(),
            false,
        );
        assert_eq!(converted.peers, 0);
        assert_eq!(converted.cumulative_read, 512);
        assert_eq!(converted.cumulative_written, 128);
        assert!(!converted.has_metadata);
    }

    #[test]
    fn engine_error_is_carried_through() {
        let mut stats = base_stats(TorrentStatsState::Error);
        stats.error = Some("tracker refused".to_string());
        let converted = convert_stats(&stats, Vec::new(), true);
        assert_eq!(converted.error.as_deref(), Some("tracker refused"));
    }
}
