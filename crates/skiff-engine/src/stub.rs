//! Scripted in-memory swarm used by tests.
//!
//! The stub gives tests full control over the observable engine state: they
//! flip metadata, progress, and error fields on a handle and the lifecycle
//! core reacts exactly as it would to a live swarm. File readers resolve
//! against a plain directory so download handlers can be exercised with real
//! bytes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use librqbit::Magnet;
use tokio::io::BufReader;
use tokio::sync::Notify;

use crate::error::{EngineError, Result};
use crate::{
    READ_AHEAD_BYTES, SharedHandle, SwarmClient, SwarmFileStat, SwarmHandle, SwarmReader,
    SwarmStats,
};

/// In-memory swarm client for tests.
#[derive(Default)]
pub struct StubSwarm {
    root: PathBuf,
    torrents: Mutex<HashMap<String, Arc<StubHandle>>>,
    removed: Mutex<Vec<(String, bool)>>,
}

impl StubSwarm {
    /// Create a stub whose file readers resolve under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            torrents: Mutex::new(HashMap::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    /// Fetch a previously added handle for scripting.
    #[must_use]
    pub fn handle(&self, info_hash: &str) -> Option<Arc<StubHandle>> {
        self.torrents
            .lock()
            .ok()
            .and_then(|map| map.get(info_hash).cloned())
    }

    /// Remove calls observed so far, as `(info_hash, delete_files)` pairs.
    #[must_use]
    pub fn removed(&self) -> Vec<(String, bool)> {
        self.removed.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn insert(&self, info_hash: String) -> Arc<StubHandle> {
        let handle = Arc::new(StubHandle::new(info_hash.clone(), self.root.clone()));
        if let Ok(mut map) = self.torrents.lock() {
            map.insert(info_hash, Arc::clone(&handle));
        }
        handle
    }
}

#[async_trait]
impl SwarmClient for StubSwarm {
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
        Ok(self.insert(info_hash))
    }

    async fn add_metainfo(&self, bytes: &[u8]) -> Result<SharedHandle> {
        if bytes.is_empty() {
            return Err(EngineError::InvalidMetainfo {
                reason: "empty metainfo".to_string(),
            });
        }
        let handle = self.insert(digest_hex(bytes));
        // Metainfo adds come with metadata already known.
        handle.set_metadata(None, Vec::new());
        Ok(handle)
    }

    async fn remove(&self, info_hash: &str, delete_files: bool) -> Result<()> {
        if let Ok(mut map) = self.torrents.lock() {
            map.remove(info_hash);
        }
        if let Ok(mut log) = self.removed.lock() {
            log.push((info_hash.to_string(), delete_files));
        }
        Ok(())
    }
}

/// Scriptable handle for one stubbed torrent.
pub struct StubHandle {
    info_hash: String,
    root: PathBuf,
    name: Mutex<Option<String>>,
    stats: Mutex<SwarmStats>,
    info_notify: Notify,
}

impl std::fmt::Debug for StubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubHandle")
            .field("info_hash", &self.info_hash)
            .finish()
    }
}

impl StubHandle {
    fn new(info_hash: String, root: PathBuf) -> Self {
        Self {
            info_hash,
            root,
            name: Mutex::new(None),
            stats: Mutex::new(SwarmStats::default()),
            info_notify: Notify::new(),
        }
    }

    /// Script: metadata arrived with the given name and file listing.
    pub fn set_metadata(&self, name: Option<String>, files: Vec<SwarmFileStat>) {
        if let Ok(mut slot) = self.name.lock() {
            *slot = name;
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.has_metadata = true;
            stats.total_bytes = files.iter().map(|file| file.size).sum();
            stats.files = files;
        }
        self.info_notify.notify_waiters();
    }

    /// Script: overwrite the whole stats snapshot.
    pub fn set_stats(&self, next: SwarmStats) {
        if let Ok(mut stats) = self.stats.lock() {
            *stats = next;
        }
        self.info_notify.notify_waiters();
    }

    /// Script: every selected byte arrived.
    pub fn finish(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.completed_bytes = stats.total_bytes;
            stats.cumulative_read = stats.cumulative_read.max(stats.total_bytes);
            stats.finished = true;
            for file in &mut stats.files {
                file.completed = file.size;
            }
        }
    }

    /// Script: the engine reported a terminal error.
    pub fn fail(&self, reason: impl Into<String>) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.error = Some(reason.into());
        }
        self.info_notify.notify_waiters();
    }
}

#[async_trait]
impl SwarmHandle for StubHandle {
    fn info_hash(&self) -> String {
        self.info_hash.clone()
    }

    fn name(&self) -> Option<String> {
        self.name.lock().ok().and_then(|slot| slot.clone())
    }

    async fn await_info(&self) -> Result<()> {
        loop {
            let notified = self.info_notify.notified();
            if let Ok(stats) = self.stats.lock() {
                if let Some(reason) = &stats.error {
                    return Err(EngineError::Engine(anyhow::anyhow!("{reason}")));
                }
                if stats.has_metadata {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    async fn start(&self) -> Result<()> {
        if let Ok(mut stats) = self.stats.lock() {
            stats.is_paused = false;
        }
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        if let Ok(mut stats) = self.stats.lock() {
            stats.is_paused = true;
            stats.peers = 0;
        }
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        if let Ok(mut stats) = self.stats.lock() {
            stats.is_paused = false;
        }
        Ok(())
    }

    fn stats(&self) -> SwarmStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    async fn open_reader(&self, relative_path: &str) -> Result<SwarmReader> {
        let known = self
            .stats()
            .files
            .iter()
            .any(|file| file.path == relative_path);
        if !known {
            return Err(EngineError::UnknownFile {
                path: relative_path.to_string(),
            });
        }
        let path = self.root.join(relative_path);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| EngineError::Engine(anyhow::anyhow!("open {path:?}: {err}")))?;
        let length = file
            .metadata()
            .await
            .map_err(|err| EngineError::Engine(anyhow::anyhow!("stat {path:?}: {err}")))?
            .len();
        Ok(SwarmReader {
            reader: Box::pin(BufReader::with_capacity(READ_AHEAD_BYTES, file)),
            length,
        })
    }
}

/// Deterministic 40-hex digest for stub infohashes (FNV-1a folded over the
/// metainfo bytes; collision quality is irrelevant for tests).
fn digest_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(40);
    let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
    for chunk in 0_u32..5 {
        for (offset, byte) in bytes.iter().enumerate() {
            acc ^= u64::from(*byte).rotate_left(chunk + (offset % 7) as u32);
            acc = acc.wrapping_mul(0x0000_0100_0000_01b3);
        }
        acc = acc.wrapping_add(u64::from(chunk));
        out.push_str(&format!("{:08x}", (acc >> 16) as u32));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGNET: &str = "magnet:?xt=urn:btih:cab507494d02ebb1178b38f2e9d7be299c86b862";

    #[tokio::test]
    async fn magnet_add_parses_the_infohash() {
        let swarm = StubSwarm::new(".");
        let handle = swarm.add_magnet(MAGNET).await.expect("magnet accepted");
        assert_eq!(handle.info_hash(), "cab507494d02ebb1178b38f2e9d7be299c86b862");
        assert!(!handle.stats().has_metadata);
    }

    #[tokio::test]
    async fn bad_magnet_is_rejected() {
        let swarm = StubSwarm::new(".");
        let err = swarm
            .add_magnet("not-a-magnet")
            .await
            .expect_err("must reject");
        assert!(matches!(err, EngineError::InvalidMagnet { .. }));
    }

    #[tokio::test]
    async fn metainfo_add_has_metadata_immediately() {
        let swarm = StubSwarm::new(".");
        let handle = swarm
            .add_metainfo(b"d4:infod4:name5:helloee")
            .await
            .expect("metainfo accepted");
        assert!(handle.stats().has_metadata);
        assert_eq!(handle.info_hash().len(), 40);
    }

    #[tokio::test]
    async fn await_info_wakes_on_metadata() {
        let swarm = StubSwarm::new(".");
        let handle = swarm.add_magnet(MAGNET).await.expect("magnet accepted");
        let scripted = swarm.handle(&handle.info_hash()).expect("stub handle");
        let waiter = tokio::spawn({
            let handle = Arc::clone(&scripted);
            async move { handle.await_info().await }
        });
        scripted.set_metadata(
            Some("hello".to_string()),
            vec![SwarmFileStat {
                path: "hello.bin".to_string(),
                size: 3,
                completed: 0,
            }],
        );
        waiter
            .await
            .expect("task joins")
            .expect("await_info resolves");
    }

    #[tokio::test]
    async fn await_info_surfaces_failures() {
        let swarm = StubSwarm::new(".");
        let handle = swarm.add_magnet(MAGNET).await.expect("magnet accepted");
        let scripted = swarm.handle(&handle.info_hash()).expect("stub handle");
        scripted.fail("no peers");
        assert!(handle.await_info().await.is_err());
    }

    #[tokio::test]
    async fn reader_serves_bytes_from_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("hello.bin"), b"abc")
            .await
            .expect("fixture written");
        let swarm = StubSwarm::new(dir.path());
        let handle = swarm.add_magnet(MAGNET).await.expect("magnet accepted");
        let scripted = swarm.handle(&handle.info_hash()).expect("stub handle");
        scripted.set_metadata(
            None,
            vec![SwarmFileStat {
                path: "hello.bin".to_string(),
                size: 3,
                completed: 3,
            }],
        );
        let reader = handle.open_reader("hello.bin").await.expect("reader opens");
        assert_eq!(reader.length, 3);
        assert!(handle.open_reader("missing.bin").await.is_err());
    }

    #[tokio::test]
    async fn remove_records_the_call() {
        let swarm = StubSwarm::new(".");
        let handle = swarm.add_magnet(MAGNET).await.expect("magnet accepted");
        swarm
            .remove(&handle.info_hash(), true)
            .await
            .expect("remove succeeds");
        assert_eq!(
            swarm.removed(),
            vec![("cab507494d02ebb1178b38f2e9d7be299c86b862".to_string(), true)]
        );
        assert!(swarm.handle(&handle.info_hash()).is_none());
    }
}
