//! Hourly retention sweep.
//!
//! Rows whose `expires_at` passed are removed together with their bytes and
//! any live engine participant. Partial failure is tolerated in one
//! direction only: bytes may outlive a failed filesystem delete until the
//! next sweep, but the row always goes. The ownership evidence is the row,
//! and forgetting beats leaking.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use skiff_data::{Store, TorrentRecord};
use skiff_engine::SwarmClient;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::package::staging_relative;
use crate::registry::Registry;

/// Cadence of the sweeper loop.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Best-effort removal of a record's staged bytes (payload plus archive).
pub async fn delete_staging(staging_root: &Path, record: &TorrentRecord) {
    if record.files.len() > 1 {
        // Multi-file payloads live in a sub-folder named after the torrent.
        if !record.name.is_empty() {
            remove_guarded(staging_root, Path::new(&record.name), true).await;
        }
    } else if let Some(file) = record.files.first() {
        let relative = staging_relative(&record.name, false, &file.path);
        remove_guarded(staging_root, &relative, false).await;
    }
    if let Some(zip_path) = &record.zip_path {
        remove_guarded(staging_root, Path::new(zip_path), false).await;
    }
}

async fn remove_guarded(root: &Path, relative: &Path, directory: bool) {
    match crate::package::guarded_join(root, relative) {
        Ok(path) => {
            let result = if directory {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(err) = result {
                warn!(path = %path.display(), error = %err, "failed to delete staged bytes");
            }
        }
        Err(err) => {
            warn!(relative = %relative.display(), error = %err, "refusing to delete unguarded path");
        }
    }
}

/// The periodic sweeper.
pub struct Sweeper {
    store: Store,
    client: Arc<dyn SwarmClient>,
    registry: Arc<Registry>,
    staging_root: std::path::PathBuf,
}

impl Sweeper {
    /// Create a sweeper over the shared collaborators.
    #[must_use]
    pub fn new(
        store: Store,
        client: Arc<dyn SwarmClient>,
        registry: Arc<Registry>,
        staging_root: std::path::PathBuf,
    ) -> Self {
        Self {
            store,
            client,
            registry,
            staging_root,
        }
    }

    /// Sweep every record expired as of `now`. Returns how many rows were
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns an error only when the expiry scan fails; per-record failures
    /// are logged and the sweep continues.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.store.expired_torrents(now).await?;
        let mut removed = 0_usize;
        for record in expired {
            self.sweep_record(&record).await;
            match self.store.delete_torrent(record.id).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(torrent_id = %record.id, error = %err, "failed to delete expired row");
                }
            }
        }
        if removed > 0 {
            info!(removed, "retention sweep removed expired torrents");
        }
        Ok(removed)
    }

    async fn sweep_record(&self, record: &TorrentRecord) {
        let live = self
            .registry
            .lookup(&record.info_hash)
            .filter(|entry| entry.id == record.id);
        if live.is_some() {
            if let Err(err) = self.client.remove(&record.info_hash, true).await {
                warn!(torrent_id = %record.id, error = %err, "engine drop failed during sweep");
            }
            self.registry.remove(&record.info_hash);
        }
        delete_staging(&self.staging_root, record).await;
    }

    /// Run hourly until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.sweep_once(Utc::now()).await {
                        warn!(error = %err, "retention sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_data::{TorrentFileEntry, TorrentStatus};
    use uuid::Uuid;

    fn record_with_files(name: &str, files: Vec<TorrentFileEntry>) -> TorrentRecord {
        TorrentRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            info_hash: "f".repeat(40),
            name: name.to_string(),
            magnet_uri: None,
            status: TorrentStatus::Completed,
            total_size: 0,
            downloaded: 0,
            uploaded: 0,
            progress: 100.0,
            download_speed: 0,
            upload_speed: 0,
            peers: 0,
            seeds: 0,
            files,
            zip_path: None,
            zip_size: 0,
            error_message: None,
            started_at: None,
            completed_at: Some(Utc::now()),
            expires_at: Some(Utc::now()),
            created_at: Utc::now(),
        }
    }

    fn entry(path: &str) -> TorrentFileEntry {
        TorrentFileEntry {
            path: path.to_string(),
            size: 1,
            progress: 1,
            priority: "normal".to_string(),
        }
    }

    #[tokio::test]
    async fn single_file_payloads_are_deleted_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("hello.bin"), b"x")
            .await
            .expect("fixture");
        let record = record_with_files("hello", vec![entry("hello.bin")]);
        delete_staging(dir.path(), &record).await;
        assert!(!dir.path().join("hello.bin").exists());
    }

    #[tokio::test]
    async fn multi_file_payloads_remove_the_subtree_and_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::create_dir_all(dir.path().join("pack")).await.expect("dirs");
        tokio::fs::write(dir.path().join("pack/a.txt"), b"a")
            .await
            .expect("fixture a");
        tokio::fs::write(dir.path().join("pack.zip"), b"zip")
            .await
            .expect("fixture zip");
        let mut record = record_with_files("pack", vec![entry("a.txt"), entry("b.txt")]);
        record.zip_path = Some("pack.zip".to_string());
        delete_staging(dir.path(), &record).await;
        assert!(!dir.path().join("pack").exists());
        assert!(!dir.path().join("pack.zip").exists());
    }

    #[tokio::test]
    async fn traversal_names_are_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outside = dir.path().join("outside.txt");
        tokio::fs::write(&outside, b"keep me").await.expect("fixture");

        let staging = dir.path().join("staging");
        tokio::fs::create_dir_all(&staging).await.expect("staging dir");
        let record = record_with_files("ignored", vec![entry("../outside.txt")]);
        delete_staging(&staging, &record).await;
        assert!(outside.exists(), "guarded join must refuse the escape");
    }
}
