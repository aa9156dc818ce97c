//! Startup rehydration of non-terminal records into the engine.
//!
//! Runs once after migration. Each record that still needs swarm
//! participation is re-added by magnet URI (or a magnet synthesised from
//! the bare infohash), registered, and armed with the usual metadata
//! deadline so a dead swarm moves the record to `failed` instead of
//! wedging it in `pending` forever. Startup itself never blocks on
//! metadata.

use std::sync::Arc;

use skiff_data::{Store, TorrentRecord, TorrentStatus};
use skiff_engine::SwarmClient;
use tracing::{info, warn};

use crate::core::arm_metadata_deadline;
use crate::error::Result;
use crate::registry::{InsertOutcome, ManagedTorrent, Registry};

/// Synthesise a magnet URI from a bare infohash.
#[must_use]
pub fn magnet_for_info_hash(info_hash: &str) -> String {
    format!("magnet:?xt=urn:btih:{info_hash}")
}

/// Whether a record still needs swarm participation after a restart.
/// Completed payloads are already on disk and are served from staging, so
/// rejoining their swarms would only turn the service into a seed.
#[must_use]
pub fn needs_swarm(status: TorrentStatus) -> bool {
    !matches!(status, TorrentStatus::Completed | TorrentStatus::Seeding)
}

/// One-shot reloader.
pub struct Reloader {
    client: Arc<dyn SwarmClient>,
    store: Store,
    registry: Arc<Registry>,
}

impl Reloader {
    /// Create a reloader over the shared collaborators.
    #[must_use]
    pub fn new(client: Arc<dyn SwarmClient>, store: Store, registry: Arc<Registry>) -> Self {
        Self {
            client,
            store,
            registry,
        }
    }

    /// Rehydrate every non-terminal record. Returns how many participants
    /// were registered.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store scan itself fails; individual
    /// records that cannot be re-added are logged and skipped.
    pub async fn run(&self) -> Result<usize> {
        let records = self.store.load_non_terminal().await?;
        let mut loaded = 0_usize;
        for record in records {
            match self.reload_one(&record).await {
                Ok(true) => loaded += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(torrent_id = %record.id, error = %err, "failed to reload torrent");
                }
            }
        }
        info!(loaded, "torrent reload finished");
        Ok(loaded)
    }

    async fn reload_one(&self, record: &TorrentRecord) -> Result<bool> {
        if !needs_swarm(record.status) {
            return Ok(false);
        }
        let uri = record
            .magnet_uri
            .clone()
            .unwrap_or_else(|| magnet_for_info_hash(&record.info_hash));
        let handle = self.client.add_magnet(&uri).await?;
        let entry = Arc::new(ManagedTorrent::new(
            record.id,
            record.user_id,
            handle.info_hash(),
            handle,
        ));
        match self.registry.insert_if_absent(Arc::clone(&entry)) {
            InsertOutcome::Existing(_) => {
                // Two records sharing an infohash load once; first wins.
                return Ok(false);
            }
            InsertOutcome::Inserted => {}
        }
        arm_metadata_deadline(entry, self.store.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesised_magnets_carry_the_infohash() {
        let uri = magnet_for_info_hash("cab507494d02ebb1178b38f2e9d7be299c86b862");
        assert_eq!(
            uri,
            "magnet:?xt=urn:btih:cab507494d02ebb1178b38f2e9d7be299c86b862"
        );
    }

    #[test]
    fn completed_records_do_not_rejoin_the_swarm() {
        assert!(!needs_swarm(TorrentStatus::Completed));
        assert!(!needs_swarm(TorrentStatus::Seeding));
        assert!(needs_swarm(TorrentStatus::Pending));
        assert!(needs_swarm(TorrentStatus::Downloading));
        assert!(needs_swarm(TorrentStatus::Paused));
        assert!(needs_swarm(TorrentStatus::Stalled));
    }
}
