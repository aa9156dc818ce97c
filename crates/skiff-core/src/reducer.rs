//! Single-consumer reducer: drains the update channel and commits to the
//! durable store.
//!
//! Three commit paths exist, decided in [`classify`]: error transitions,
//! completion transitions, and plain progress. Completion is idempotent:
//! the store only honours the first commit, and later completion updates
//! degenerate into progress writes that leave `completed_at`/`expires_at`
//! untouched. A store failure is logged and the update dropped; the next
//! tick retries the same commit from fresh engine truth.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use skiff_data::{plans, Store, TorrentFileEntry, TorrentStatus, UsageAction};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::package::Packager;
use crate::update::StatusUpdate;

/// The three ways an update can commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPath {
    /// Persist the failure and stop.
    Error,
    /// Run the completion transition.
    Completion,
    /// Persist current numbers.
    Progress,
}

/// Decide the commit path for an update.
#[must_use]
pub fn classify(update: &StatusUpdate) -> CommitPath {
    if update.error.as_deref().is_some_and(|msg| !msg.is_empty()) {
        CommitPath::Error
    } else if update.status == TorrentStatus::Completed {
        CommitPath::Completion
    } else {
        CommitPath::Progress
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Convert the engine file listing into persistable entries.
#[must_use]
pub fn file_entries(update: &StatusUpdate) -> Vec<TorrentFileEntry> {
    update
        .files
        .iter()
        .map(|file| TorrentFileEntry {
            path: file.path.clone(),
            size: clamp_i64(file.size),
            progress: clamp_i64(file.completed),
            priority: "normal".to_string(),
        })
        .collect()
}

/// The serial consumer of the update channel.
pub struct Reducer {
    store: Store,
    packager: Arc<Packager>,
    metadata_seen: HashSet<Uuid>,
}

impl Reducer {
    /// Create a reducer committing through `store` and scheduling archive
    /// builds on `packager`.
    #[must_use]
    pub fn new(store: Store, packager: Arc<Packager>) -> Self {
        Self {
            store,
            packager,
            metadata_seen: HashSet::new(),
        }
    }

    /// Drain the channel until it closes or the token fires.
    pub async fn run(mut self, mut rx: mpsc::Receiver<StatusUpdate>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(update) => {
                        if let Err(err) = self.apply(&update).await {
                            // Dropped on purpose: the next tick re-attempts.
                            warn!(torrent_id = %update.torrent_id, error = %err,
                                  "failed to persist status update");
                        }
                    }
                    None => break,
                },
            }
        }
    }

    /// Commit one update.
    ///
    /// # Errors
    ///
    /// Returns an error when the store rejects a write; the caller logs and
    /// drops it.
    pub async fn apply(&mut self, update: &StatusUpdate) -> skiff_data::Result<()> {
        match classify(update) {
            CommitPath::Error => self.apply_error(update).await,
            CommitPath::Completion => self.apply_completion(update).await,
            CommitPath::Progress => self.apply_progress(update).await,
        }
    }

    async fn apply_error(&self, update: &StatusUpdate) -> skiff_data::Result<()> {
        let message = update.error.as_deref().unwrap_or("engine failure");
        self.store
            .mark_torrent_failed(update.torrent_id, message)
            .await
    }

    async fn apply_completion(&mut self, update: &StatusUpdate) -> skiff_data::Result<()> {
        let now = Utc::now();
        // Retention comes from the subscription snapshot at this instant;
        // later plan changes never re-date the record.
        let plan = match self.store.user_by_id(update.user_id).await? {
            Some(user) => {
                let subscription = self.store.subscription_for(user.id).await?;
                plans::resolve(user.role, subscription.as_ref())
            }
            None => plans::FREE,
        };
        let expires_at = now + ChronoDuration::days(plan.retention_days);

        let won = self
            .store
            .mark_torrent_completed(update.torrent_id, now, expires_at)
            .await?;

        self.persist_metadata(update, true).await?;

        if won {
            debug!(torrent_id = %update.torrent_id, plan = plan.name, "completion committed");
            if update.files.len() > 1 {
                if let Some(name) = update.name.clone() {
                    self.packager.schedule(update.torrent_id, name);
                }
            }
            self.store
                .log_usage(
                    update.user_id,
                    UsageAction::DownloadCompleted,
                    clamp_i64(update.total_size),
                    json!({ "torrent_id": update.torrent_id, "info_hash": update.info_hash }),
                )
                .await?;
        } else {
            // Degenerate replay: persist numbers without touching the
            // completion columns.
            self.apply_progress(update).await?;
        }
        Ok(())
    }

    async fn apply_progress(&mut self, update: &StatusUpdate) -> skiff_data::Result<()> {
        self.store
            .update_torrent_progress(
                update.torrent_id,
                update.status,
                update.progress.clamp(0.0, 100.0),
                clamp_i64(update.downloaded),
                clamp_i64(update.uploaded),
                clamp_i64(update.download_speed),
                clamp_i64(update.upload_speed),
                clamp_i32(update.peers),
                clamp_i32(update.seeds),
            )
            .await?;
        self.persist_metadata(update, false).await
    }

    async fn persist_metadata(
        &mut self,
        update: &StatusUpdate,
        force: bool,
    ) -> skiff_data::Result<()> {
        if update.files.is_empty() {
            return Ok(());
        }
        if !force && self.metadata_seen.contains(&update.torrent_id) {
            return Ok(());
        }
        let name = update.name.clone().unwrap_or_default();
        self.store
            .update_torrent_metadata(
                update.torrent_id,
                &name,
                clamp_i64(update.total_size),
                &file_entries(update),
            )
            .await?;
        self.metadata_seen.insert(update.torrent_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_engine::SwarmFileStat;

    fn update(status: TorrentStatus, error: Option<&str>) -> StatusUpdate {
        StatusUpdate {
            torrent_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            info_hash: "a".repeat(40),
            status,
            progress: 50.0,
            total_size: 1000,
            downloaded: 500,
            uploaded: 10,
            download_speed: 100,
            upload_speed: 5,
            peers: 2,
            seeds: 1,
            name: Some("pack".to_string()),
            files: vec![SwarmFileStat {
                path: "a.txt".to_string(),
                size: 1000,
                completed: 500,
            }],
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn errors_take_the_error_path() {
        let failed = update(TorrentStatus::Downloading, Some("tracker refused"));
        assert_eq!(classify(&failed), CommitPath::Error);
    }

    #[test]
    fn empty_error_strings_do_not_fail_the_record() {
        let noisy = update(TorrentStatus::Downloading, Some(""));
        assert_eq!(classify(&noisy), CommitPath::Progress);
    }

    #[test]
    fn completion_is_classified_before_progress() {
        let done = update(TorrentStatus::Completed, None);
        assert_eq!(classify(&done), CommitPath::Completion);
        let partial = update(TorrentStatus::Downloading, None);
        assert_eq!(classify(&partial), CommitPath::Progress);
    }

    #[test]
    fn error_wins_over_completion() {
        let both = update(TorrentStatus::Completed, Some("disk full"));
        assert_eq!(classify(&both), CommitPath::Error);
    }

    #[test]
    fn file_entries_clamp_and_carry_paths() {
        let mut done = update(TorrentStatus::Completed, None);
        done.files = vec![SwarmFileStat {
            path: "huge.bin".to_string(),
            size: u64::MAX,
            completed: 3,
        }];
        let entries = file_entries(&done);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "huge.bin");
        assert_eq!(entries[0].size, i64::MAX);
        assert_eq!(entries[0].progress, 3);
    }
}
