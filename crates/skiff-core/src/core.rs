//! The lifecycle core façade.
//!
//! One [`TorrentCore`] exists per process. It owns the registry, the update
//! channel, and the long-lived tasks (updater, reducer, sweeper), and it is
//! the only path through which the HTTP layer touches the engine: admission
//! with quota gating, pause/resume, removal, projections, download-token
//! minting, and token redemption all live here.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde_json::json;
use skiff_data::tokens::{ARCHIVE_PATH_MARKER, DEFAULT_MAX_DOWNLOADS, DEFAULT_TOKEN_TTL_HOURS};
use skiff_data::{
    plans, DownloadToken, NewTorrent, Plan, Role, Store, TorrentRecord, TorrentStatus, UsageAction,
};
use skiff_engine::{EngineError, SharedHandle, SwarmClient, SwarmReader, READ_AHEAD_BYTES};
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::package::{guarded_join, staging_relative, Packager};
use crate::projection::{detail_from, project_live, TorrentDetail, TorrentProjection};
use crate::registry::{InsertOutcome, ManagedTorrent, Registry};
use crate::reducer::Reducer;
use crate::reload::Reloader;
use crate::retention::{delete_staging, Sweeper};
use crate::update::Updater;

/// Absolute deadline for metadata resolution after an add.
pub const METADATA_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Validated caller identity handed in by the HTTP layer.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    /// Authenticated user id.
    pub user_id: Uuid,
    /// Authenticated role.
    pub role: Role,
}

impl Caller {
    /// Whether the caller holds the operator role.
    #[must_use]
    pub const fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }

    /// Whether the caller may act on a record owned by `owner`.
    #[must_use]
    pub fn can_access(&self, owner: Uuid) -> bool {
        self.is_admin() || self.user_id == owner
    }
}

/// Construction parameters for the core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Staging directory for payloads and archives.
    pub staging_root: PathBuf,
    /// System-wide ceiling hint for active torrents.
    pub max_concurrent: usize,
}

/// Result of an admission call.
pub struct AddOutcome {
    /// The (possibly pre-existing) record.
    pub record: TorrentRecord,
    /// `false` when the caller re-added their own live infohash.
    pub created: bool,
}

/// An opened, authorised download.
pub struct Download {
    /// Positioned reader over the artefact.
    pub reader: SwarmReader,
    /// Basename offered in `Content-Disposition`.
    pub filename: String,
}

/// Process-lifetime owner of all live swarm state.
pub struct TorrentCore {
    client: Arc<dyn SwarmClient>,
    store: Store,
    registry: Arc<Registry>,
    packager: Arc<Packager>,
    sweeper: Arc<Sweeper>,
    config: CoreConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TorrentCore {
    /// Wire the core's collaborators. Call [`TorrentCore::start`] afterwards.
    #[must_use]
    pub fn new(client: Arc<dyn SwarmClient>, store: Store, config: CoreConfig) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let packager = Arc::new(Packager::new(store.clone(), config.staging_root.clone()));
        let sweeper = Arc::new(Sweeper::new(
            store.clone(),
            Arc::clone(&client),
            Arc::clone(&registry),
            config.staging_root.clone(),
        ));
        Arc::new(Self {
            client,
            store,
            registry,
            packager,
            sweeper,
            config,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The shared registry (SSE and tests read it directly).
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The durable store.
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// Reload persisted state and spawn the long-lived tasks.
    ///
    /// # Errors
    ///
    /// Returns an error when the reload scan fails.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let reloader = Reloader::new(
            Arc::clone(&self.client),
            self.store.clone(),
            Arc::clone(&self.registry),
        );
        let loaded = reloader.run().await?;
        info!(loaded, "lifecycle core reloaded persisted torrents");

        let (updater, rx) = Updater::new(Arc::clone(&self.registry));
        let reducer = Reducer::new(self.store.clone(), Arc::clone(&self.packager));

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(updater.run(self.cancel.child_token())));
        tasks.push(tokio::spawn(reducer.run(rx, self.cancel.child_token())));
        tasks.push(tokio::spawn(
            Arc::clone(&self.sweeper).run(self.cancel.child_token()),
        ));
        Ok(())
    }

    /// Stop the long-lived tasks and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn resolve_plan(&self, user_id: Uuid) -> Result<Plan> {
        let Some(user) = self.store.user_by_id(user_id).await? else {
            return Ok(plans::FREE);
        };
        let subscription = self.store.subscription_for(user_id).await?;
        Ok(plans::resolve(user.role, subscription.as_ref()))
    }

    /// Quota gate applied before the engine sees the request.
    async fn admission_check(&self, user_id: Uuid) -> Result<Plan> {
        if self.registry.len() >= self.config.max_concurrent {
            return Err(CoreError::Capacity);
        }
        let plan = self.resolve_plan(user_id).await?;
        let active = self.store.count_active_torrents(user_id).await?;
        if active >= plan.concurrent_limit {
            return Err(CoreError::ConcurrentLimit {
                limit: plan.concurrent_limit,
            });
        }
        if let Some(limit) = plan.limit_bytes_per_month {
            let used = self.store.monthly_usage(user_id, Utc::now()).await?;
            if used >= limit {
                return Err(CoreError::BandwidthLimit { limit });
            }
        }
        Ok(plan)
    }

    /// Accept a magnet link.
    ///
    /// # Errors
    ///
    /// Quota violations, duplicate infohashes, invalid magnets, and engine or
    /// store failures.
    pub async fn add_magnet(&self, caller: &Caller, uri: &str) -> Result<AddOutcome> {
        let plan = self.admission_check(caller.user_id).await?;
        let handle = self.client.add_magnet(uri).await.map_err(map_add_error)?;
        self.admit(caller, handle, Some(uri.to_string()), plan).await
    }

    /// Accept raw `.torrent` metainfo bytes.
    ///
    /// # Errors
    ///
    /// Quota violations, duplicate infohashes, invalid metainfo, and engine
    /// or store failures.
    pub async fn add_metainfo(&self, caller: &Caller, bytes: &[u8]) -> Result<AddOutcome> {
        let plan = self.admission_check(caller.user_id).await?;
        let handle = self
            .client
            .add_metainfo(bytes)
            .await
            .map_err(map_add_error)?;
        self.admit(caller, handle, None, plan).await
    }

    async fn admit(
        &self,
        caller: &Caller,
        handle: SharedHandle,
        magnet_uri: Option<String>,
        plan: Plan,
    ) -> Result<AddOutcome> {
        let info_hash = handle.info_hash().to_lowercase();
        let id = Uuid::new_v4();
        let entry = Arc::new(ManagedTorrent::new(
            id,
            caller.user_id,
            info_hash.clone(),
            Arc::clone(&handle),
        ));

        match self.registry.insert_if_absent(Arc::clone(&entry)) {
            InsertOutcome::Existing(existing) => {
                if existing.user_id == caller.user_id {
                    let record = self
                        .store
                        .get_torrent(existing.id)
                        .await?
                        .ok_or(CoreError::NotFound)?;
                    return Ok(AddOutcome {
                        record,
                        created: false,
                    });
                }
                return Err(CoreError::Duplicate {
                    existing_id: existing.id,
                });
            }
            InsertOutcome::Inserted => {}
        }

        // Metainfo adds know their size up front; hold them to the monthly
        // allowance before a record exists.
        let stats = handle.stats();
        if let Some(limit) = plan.limit_bytes_per_month {
            let used = self.store.monthly_usage(caller.user_id, Utc::now()).await?;
            let incoming = i64::try_from(stats.total_bytes).unwrap_or(i64::MAX);
            if stats.total_bytes > 0 && used.saturating_add(incoming) > limit {
                self.rollback_admission(&info_hash).await;
                return Err(CoreError::BandwidthLimit { limit });
            }
        }

        let new = NewTorrent {
            id,
            user_id: caller.user_id,
            info_hash: info_hash.clone(),
            name: handle.name().unwrap_or_default(),
            magnet_uri,
            total_size: i64::try_from(stats.total_bytes).unwrap_or(i64::MAX),
        };
        if let Err(err) = self.store.insert_torrent(&new).await {
            self.rollback_admission(&info_hash).await;
            return Err(err.into());
        }

        if let Err(err) = self
            .store
            .log_usage(
                caller.user_id,
                UsageAction::DownloadStarted,
                0,
                json!({ "torrent_id": id, "info_hash": info_hash }),
            )
            .await
        {
            warn!(torrent_id = %id, error = %err, "failed to log acceptance");
        }

        arm_metadata_deadline(entry, self.store.clone());

        let record = self
            .store
            .get_torrent(id)
            .await?
            .ok_or(CoreError::NotFound)?;
        Ok(AddOutcome {
            record,
            created: true,
        })
    }

    async fn rollback_admission(&self, info_hash: &str) {
        self.registry.remove(info_hash);
        if let Err(err) = self.client.remove(info_hash, false).await {
            warn!(info_hash, error = %err, "failed to roll back engine add");
        }
    }

    async fn owned_record(&self, caller: &Caller, id: Uuid) -> Result<TorrentRecord> {
        let record = self
            .store
            .get_torrent(id)
            .await?
            .ok_or(CoreError::NotFound)?;
        if !caller.can_access(record.user_id) {
            return Err(CoreError::Forbidden);
        }
        Ok(record)
    }

    fn live_entry(&self, record: &TorrentRecord) -> Option<Arc<ManagedTorrent>> {
        self.registry
            .lookup(&record.info_hash)
            .filter(|entry| entry.id == record.id)
    }

    /// Pause a download (zero peer connections allowed).
    ///
    /// # Errors
    ///
    /// Unknown ids, foreign records, inactive torrents, engine failures.
    pub async fn pause(&self, caller: &Caller, id: Uuid) -> Result<()> {
        let record = self.owned_record(caller, id).await?;
        let entry = self
            .live_entry(&record)
            .ok_or_else(|| CoreError::invalid("torrent is not active"))?;
        entry.handle.pause().await?;
        self.store
            .set_torrent_status(id, TorrentStatus::Paused)
            .await?;
        Ok(())
    }

    /// Resume a paused download, restoring the configured peer ceiling.
    ///
    /// # Errors
    ///
    /// Unknown ids, foreign records, inactive torrents, engine failures.
    pub async fn resume(&self, caller: &Caller, id: Uuid) -> Result<()> {
        let record = self.owned_record(caller, id).await?;
        let entry = self
            .live_entry(&record)
            .ok_or_else(|| CoreError::invalid("torrent is not active"))?;
        entry.handle.resume().await?;
        self.store
            .set_torrent_status(id, TorrentStatus::Downloading)
            .await?;
        Ok(())
    }

    /// Drop a torrent. With `delete_files`, the bytes and the row both go;
    /// without, the engine participant is dropped and the record is kept as
    /// `cancelled`.
    ///
    /// # Errors
    ///
    /// Unknown ids, foreign records, store failures.
    pub async fn remove(&self, caller: &Caller, id: Uuid, delete_files: bool) -> Result<()> {
        let record = self.owned_record(caller, id).await?;
        if let Some(entry) = self.live_entry(&record) {
            if let Err(err) = self.client.remove(&entry.info_hash, delete_files).await {
                warn!(torrent_id = %id, error = %err, "engine drop failed during removal");
            }
            self.registry.remove(&entry.info_hash);
        }
        if delete_files {
            delete_staging(&self.config.staging_root, &record).await;
            self.store.delete_torrent(id).await?;
        } else {
            self.store
                .set_torrent_status(id, TorrentStatus::Cancelled)
                .await?;
        }
        Ok(())
    }

    /// Paginated listing for the caller, merged with live engine stats.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn list(
        &self,
        caller: &Caller,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<TorrentDetail>, i64)> {
        let offset = (page - 1).max(0) * page_size;
        let records = self
            .store
            .list_torrents(caller.user_id, page_size, offset)
            .await?;
        let total = self.store.count_torrents(caller.user_id).await?;
        let details = records
            .iter()
            .map(|record| detail_from(record, self.live_entry(record).as_deref()))
            .collect();
        Ok((details, total))
    }

    /// Single-record detail, merged with live engine stats.
    ///
    /// # Errors
    ///
    /// Unknown ids, foreign records, store failures.
    pub async fn get(&self, caller: &Caller, id: Uuid) -> Result<TorrentDetail> {
        let record = self.owned_record(caller, id).await?;
        Ok(detail_from(&record, self.live_entry(&record).as_deref()))
    }

    /// Live projections for one user's participants (SSE payload).
    #[must_use]
    pub fn projections_for_user(&self, user_id: Uuid) -> Vec<TorrentProjection> {
        self.registry
            .iter_by_user(user_id)
            .iter()
            .map(|entry| project_live(entry))
            .collect()
    }

    /// Live projections for every participant (admin SSE payload).
    #[must_use]
    pub fn projections_all(&self) -> Vec<TorrentProjection> {
        self.registry
            .iter()
            .iter()
            .map(|entry| project_live(entry))
            .collect()
    }

    /// Mint a download token for a finished torrent.
    ///
    /// # Errors
    ///
    /// Unknown ids, foreign records, unfinished torrents, unknown file
    /// paths, missing archives, store failures.
    pub async fn mint_token(
        &self,
        caller: &Caller,
        id: Uuid,
        file_path: Option<String>,
        use_zip: bool,
    ) -> Result<DownloadToken> {
        let record = self.owned_record(caller, id).await?;
        if !matches!(
            record.status,
            TorrentStatus::Completed | TorrentStatus::Seeding
        ) {
            return Err(CoreError::NotCompleted);
        }

        let file_path = if use_zip {
            if record.zip_path.is_none() {
                return Err(CoreError::ArchiveUnavailable);
            }
            ARCHIVE_PATH_MARKER.to_string()
        } else {
            let requested = file_path.unwrap_or_default();
            if requested.is_empty() {
                match record.files.as_slice() {
                    [only] => only.path.clone(),
                    _ => {
                        return Err(CoreError::UnknownFile {
                            path: String::new(),
                        });
                    }
                }
            } else if record.files.iter().any(|file| file.path == requested) {
                requested
            } else {
                return Err(CoreError::UnknownFile { path: requested });
            }
        };

        let now = Utc::now();
        let token = DownloadToken {
            id: Uuid::new_v4(),
            torrent_id: record.id,
            file_path,
            token: generate_token(),
            expires_at: now + ChronoDuration::hours(DEFAULT_TOKEN_TTL_HOURS),
            max_downloads: DEFAULT_MAX_DOWNLOADS,
            download_count: 0,
            created_at: now,
        };
        self.store.insert_download_token(&token).await?;
        Ok(token)
    }

    /// Redeem a download token and open the artefact.
    ///
    /// # Errors
    ///
    /// [`CoreError::TokenNotFound`] / [`CoreError::TokenGone`] for unknown,
    /// expired, or exhausted tokens; filesystem or engine failures otherwise.
    pub async fn open_download(&self, token: &str) -> Result<Download> {
        let now = Utc::now();
        let Some(consumed) = self.store.consume_download_token(token, now).await? else {
            // Distinguish "never existed" from "expired or exhausted" for the
            // status code; the body stays non-revealing either way.
            return Err(match self.store.get_download_token(token).await? {
                Some(_) => CoreError::TokenGone,
                None => CoreError::TokenNotFound,
            });
        };

        let record = self
            .store
            .get_torrent(consumed.torrent_id)
            .await?
            .ok_or(CoreError::TokenNotFound)?;

        if consumed.file_path == ARCHIVE_PATH_MARKER {
            let zip_rel = record
                .zip_path
                .clone()
                .ok_or(CoreError::ArchiveUnavailable)?;
            let reader = self.open_staged(Path::new(&zip_rel)).await?;
            return Ok(Download {
                reader,
                filename: basename(&zip_rel),
            });
        }

        let filename = basename(&consumed.file_path);
        if let Some(entry) = self.live_entry(&record) {
            match entry.handle.open_reader(&consumed.file_path).await {
                Ok(reader) => return Ok(Download { reader, filename }),
                Err(EngineError::UnknownFile { path }) => {
                    return Err(CoreError::UnknownFile { path });
                }
                Err(err) => {
                    warn!(torrent_id = %record.id, error = %err,
                          "engine reader unavailable, serving from staging");
                }
            }
        }

        // No live participant (or its reader failed): serve the staged bytes.
        let relative = staging_relative(&record.name, record.files.len() > 1, &consumed.file_path);
        let reader = self.open_staged(&relative).await?;
        Ok(Download { reader, filename })
    }

    async fn open_staged(&self, relative: &Path) -> Result<SwarmReader> {
        let path = guarded_join(&self.config.staging_root, relative)?;
        let file = tokio::fs::File::open(&path).await?;
        let length = file.metadata().await?.len();
        Ok(SwarmReader {
            reader: Box::pin(BufReader::with_capacity(READ_AHEAD_BYTES, file)),
            length,
        })
    }

    /// Run one retention sweep immediately (admin surface).
    ///
    /// # Errors
    ///
    /// Store failures during the expiry scan.
    pub async fn sweep_now(&self) -> Result<usize> {
        self.sweeper.sweep_once(Utc::now()).await
    }

    /// Count of live participants.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.registry.len()
    }
}

fn map_add_error(err: EngineError) -> CoreError {
    match err {
        EngineError::InvalidMagnet { .. } | EngineError::InvalidMetainfo { .. } => {
            CoreError::invalid(err.to_string())
        }
        other => CoreError::Engine(other),
    }
}

/// Basename of a relative artefact path, for `Content-Disposition`.
#[must_use]
pub fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map_or_else(|| path.to_string(), |name| name.to_string_lossy().into_owned())
}

/// Generate a 256-bit URL-safe download token.
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0_u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Arm the asynchronous await-info → start-download sequence with the
/// 5-minute absolute deadline. On deadline or engine failure a failed update
/// is synthesised on the participant and the record is failed directly so
/// the transition is visible before the next tick.
pub fn arm_metadata_deadline(entry: Arc<ManagedTorrent>, store: Store) {
    tokio::spawn(async move {
        let outcome = tokio::time::timeout(METADATA_DEADLINE, entry.handle.await_info()).await;
        let failure = match outcome {
            Ok(Ok(())) => match entry.handle.start().await {
                Ok(()) => None,
                Err(err) => Some(format!("failed to start download: {err}")),
            },
            Ok(Err(err)) => Some(format!("metadata fetch failed: {err}")),
            Err(_) => Some("metadata fetch timed out".to_string()),
        };
        if let Some(message) = failure {
            entry.mark_failed(message.clone());
            if let Err(err) = store.mark_torrent_failed(entry.id, &message).await {
                warn!(torrent_id = %entry.id, error = %err, "failed to persist failure");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_url_safe_and_long_enough() {
        let token = generate_token();
        // 32 bytes without padding encode to 43 characters.
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'));
    }

    #[test]
    fn tokens_do_not_repeat() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("pack/sub/a.txt"), "a.txt");
        assert_eq!(basename("hello.bin"), "hello.bin");
    }

    #[test]
    fn admins_access_everything_owners_only_their_own() {
        let owner = Uuid::new_v4();
        let caller = Caller {
            user_id: owner,
            role: Role::User,
        };
        assert!(caller.can_access(owner));
        assert!(!caller.can_access(Uuid::new_v4()));

        let admin = Caller {
            user_id: Uuid::new_v4(),
            role: Role::Admin,
        };
        assert!(admin.can_access(owner));
    }
}
