//! Snapshots of torrent state for broadcast and API responses.

use chrono::{DateTime, Utc};
use serde::Serialize;
use skiff_data::{TorrentFileEntry, TorrentRecord, TorrentStatus};
use uuid::Uuid;

use crate::registry::ManagedTorrent;
use crate::reducer::file_entries;
use crate::update::{build_update, StatusUpdate};

/// Live snapshot of one participant, as pushed over SSE.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentProjection {
    /// Durable record id.
    pub id: Uuid,
    /// 40-hex infohash.
    pub info_hash: String,
    /// Derived lifecycle status.
    pub status: TorrentStatus,
    /// Completion percentage in `[0, 100]`.
    pub progress: f64,
    /// Bytes downloaded and verified.
    pub downloaded: u64,
    /// Bytes uploaded.
    pub uploaded: u64,
    /// Download speed at the last tick (bytes/s).
    pub download_speed: u64,
    /// Upload speed at the last tick (bytes/s).
    pub upload_speed: u64,
    /// Established peers.
    pub peers: u32,
    /// Complete peers.
    pub seeds: u32,
    /// Display name ('' until metadata is known).
    pub name: String,
    /// Total payload size.
    pub total_size: u64,
    /// Per-file listing, omitted until metadata is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<TorrentFileEntry>>,
    /// Failure detail, when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build the broadcast projection for one live participant.
#[must_use]
pub fn project_live(entry: &ManagedTorrent) -> TorrentProjection {
    let stats = entry.handle.stats();
    // Reuse the updater's derivation so SSE and the reducer agree, but keep
    // the previously derived speeds: a projection must not advance the
    // updater's counters.
    let (update, _) = build_update(entry, &stats, std::time::Instant::now());
    let tick = entry.tick_state();
    projection_from_update(&update, tick.last_download_speed, tick.last_upload_speed)
}

fn projection_from_update(
    update: &StatusUpdate,
    download_speed: u64,
    upload_speed: u64,
) -> TorrentProjection {
    TorrentProjection {
        id: update.torrent_id,
        info_hash: update.info_hash.clone(),
        status: update.status,
        progress: update.progress,
        downloaded: update.downloaded,
        uploaded: update.uploaded,
        download_speed,
        upload_speed,
        peers: update.peers,
        seeds: update.seeds,
        name: update.name.clone().unwrap_or_default(),
        total_size: update.total_size,
        files: if update.files.is_empty() {
            None
        } else {
            Some(file_entries(update))
        },
        error: update.error.clone(),
    }
}

/// Full record view returned by the torrent endpoints, merged with live
/// engine numbers when the participant is still in memory.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentDetail {
    /// Durable record id.
    pub id: Uuid,
    /// 40-hex infohash.
    pub info_hash: String,
    /// Display name.
    pub name: String,
    /// Lifecycle status.
    pub status: TorrentStatus,
    /// Completion percentage.
    pub progress: f64,
    /// Total payload size.
    pub total_size: i64,
    /// Bytes downloaded.
    pub downloaded: i64,
    /// Bytes uploaded.
    pub uploaded: i64,
    /// Download speed (bytes/s).
    pub download_speed: i64,
    /// Upload speed (bytes/s).
    pub upload_speed: i64,
    /// Established peers.
    pub peers: i32,
    /// Complete peers.
    pub seeds: i32,
    /// Persisted file listing.
    pub files: Vec<TorrentFileEntry>,
    /// Relative archive path, when packaged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_path: Option<String>,
    /// Archive size in bytes.
    pub zip_size: i64,
    /// Failure detail, when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the download started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the completion commit ran.
    pub completed_at: Option<DateTime<Utc>>,
    /// Retention deadline.
    pub expires_at: Option<DateTime<Utc>>,
    /// Record creation time.
    pub created_at: DateTime<Utc>,
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Merge a persisted record with the live participant, if one exists.
///
/// Terminal statuses on the record are authoritative; otherwise live numbers
/// win because they are at most one tick fresher than the row.
#[must_use]
pub fn detail_from(record: &TorrentRecord, live: Option<&ManagedTorrent>) -> TorrentDetail {
    let mut detail = TorrentDetail {
        id: record.id,
        info_hash: record.info_hash.clone(),
        name: record.name.clone(),
        status: record.status,
        progress: record.progress,
        total_size: record.total_size,
        downloaded: record.downloaded,
        uploaded: record.uploaded,
        download_speed: record.download_speed,
        upload_speed: record.upload_speed,
        peers: record.peers,
        seeds: record.seeds,
        files: record.files.clone(),
        zip_path: record.zip_path.clone(),
        zip_size: record.zip_size,
        error_message: record.error_message.clone(),
        started_at: record.started_at,
        completed_at: record.completed_at,
        expires_at: record.expires_at,
        created_at: record.created_at,
    };

    if record.status.is_terminal() {
        return detail;
    }
    let Some(entry) = live else {
        return detail;
    };

    let projection = project_live(entry);
    detail.progress = projection.progress.max(detail.progress);
    detail.downloaded = clamp_i64(projection.downloaded).max(detail.downloaded);
    detail.uploaded = clamp_i64(projection.uploaded).max(detail.uploaded);
    detail.download_speed = clamp_i64(projection.download_speed);
    detail.upload_speed = clamp_i64(projection.upload_speed);
    detail.peers = i32::try_from(projection.peers).unwrap_or(i32::MAX);
    detail.seeds = i32::try_from(projection.seeds).unwrap_or(i32::MAX);
    if record.completed_at.is_none() {
        detail.status = projection.status;
    }
    if detail.name.is_empty() {
        detail.name = projection.name;
    }
    if detail.files.is_empty() {
        if let Some(files) = projection.files {
            detail.files = files;
        }
    }
    if detail.total_size == 0 {
        detail.total_size = clamp_i64(projection.total_size);
    }
    detail
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_data::TorrentStatus;

    fn record(status: TorrentStatus) -> TorrentRecord {
        TorrentRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            info_hash: "d".repeat(40),
            name: "pack".to_string(),
            magnet_uri: None,
            status,
            total_size: 100,
            downloaded: 40,
            uploaded: 5,
            progress: 40.0,
            download_speed: 10,
            upload_speed: 1,
            peers: 3,
            seeds: 1,
            files: Vec::new(),
            zip_path: None,
            zip_size: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn detail_without_live_entry_mirrors_the_record() {
        let rec = record(TorrentStatus::Downloading);
        let detail = detail_from(&rec, None);
        assert_eq!(detail.status, TorrentStatus::Downloading);
        assert_eq!(detail.downloaded, 40);
    }

    #[test]
    fn terminal_records_ignore_live_state() {
        let rec = record(TorrentStatus::Cancelled);
        let detail = detail_from(&rec, None);
        assert_eq!(detail.status, TorrentStatus::Cancelled);
    }

    #[test]
    fn projection_serialises_with_snake_case_status() {
        let projection = TorrentProjection {
            id: Uuid::nil(),
            info_hash: "e".repeat(40),
            status: TorrentStatus::Downloading,
            progress: 12.5,
            downloaded: 10,
            uploaded: 2,
            download_speed: 100,
            upload_speed: 20,
            peers: 4,
            seeds: 2,
            name: "pack".to_string(),
            total_size: 80,
            files: None,
            error: None,
        };
        let json = serde_json::to_value(&projection).expect("serialises");
        assert_eq!(json["status"], "downloading");
        assert!(json.get("files").is_none());
        assert!(json.get("error").is_none());
    }
}
