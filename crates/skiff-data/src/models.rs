//! Domain types persisted by the durable store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DataError;

/// Lifecycle states a torrent record can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentStatus {
    /// Accepted; metadata not yet known.
    Pending,
    /// Actively transferring pieces.
    Downloading,
    /// Complete and still attached to the swarm.
    Seeding,
    /// Every selected byte landed and the completion commit ran.
    Completed,
    /// Terminal failure; see `error_message`.
    Failed,
    /// Peer connections disallowed by the user.
    Paused,
    /// No peers and no progress.
    Stalled,
    /// Removed by the user before completion.
    Cancelled,
}

impl TorrentStatus {
    /// Stable wire/database label for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Stalled => "stalled",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a database label back into the enum.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::Corrupt`] for labels outside the status domain.
    pub fn parse(value: &str) -> Result<Self, DataError> {
        match value {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "seeding" => Ok(Self::Seeding),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "stalled" => Ok(Self::Stalled),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DataError::Corrupt {
                field: "torrents.status",
                value: other.to_string(),
            }),
        }
    }

    /// Whether the record counts against the concurrent-download quota.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Downloading)
    }

    /// Whether the record is terminal and holds no engine participant.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

/// One file inside a torrent payload, as persisted on the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentFileEntry {
    /// Path relative to the torrent root.
    pub path: String,
    /// Size in bytes.
    pub size: i64,
    /// Bytes downloaded and verified.
    pub progress: i64,
    /// Engine priority label (informational).
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_priority() -> String {
    "normal".to_string()
}

/// A torrent row.
#[derive(Debug, Clone)]
pub struct TorrentRecord {
    /// Record identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// 40-hex infohash.
    pub info_hash: String,
    /// Display name ('' until metadata is known).
    pub name: String,
    /// Original magnet URI when added by magnet.
    pub magnet_uri: Option<String>,
    /// Lifecycle state.
    pub status: TorrentStatus,
    /// Total payload size in bytes.
    pub total_size: i64,
    /// Bytes downloaded.
    pub downloaded: i64,
    /// Bytes uploaded.
    pub uploaded: i64,
    /// Completion percentage in `[0, 100]`.
    pub progress: f64,
    /// Last observed download speed (bytes/s).
    pub download_speed: i64,
    /// Last observed upload speed (bytes/s).
    pub upload_speed: i64,
    /// Established peers at last tick.
    pub peers: i32,
    /// Complete peers at last tick.
    pub seeds: i32,
    /// Persisted file listing.
    pub files: Vec<TorrentFileEntry>,
    /// Relative path of the packaged archive, once produced.
    pub zip_path: Option<String>,
    /// Size of the packaged archive in bytes.
    pub zip_size: i64,
    /// Failure detail for `failed` records.
    pub error_message: Option<String>,
    /// When the download first started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the completion commit ran. Set at most once.
    pub completed_at: Option<DateTime<Utc>>,
    /// Retention deadline, set with `completed_at`.
    pub expires_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Fields required to insert a torrent row.
#[derive(Debug, Clone)]
pub struct NewTorrent {
    /// Record identifier (caller-assigned).
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// 40-hex infohash.
    pub info_hash: String,
    /// Initial display name (may be '').
    pub name: String,
    /// Magnet URI when added by magnet.
    pub magnet_uri: Option<String>,
    /// Known payload size (0 for unresolved magnets).
    pub total_size: i64,
}

/// A download token row.
#[derive(Debug, Clone)]
pub struct DownloadToken {
    /// Row identifier.
    pub id: Uuid,
    /// Torrent the token grants access to.
    pub torrent_id: Uuid,
    /// File path within the torrent, or the archive marker.
    pub file_path: String,
    /// The opaque capability value.
    pub token: String,
    /// Validity deadline.
    pub expires_at: DateTime<Utc>,
    /// Maximum number of redemptions.
    pub max_downloads: i32,
    /// Redemptions so far.
    pub download_count: i32,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// Actions recorded in the usage log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageAction {
    /// A torrent was accepted for download.
    DownloadStarted,
    /// A torrent finished downloading.
    DownloadCompleted,
}

impl UsageAction {
    /// Stable database label for the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DownloadStarted => "download_started",
            Self::DownloadCompleted => "download_completed",
        }
    }
}

/// User roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Standard account.
    User,
    /// Paying account.
    Premium,
    /// Throwaway trial account.
    Demo,
    /// Operator account.
    Admin,
}

impl Role {
    /// Stable wire/database label for the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Premium => "premium",
            Self::Demo => "demo",
            Self::Admin => "admin",
        }
    }

    /// Parse a database label back into the enum.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::Corrupt`] for labels outside the role domain.
    pub fn parse(value: &str) -> Result<Self, DataError> {
        match value {
            "user" => Ok(Self::User),
            "premium" => Ok(Self::Premium),
            "demo" => Ok(Self::Demo),
            "admin" => Ok(Self::Admin),
            other => Err(DataError::Corrupt {
                field: "users.role",
                value: other.to_string(),
            }),
        }
    }
}

/// A user row.
#[derive(Debug, Clone)]
pub struct User {
    /// User identifier.
    pub id: Uuid,
    /// Login email.
    pub email: String,
    /// Argon2 password hash.
    pub password_hash: String,
    /// Account role.
    pub role: Role,
    /// External billing reference, when linked.
    pub plan_customer_ref: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
}

/// A subscription row (at most one per user).
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscribed user.
    pub user_id: Uuid,
    /// Plan name resolved against the plan table.
    pub plan_name: String,
    /// Billing status label.
    pub status: String,
    /// End of the paid period, when bounded.
    pub period_end: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_labels_round_trip() {
        for status in [
            TorrentStatus::Pending,
            TorrentStatus::Downloading,
            TorrentStatus::Seeding,
            TorrentStatus::Completed,
            TorrentStatus::Failed,
            TorrentStatus::Paused,
            TorrentStatus::Stalled,
            TorrentStatus::Cancelled,
        ] {
            assert_eq!(TorrentStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TorrentStatus::parse("limbo").is_err());
    }

    #[test]
    fn active_statuses_gate_the_quota() {
        assert!(TorrentStatus::Pending.is_active());
        assert!(TorrentStatus::Downloading.is_active());
        assert!(!TorrentStatus::Completed.is_active());
        assert!(!TorrentStatus::Paused.is_active());
    }

    #[test]
    fn terminal_statuses_have_no_participant() {
        assert!(TorrentStatus::Failed.is_terminal());
        assert!(TorrentStatus::Cancelled.is_terminal());
        assert!(!TorrentStatus::Seeding.is_terminal());
    }

    #[test]
    fn role_labels_round_trip() {
        for role in [Role::User, Role::Premium, Role::Demo, Role::Admin] {
            assert_eq!(Role::parse(role.as_str()).unwrap(), role);
        }
        assert!(Role::parse("root").is_err());
    }

    #[test]
    fn file_entry_defaults_priority_on_decode() {
        let entry: TorrentFileEntry =
            serde_json::from_str(r#"{"path":"a.txt","size":10,"progress":4}"#).unwrap();
        assert_eq!(entry.priority, "normal");
    }
}
