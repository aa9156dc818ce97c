//! Torrent record repository.
//!
//! Every mutation the reducer performs is a single statement so concurrent
//! readers never observe a half-applied commit. Completion is made idempotent
//! by guarding on `completed_at IS NULL` and reporting whether the guard hit.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{DataError, Result};
use crate::models::{NewTorrent, TorrentFileEntry, TorrentRecord, TorrentStatus};
use crate::Store;

const TORRENT_COLUMNS: &str = r"
    id, user_id, info_hash, name, magnet_uri, status, total_size, downloaded,
    uploaded, progress, download_speed, upload_speed, peers, seeds, files,
    zip_path, zip_size, error_message, started_at, completed_at, expires_at,
    created_at
";

fn select_torrents(where_clause: &str) -> String {
    format!("SELECT {TORRENT_COLUMNS} FROM torrents {where_clause}")
}

fn row_to_record(row: &PgRow) -> Result<TorrentRecord> {
    let status_label: String = row.try_get("status")?;
    let files: Json<Value> = row.try_get("files")?;
    let files: Vec<TorrentFileEntry> =
        serde_json::from_value(files.0).map_err(|_| DataError::Corrupt {
            field: "torrents.files",
            value: "unparseable file listing".to_string(),
        })?;
    Ok(TorrentRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        info_hash: row.try_get::<String, _>("info_hash")?.trim().to_string(),
        name: row.try_get("name")?,
        magnet_uri: row.try_get("magnet_uri")?,
        status: TorrentStatus::parse(&status_label)?,
        total_size: row.try_get("total_size")?,
        downloaded: row.try_get("downloaded")?,
        uploaded: row.try_get("uploaded")?,
        progress: row.try_get("progress")?,
        download_speed: row.try_get("download_speed")?,
        upload_speed: row.try_get("upload_speed")?,
        peers: row.try_get("peers")?,
        seeds: row.try_get("seeds")?,
        files,
        zip_path: row.try_get("zip_path")?,
        zip_size: row.try_get("zip_size")?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Insert a freshly accepted torrent in `pending` state.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub async fn insert_torrent(&self, new: &NewTorrent) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO torrents (id, user_id, info_hash, name, magnet_uri,
                                  status, total_size, started_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, now())
            ",
        )
        .bind(new.id)
        .bind(new.user_id)
        .bind(&new.info_hash)
        .bind(&new.name)
        .bind(&new.magnet_uri)
        .bind(new.total_size)
        .execute(self.pool())
        .await
        .map_err(DataError::query("torrents.insert"))?;
        Ok(())
    }

    /// Fetch one record by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or the row is corrupt.
    pub async fn get_torrent(&self, id: Uuid) -> Result<Option<TorrentRecord>> {
        let row = sqlx::query(&select_torrents("WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(DataError::query("torrents.get"))?;
        row.as_ref().map(row_to_record).transpose()
    }

    /// Page through one user's records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a row is corrupt.
    pub async fn list_torrents(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TorrentRecord>> {
        let rows = sqlx::query(&select_torrents(
            "WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .map_err(DataError::query("torrents.list"))?;
        rows.iter().map(row_to_record).collect()
    }

    /// Count one user's records.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn count_torrents(&self, user_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM torrents WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(self.pool())
            .await
            .map_err(DataError::query("torrents.count"))?;
        Ok(count)
    }

    /// Page through every record, newest first (admin surface).
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a row is corrupt.
    pub async fn list_all_torrents(&self, limit: i64, offset: i64) -> Result<Vec<TorrentRecord>> {
        let rows = sqlx::query(&select_torrents(
            "ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .map_err(DataError::query("torrents.list_all"))?;
        rows.iter().map(row_to_record).collect()
    }

    /// Records that should be rehydrated into the engine after a restart:
    /// everything that is not terminally failed or cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a row is corrupt.
    pub async fn load_non_terminal(&self) -> Result<Vec<TorrentRecord>> {
        let rows = sqlx::query(&select_torrents(
            "WHERE status NOT IN ('failed', 'cancelled') ORDER BY created_at",
        ))
        .fetch_all(self.pool())
        .await
        .map_err(DataError::query("torrents.load_non_terminal"))?;
        rows.iter().map(row_to_record).collect()
    }

    /// Count records holding a concurrency slot for the user.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn count_active_torrents(&self, user_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM torrents WHERE user_id = $1 AND status IN ('pending', 'downloading')",
        )
        .bind(user_id)
        .fetch_one(self.pool())
        .await
        .map_err(DataError::query("torrents.count_active"))?;
        Ok(count)
    }

    /// Persist one progress tick.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_torrent_progress(
        &self,
        id: Uuid,
        status: TorrentStatus,
        progress: f64,
        downloaded: i64,
        uploaded: i64,
        download_speed: i64,
        upload_speed: i64,
        peers: i32,
        seeds: i32,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE torrents
            SET status = $2, progress = $3, downloaded = $4, uploaded = $5,
                download_speed = $6, upload_speed = $7, peers = $8, seeds = $9
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(progress)
        .bind(downloaded)
        .bind(uploaded)
        .bind(download_speed)
        .bind(upload_speed)
        .bind(peers)
        .bind(seeds)
        .execute(self.pool())
        .await
        .map_err(DataError::query("torrents.update_progress"))?;
        Ok(())
    }

    /// Persist metadata once the engine reports it. The stored name is only
    /// replaced while still blank, keeping user-visible names stable.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn update_torrent_metadata(
        &self,
        id: Uuid,
        name: &str,
        total_size: i64,
        files: &[TorrentFileEntry],
    ) -> Result<()> {
        let files = serde_json::to_value(files).unwrap_or(Value::Array(Vec::new()));
        sqlx::query(
            r"
            UPDATE torrents
            SET name = CASE WHEN name = '' THEN $2 ELSE name END,
                total_size = $3,
                files = $4
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(name)
        .bind(total_size)
        .bind(Json(files))
        .execute(self.pool())
        .await
        .map_err(DataError::query("torrents.update_metadata"))?;
        Ok(())
    }

    /// Commit the completion transition. Returns `true` when this call won
    /// the commit; `false` when `completed_at` was already set, in which case
    /// neither `completed_at` nor `expires_at` changed.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn mark_torrent_completed(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE torrents
            SET status = 'completed', progress = 100, downloaded = total_size,
                completed_at = $2, expires_at = $3, error_message = NULL
            WHERE id = $1 AND completed_at IS NULL
            ",
        )
        .bind(id)
        .bind(completed_at)
        .bind(expires_at)
        .execute(self.pool())
        .await
        .map_err(DataError::query("torrents.mark_completed"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a terminal failure.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn mark_torrent_failed(&self, id: Uuid, message: &str) -> Result<()> {
        sqlx::query("UPDATE torrents SET status = 'failed', error_message = $2 WHERE id = $1")
            .bind(id)
            .bind(message)
            .execute(self.pool())
            .await
            .map_err(DataError::query("torrents.mark_failed"))?;
        Ok(())
    }

    /// Overwrite the lifecycle status (pause/resume/cancel paths).
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn set_torrent_status(&self, id: Uuid, status: TorrentStatus) -> Result<()> {
        sqlx::query("UPDATE torrents SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(self.pool())
            .await
            .map_err(DataError::query("torrents.set_status"))?;
        Ok(())
    }

    /// Record the packaged archive produced for a multi-file torrent.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn set_torrent_archive(
        &self,
        id: Uuid,
        zip_path: &str,
        zip_size: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE torrents SET zip_path = $2, zip_size = $3 WHERE id = $1")
            .bind(id)
            .bind(zip_path)
            .bind(zip_size)
            .execute(self.pool())
            .await
            .map_err(DataError::query("torrents.set_archive"))?;
        Ok(())
    }

    /// Delete the record; dependent tokens cascade.
    ///
    /// # Errors
    ///
    /// Returns an error when the delete fails.
    pub async fn delete_torrent(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM torrents WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(DataError::query("torrents.delete"))?;
        Ok(())
    }

    /// Records whose retention deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a row is corrupt.
    pub async fn expired_torrents(&self, now: DateTime<Utc>) -> Result<Vec<TorrentRecord>> {
        let rows = sqlx::query(&select_torrents("WHERE expires_at IS NOT NULL AND expires_at < $1"))
            .bind(now)
            .fetch_all(self.pool())
            .await
            .map_err(DataError::query("torrents.expired"))?;
        rows.iter().map(row_to_record).collect()
    }

    /// Aggregate counts for the admin stats surface:
    /// `(total_records, active_records, completed_bytes)`.
    ///
    /// # Errors
    ///
    /// Returns an error when a query fails.
    pub async fn torrent_totals(&self) -> Result<(i64, i64, i64)> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status IN ('pending', 'downloading')) AS active,
                   COALESCE(SUM(total_size) FILTER (WHERE status IN ('completed', 'seeding')), 0)::BIGINT AS bytes
            FROM torrents
            ",
        )
        .fetch_one(self.pool())
        .await
        .map_err(DataError::query("torrents.totals"))?;
        Ok((
            row.try_get("total")?,
            row.try_get("active")?,
            row.try_get("bytes")?,
        ))
    }
}
