//! Download-token repository.
//!
//! A token is a bearer capability: the row is keyed by the opaque value and
//! is never enumerable by user. Consumption is one atomic statement so the
//! counter can never pass `max_downloads` under concurrent redemptions.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::error::{DataError, Result};
use crate::models::DownloadToken;
use crate::Store;

fn row_to_token(row: &PgRow) -> Result<DownloadToken> {
    Ok(DownloadToken {
        id: row.try_get("id")?,
        torrent_id: row.try_get("torrent_id")?,
        file_path: row.try_get("file_path")?,
        token: row.try_get("token")?,
        expires_at: row.try_get("expires_at")?,
        max_downloads: row.try_get("max_downloads")?,
        download_count: row.try_get("download_count")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Persist a freshly minted token.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub async fn insert_download_token(&self, token: &DownloadToken) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO download_tokens (id, torrent_id, file_path, token,
                                         expires_at, max_downloads, download_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(token.id)
        .bind(token.torrent_id)
        .bind(&token.file_path)
        .bind(&token.token)
        .bind(token.expires_at)
        .bind(token.max_downloads)
        .bind(token.download_count)
        .execute(self.pool())
        .await
        .map_err(DataError::query("tokens.insert"))?;
        Ok(())
    }

    /// Redeem a token: validate the expiry window and the redemption cap,
    /// and increment the counter, all in one statement. Returns the post-
    /// increment row, or `None` when the token is unknown, expired, or
    /// exhausted; the statement does not reveal which.
    ///
    /// # Errors
    ///
    /// Returns an error when the update fails.
    pub async fn consume_download_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DownloadToken>> {
        let row = sqlx::query(
            r"
            UPDATE download_tokens
            SET download_count = download_count + 1
            WHERE token = $1 AND expires_at > $2 AND download_count < max_downloads
            RETURNING id, torrent_id, file_path, token, expires_at,
                      max_downloads, download_count, created_at
            ",
        )
        .bind(token)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(DataError::query("tokens.consume"))?;
        row.as_ref().map(row_to_token).transpose()
    }

    /// Peek at a token without redeeming it (tests and admin tooling).
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn get_download_token(&self, token: &str) -> Result<Option<DownloadToken>> {
        let row = sqlx::query(
            r"
            SELECT id, torrent_id, file_path, token, expires_at,
                   max_downloads, download_count, created_at
            FROM download_tokens WHERE token = $1
            ",
        )
        .bind(token)
        .fetch_optional(self.pool())
        .await
        .map_err(DataError::query("tokens.get"))?;
        row.as_ref().map(row_to_token).transpose()
    }
}

/// Marker stored in `file_path` when the token grants the packaged archive
/// rather than an individual payload file.
pub const ARCHIVE_PATH_MARKER: &str = "::archive::";

/// Default redemption cap per token.
pub const DEFAULT_MAX_DOWNLOADS: i32 = 10;

/// Default validity window.
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy() {
        assert_eq!(DEFAULT_MAX_DOWNLOADS, 10);
        assert_eq!(DEFAULT_TOKEN_TTL_HOURS, 24);
    }

    #[test]
    fn archive_marker_cannot_collide_with_relative_paths() {
        // Engine paths are relative file names; the marker's colons keep it
        // outside that namespace.
        assert!(ARCHIVE_PATH_MARKER.starts_with("::"));
    }
}
