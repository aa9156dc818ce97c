//! Usage accounting.
//!
//! Append-only log aggregated by calendar month (UTC). Only completion rows
//! carry real byte counts; acceptance rows exist for audit trails.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{DataError, Result};
use crate::models::UsageAction;
use crate::Store;

/// First instant of the month containing `now`, in UTC.
#[must_use]
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

impl Store {
    /// Append one usage row.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub async fn log_usage(
        &self,
        user_id: Uuid,
        action: UsageAction,
        bytes_transferred: i64,
        metadata: Value,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO usage_logs (id, user_id, action, bytes_transferred, metadata)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(action.as_str())
        .bind(bytes_transferred)
        .bind(Json(metadata))
        .execute(self.pool())
        .await
        .map_err(DataError::query("usage.log"))?;
        Ok(())
    }

    /// Sum of bytes charged to the user this month. Only completed downloads
    /// count against the monthly allowance.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn monthly_usage(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            r"
            SELECT COALESCE(SUM(bytes_transferred), 0)::BIGINT
            FROM usage_logs
            WHERE user_id = $1 AND action = 'download_completed' AND created_at >= $2
            ",
        )
        .bind(user_id)
        .bind(month_start(now))
        .fetch_one(self.pool())
        .await
        .map_err(DataError::query("usage.monthly"))?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_start_truncates_to_first() {
        let now = Utc.with_ymd_and_hms(2026, 7, 19, 13, 45, 12).unwrap();
        let start = month_start(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn month_start_is_identity_on_the_boundary() {
        let boundary = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(month_start(boundary), boundary);
    }
}
