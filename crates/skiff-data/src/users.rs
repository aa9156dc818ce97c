//! Users, subscriptions, and refresh-token revocation.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{DataError, Result};
use crate::models::{Role, Subscription, User};
use crate::Store;

fn row_to_user(row: &PgRow) -> Result<User> {
    let role_label: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        role: Role::parse(&role_label)?,
        plan_customer_ref: row.try_get("plan_customer_ref")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_subscription(row: &PgRow) -> Result<Subscription> {
    Ok(Subscription {
        user_id: row.try_get("user_id")?,
        plan_name: row.try_get("plan_name")?,
        status: row.try_get("status")?,
        period_end: row.try_get("period_end")?,
    })
}

const USER_COLUMNS: &str = "id, email, password_hash, role, plan_customer_ref, created_at";

impl Store {
    /// Insert a new user.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails (including unique-email
    /// violations, surfaced as a query failure).
    pub async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO users (id, email, password_hash, role, plan_customer_ref)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(&user.plan_customer_ref)
        .execute(self.pool())
        .await
        .map_err(DataError::query("users.insert"))?;
        Ok(())
    }

    /// Look a user up by login email.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or the row is corrupt.
    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
            .bind(email)
            .fetch_optional(self.pool())
            .await
            .map_err(DataError::query("users.by_email"))?;
        row.as_ref().map(row_to_user).transpose()
    }

    /// Look a user up by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or the row is corrupt.
    pub async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(DataError::query("users.by_id"))?;
        row.as_ref().map(row_to_user).transpose()
    }

    /// Total registered users.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn count_users(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(self.pool())
            .await
            .map_err(DataError::query("users.count"))?;
        Ok(count)
    }

    /// Page through users, oldest first (admin surface).
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails or a row is corrupt.
    pub async fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY created_at LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await
        .map_err(DataError::query("users.list"))?;
        rows.iter().map(row_to_user).collect()
    }

    /// Fetch the user's subscription, if any.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn subscription_for(&self, user_id: Uuid) -> Result<Option<Subscription>> {
        let row = sqlx::query(
            "SELECT user_id, plan_name, status, period_end FROM subscriptions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(DataError::query("subscriptions.for_user"))?;
        row.as_ref().map(row_to_subscription).transpose()
    }

    /// Create or replace the user's subscription (one row per user).
    ///
    /// # Errors
    ///
    /// Returns an error when the upsert fails.
    pub async fn upsert_subscription(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO subscriptions (id, user_id, plan_name, status, period_end)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id)
            DO UPDATE SET plan_name = EXCLUDED.plan_name,
                          status = EXCLUDED.status,
                          period_end = EXCLUDED.period_end
            ",
        )
        .bind(Uuid::new_v4())
        .bind(subscription.user_id)
        .bind(&subscription.plan_name)
        .bind(&subscription.status)
        .bind(subscription.period_end)
        .execute(self.pool())
        .await
        .map_err(DataError::query("subscriptions.upsert"))?;
        Ok(())
    }

    /// Register an issued refresh token for later revocation checks.
    ///
    /// # Errors
    ///
    /// Returns an error when the insert fails.
    pub async fn insert_refresh_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .execute(self.pool())
        .await
        .map_err(DataError::query("refresh_tokens.insert"))?;
        Ok(())
    }

    /// Whether an issued refresh token is still redeemable.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn refresh_token_active(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM refresh_tokens WHERE token_hash = $1 AND expires_at > $2",
        )
        .bind(token_hash)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(DataError::query("refresh_tokens.active"))?;
        Ok(count > 0)
    }

    /// Revoke one issued refresh token.
    ///
    /// # Errors
    ///
    /// Returns an error when the delete fails.
    pub async fn revoke_refresh_token(&self, token_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .execute(self.pool())
            .await
            .map_err(DataError::query("refresh_tokens.revoke"))?;
        Ok(())
    }
}
