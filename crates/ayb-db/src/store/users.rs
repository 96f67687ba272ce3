//! Identity rows: `_ayb_users` and `_ayb_sessions`.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::{error::DbError, Db};

#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: Uuid,
    pub email: String,
    pub phone: Option<String>,
    pub password_hash: Option<String>,
    pub email_verified: bool,
    pub mfa_secret: Option<String>,
    pub mfa_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub refresh_token_hash: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

fn map_user(row: sqlx::postgres::PgRow) -> Result<UserRecord, DbError> {
    Ok(UserRecord {
        id: row.try_get("id").map_err(DbError::from)?,
        email: row.try_get("email").map_err(DbError::from)?,
        phone: row.try_get("phone").map_err(DbError::from)?,
        password_hash: row.try_get("password_hash").map_err(DbError::from)?,
        email_verified: row.try_get("email_verified").map_err(DbError::from)?,
        mfa_secret: row.try_get("mfa_secret").map_err(DbError::from)?,
        mfa_enabled: row.try_get("mfa_enabled").map_err(DbError::from)?,
        created_at: row.try_get("created_at").map_err(DbError::from)?,
        updated_at: row.try_get("updated_at").map_err(DbError::from)?,
    })
}

impl Db {
    /// Inserts a user; the email is stored lowercased.
    pub async fn create_user(
        &self,
        email: &str,
        password_hash: Option<&str>,
    ) -> Result<UserRecord, DbError> {
        let row = sqlx::query(
            r#"
            INSERT INTO _ayb_users (email, password_hash)
            VALUES (lower($1), $2)
            RETURNING *
            "#,
        )
        .bind(email)
        .bind(password_hash)
        .fetch_one(self.pool())
        .await?;
        map_user(row)
    }

    pub async fn fetch_user(&self, id: Uuid) -> Result<Option<UserRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM _ayb_users WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(map_user).transpose()
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM _ayb_users WHERE lower(email) = lower($1)")
            .bind(email)
            .fetch_optional(self.pool())
            .await?;
        row.map(map_user).transpose()
    }

    pub async fn find_user_by_phone(&self, phone: &str) -> Result<Option<UserRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM _ayb_users WHERE phone = $1")
            .bind(phone)
            .fetch_optional(self.pool())
            .await?;
        row.map(map_user).transpose()
    }

    pub async fn set_user_password(&self, id: Uuid, password_hash: &str) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE _ayb_users SET password_hash = $1, updated_at = now() WHERE id = $2",
        )
        .bind(password_hash)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_email_verified(&self, id: Uuid) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE _ayb_users SET email_verified = TRUE, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_user_mfa_secret(&self, id: Uuid, secret: &str) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE _ayb_users SET mfa_secret = $1, mfa_enabled = FALSE, updated_at = now() WHERE id = $2",
        )
        .bind(secret)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_user_mfa_enabled(&self, id: Uuid, enabled: bool) -> Result<(), DbError> {
        sqlx::query("UPDATE _ayb_users SET mfa_enabled = $1, updated_at = now() WHERE id = $2")
            .bind(enabled)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Removes the user; sessions, keys and OAuth links cascade.
    pub async fn delete_user(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM _ayb_users WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_session(
        &self,
        refresh_token_hash: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO _ayb_sessions (refresh_token_hash, user_id, expires_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(refresh_token_hash)
        .bind(user_id)
        .bind(expires_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Single-use consumption: the row is deleted as it is read, so a second
    /// use of the same refresh token finds nothing.
    pub async fn consume_session(
        &self,
        refresh_token_hash: &str,
    ) -> Result<Option<SessionRecord>, DbError> {
        let row = sqlx::query(
            r#"
            DELETE FROM _ayb_sessions
            WHERE refresh_token_hash = $1
            RETURNING refresh_token_hash, user_id, expires_at
            "#,
        )
        .bind(refresh_token_hash)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(SessionRecord {
                refresh_token_hash: row.try_get("refresh_token_hash").map_err(DbError::from)?,
                user_id: row.try_get("user_id").map_err(DbError::from)?,
                expires_at: row.try_get("expires_at").map_err(DbError::from)?,
            })
        })
        .transpose()
    }

    pub async fn delete_sessions_for_user(&self, user_id: Uuid) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM _ayb_sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn prune_expired_sessions(&self) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM _ayb_sessions WHERE expires_at < now()")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
