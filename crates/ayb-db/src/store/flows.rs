//! Single-use auth-flow tokens: email verification, password reset, magic
//! links, SMS OTP codes. All token values arrive pre-hashed.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::{error::DbError, Db};

#[derive(Clone, Debug)]
pub struct SmsCodeRecord {
    pub id: Uuid,
    pub phone: String,
    pub code_hash: String,
    pub attempts: i32,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl Db {
    pub async fn insert_email_verification(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO _ayb_email_verifications (user_id, token_hash, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Consumes the token atomically; returns the owning user when the token
    /// was live.
    pub async fn consume_email_verification(
        &self,
        token_hash: &str,
    ) -> Result<Option<Uuid>, DbError> {
        consume_flow_token(self, "_ayb_email_verifications", token_hash).await
    }

    pub async fn insert_password_reset(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO _ayb_password_resets (user_id, token_hash, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn consume_password_reset(&self, token_hash: &str) -> Result<Option<Uuid>, DbError> {
        consume_flow_token(self, "_ayb_password_resets", token_hash).await
    }

    pub async fn insert_magic_link(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO _ayb_magic_links (user_id, token_hash, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn consume_magic_link(&self, token_hash: &str) -> Result<Option<Uuid>, DbError> {
        consume_flow_token(self, "_ayb_magic_links", token_hash).await
    }

    pub async fn insert_sms_code(
        &self,
        phone: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO _ayb_sms_codes (phone, code_hash, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(phone)
        .bind(code_hash)
        .bind(expires_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Most recent live code for the phone number.
    pub async fn latest_sms_code(&self, phone: &str) -> Result<Option<SmsCodeRecord>, DbError> {
        let row = sqlx::query(
            r#"
            SELECT id, phone, code_hash, attempts, expires_at, used_at
            FROM _ayb_sms_codes
            WHERE phone = $1 AND used_at IS NULL AND expires_at > now()
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(phone)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(SmsCodeRecord {
                id: row.try_get("id").map_err(DbError::from)?,
                phone: row.try_get("phone").map_err(DbError::from)?,
                code_hash: row.try_get("code_hash").map_err(DbError::from)?,
                attempts: row.try_get("attempts").map_err(DbError::from)?,
                expires_at: row.try_get("expires_at").map_err(DbError::from)?,
                used_at: row.try_get("used_at").map_err(DbError::from)?,
            })
        })
        .transpose()
    }

    pub async fn bump_sms_attempts(&self, id: Uuid) -> Result<i32, DbError> {
        let row = sqlx::query(
            "UPDATE _ayb_sms_codes SET attempts = attempts + 1 WHERE id = $1 RETURNING attempts",
        )
        .bind(id)
        .fetch_one(self.pool())
        .await?;
        row.try_get("attempts").map_err(DbError::from)
    }

    pub async fn consume_sms_code(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE _ayb_sms_codes SET used_at = now() WHERE id = $1 AND used_at IS NULL",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Scheduled cleanup: removes expired or consumed auth-flow tokens.
    pub async fn prune_expired_auth_tokens(&self) -> Result<u64, DbError> {
        let mut total = 0;
        for table in [
            "_ayb_email_verifications",
            "_ayb_password_resets",
            "_ayb_magic_links",
            "_ayb_sms_codes",
        ] {
            let result = sqlx::query(&format!(
                "DELETE FROM {table} WHERE expires_at < now() OR used_at IS NOT NULL"
            ))
            .execute(self.pool())
            .await?;
            total += result.rows_affected();
        }
        Ok(total)
    }
}

/// `UPDATE … WHERE used_at IS NULL RETURNING user_id` over one of the
/// single-use token tables; the table name is a compile-time constant.
async fn consume_flow_token(
    db: &Db,
    table: &'static str,
    token_hash: &str,
) -> Result<Option<Uuid>, DbError> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE {table}
        SET used_at = now()
        WHERE token_hash = $1 AND used_at IS NULL AND expires_at > now()
        RETURNING user_id
        "#
    ))
    .bind(token_hash)
    .fetch_optional(db.pool())
    .await?;

    row.map(|row| row.try_get("user_id").map_err(DbError::from))
        .transpose()
}
