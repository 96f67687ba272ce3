//! `_ayb_apps` and `_ayb_api_keys`.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::{error::DbError, Db};

#[derive(Clone, Debug)]
pub struct AppRecord {
    pub id: Uuid,
    pub name: String,
    pub owner_user_id: Option<Uuid>,
    pub rate_limit_rps: i32,
    pub rate_limit_window_seconds: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub app_id: Option<Uuid>,
    pub name: String,
    pub key_prefix: String,
    pub scope: String,
    pub allowed_tables: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map(|e| e > now).unwrap_or(true)
    }

    /// Empty list means every table.
    pub fn allows_table(&self, table: &str) -> bool {
        self.allowed_tables.is_empty() || self.allowed_tables.iter().any(|t| t == table)
    }
}

fn map_app(row: sqlx::postgres::PgRow) -> Result<AppRecord, DbError> {
    Ok(AppRecord {
        id: row.try_get("id").map_err(DbError::from)?,
        name: row.try_get("name").map_err(DbError::from)?,
        owner_user_id: row.try_get("owner_user_id").map_err(DbError::from)?,
        rate_limit_rps: row.try_get("rate_limit_rps").map_err(DbError::from)?,
        rate_limit_window_seconds: row
            .try_get("rate_limit_window_seconds")
            .map_err(DbError::from)?,
        created_at: row.try_get("created_at").map_err(DbError::from)?,
    })
}

fn map_api_key(row: sqlx::postgres::PgRow) -> Result<ApiKeyRecord, DbError> {
    Ok(ApiKeyRecord {
        id: row.try_get("id").map_err(DbError::from)?,
        user_id: row.try_get("user_id").map_err(DbError::from)?,
        app_id: row.try_get("app_id").map_err(DbError::from)?,
        name: row.try_get("name").map_err(DbError::from)?,
        key_prefix: row.try_get("key_prefix").map_err(DbError::from)?,
        scope: row.try_get("scope").map_err(DbError::from)?,
        allowed_tables: row.try_get("allowed_tables").map_err(DbError::from)?,
        expires_at: row.try_get("expires_at").map_err(DbError::from)?,
        revoked_at: row.try_get("revoked_at").map_err(DbError::from)?,
        created_at: row.try_get("created_at").map_err(DbError::from)?,
    })
}

impl Db {
    pub async fn create_app(
        &self,
        name: &str,
        owner_user_id: Option<Uuid>,
        rate_limit_rps: i32,
        rate_limit_window_seconds: i32,
    ) -> Result<AppRecord, DbError> {
        let row = sqlx::query(
            r#"
            INSERT INTO _ayb_apps (name, owner_user_id, rate_limit_rps, rate_limit_window_seconds)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(owner_user_id)
        .bind(rate_limit_rps)
        .bind(rate_limit_window_seconds)
        .fetch_one(self.pool())
        .await?;
        map_app(row)
    }

    pub async fn fetch_app(&self, id: Uuid) -> Result<Option<AppRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM _ayb_apps WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(map_app).transpose()
    }

    pub async fn list_apps(&self) -> Result<Vec<AppRecord>, DbError> {
        let rows = sqlx::query("SELECT * FROM _ayb_apps ORDER BY created_at DESC")
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(map_app).collect()
    }

    pub async fn update_app(
        &self,
        id: Uuid,
        name: &str,
        rate_limit_rps: i32,
        rate_limit_window_seconds: i32,
    ) -> Result<Option<AppRecord>, DbError> {
        let row = sqlx::query(
            r#"
            UPDATE _ayb_apps
            SET name = $1, rate_limit_rps = $2, rate_limit_window_seconds = $3
            WHERE id = $4
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(rate_limit_rps)
        .bind(rate_limit_window_seconds)
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(map_app).transpose()
    }

    pub async fn delete_app(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM _ayb_apps WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_api_key(
        &self,
        user_id: Option<Uuid>,
        app_id: Option<Uuid>,
        name: &str,
        key_hash: &str,
        key_prefix: &str,
        scope: &str,
        allowed_tables: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKeyRecord, DbError> {
        let row = sqlx::query(
            r#"
            INSERT INTO _ayb_api_keys (
                user_id, app_id, name, key_hash, key_prefix,
                scope, allowed_tables, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(app_id)
        .bind(name)
        .bind(key_hash)
        .bind(key_prefix)
        .bind(scope)
        .bind(allowed_tables)
        .bind(expires_at)
        .fetch_one(self.pool())
        .await?;
        map_api_key(row)
    }

    pub async fn find_api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiKeyRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM _ayb_api_keys WHERE key_hash = $1")
            .bind(key_hash)
            .fetch_optional(self.pool())
            .await?;
        row.map(map_api_key).transpose()
    }

    pub async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, DbError> {
        let rows = sqlx::query("SELECT * FROM _ayb_api_keys ORDER BY created_at DESC")
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(map_api_key).collect()
    }

    pub async fn revoke_api_key(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE _ayb_api_keys SET revoked_at = now() WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(allowed: &[&str]) -> ApiKeyRecord {
        ApiKeyRecord {
            id: Uuid::new_v4(),
            user_id: None,
            app_id: None,
            name: "test".into(),
            key_prefix: "ayb_abc".into(),
            scope: "user".into(),
            allowed_tables: allowed.iter().map(|s| s.to_string()).collect(),
            expires_at: None,
            revoked_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_allowlist_permits_everything() {
        assert!(key(&[]).allows_table("posts"));
        assert!(key(&["posts"]).allows_table("posts"));
        assert!(!key(&["posts"]).allows_table("users"));
    }

    #[test]
    fn usability_honors_expiry_and_revocation() {
        let now = Utc::now();
        let mut k = key(&[]);
        assert!(k.is_usable(now));
        k.expires_at = Some(now - chrono::Duration::minutes(1));
        assert!(!k.is_usable(now));
        k.expires_at = None;
        k.revoked_at = Some(now);
        assert!(!k.is_usable(now));
    }
}
