//! OAuth authorization-server tables plus consumer account links.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::{error::DbError, Db};

#[derive(Clone, Debug)]
pub struct OauthClientRecord {
    pub client_id: String,
    pub app_id: Option<Uuid>,
    pub client_secret_hash: Option<String>,
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub scopes: Vec<String>,
    pub client_type: String,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OauthClientRecord {
    pub fn is_public(&self) -> bool {
        self.client_type == "public"
    }
}

#[derive(Clone, Debug)]
pub struct AuthorizationCodeRecord {
    pub code_hash: String,
    pub client_id: String,
    pub user_id: Uuid,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub code_challenge: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct OauthTokenRecord {
    pub id: Uuid,
    pub access_token_hash: String,
    pub refresh_token_hash: Option<String>,
    pub grant_id: Uuid,
    pub client_id: String,
    pub user_id: Option<Uuid>,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub refresh_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub rotated_from_id: Option<Uuid>,
}

#[derive(Clone, Debug)]
pub struct OauthAccountRecord {
    pub provider: String,
    pub provider_user_id: String,
    pub user_id: Uuid,
    pub email: Option<String>,
    pub name: Option<String>,
}

fn map_client(row: sqlx::postgres::PgRow) -> Result<OauthClientRecord, DbError> {
    Ok(OauthClientRecord {
        client_id: row.try_get("client_id").map_err(DbError::from)?,
        app_id: row.try_get("app_id").map_err(DbError::from)?,
        client_secret_hash: row.try_get("client_secret_hash").map_err(DbError::from)?,
        client_name: row.try_get("client_name").map_err(DbError::from)?,
        redirect_uris: row.try_get("redirect_uris").map_err(DbError::from)?,
        scopes: row.try_get("scopes").map_err(DbError::from)?,
        client_type: row.try_get("client_type").map_err(DbError::from)?,
        revoked_at: row.try_get("revoked_at").map_err(DbError::from)?,
        created_at: row.try_get("created_at").map_err(DbError::from)?,
    })
}

fn map_token(row: sqlx::postgres::PgRow) -> Result<OauthTokenRecord, DbError> {
    Ok(OauthTokenRecord {
        id: row.try_get("id").map_err(DbError::from)?,
        access_token_hash: row.try_get("access_token_hash").map_err(DbError::from)?,
        refresh_token_hash: row.try_get("refresh_token_hash").map_err(DbError::from)?,
        grant_id: row.try_get("grant_id").map_err(DbError::from)?,
        client_id: row.try_get("client_id").map_err(DbError::from)?,
        user_id: row.try_get("user_id").map_err(DbError::from)?,
        scopes: row.try_get("scopes").map_err(DbError::from)?,
        expires_at: row.try_get("expires_at").map_err(DbError::from)?,
        refresh_expires_at: row.try_get("refresh_expires_at").map_err(DbError::from)?,
        refresh_used_at: row.try_get("refresh_used_at").map_err(DbError::from)?,
        revoked_at: row.try_get("revoked_at").map_err(DbError::from)?,
        rotated_from_id: row.try_get("rotated_from_id").map_err(DbError::from)?,
    })
}

impl Db {
    #[allow(clippy::too_many_arguments)]
    pub async fn create_oauth_client(
        &self,
        client_id: &str,
        app_id: Option<Uuid>,
        client_secret_hash: Option<&str>,
        client_name: &str,
        redirect_uris: &[String],
        scopes: &[String],
        client_type: &str,
    ) -> Result<OauthClientRecord, DbError> {
        let row = sqlx::query(
            r#"
            INSERT INTO _ayb_oauth_clients (
                client_id, app_id, client_secret_hash, client_name,
                redirect_uris, scopes, client_type
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(client_id)
        .bind(app_id)
        .bind(client_secret_hash)
        .bind(client_name)
        .bind(redirect_uris)
        .bind(scopes)
        .bind(client_type)
        .fetch_one(self.pool())
        .await?;
        map_client(row)
    }

    pub async fn fetch_oauth_client(
        &self,
        client_id: &str,
    ) -> Result<Option<OauthClientRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM _ayb_oauth_clients WHERE client_id = $1")
            .bind(client_id)
            .fetch_optional(self.pool())
            .await?;
        row.map(map_client).transpose()
    }

    pub async fn list_oauth_clients(&self) -> Result<Vec<OauthClientRecord>, DbError> {
        let rows = sqlx::query("SELECT * FROM _ayb_oauth_clients ORDER BY created_at DESC")
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(map_client).collect()
    }

    pub async fn revoke_oauth_client(&self, client_id: &str) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE _ayb_oauth_clients SET revoked_at = now() WHERE client_id = $1 AND revoked_at IS NULL",
        )
        .bind(client_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_authorization_code(
        &self,
        code_hash: &str,
        client_id: &str,
        user_id: Uuid,
        redirect_uri: &str,
        scopes: &[String],
        code_challenge: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO _ayb_oauth_authorization_codes (
                code_hash, client_id, user_id, redirect_uri,
                scopes, code_challenge, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(code_hash)
        .bind(client_id)
        .bind(user_id)
        .bind(redirect_uri)
        .bind(scopes)
        .bind(code_challenge)
        .bind(expires_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Atomic single-use consumption of an authorization code.
    pub async fn consume_authorization_code(
        &self,
        code_hash: &str,
    ) -> Result<Option<AuthorizationCodeRecord>, DbError> {
        let row = sqlx::query(
            r#"
            UPDATE _ayb_oauth_authorization_codes
            SET used_at = now()
            WHERE code_hash = $1 AND used_at IS NULL AND expires_at > now()
            RETURNING code_hash, client_id, user_id, redirect_uri,
                      scopes, code_challenge, expires_at
            "#,
        )
        .bind(code_hash)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(AuthorizationCodeRecord {
                code_hash: row.try_get("code_hash").map_err(DbError::from)?,
                client_id: row.try_get("client_id").map_err(DbError::from)?,
                user_id: row.try_get("user_id").map_err(DbError::from)?,
                redirect_uri: row.try_get("redirect_uri").map_err(DbError::from)?,
                scopes: row.try_get("scopes").map_err(DbError::from)?,
                code_challenge: row.try_get("code_challenge").map_err(DbError::from)?,
                expires_at: row.try_get("expires_at").map_err(DbError::from)?,
            })
        })
        .transpose()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_oauth_token(
        &self,
        access_token_hash: &str,
        refresh_token_hash: Option<&str>,
        grant_id: Uuid,
        client_id: &str,
        user_id: Option<Uuid>,
        scopes: &[String],
        expires_at: DateTime<Utc>,
        refresh_expires_at: Option<DateTime<Utc>>,
        rotated_from_id: Option<Uuid>,
    ) -> Result<OauthTokenRecord, DbError> {
        let row = sqlx::query(
            r#"
            INSERT INTO _ayb_oauth_tokens (
                access_token_hash, refresh_token_hash, grant_id, client_id,
                user_id, scopes, expires_at, refresh_expires_at, rotated_from_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(access_token_hash)
        .bind(refresh_token_hash)
        .bind(grant_id)
        .bind(client_id)
        .bind(user_id)
        .bind(scopes)
        .bind(expires_at)
        .bind(refresh_expires_at)
        .bind(rotated_from_id)
        .fetch_one(self.pool())
        .await?;
        map_token(row)
    }

    pub async fn find_oauth_token_by_access_hash(
        &self,
        access_token_hash: &str,
    ) -> Result<Option<OauthTokenRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM _ayb_oauth_tokens WHERE access_token_hash = $1")
            .bind(access_token_hash)
            .fetch_optional(self.pool())
            .await?;
        row.map(map_token).transpose()
    }

    pub async fn find_oauth_token_by_refresh_hash(
        &self,
        refresh_token_hash: &str,
    ) -> Result<Option<OauthTokenRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM _ayb_oauth_tokens WHERE refresh_token_hash = $1")
            .bind(refresh_token_hash)
            .fetch_optional(self.pool())
            .await?;
        row.map(map_token).transpose()
    }

    /// Marks the refresh half of a token row consumed. Returns `false` when
    /// it was already used — the reuse-detection trigger.
    pub async fn mark_oauth_refresh_used(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE _ayb_oauth_tokens SET refresh_used_at = now() WHERE id = $1 AND refresh_used_at IS NULL",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn revoke_oauth_token(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE _ayb_oauth_tokens SET revoked_at = now() WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cascade revocation of every token in a grant.
    pub async fn revoke_oauth_grant(&self, grant_id: Uuid) -> Result<u64, DbError> {
        let result = sqlx::query(
            "UPDATE _ayb_oauth_tokens SET revoked_at = now() WHERE grant_id = $1 AND revoked_at IS NULL",
        )
        .bind(grant_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn find_oauth_consent(
        &self,
        user_id: Uuid,
        client_id: &str,
    ) -> Result<Option<Vec<String>>, DbError> {
        let row = sqlx::query(
            "SELECT scopes FROM _ayb_oauth_consents WHERE user_id = $1 AND client_id = $2",
        )
        .bind(user_id)
        .bind(client_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|row| row.try_get("scopes").map_err(DbError::from))
            .transpose()
    }

    pub async fn upsert_oauth_consent(
        &self,
        user_id: Uuid,
        client_id: &str,
        scopes: &[String],
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO _ayb_oauth_consents (user_id, client_id, scopes)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, client_id)
            DO UPDATE SET scopes = EXCLUDED.scopes, granted_at = now()
            "#,
        )
        .bind(user_id)
        .bind(client_id)
        .bind(scopes)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn upsert_oauth_account(
        &self,
        provider: &str,
        provider_user_id: &str,
        user_id: Uuid,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO _ayb_oauth_accounts (provider, provider_user_id, user_id, email, name)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (provider, provider_user_id)
            DO UPDATE SET email = EXCLUDED.email, name = EXCLUDED.name
            "#,
        )
        .bind(provider)
        .bind(provider_user_id)
        .bind(user_id)
        .bind(email)
        .bind(name)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn find_oauth_account(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<OauthAccountRecord>, DbError> {
        let row = sqlx::query(
            "SELECT * FROM _ayb_oauth_accounts WHERE provider = $1 AND provider_user_id = $2",
        )
        .bind(provider)
        .bind(provider_user_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(OauthAccountRecord {
                provider: row.try_get("provider").map_err(DbError::from)?,
                provider_user_id: row.try_get("provider_user_id").map_err(DbError::from)?,
                user_id: row.try_get("user_id").map_err(DbError::from)?,
                email: row.try_get("email").map_err(DbError::from)?,
                name: row.try_get("name").map_err(DbError::from)?,
            })
        })
        .transpose()
    }

    /// Scheduled cleanup for the OAuth tables.
    pub async fn prune_expired_oauth(&self) -> Result<u64, DbError> {
        let mut total = 0;
        let codes = sqlx::query(
            "DELETE FROM _ayb_oauth_authorization_codes WHERE expires_at < now() OR used_at IS NOT NULL",
        )
        .execute(self.pool())
        .await?;
        total += codes.rows_affected();

        let tokens = sqlx::query(
            r#"
            DELETE FROM _ayb_oauth_tokens
            WHERE expires_at < now()
              AND (refresh_expires_at IS NULL OR refresh_expires_at < now())
            "#,
        )
        .execute(self.pool())
        .await?;
        total += tokens.rows_affected();
        Ok(total)
    }
}
