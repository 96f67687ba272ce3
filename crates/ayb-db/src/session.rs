//! Request-scoped RLS session gateway.
//!
//! Every piece of user-facing SQL runs inside a transaction this gateway
//! opened: the request's claims are injected as `ayb.*` session variables
//! and the connection switches to an unprivileged role so native PostgreSQL
//! row-level-security policies apply. Admin SQL bypasses the gateway and
//! runs on the pool's own role.

use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{
    error::DbError,
    schema::{quote_ident, TableDescriptor},
};

/// Claims injected into the database session for the duration of a request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionClaims {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub role: Option<String>,
}

impl SessionClaims {
    pub fn authenticated(user_id: Uuid, email: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            email: Some(email.into()),
            role: Some("authenticated".to_owned()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }
}

#[derive(Clone)]
pub struct RlsGateway {
    pool: PgPool,
    authenticated_role: String,
    anonymous_role: String,
}

impl RlsGateway {
    pub fn new(
        pool: PgPool,
        authenticated_role: impl Into<String>,
        anonymous_role: impl Into<String>,
    ) -> Result<Self, DbError> {
        let authenticated_role = authenticated_role.into();
        let anonymous_role = anonymous_role.into();
        validate_role(&authenticated_role)?;
        validate_role(&anonymous_role)?;
        Ok(Self {
            pool,
            authenticated_role,
            anonymous_role,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Opens a transaction with the claims applied. `set_config(..., true)`
    /// scopes the variables to the transaction, and `SET LOCAL ROLE` reverts
    /// on commit/rollback, so pooled connections never leak a session.
    pub async fn begin(
        &self,
        claims: &SessionClaims,
    ) -> Result<Transaction<'static, Postgres>, DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            SELECT set_config('ayb.user_id', $1, true),
                   set_config('ayb.user_email', $2, true),
                   set_config('ayb.user_role', $3, true)
            "#,
        )
        .bind(claims.user_id.map(|id| id.to_string()).unwrap_or_default())
        .bind(claims.email.clone().unwrap_or_default())
        .bind(claims.role.clone().unwrap_or_default())
        .execute(&mut *tx)
        .await?;

        let role = if claims.is_anonymous() {
            &self.anonymous_role
        } else {
            &self.authenticated_role
        };
        sqlx::query(&format!("SET LOCAL ROLE {}", quote_ident(role)))
            .execute(&mut *tx)
            .await?;

        Ok(tx)
    }

    /// Probe used by the realtime hub: does a row with this primary key
    /// exist for these claims right now?
    pub async fn visible(
        &self,
        claims: &SessionClaims,
        table: &TableDescriptor,
        pk_value: &str,
    ) -> Result<bool, DbError> {
        let pk = table
            .primary_key
            .as_deref()
            .and_then(|name| table.column(name))
            .ok_or_else(|| {
                DbError::not_found(format!(
                    "table \"{}\" has no single-column primary key",
                    table.name
                ))
            })?;

        let mut tx = self.begin(claims).await?;
        let sql = format!(
            "SELECT 1 AS hit FROM {} WHERE {} = $1::{} LIMIT 1",
            table.qualified(),
            quote_ident(&pk.name),
            pk.pg_type.cast_name(),
        );
        let row = sqlx::query(&sql)
            .bind(pk_value)
            .fetch_optional(&mut *tx)
            .await?;
        tx.rollback().await.ok();
        Ok(row.map(|r| r.try_get::<i32, _>("hit").is_ok()).unwrap_or(false))
    }
}

fn validate_role(role: &str) -> Result<(), DbError> {
    let valid = !role.is_empty()
        && role
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DbError::validation(format!("invalid role name \"{role}\"")))
    }
}
