//! `_ayb_webhooks` and `_ayb_webhook_deliveries`.
//!
//! Delivery rows are written with the caller's connection so enqueueing
//! participates in the originating write transaction.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::{error::DbError, Db};

#[derive(Clone, Debug)]
pub struct WebhookRecord {
    pub id: Uuid,
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
    pub tables: Vec<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookDeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl WebhookDeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookDeliveryStatus::Pending => "pending",
            WebhookDeliveryStatus::Delivered => "delivered",
            WebhookDeliveryStatus::Failed => "failed",
        }
    }
}

impl FromStr for WebhookDeliveryStatus {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WebhookDeliveryStatus::Pending),
            "delivered" => Ok(WebhookDeliveryStatus::Delivered),
            "failed" => Ok(WebhookDeliveryStatus::Failed),
            other => Err(DbError::validation(format!(
                "unknown delivery status \"{other}\""
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WebhookDeliveryRecord {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event: Value,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: WebhookDeliveryStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn map_webhook(row: sqlx::postgres::PgRow) -> Result<WebhookRecord, DbError> {
    Ok(WebhookRecord {
        id: row.try_get("id").map_err(DbError::from)?,
        url: row.try_get("url").map_err(DbError::from)?,
        secret: row.try_get("secret").map_err(DbError::from)?,
        events: row.try_get("events").map_err(DbError::from)?,
        tables: row.try_get("tables").map_err(DbError::from)?,
        enabled: row.try_get("enabled").map_err(DbError::from)?,
        created_at: row.try_get("created_at").map_err(DbError::from)?,
    })
}

fn map_delivery(row: sqlx::postgres::PgRow) -> Result<WebhookDeliveryRecord, DbError> {
    let status: String = row.try_get("status").map_err(DbError::from)?;
    Ok(WebhookDeliveryRecord {
        id: row.try_get("id").map_err(DbError::from)?,
        webhook_id: row.try_get("webhook_id").map_err(DbError::from)?,
        event: row.try_get("event").map_err(DbError::from)?,
        attempts: row.try_get("attempts").map_err(DbError::from)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(DbError::from)?,
        status: status.parse()?,
        last_error: row.try_get("last_error").map_err(DbError::from)?,
        created_at: row.try_get("created_at").map_err(DbError::from)?,
    })
}

/// Inserts a pending delivery on the supplied connection — typically the
/// transaction of the write that produced the event.
pub async fn insert_delivery(
    conn: &mut PgConnection,
    webhook_id: Uuid,
    event: &Value,
) -> Result<Uuid, DbError> {
    let row = sqlx::query(
        "INSERT INTO _ayb_webhook_deliveries (webhook_id, event) VALUES ($1, $2) RETURNING id",
    )
    .bind(webhook_id)
    .bind(event)
    .fetch_one(conn)
    .await?;
    row.try_get("id").map_err(DbError::from)
}

impl Db {
    pub async fn create_webhook(
        &self,
        url: &str,
        secret: &str,
        events: &[String],
        tables: &[String],
        enabled: bool,
    ) -> Result<WebhookRecord, DbError> {
        let row = sqlx::query(
            r#"
            INSERT INTO _ayb_webhooks (url, secret, events, tables, enabled)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(url)
        .bind(secret)
        .bind(events)
        .bind(tables)
        .bind(enabled)
        .fetch_one(self.pool())
        .await?;
        map_webhook(row)
    }

    pub async fn fetch_webhook(&self, id: Uuid) -> Result<Option<WebhookRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM _ayb_webhooks WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(map_webhook).transpose()
    }

    pub async fn list_webhooks(&self) -> Result<Vec<WebhookRecord>, DbError> {
        let rows = sqlx::query("SELECT * FROM _ayb_webhooks ORDER BY created_at DESC")
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(map_webhook).collect()
    }

    pub async fn delete_webhook(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM _ayb_webhooks WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_webhook_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE _ayb_webhooks SET enabled = $1 WHERE id = $2")
            .bind(enabled)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Webhooks subscribed to `(table, action)`. Empty filter arrays match
    /// everything.
    pub async fn matching_webhooks(
        &self,
        table: &str,
        action: &str,
    ) -> Result<Vec<WebhookRecord>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM _ayb_webhooks
            WHERE enabled
              AND (cardinality(tables) = 0 OR $1 = ANY (tables))
              AND (cardinality(events) = 0 OR $2 = ANY (events))
            "#,
        )
        .bind(table)
        .bind(action)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(map_webhook).collect()
    }

    /// Claims due deliveries for a dispatcher worker, bumping `attempts`.
    pub async fn claim_due_deliveries(
        &self,
        limit: i64,
    ) -> Result<Vec<WebhookDeliveryRecord>, DbError> {
        let rows = sqlx::query(
            r#"
            UPDATE _ayb_webhook_deliveries
            SET attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM _ayb_webhook_deliveries
                WHERE status = 'pending' AND next_attempt_at <= now()
                ORDER BY next_attempt_at
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            RETURNING *
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(map_delivery).collect()
    }

    pub async fn mark_delivery_delivered(&self, id: Uuid) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE _ayb_webhook_deliveries SET status = 'delivered', last_error = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_delivery_retry(
        &self,
        id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE _ayb_webhook_deliveries SET next_attempt_at = $2, last_error = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(next_attempt_at)
        .bind(error)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_delivery_failed(&self, id: Uuid, error: &str) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE _ayb_webhook_deliveries SET status = 'failed', last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_deliveries_for_webhook(
        &self,
        webhook_id: Uuid,
        limit: i64,
    ) -> Result<Vec<WebhookDeliveryRecord>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM _ayb_webhook_deliveries
            WHERE webhook_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(webhook_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(map_delivery).collect()
    }

    /// Retention for terminal deliveries.
    pub async fn prune_deliveries(&self, before: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            DELETE FROM _ayb_webhook_deliveries
            WHERE status IN ('delivered', 'failed') AND created_at < $1
            "#,
        )
        .bind(before)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
