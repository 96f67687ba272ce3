//! Change events and their post-commit side effects.
//!
//! Webhook delivery rows are staged on the write's own transaction so the
//! enqueue commits or aborts with the data change. Realtime broadcast and
//! the dispatcher wakeup run only after the commit succeeded, and a
//! failure there never fails the originating request.

use ayb_db::{store::webhooks::insert_delivery, DbError, TableDescriptor};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgConnection;
use tracing::warn;

use crate::state::AppState;

#[derive(Clone, Debug, Serialize)]
pub struct ChangeEvent {
    pub action: &'static str,
    pub table: String,
    pub record: Value,
}

impl ChangeEvent {
    pub fn new(action: &'static str, table: &TableDescriptor, record: Value) -> Self {
        Self {
            action,
            table: public_name(table),
            record,
        }
    }

    /// Primary-key value as text, for the realtime visibility probe.
    pub fn pk_text(&self, table: &TableDescriptor) -> Option<String> {
        let pk = table.primary_key.as_deref()?;
        match &self.record[pk] {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Tables in `public` go by their bare name on the wire.
pub fn public_name(table: &TableDescriptor) -> String {
    if table.schema == "public" {
        table.name.clone()
    } else {
        table.key()
    }
}

/// Stages webhook deliveries for `event` on the caller's transaction.
pub async fn stage_webhook_deliveries(
    state: &AppState,
    conn: &mut PgConnection,
    event: &ChangeEvent,
) -> Result<(), DbError> {
    let webhooks = state.db.matching_webhooks(&event.table, event.action).await?;
    if webhooks.is_empty() {
        return Ok(());
    }
    let payload = json!({
        "action": event.action,
        "table": event.table,
        "record": event.record,
        "timestamp": Utc::now().to_rfc3339(),
    });
    for webhook in webhooks {
        insert_delivery(conn, webhook.id, &payload).await?;
    }
    Ok(())
}

/// Post-commit: fan out to SSE subscribers and wake the dispatcher.
pub fn after_commit(state: &AppState, events: Vec<ChangeEvent>) {
    if events.is_empty() {
        return;
    }
    for event in events {
        if let Err(err) = state.hub.publish(event) {
            warn!(error = %err, "realtime publish failed");
        }
    }
    state.dispatcher.notify();
}
