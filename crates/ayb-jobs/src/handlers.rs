//! Built-in job handlers for the default schedules.

use std::sync::Arc;

use ayb_db::{Db, JobRecord};
use chrono::{Duration, Utc};
use tracing::info;

use crate::worker::{JobHandler, JobRegistry};

/// Days a terminal delivery or job row is kept for audit before pruning.
const RETENTION_DAYS: i64 = 7;

struct SessionCleanup {
    db: Db,
}

#[async_trait::async_trait]
impl JobHandler for SessionCleanup {
    async fn run(&self, _job: &JobRecord) -> anyhow::Result<()> {
        let pruned = self.db.prune_expired_sessions().await?;
        info!(pruned, "expired sessions pruned");
        Ok(())
    }
}

struct WebhookDeliveryPrune {
    db: Db,
}

#[async_trait::async_trait]
impl JobHandler for WebhookDeliveryPrune {
    async fn run(&self, job: &JobRecord) -> anyhow::Result<()> {
        let days = job.payload["retention_days"].as_i64().unwrap_or(RETENTION_DAYS);
        let before = Utc::now() - Duration::days(days);
        let deliveries = self.db.prune_deliveries(before).await?;
        let jobs = self.db.prune_terminal_jobs(before).await?;
        info!(deliveries, jobs, "terminal delivery and job rows pruned");
        Ok(())
    }
}

struct ExpiredOauthCleanup {
    db: Db,
}

#[async_trait::async_trait]
impl JobHandler for ExpiredOauthCleanup {
    async fn run(&self, _job: &JobRecord) -> anyhow::Result<()> {
        let pruned = self.db.prune_expired_oauth().await?;
        info!(pruned, "expired OAuth codes and tokens pruned");
        Ok(())
    }
}

struct ExpiredAuthCleanup {
    db: Db,
}

#[async_trait::async_trait]
impl JobHandler for ExpiredAuthCleanup {
    async fn run(&self, _job: &JobRecord) -> anyhow::Result<()> {
        let pruned = self.db.prune_expired_auth_tokens().await?;
        info!(pruned, "expired auth-flow tokens pruned");
        Ok(())
    }
}

/// Registers every built-in handler against its schedule's job type.
pub fn register_builtin_handlers(registry: &mut JobRegistry, db: &Db) {
    registry.register("session_cleanup", Arc::new(SessionCleanup { db: db.clone() }));
    registry.register(
        "webhook_delivery_prune",
        Arc::new(WebhookDeliveryPrune { db: db.clone() }),
    );
    registry.register(
        "expired_oauth_cleanup",
        Arc::new(ExpiredOauthCleanup { db: db.clone() }),
    );
    registry.register(
        "expired_auth_cleanup",
        Arc::new(ExpiredAuthCleanup { db: db.clone() }),
    );
}
