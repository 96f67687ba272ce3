//! `_ayb_jobs` and `_ayb_schedules`.
//!
//! The claim statement is the queue's only correctness-critical piece:
//! `FOR UPDATE SKIP LOCKED` gives one worker exclusive ownership of a row
//! without blocking its peers.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use crate::{error::DbError, Db};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }
}

impl FromStr for JobState {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "canceled" => Ok(JobState::Canceled),
            other => Err(DbError::validation(format!("unknown job state \"{other}\""))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobRecord {
    pub id: Uuid,
    pub job_type: String,
    pub payload: Value,
    pub state: JobState,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_after: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct ScheduleRecord {
    pub id: Uuid,
    pub name: String,
    pub job_type: String,
    pub cron_expr: String,
    pub timezone: String,
    pub payload: Value,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
}

fn map_job(row: sqlx::postgres::PgRow) -> Result<JobRecord, DbError> {
    let state: String = row.try_get("state").map_err(DbError::from)?;
    Ok(JobRecord {
        id: row.try_get("id").map_err(DbError::from)?,
        job_type: row.try_get("type").map_err(DbError::from)?,
        payload: row.try_get("payload").map_err(DbError::from)?,
        state: state.parse()?,
        attempts: row.try_get("attempts").map_err(DbError::from)?,
        max_attempts: row.try_get("max_attempts").map_err(DbError::from)?,
        run_after: row.try_get("run_after").map_err(DbError::from)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(DbError::from)?,
        last_error: row.try_get("last_error").map_err(DbError::from)?,
        created_at: row.try_get("created_at").map_err(DbError::from)?,
        updated_at: row.try_get("updated_at").map_err(DbError::from)?,
    })
}

fn map_schedule(row: sqlx::postgres::PgRow) -> Result<ScheduleRecord, DbError> {
    Ok(ScheduleRecord {
        id: row.try_get("id").map_err(DbError::from)?,
        name: row.try_get("name").map_err(DbError::from)?,
        job_type: row.try_get("job_type").map_err(DbError::from)?,
        cron_expr: row.try_get("cron_expr").map_err(DbError::from)?,
        timezone: row.try_get("timezone").map_err(DbError::from)?,
        payload: row.try_get("payload").map_err(DbError::from)?,
        enabled: row.try_get("enabled").map_err(DbError::from)?,
        next_run_at: row.try_get("next_run_at").map_err(DbError::from)?,
        max_attempts: row.try_get("max_attempts").map_err(DbError::from)?,
    })
}

impl Db {
    pub async fn enqueue_job(
        &self,
        job_type: &str,
        payload: &Value,
        max_attempts: i32,
        run_after: Option<DateTime<Utc>>,
    ) -> Result<JobRecord, DbError> {
        let row = sqlx::query(
            r#"
            INSERT INTO _ayb_jobs (type, payload, max_attempts, run_after)
            VALUES ($1, $2, $3, COALESCE($4, now()))
            RETURNING *
            "#,
        )
        .bind(job_type)
        .bind(payload)
        .bind(max_attempts)
        .bind(run_after)
        .fetch_one(self.pool())
        .await?;
        map_job(row)
    }

    /// Claims the next due job, bumping `attempts` and taking a lease.
    pub async fn claim_job(&self, lease: Duration) -> Result<Option<JobRecord>, DbError> {
        let row = sqlx::query(
            r#"
            UPDATE _ayb_jobs
            SET state = 'running',
                lease_expires_at = now() + $1 * interval '1 second',
                attempts = attempts + 1,
                updated_at = now()
            WHERE id = (
                SELECT id FROM _ayb_jobs
                WHERE state = 'queued' AND run_after <= now()
                ORDER BY run_after
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(lease.as_secs() as f64)
        .fetch_optional(self.pool())
        .await?;
        row.map(map_job).transpose()
    }

    pub async fn complete_job(&self, id: Uuid) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE _ayb_jobs
            SET state = 'completed', lease_expires_at = NULL, updated_at = now()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Returns the job to the queue for another attempt.
    pub async fn requeue_job(
        &self,
        id: Uuid,
        error: &str,
        run_after: DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE _ayb_jobs
            SET state = 'queued', lease_expires_at = NULL,
                run_after = $2, last_error = $3, updated_at = now()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(run_after)
        .bind(error)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn fail_job(&self, id: Uuid, error: &str) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE _ayb_jobs
            SET state = 'failed', lease_expires_at = NULL,
                last_error = $2, updated_at = now()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_job_canceled(&self, id: Uuid, error: Option<&str>) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE _ayb_jobs
            SET state = 'canceled', lease_expires_at = NULL,
                last_error = COALESCE($2, last_error), updated_at = now()
            WHERE id = $1 AND state IN ('queued', 'running')
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Admin cancel: only queued jobs can be withdrawn before a worker holds
    /// them.
    pub async fn cancel_job(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE _ayb_jobs
            SET state = 'canceled', updated_at = now()
            WHERE id = $1 AND state = 'queued'
            "#,
        )
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Crash recovery: running jobs whose lease lapsed go back to `queued`
    /// with their attempt count intact.
    pub async fn sweep_expired_leases(&self) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE _ayb_jobs
            SET state = 'queued', lease_expires_at = NULL, updated_at = now()
            WHERE state = 'running' AND lease_expires_at < now()
            "#,
        )
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_job(&self, id: Uuid) -> Result<Option<JobRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM _ayb_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(map_job).transpose()
    }

    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: i64,
    ) -> Result<Vec<JobRecord>, DbError> {
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    "SELECT * FROM _ayb_jobs WHERE state = $1 ORDER BY created_at DESC LIMIT $2",
                )
                .bind(state.as_str())
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM _ayb_jobs ORDER BY created_at DESC LIMIT $1")
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await?
            }
        };
        rows.into_iter().map(map_job).collect()
    }

    /// Retention: terminal jobs older than `before` are removed.
    pub async fn prune_terminal_jobs(&self, before: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            DELETE FROM _ayb_jobs
            WHERE state IN ('completed', 'failed', 'canceled') AND updated_at < $1
            "#,
        )
        .bind(before)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Boot-time upsert for built-in schedules. An existing row keeps its
    /// `next_run_at` so restarts do not reset the cadence.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_schedule(
        &self,
        name: &str,
        job_type: &str,
        cron_expr: &str,
        timezone: &str,
        payload: &Value,
        enabled: bool,
        max_attempts: i32,
    ) -> Result<ScheduleRecord, DbError> {
        let row = sqlx::query(
            r#"
            INSERT INTO _ayb_schedules (name, job_type, cron_expr, timezone, payload, enabled, max_attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO UPDATE
            SET job_type = EXCLUDED.job_type,
                cron_expr = EXCLUDED.cron_expr,
                timezone = EXCLUDED.timezone,
                payload = EXCLUDED.payload,
                max_attempts = EXCLUDED.max_attempts
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(job_type)
        .bind(cron_expr)
        .bind(timezone)
        .bind(payload)
        .bind(enabled)
        .bind(max_attempts)
        .fetch_one(self.pool())
        .await?;
        map_schedule(row)
    }

    pub async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>, DbError> {
        let rows = sqlx::query("SELECT * FROM _ayb_schedules ORDER BY name")
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(map_schedule).collect()
    }

    pub async fn fetch_schedule(&self, id: Uuid) -> Result<Option<ScheduleRecord>, DbError> {
        let row = sqlx::query("SELECT * FROM _ayb_schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(map_schedule).transpose()
    }

    pub async fn update_schedule_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE _ayb_schedules SET enabled = $1 WHERE id = $2")
            .bind(enabled)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_schedule(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM _ayb_schedules WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn due_schedules(&self) -> Result<Vec<ScheduleRecord>, DbError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM _ayb_schedules
            WHERE enabled AND (next_run_at IS NULL OR next_run_at <= now())
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(map_schedule).collect()
    }

    pub async fn set_schedule_next_run(
        &self,
        id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE _ayb_schedules SET next_run_at = $1 WHERE id = $2")
            .bind(next_run_at)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_round_trips() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
            JobState::Canceled,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("bogus".parse::<JobState>().is_err());
    }
}
