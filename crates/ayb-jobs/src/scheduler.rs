//! Cron-driven enqueue into `_ayb_jobs`.
//!
//! Five-field expressions are normalized by prepending a seconds column;
//! the next fire is computed in the schedule's IANA timezone and stored as
//! UTC.

use std::{str::FromStr, sync::Arc, time::Duration};

use ayb_db::{Db, DbError, ScheduleRecord};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(15),
        }
    }
}

/// Computes the next fire strictly after `after` for a 5-field cron
/// expression in `timezone`.
pub fn next_fire(
    cron_expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, DbError> {
    let normalized = normalize_expr(cron_expr);
    let schedule = Schedule::from_str(&normalized)
        .map_err(|err| DbError::validation(format!("invalid cron expression: {err}")))?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| DbError::validation(format!("unknown timezone \"{timezone}\"")))?;
    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|fire| fire.with_timezone(&Utc)))
}

/// The `cron` crate wants a seconds column; 5-field input gains a fixed
/// `0` so expressions stay in the conventional shape.
fn normalize_expr(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_owned()
    }
}

/// Upserted on boot; existing rows keep their `next_run_at`.
pub async fn ensure_default_schedules(db: &Db) -> Result<(), DbError> {
    let defaults = [
        ("session_cleanup_hourly", "session_cleanup", "0 * * * *"),
        (
            "webhook_delivery_prune_daily",
            "webhook_delivery_prune",
            "30 3 * * *",
        ),
        (
            "expired_oauth_cleanup_daily",
            "expired_oauth_cleanup",
            "40 3 * * *",
        ),
        (
            "expired_auth_cleanup_daily",
            "expired_auth_cleanup",
            "50 3 * * *",
        ),
    ];
    for (name, job_type, cron_expr) in defaults {
        db.upsert_schedule(name, job_type, cron_expr, "UTC", &json!({}), true, 3)
            .await?;
    }
    Ok(())
}

pub struct Scheduler {
    db: Db,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(db: Db, config: SchedulerConfig) -> Self {
        Self { db, config }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(err) = self.tick().await {
                error!(error = %err, "scheduler tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick) => {}
                _ = shutdown.wait_for(|stop| *stop) => return,
            }
        }
    }

    async fn tick(&self) -> Result<(), DbError> {
        let due = self.db.due_schedules().await?;
        for schedule in due {
            if let Err(err) = self.fire(&schedule).await {
                warn!(schedule = %schedule.name, error = %err, "schedule fire failed");
            }
        }
        Ok(())
    }

    async fn fire(&self, schedule: &ScheduleRecord) -> Result<(), DbError> {
        let next = next_fire(&schedule.cron_expr, &schedule.timezone, Utc::now())?;

        // A NULL next_run_at means the schedule is fresh: plant the first
        // fire time without enqueueing retroactively.
        if schedule.next_run_at.is_some() {
            self.db
                .enqueue_job(
                    &schedule.job_type,
                    &schedule.payload,
                    schedule.max_attempts,
                    None,
                )
                .await?;
            info!(schedule = %schedule.name, job_type = %schedule.job_type, "schedule fired");
        }

        self.db.set_schedule_next_run(schedule.id, next).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_gain_seconds() {
        assert_eq!(normalize_expr("0 * * * *"), "0 0 * * * *");
        assert_eq!(normalize_expr("*/5 0 1 2 3 4"), "*/5 0 1 2 3 4");
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let next = next_fire("0 * * * *", "UTC", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn timezone_shifts_the_fire_time() {
        // 03:30 in New York is 08:30 UTC in winter.
        let after = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        let next = next_fire("30 3 * * *", "America/New_York", after)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 15, 8, 30, 0).unwrap());
    }

    #[test]
    fn bad_inputs_are_rejected() {
        assert!(next_fire("not a cron", "UTC", Utc::now()).is_err());
        assert!(next_fire("0 * * * *", "Mars/Olympus", Utc::now()).is_err());
    }
}
