use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use ayb_db::{Db, JobRecord, JobState};
use ayb_jobs::{
    ensure_default_schedules, handlers::register_builtin_handlers, JobHandler, JobRegistry,
    WorkerConfig, WorkerPool,
};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::watch;

struct FlakyHandler {
    calls: Arc<AtomicU32>,
    fail_times: u32,
}

#[async_trait::async_trait]
impl JobHandler for FlakyHandler {
    async fn run(&self, _job: &JobRecord) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_times {
            anyhow::bail!("transient failure {call}");
        }
        Ok(())
    }
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn default_schedules_are_upserted_once(pool: PgPool) -> anyhow::Result<()> {
    let db = Db::from_pool(pool);
    ensure_default_schedules(&db).await?;
    ensure_default_schedules(&db).await?;

    let schedules = db.list_schedules().await?;
    assert_eq!(schedules.len(), 4);
    let names: Vec<&str> = schedules.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"session_cleanup_hourly"));
    assert!(names.contains(&"webhook_delivery_prune_daily"));
    assert!(names.contains(&"expired_oauth_cleanup_daily"));
    assert!(names.contains(&"expired_auth_cleanup_daily"));
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn builtin_handlers_cover_default_job_types(pool: PgPool) -> anyhow::Result<()> {
    let db = Db::from_pool(pool);
    let mut registry = JobRegistry::new();
    register_builtin_handlers(&mut registry, &db);
    for job_type in [
        "session_cleanup",
        "webhook_delivery_prune",
        "expired_oauth_cleanup",
        "expired_auth_cleanup",
    ] {
        assert!(registry.get(job_type).is_some(), "{job_type} missing");
    }
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn worker_retries_until_success(pool: PgPool) -> anyhow::Result<()> {
    let db = Db::from_pool(pool);
    let calls = Arc::new(AtomicU32::new(0));

    let mut registry = JobRegistry::new();
    registry.register(
        "flaky",
        Arc::new(FlakyHandler {
            calls: calls.clone(),
            fail_times: 1,
        }),
    );

    let job = db.enqueue_job("flaky", &json!({}), 3, None).await?;

    let pool_config = WorkerConfig {
        concurrency: 1,
        poll_interval: Duration::from_millis(50),
        lease: Duration::from_secs(30),
    };
    let worker = Arc::new(WorkerPool::new(db.clone(), Arc::new(registry), pool_config));
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(stop_rx));

    // First attempt fails and schedules a retry ~5s out; fast-forward it.
    let mut completed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        sqlx::query("UPDATE _ayb_jobs SET run_after = now() WHERE state = 'queued'")
            .execute(db.pool())
            .await?;
        let current = db.fetch_job(job.id).await?.unwrap();
        if current.state == JobState::Completed {
            completed = true;
            break;
        }
        assert_ne!(current.state, JobState::Failed, "{:?}", current.last_error);
    }
    let _ = stop_tx.send(true);
    let _ = handle.await;

    assert!(completed, "job never completed");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let done = db.fetch_job(job.id).await?.unwrap();
    assert_eq!(done.attempts, 2);
    assert!(done.last_error.unwrap().contains("transient failure 1"));
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn exhausted_retries_mark_failed(pool: PgPool) -> anyhow::Result<()> {
    let db = Db::from_pool(pool);
    let calls = Arc::new(AtomicU32::new(0));

    let mut registry = JobRegistry::new();
    registry.register(
        "always_fails",
        Arc::new(FlakyHandler {
            calls: calls.clone(),
            fail_times: u32::MAX,
        }),
    );

    let job = db.enqueue_job("always_fails", &json!({}), 2, None).await?;

    let worker = Arc::new(WorkerPool::new(
        db.clone(),
        Arc::new(registry),
        WorkerConfig {
            concurrency: 1,
            poll_interval: Duration::from_millis(50),
            lease: Duration::from_secs(30),
        },
    ));
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(stop_rx));

    let mut failed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        sqlx::query("UPDATE _ayb_jobs SET run_after = now() WHERE state = 'queued'")
            .execute(db.pool())
            .await?;
        let current = db.fetch_job(job.id).await?.unwrap();
        if current.state == JobState::Failed {
            failed = true;
            break;
        }
    }
    let _ = stop_tx.send(true);
    let _ = handle.await;

    assert!(failed, "job never reached failed state");
    // max_attempts bounds handler invocations.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}
