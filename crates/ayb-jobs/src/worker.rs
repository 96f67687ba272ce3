//! Leased polling workers over `_ayb_jobs`.
//!
//! Delivery is at-least-once: handlers must be idempotent. A worker's
//! exclusive window over a row is its lease; if the process dies the sweep
//! returns the row to the queue with its attempt count intact.

use std::{collections::HashMap, sync::Arc, time::Duration};

use ayb_db::{Db, JobRecord};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::retry_backoff;

/// A registered job handler. Implementations must be idempotent.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &JobRecord) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(60),
        }
    }
}

pub struct WorkerPool {
    db: Db,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(db: Db, registry: Arc<JobRegistry>, config: WorkerConfig) -> Self {
        Self {
            db,
            registry,
            config,
        }
    }

    /// Spawns the worker loops plus the lease sweep; returns once
    /// `shutdown` flips to `true` and the loops have wound down.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tasks = Vec::with_capacity(self.config.concurrency + 1);

        for worker_id in 0..self.config.concurrency {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, shutdown).await;
            }));
        }

        {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                pool.sweep_loop(shutdown).await;
            }));
        }

        let _ = shutdown.wait_for(|stop| *stop).await;
        for task in tasks {
            let _ = task.await;
        }
        info!("job worker pool stopped");
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.db.claim_job(self.config.lease).await {
                Ok(Some(job)) => self.execute(worker_id, job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.wait_for(|stop| *stop) => return,
                    }
                }
                Err(err) => {
                    error!(worker_id, error = %err, "job claim failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.wait_for(|stop| *stop) => return,
                    }
                }
            }
        }
    }

    async fn execute(&self, worker_id: usize, job: JobRecord) {
        let Some(handler) = self.registry.get(&job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered");
            let _ = self
                .db
                .fail_job(job.id, &format!("no handler for type \"{}\"", job.job_type))
                .await;
            return;
        };

        // The handler's budget ends at the lease boundary.
        let budget = job
            .lease_expires_at
            .map(|lease| (lease - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(self.config.lease);

        let outcome = tokio::time::timeout(budget, handler.run(&job)).await;
        let result = match outcome {
            Ok(Ok(())) => self.db.complete_job(job.id).await,
            Ok(Err(err)) => {
                let message = err.to_string();
                if job.attempts < job.max_attempts {
                    let delay = retry_backoff(job.attempts);
                    warn!(job_id = %job.id, attempts = job.attempts, error = %message, "job failed; retrying");
                    self.db
                        .requeue_job(
                            job.id,
                            &message,
                            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
                        )
                        .await
                } else {
                    error!(job_id = %job.id, attempts = job.attempts, error = %message, "job failed terminally");
                    self.db.fail_job(job.id, &message).await
                }
            }
            Err(_) => {
                warn!(worker_id, job_id = %job.id, "job exceeded its lease; canceling");
                self.db
                    .mark_job_canceled(job.id, Some("lease expired during execution"))
                    .await
            }
        };

        if let Err(err) = result {
            error!(job_id = %job.id, error = %err, "job state transition failed");
        }
    }

    /// Crash recovery: runs once per poll interval.
    async fn sweep_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.db.sweep_expired_leases().await {
                Ok(0) => {}
                Ok(restored) => info!(restored, "requeued jobs with expired leases"),
                Err(err) => error!(error = %err, "lease sweep failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.wait_for(|stop| *stop) => return,
            }
        }
    }
}
