//! Background execution for AllYourBase: the durable job queue and its
//! worker pool, the cron scheduler, and the outbound webhook dispatcher.

pub mod handlers;
pub mod scheduler;
pub mod webhooks;
pub mod worker;

use std::time::Duration;

pub use scheduler::{ensure_default_schedules, Scheduler, SchedulerConfig};
pub use webhooks::{sign_payload, WebhookDispatcher, WebhookDispatcherConfig};
pub use worker::{JobHandler, JobRegistry, WorkerConfig, WorkerPool};

/// Retry backoff shared by the queue and the dispatcher:
/// `5s * 2^(n-1)`, capped at five minutes. `attempts` is the number of
/// attempts already made (>= 1).
pub fn retry_backoff(attempts: i32) -> Duration {
    let exp = attempts.saturating_sub(1).clamp(0, 16) as u32;
    let secs = 5u64.saturating_mul(1u64 << exp);
    Duration::from_secs(secs.min(300))
}
