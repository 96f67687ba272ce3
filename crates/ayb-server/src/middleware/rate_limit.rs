//! Token-bucket rate limiting.
//!
//! Buckets are sharded across a fixed set of mutexes keyed by hash so hot
//! paths do not serialize on one lock. Exhaustion answers 429 with
//! `Retry-After` set to the seconds until the next token drips in.

use std::{
    collections::hash_map::DefaultHasher,
    collections::HashMap,
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::{auth::AuthContext, state::SharedState};

const SHARDS: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum RateKey {
    AuthIp(String),
    AdminLoginIp(String),
    App(Uuid),
}

#[derive(Clone, Copy, Debug)]
struct Budget {
    /// Bucket capacity; also the refill amount per window.
    limit: f64,
    window_seconds: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    shards: Vec<Mutex<HashMap<RateKey, Bucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    async fn check(&self, key: RateKey, budget: Budget) -> Result<(), u64> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = &self.shards[(hasher.finish() as usize) % SHARDS];

        let mut buckets = shard.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(key).or_insert(Bucket {
            tokens: budget.limit,
            last_refill: now,
        });

        let refill_per_second = budget.limit / budget.window_seconds;
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_second).min(budget.limit);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            Err((deficit / refill_per_second).ceil().max(1.0) as u64)
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct RateLimitBody {
    code: u16,
    message: &'static str,
}

fn too_many_requests(retry_after: u64) -> Response {
    let body = RateLimitBody {
        code: StatusCode::TOO_MANY_REQUESTS.as_u16(),
        message: "rate limit exceeded",
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
    response.headers_mut().insert(
        header::RETRY_AFTER,
        HeaderValue::from_str(&retry_after.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("1")),
    );
    response
}

fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return forwarded.to_owned();
    }
    if let Some(real_ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        return real_ip.to_owned();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "local".to_owned())
}

/// Middleware: runs after bearer resolution so app-scoped keys can be
/// throttled on their app's configured budget.
pub async fn rate_limit_middleware(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();

    let decision = if path.starts_with("/api/admin/auth") {
        Some((
            RateKey::AdminLoginIp(client_ip(&request)),
            Budget {
                limit: state.config.admin_login_rate_per_minute as f64,
                window_seconds: 60.0,
            },
        ))
    } else if path.starts_with("/api/auth/") {
        Some((
            RateKey::AuthIp(client_ip(&request)),
            Budget {
                limit: state.config.auth_rate_per_minute as f64,
                window_seconds: 60.0,
            },
        ))
    } else {
        request
            .extensions()
            .get::<AuthContext>()
            .and_then(|ctx| ctx.app_limit)
            .map(|(app_id, rps, window)| {
                (
                    RateKey::App(app_id),
                    Budget {
                        limit: (rps.max(1) as f64) * (window.max(1) as f64),
                        window_seconds: window.max(1) as f64,
                    },
                )
            })
    };

    if let Some((key, budget)) = decision {
        if let Err(retry_after) = state.rate_limiter.check(key.clone(), budget).await {
            warn!(?key, retry_after, "rate limit exceeded");
            return too_many_requests(retry_after);
        }
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_exhausts_and_reports_retry_after() {
        let limiter = RateLimiter::new();
        let budget = Budget {
            limit: 2.0,
            window_seconds: 60.0,
        };
        let key = RateKey::AuthIp("10.0.0.1".into());

        assert!(limiter.check(key.clone(), budget).await.is_ok());
        assert!(limiter.check(key.clone(), budget).await.is_ok());
        let retry_after = limiter.check(key.clone(), budget).await.unwrap_err();
        assert!(retry_after >= 1);

        // A different key has its own bucket.
        let other = RateKey::AuthIp("10.0.0.2".into());
        assert!(limiter.check(other, budget).await.is_ok());
    }

    #[tokio::test]
    async fn app_buckets_are_keyed_by_id() {
        let limiter = RateLimiter::new();
        let budget = Budget {
            limit: 1.0,
            window_seconds: 1.0,
        };
        let app = Uuid::new_v4();
        assert!(limiter.check(RateKey::App(app), budget).await.is_ok());
        assert!(limiter.check(RateKey::App(app), budget).await.is_err());
        assert!(limiter
            .check(RateKey::App(Uuid::new_v4()), budget)
            .await
            .is_ok());
    }
}
