//! Environment-driven daemon configuration. All keys are `AYB_`-prefixed
//! and carry workable defaults for local development, except the database
//! DSN and the JWT secret which must be supplied.

use std::{env, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use ayb_auth::oauth_provider::ProviderCredentials;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub db_url: String,
    pub db_max_connections: u32,
    pub jwt_secret: Vec<u8>,

    pub admin_email: String,
    pub admin_password: String,

    pub cors_origins: Vec<String>,
    pub body_limit_bytes: usize,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,

    /// Requests per minute per IP on `/api/auth/*`.
    pub auth_rate_per_minute: u64,
    /// Attempts per minute per IP on `/api/admin/auth`.
    pub admin_login_rate_per_minute: u64,

    pub worker_concurrency: usize,
    pub worker_poll_interval: Duration,
    pub job_lease: Duration,
    pub scheduler_tick: Duration,

    pub google: Option<ProviderCredentials>,
    pub github: Option<ProviderCredentials>,
    /// Public base URL used to build OAuth consumer callback URLs.
    pub external_url: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr = env::var("AYB_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8090".to_string())
            .parse()
            .context("invalid AYB_LISTEN_ADDR")?;

        let db_url = env::var("AYB_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("AYB_DATABASE_URL or DATABASE_URL must be configured")?;

        let jwt_secret = env::var("AYB_JWT_SECRET")
            .context("AYB_JWT_SECRET must be configured")?
            .into_bytes();
        if jwt_secret.len() < 16 {
            anyhow::bail!("AYB_JWT_SECRET must be at least 16 bytes");
        }

        let admin_email = env::var("AYB_ADMIN_EMAIL").unwrap_or_else(|_| "admin@localhost".into());
        let admin_password =
            env::var("AYB_ADMIN_PASSWORD").context("AYB_ADMIN_PASSWORD must be configured")?;

        let cors_origins = env::var("AYB_CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let google = provider_from_env("AYB_GOOGLE_CLIENT_ID", "AYB_GOOGLE_CLIENT_SECRET");
        let github = provider_from_env("AYB_GITHUB_CLIENT_ID", "AYB_GITHUB_CLIENT_SECRET");

        Ok(Self {
            listen_addr,
            db_url,
            db_max_connections: parse_env("AYB_DB_MAX_CONNECTIONS", 16),
            jwt_secret,
            admin_email,
            admin_password,
            cors_origins,
            body_limit_bytes: parse_env("AYB_BODY_LIMIT_BYTES", 2 * 1024 * 1024),
            request_timeout: Duration::from_secs(parse_env("AYB_REQUEST_TIMEOUT_SECONDS", 30)),
            shutdown_timeout: Duration::from_secs(parse_env("AYB_SHUTDOWN_TIMEOUT_SECONDS", 15)),
            auth_rate_per_minute: parse_env("AYB_AUTH_RATE_PER_MINUTE", 60),
            admin_login_rate_per_minute: parse_env("AYB_ADMIN_LOGIN_RATE_PER_MINUTE", 10),
            worker_concurrency: parse_env("AYB_WORKER_CONCURRENCY", 4),
            worker_poll_interval: Duration::from_secs(parse_env("AYB_WORKER_POLL_SECONDS", 1)),
            job_lease: Duration::from_secs(parse_env("AYB_JOB_LEASE_SECONDS", 60)),
            scheduler_tick: Duration::from_secs(parse_env("AYB_SCHEDULER_TICK_SECONDS", 15)),
            google,
            github,
            external_url: env::var("AYB_EXTERNAL_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8090".into()),
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn provider_from_env(id_key: &str, secret_key: &str) -> Option<ProviderCredentials> {
    let client_id = env::var(id_key).ok().filter(|v| !v.is_empty())?;
    let client_secret = env::var(secret_key).ok().filter(|v| !v.is_empty())?;
    Some(ProviderCredentials {
        client_id,
        client_secret,
    })
}
