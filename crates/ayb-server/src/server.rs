//! Router assembly and daemon lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    middleware as axum_middleware,
    routing::{delete, get, post, put},
    Router,
};
use ayb_auth::{
    identity::{IdentityConfig, IdentityService, LogMailer, LogSmsSender},
    jwt::JwtKeys,
    oauth_provider::OAuthConsumer,
    oauth_server::{OAuthServer, OAuthServerConfig},
};
use ayb_db::{Db, RlsGateway, SchemaCache};
use ayb_jobs::{
    ensure_default_schedules, handlers::register_builtin_handlers, JobRegistry, Scheduler,
    SchedulerConfig, WebhookDispatcher, WebhookDispatcherConfig, WorkerConfig, WorkerPool,
};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    auth::auth_middleware,
    config::AppConfig,
    handlers::{self, admin, auth_routes, collections, oauth_routes, rpc},
    middleware::{content_type::content_type_guard, rate_limit::rate_limit_middleware},
    middleware::rate_limit::RateLimiter,
    realtime::{realtime_handler, RealtimeHub},
    state::{AppState, SharedState},
};

pub const AUTHENTICATED_ROLE: &str = "ayb_authenticated";
pub const ANONYMOUS_ROLE: &str = "ayb_anon";

/// Builds the shared state from configuration: pool, schema cache,
/// services, hub, dispatcher.
pub async fn build_state(config: AppConfig) -> Result<SharedState> {
    let db = Db::connect(&config.db_url, config.db_max_connections)
        .await
        .context("failed to open database")?;

    let schema = Arc::new(
        SchemaCache::load(db.pool().clone())
            .await
            .context("schema introspection failed")?,
    );
    let gateway = RlsGateway::new(db.pool().clone(), AUTHENTICATED_ROLE, ANONYMOUS_ROLE)
        .context("gateway setup failed")?;

    let jwt = JwtKeys::new(&config.jwt_secret);
    let identity = IdentityService::new(
        db.clone(),
        jwt.clone(),
        IdentityConfig::default(),
        Arc::new(LogMailer),
        Arc::new(LogSmsSender),
    );
    let oauth = OAuthServer::new(db.clone(), OAuthServerConfig::default());
    let consumer = OAuthConsumer::new(config.google.clone(), config.github.clone());
    let hub = Arc::new(RealtimeHub::new());
    let dispatcher = Arc::new(WebhookDispatcher::new(
        db.clone(),
        WebhookDispatcherConfig::default(),
    ));

    Ok(Arc::new(AppState {
        config,
        db,
        schema,
        gateway,
        jwt,
        identity,
        oauth,
        consumer,
        hub,
        dispatcher,
        rate_limiter: RateLimiter::new(),
    }))
}

pub fn build_router(state: SharedState) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let api = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/schema", get(handlers::schema))
        .route(
            "/api/collections/:table",
            get(collections::list_records).post(collections::create_record),
        )
        .route("/api/collections/:table/batch", post(collections::batch))
        .route(
            "/api/collections/:table/:id",
            get(collections::get_record)
                .patch(collections::update_record)
                .delete(collections::delete_record),
        )
        .route("/api/rpc/:function", post(rpc::invoke))
        .route("/api/realtime", get(realtime_handler))
        // identity
        .route("/api/auth/register", post(auth_routes::register))
        .route("/api/auth/login", post(auth_routes::login))
        .route("/api/auth/refresh", post(auth_routes::refresh))
        .route("/api/auth/logout", post(auth_routes::logout))
        .route(
            "/api/auth/me",
            get(auth_routes::me).delete(auth_routes::delete_me),
        )
        .route(
            "/api/auth/password-reset",
            post(auth_routes::password_reset_request),
        )
        .route(
            "/api/auth/password-reset/confirm",
            post(auth_routes::password_reset_confirm),
        )
        .route("/api/auth/verify", post(auth_routes::verify_email))
        .route(
            "/api/auth/verify/resend",
            post(auth_routes::resend_verification),
        )
        .route("/api/auth/magic-link", post(auth_routes::magic_link_request))
        .route(
            "/api/auth/magic-link/confirm",
            post(auth_routes::magic_link_confirm),
        )
        .route("/api/auth/sms", post(auth_routes::sms_request))
        .route("/api/auth/sms/confirm", post(auth_routes::sms_confirm))
        .route("/api/auth/mfa/enroll", post(auth_routes::mfa_enroll))
        .route("/api/auth/mfa/verify", post(auth_routes::mfa_verify))
        .route("/api/auth/mfa/challenge", post(auth_routes::mfa_challenge))
        .route("/api/auth/oauth/:provider", get(auth_routes::provider_start))
        .route(
            "/api/auth/oauth/:provider/callback",
            get(auth_routes::provider_callback),
        )
        // OAuth authorization server
        .route("/api/auth/authorize", get(oauth_routes::authorize))
        .route(
            "/api/auth/authorize/consent",
            post(oauth_routes::consent),
        )
        .route("/api/auth/token", post(oauth_routes::token))
        .route("/api/auth/revoke", post(oauth_routes::revoke))
        // admin
        .route("/api/admin/auth", post(admin::admin_login))
        .route(
            "/api/admin/apps",
            get(admin::list_apps).post(admin::create_app),
        )
        .route(
            "/api/admin/apps/:id",
            put(admin::update_app).delete(admin::delete_app),
        )
        .route(
            "/api/admin/api-keys",
            get(admin::list_api_keys).post(admin::create_api_key),
        )
        .route("/api/admin/api-keys/:id", delete(admin::revoke_api_key))
        .route(
            "/api/admin/webhooks",
            get(admin::list_webhooks).post(admin::create_webhook),
        )
        .route(
            "/api/admin/webhooks/:id",
            put(admin::update_webhook).delete(admin::delete_webhook),
        )
        .route(
            "/api/admin/webhooks/:id/deliveries",
            get(admin::list_webhook_deliveries),
        )
        .route(
            "/api/admin/oauth/clients",
            get(admin::list_oauth_clients).post(admin::create_oauth_client),
        )
        .route(
            "/api/admin/oauth/clients/:client_id",
            delete(admin::revoke_oauth_client),
        )
        .route(
            "/api/admin/jobs",
            get(admin::list_jobs).post(admin::enqueue_job),
        )
        .route(
            "/api/admin/jobs/:id",
            get(admin::get_job).delete(admin::cancel_job),
        )
        .route(
            "/api/admin/schedules",
            get(admin::list_schedules).post(admin::upsert_schedule),
        )
        .route(
            "/api/admin/schedules/:id",
            put(admin::update_schedule).delete(admin::delete_schedule),
        )
        .route("/api/admin/sql", post(admin::execute_sql))
        .route("/api/admin/schema/refresh", post(admin::schema_refresh));

    // Outer to inner: recovery, request id, access log, CORS, body limit,
    // content-type guard, bearer resolution, rate limit, route.
    api.layer(
        ServiceBuilder::new()
            .layer(CatchPanicLayer::new())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(state.config.request_timeout))
            .layer(cors)
            .layer(DefaultBodyLimit::max(state.config.body_limit_bytes))
            .layer(axum_middleware::from_fn(content_type_guard))
            .layer(axum_middleware::from_fn_with_state(
                state.clone(),
                auth_middleware,
            ))
            .layer(axum_middleware::from_fn_with_state(
                state.clone(),
                rate_limit_middleware,
            )),
    )
    .with_state(state)
}

/// Daemon entry point: state, background workers, HTTP server, graceful
/// shutdown.
pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;
    let state = build_state(config).await?;

    ensure_default_schedules(&state.db).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut registry = JobRegistry::new();
    register_builtin_handlers(&mut registry, &state.db);
    let workers = Arc::new(WorkerPool::new(
        state.db.clone(),
        Arc::new(registry),
        WorkerConfig {
            concurrency: state.config.worker_concurrency,
            poll_interval: state.config.worker_poll_interval,
            lease: state.config.job_lease,
        },
    ));
    let worker_task = tokio::spawn(workers.run(shutdown_rx.clone()));

    let scheduler = Arc::new(Scheduler::new(
        state.db.clone(),
        SchedulerConfig {
            tick: state.config.scheduler_tick,
        },
    ));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let dispatcher_task = tokio::spawn(state.dispatcher.clone().run(shutdown_rx.clone()));

    let listener = tokio::net::TcpListener::bind(state.config.listen_addr)
        .await
        .context("failed to bind listen socket")?;
    info!(addr = %state.config.listen_addr, "ayb-server listening");

    let shutdown_timeout = state.config.shutdown_timeout;
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server exited")?;

    // Drain background loops; leases not released in time are recovered by
    // the next worker's sweep.
    let _ = shutdown_tx.send(true);
    let drain = async {
        let _ = worker_task.await;
        let _ = scheduler_task.await;
        let _ = dispatcher_task.await;
    };
    if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
        info!("shutdown timeout reached; abandoning background tasks");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
