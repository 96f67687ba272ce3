use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use ayb_auth::{
    identity::{IdentityConfig, IdentityService, LogMailer, LogSmsSender},
    jwt::JwtKeys,
    oauth_provider::OAuthConsumer,
    oauth_server::{OAuthServer, OAuthServerConfig},
    tokens::pkce_challenge,
};
use ayb_db::{Db, RlsGateway, SchemaCache};
use ayb_jobs::{WebhookDispatcher, WebhookDispatcherConfig};
use ayb_server::{
    config::AppConfig,
    middleware::rate_limit::RateLimiter,
    realtime::{HubMessage, RealtimeHub},
    server::{build_router, ANONYMOUS_ROLE, AUTHENTICATED_ROLE},
    state::{AppState, SharedState},
};
use serde_json::{json, Value};
use sqlx::PgPool;
use tower::Service;

fn test_config() -> AppConfig {
    AppConfig {
        listen_addr: "127.0.0.1:0".parse::<SocketAddr>().unwrap(),
        db_url: String::new(),
        db_max_connections: 4,
        jwt_secret: b"integration-test-secret-0123456789".to_vec(),
        admin_email: "admin@test.local".into(),
        admin_password: "admin-password".into(),
        cors_origins: Vec::new(),
        body_limit_bytes: 1024 * 1024,
        request_timeout: Duration::from_secs(30),
        shutdown_timeout: Duration::from_secs(5),
        auth_rate_per_minute: 10_000,
        admin_login_rate_per_minute: 10_000,
        worker_concurrency: 1,
        worker_poll_interval: Duration::from_millis(100),
        job_lease: Duration::from_secs(30),
        scheduler_tick: Duration::from_secs(60),
        google: None,
        github: None,
        external_url: "http://127.0.0.1:8090".into(),
    }
}

async fn test_state(pool: PgPool) -> anyhow::Result<SharedState> {
    let config = test_config();
    let db = Db::from_pool(pool);
    let schema = Arc::new(SchemaCache::load(db.pool().clone()).await?);
    let gateway = RlsGateway::new(db.pool().clone(), AUTHENTICATED_ROLE, ANONYMOUS_ROLE)?;
    let jwt = JwtKeys::new(&config.jwt_secret);
    let identity = IdentityService::new(
        db.clone(),
        jwt.clone(),
        IdentityConfig::default(),
        Arc::new(LogMailer),
        Arc::new(LogSmsSender),
    );
    let oauth = OAuthServer::new(db.clone(), OAuthServerConfig::default());
    let consumer = OAuthConsumer::new(None, None);
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

async fn send(
    router: &mut Router,
    method: &str,
    uri: &str,
    bearer: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.call(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn send_form(
    router: &mut Router,
    uri: &str,
    form: &str,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(form.to_owned()))
        .unwrap();
    let response = router.call(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn register_user(router: &mut Router, email: &str) -> (String, String) {
    let (status, body) = send(
        router,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({ "email": email, "password": "password123" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    (
        body["access_token"].as_str().unwrap().to_owned(),
        body["refresh_token"].as_str().unwrap().to_owned(),
    )
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn health_is_public(pool: PgPool) -> anyhow::Result<()> {
    let state = test_state(pool).await?;
    let mut router = build_router(state);
    let (status, body) = send(&mut router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn filter_round_trip_over_http(pool: PgPool) -> anyhow::Result<()> {
    sqlx::query("CREATE TABLE posts (id SERIAL PRIMARY KEY, title TEXT, published BOOL NOT NULL DEFAULT FALSE)")
        .execute(&pool)
        .await?;
    sqlx::query("INSERT INTO posts (title, published) VALUES ('a', TRUE), ('b', FALSE)")
        .execute(&pool)
        .await?;

    let state = test_state(pool).await?;
    let mut router = build_router(state);

    let (status, body) = send(
        &mut router,
        "GET",
        "/api/collections/posts?filter=published%3Dtrue",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["totalItems"], json!(1));
    assert_eq!(body["items"][0]["id"], json!(1));
    assert_eq!(body["items"][0]["title"], json!("a"));
    assert_eq!(body["items"][0]["published"], json!(true));
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn list_boundaries_reject_bad_pagination(pool: PgPool) -> anyhow::Result<()> {
    sqlx::query("CREATE TABLE posts (id SERIAL PRIMARY KEY, title TEXT)")
        .execute(&pool)
        .await?;
    let state = test_state(pool).await?;
    let mut router = build_router(state);

    for uri in [
        "/api/collections/posts?page=0",
        "/api/collections/posts?perPage=0",
        "/api/collections/posts?perPage=501",
        "/api/collections/posts?filter=(title%3D'a'",
        "/api/collections/posts?filter=nope%3D1",
    ] {
        let (status, body) = send(&mut router, "GET", uri, None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri} -> {body}");
        assert_eq!(body["code"], json!(400));
    }

    let (status, _) = send(&mut router, "GET", "/api/collections/ghost", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn crud_and_realtime_publish(pool: PgPool) -> anyhow::Result<()> {
    sqlx::query("CREATE TABLE posts (id SERIAL PRIMARY KEY, title TEXT, published BOOL NOT NULL DEFAULT FALSE)")
        .execute(&pool)
        .await?;
    let state = test_state(pool).await?;
    let mut router = build_router(state.clone());

    let (access, _) = register_user(&mut router, "writer@example.com").await;

    let (_, mut rx) = state.hub.subscribe(
        vec!["posts".into()],
        ayb_db::SessionClaims::anonymous(),
        false,
    );

    let (status, created) = send(
        &mut router,
        "POST",
        "/api/collections/posts",
        Some(&access),
        Some(json!({ "title": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let id = created["id"].as_i64().unwrap();

    // create -> get round trip
    let (status, fetched) = send(
        &mut router,
        "GET",
        &format!("/api/collections/posts/{id}"),
        Some(&access),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, created);

    // partial update leaves other fields alone
    let (status, updated) = send(
        &mut router,
        "PATCH",
        &format!("/api/collections/posts/{id}"),
        Some(&access),
        Some(json!({ "published": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["title"], json!("hello"));
    assert_eq!(updated["published"], json!(true));

    let (status, _) = send(
        &mut router,
        "DELETE",
        &format!("/api/collections/posts/{id}"),
        Some(&access),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Three events in commit order: create, update, delete (PK only).
    let first = rx.try_recv().expect("create event");
    match first {
        HubMessage::Change(event) => {
            assert_eq!(event.action, "create");
            assert_eq!(event.record["title"], json!("hello"));
        }
        other => panic!("unexpected message {other:?}"),
    }
    let second = rx.try_recv().expect("update event");
    match second {
        HubMessage::Change(event) => assert_eq!(event.action, "update"),
        other => panic!("unexpected message {other:?}"),
    }
    match rx.try_recv().expect("delete event") {
        HubMessage::Change(event) => {
            assert_eq!(event.action, "delete");
            assert_eq!(event.record, json!({ "id": id }));
        }
        other => panic!("unexpected message {other:?}"),
    }
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn batch_aborts_atomically_on_unique_violation(pool: PgPool) -> anyhow::Result<()> {
    sqlx::query("CREATE TABLE tags (id SERIAL PRIMARY KEY, name TEXT UNIQUE)")
        .execute(&pool)
        .await?;
    sqlx::query("INSERT INTO tags (name) VALUES ('go')")
        .execute(&pool)
        .await?;

    let state = test_state(pool.clone()).await?;
    state
        .db
        .create_webhook("http://127.0.0.1:9/hook", "s3cret", &[], &[], true)
        .await?;
    let mut router = build_router(state.clone());
    let (access, _) = register_user(&mut router, "batcher@example.com").await;

    let (_, mut rx) = state.hub.subscribe(
        vec!["tags".into()],
        ayb_db::SessionClaims::anonymous(),
        false,
    );

    let (status, body) = send(
        &mut router,
        "POST",
        "/api/collections/tags/batch",
        Some(&access),
        Some(json!({
            "operations": [
                { "method": "POST", "body": { "name": "x" } },
                { "method": "POST", "body": { "name": "go" } },
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM tags")
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 1, "batch must not leave partial writes");

    let deliveries: i64 = sqlx::query_scalar("SELECT count(*) FROM _ayb_webhook_deliveries")
        .fetch_one(&pool)
        .await?;
    assert_eq!(deliveries, 0, "aborted batch must not enqueue webhooks");
    assert!(rx.try_recv().is_err(), "aborted batch must not broadcast");

    // A successful batch reports per-op statuses by index.
    let (status, body) = send(
        &mut router,
        "POST",
        "/api/collections/tags/batch",
        Some(&access),
        Some(json!({
            "operations": [
                { "method": "POST", "body": { "name": "rust" } },
                { "method": "POST", "body": { "name": "zig" } },
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body[0]["index"], json!(0));
    assert_eq!(body[0]["status"], json!(201));
    assert_eq!(body[1]["index"], json!(1));
    assert_eq!(body[1]["status"], json!(201));

    let deliveries: i64 = sqlx::query_scalar("SELECT count(*) FROM _ayb_webhook_deliveries")
        .fetch_one(&pool)
        .await?;
    assert_eq!(deliveries, 2);
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn identity_refresh_is_single_use(pool: PgPool) -> anyhow::Result<()> {
    let state = test_state(pool).await?;
    let mut router = build_router(state);

    let (access, refresh) = register_user(&mut router, "rotate@example.com").await;

    let (status, me) = send(&mut router, "GET", "/api/auth/me", Some(&access), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["email"], json!("rotate@example.com"));

    let (status, rotated) = send(
        &mut router,
        "POST",
        "/api/auth/refresh",
        None,
        Some(json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(rotated["refresh_token"].as_str().is_some());

    // The original refresh token was consumed by the rotation.
    let (status, _) = send(
        &mut router,
        "POST",
        "/api/auth/refresh",
        None,
        Some(json!({ "refresh_token": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn oauth_code_pkce_flow_with_reuse_detection(pool: PgPool) -> anyhow::Result<()> {
    let state = test_state(pool).await?;
    let mut router = build_router(state);

    let (user_access, _) = register_user(&mut router, "resource-owner@example.com").await;

    // Admin registers the client; the secret is shown once.
    let (status, admin_session) = send(
        &mut router,
        "POST",
        "/api/admin/auth",
        None,
        Some(json!({ "email": "admin@test.local", "password": "admin-password" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{admin_session}");
    let admin_token = admin_session["token"].as_str().unwrap().to_owned();

    let (status, client) = send(
        &mut router,
        "POST",
        "/api/admin/oauth/clients",
        Some(&admin_token),
        Some(json!({
            "name": "Example App",
            "redirectUris": ["https://app.example/cb"],
            "scopes": ["read", "write"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{client}");
    let client_id = client["clientId"].as_str().unwrap().to_owned();
    let client_secret = client["clientSecret"].as_str().unwrap().to_owned();

    let verifier = "a-very-long-pkce-code-verifier-string-0123456789-0123456789";
    let challenge = pkce_challenge(verifier);

    let authorize_uri = format!(
        "/api/auth/authorize?client_id={client_id}&redirect_uri=https%3A%2F%2Fapp.example%2Fcb&response_type=code&scope=read&state=S1&code_challenge={challenge}&code_challenge_method=S256"
    );

    // First pass: no consent on file yet.
    let (status, body) = send(&mut router, "GET", &authorize_uri, Some(&user_access), None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["consent_required"], json!(true));

    let (status, consent) = send(
        &mut router,
        "POST",
        "/api/auth/authorize/consent",
        Some(&user_access),
        Some(json!({
            "client_id": client_id,
            "redirect_uri": "https://app.example/cb",
            "response_type": "code",
            "scope": "read",
            "state": "S1",
            "code_challenge": challenge,
            "code_challenge_method": "S256",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{consent}");
    let redirect = consent["redirect"].as_str().unwrap();
    assert!(redirect.starts_with("https://app.example/cb?code="));
    assert!(redirect.ends_with("&state=S1"));
    let code = redirect
        .split("code=")
        .nth(1)
        .unwrap()
        .split('&')
        .next()
        .unwrap()
        .to_owned();

    // With consent stored, authorize now redirects immediately.
    let (status, _) = send(&mut router, "GET", &authorize_uri, Some(&user_access), None).await;
    assert_eq!(status, StatusCode::SEE_OTHER);

    let token_form = format!(
        "grant_type=authorization_code&code={code}&code_verifier={verifier}&redirect_uri=https%3A%2F%2Fapp.example%2Fcb&client_id={client_id}&client_secret={client_secret}"
    );
    let (status, tokens) = send_form(&mut router, "/api/auth/token", &token_form).await;
    assert_eq!(status, StatusCode::OK, "{tokens}");
    let access = tokens["access_token"].as_str().unwrap().to_owned();
    let refresh = tokens["refresh_token"].as_str().unwrap().to_owned();
    assert!(access.starts_with("ayb_at_"));
    assert!(refresh.starts_with("ayb_rt_"));
    assert_eq!(tokens["expires_in"], json!(3600));

    // Replaying the code is invalid_grant.
    let (status, replay) = send_form(&mut router, "/api/auth/token", &token_form).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(replay["error"], json!("invalid_grant"));

    // The opaque access token resolves as a bearer.
    let (status, me) = send(&mut router, "GET", "/api/auth/me", Some(&access), None).await;
    assert_eq!(status, StatusCode::OK, "{me}");
    assert_eq!(me["email"], json!("resource-owner@example.com"));

    // Rotate, then reuse the first refresh token: the grant is burned.
    let rotate_form = format!(
        "grant_type=refresh_token&refresh_token={refresh}&client_id={client_id}&client_secret={client_secret}"
    );
    let (status, rotated) = send_form(&mut router, "/api/auth/token", &rotate_form).await;
    assert_eq!(status, StatusCode::OK, "{rotated}");
    let rotated_access = rotated["access_token"].as_str().unwrap().to_owned();

    let (status, reuse) = send_form(&mut router, "/api/auth/token", &rotate_form).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(reuse["error"], json!("invalid_grant"));

    let (status, _) = send(&mut router, "GET", "/api/auth/me", Some(&rotated_access), None).await;
    assert_eq!(
        status,
        StatusCode::UNAUTHORIZED,
        "tokens from a burned grant must stop working"
    );
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn rpc_scalar_over_http(pool: PgPool) -> anyhow::Result<()> {
    sqlx::query("CREATE FUNCTION add_one(n int) RETURNS int AS $$ SELECT n + 1 $$ LANGUAGE sql")
        .execute(&pool)
        .await?;
    sqlx::query("GRANT EXECUTE ON FUNCTION add_one(int) TO ayb_anon, ayb_authenticated")
        .execute(&pool)
        .await?;

    let state = test_state(pool).await?;
    let mut router = build_router(state);

    let (status, body) = send(
        &mut router,
        "POST",
        "/api/rpc/add_one",
        None,
        Some(json!({ "n": 41 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body, json!(42));

    let (status, _) = send(
        &mut router,
        "POST",
        "/api/rpc/does_not_exist",
        None,
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn admin_sql_returns_last_statement(pool: PgPool) -> anyhow::Result<()> {
    let state = test_state(pool).await?;
    let mut router = build_router(state);

    let (status, session) = send(
        &mut router,
        "POST",
        "/api/admin/auth",
        None,
        Some(json!({ "email": "admin@test.local", "password": "admin-password" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let admin_token = session["token"].as_str().unwrap().to_owned();

    let (status, result) = send(
        &mut router,
        "POST",
        "/api/admin/sql",
        Some(&admin_token),
        Some(json!({
            "query": "CREATE TABLE scratch (n INT); INSERT INTO scratch VALUES (1), (2); SELECT n FROM scratch ORDER BY n"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{result}");
    assert_eq!(result["columns"], json!(["n"]));
    assert_eq!(result["rows"], json!([[1], [2]]));
    assert_eq!(result["rowCount"], json!(2));

    // A mutating statement without RETURNING reports the command tag's
    // affected-row count, not an empty result set.
    let (status, result) = send(
        &mut router,
        "POST",
        "/api/admin/sql",
        Some(&admin_token),
        Some(json!({ "query": "UPDATE scratch SET n = n + 10" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{result}");
    assert_eq!(result["rowCount"], json!(2));
    assert_eq!(result["rows"], json!([]));
    assert_eq!(result["columns"], json!([]));

    // The DDL triggered a schema refresh: the new table is visible.
    let (status, _) = send(
        &mut router,
        "GET",
        "/api/collections/scratch",
        Some(&admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Non-admin bearers are refused.
    let (status, _) = send(
        &mut router,
        "POST",
        "/api/admin/sql",
        None,
        Some(json!({ "query": "SELECT 1" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn non_json_bodies_are_refused(pool: PgPool) -> anyhow::Result<()> {
    let state = test_state(pool).await?;
    let mut router = build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/api/auth/login")
        .header("content-type", "text/plain")
        .body(Body::from("email=x"))
        .unwrap();
    let response = router.call(request).await?;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    Ok(())
}
