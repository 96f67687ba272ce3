use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Map, Value};
use sqlx::PgPool;

use ayb_db::{
    query::{self, ListOptions},
    rpc, Db, JobState, RlsGateway, SchemaCache, SessionClaims,
};

async fn seed_posts(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE posts (
            id BIGSERIAL PRIMARY KEY,
            title TEXT,
            published BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("INSERT INTO posts (title, published) VALUES ('a', TRUE), ('b', FALSE)")
        .execute(pool)
        .await?;
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn schema_cache_hides_internal_tables(pool: PgPool) -> Result<()> {
    seed_posts(&pool).await?;
    let cache = SchemaCache::load(pool).await?;
    let snapshot = cache.snapshot();

    assert!(snapshot.resolve("posts").is_some());
    assert!(snapshot.resolve("_ayb_users").is_none());
    assert!(snapshot.resolve("_sqlx_migrations").is_none());

    let posts = snapshot.resolve("posts").unwrap();
    assert_eq!(posts.primary_key.as_deref(), Some("id"));
    assert!(!posts.is_view);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn filter_round_trip(pool: PgPool) -> Result<()> {
    seed_posts(&pool).await?;
    let cache = SchemaCache::load(pool.clone()).await?;
    let snapshot = cache.snapshot();
    let table = snapshot.resolve("posts").unwrap();

    let mut conn = pool.acquire().await?;
    let opts = ListOptions {
        filter: Some("published = true".into()),
        ..Default::default()
    };
    let result = query::run_list(&mut conn, table, &opts).await?;

    assert_eq!(result.total_items, 1);
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0]["title"], json!("a"));
    assert_eq!(result.items[0]["published"], json!(true));
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn crud_round_trip(pool: PgPool) -> Result<()> {
    seed_posts(&pool).await?;
    let cache = SchemaCache::load(pool.clone()).await?;
    let snapshot = cache.snapshot();
    let table = snapshot.resolve("posts").unwrap();
    let mut conn = pool.acquire().await?;

    let mut body = Map::new();
    body.insert("title".into(), json!("created"));
    let created = query::insert_record(&mut conn, table, &body).await?;
    let id = created["id"].to_string();

    let fetched = query::fetch_record(&mut conn, table, &id, None)
        .await?
        .expect("row exists");
    assert_eq!(fetched, created);

    let mut patch = Map::new();
    patch.insert("published".into(), json!(true));
    let updated = query::update_record(&mut conn, table, &id, &patch)
        .await?
        .expect("row updated");
    assert_eq!(updated["published"], json!(true));
    assert_eq!(updated["title"], json!("created"));

    let deleted = query::delete_record(&mut conn, table, &id).await?;
    assert!(deleted.is_some());
    assert!(query::delete_record(&mut conn, table, &id).await?.is_none());
    assert!(query::fetch_record(&mut conn, table, &id, None).await?.is_none());
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn unknown_body_column_is_rejected(pool: PgPool) -> Result<()> {
    seed_posts(&pool).await?;
    let cache = SchemaCache::load(pool.clone()).await?;
    let snapshot = cache.snapshot();
    let table = snapshot.resolve("posts").unwrap();
    let mut conn = pool.acquire().await?;

    let mut body = Map::new();
    body.insert("nope".into(), json!(1));
    let err = query::insert_record(&mut conn, table, &body).await.unwrap_err();
    assert!(err.to_string().contains("unknown column"));
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn rls_gateway_scopes_visibility(pool: PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE messages (
            id BIGSERIAL PRIMARY KEY,
            user_id UUID NOT NULL,
            body TEXT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;
    sqlx::query("GRANT SELECT, INSERT, UPDATE, DELETE ON messages TO ayb_authenticated")
        .execute(&pool)
        .await?;
    sqlx::query("GRANT USAGE, SELECT ON SEQUENCE messages_id_seq TO ayb_authenticated")
        .execute(&pool)
        .await?;
    sqlx::query("ALTER TABLE messages ENABLE ROW LEVEL SECURITY")
        .execute(&pool)
        .await?;
    sqlx::query(
        r#"
        CREATE POLICY owner_only ON messages
        USING (user_id = current_setting('ayb.user_id')::uuid)
        WITH CHECK (user_id = current_setting('ayb.user_id')::uuid)
        "#,
    )
    .execute(&pool)
    .await?;

    let u1 = uuid::Uuid::new_v4();
    let u2 = uuid::Uuid::new_v4();
    sqlx::query("INSERT INTO messages (user_id, body) VALUES ($1, 'mine'), ($2, 'theirs')")
        .bind(u1)
        .bind(u2)
        .execute(&pool)
        .await?;

    let cache = SchemaCache::load(pool.clone()).await?;
    let snapshot = cache.snapshot();
    let table = snapshot.resolve("messages").unwrap();
    assert!(table.rls_enabled);

    let gateway = RlsGateway::new(pool.clone(), "ayb_authenticated", "ayb_anon")?;
    let claims = SessionClaims::authenticated(u1, "u1@example.com");

    let mut tx = gateway.begin(&claims).await?;
    let result = query::run_list(&mut tx, table, &ListOptions::default()).await?;
    tx.rollback().await?;
    assert_eq!(result.total_items, 1);
    assert_eq!(result.items[0]["body"], json!("mine"));

    // The visibility probe mirrors what the realtime hub asks per event.
    let theirs_id: i64 = sqlx::query_scalar("SELECT id FROM messages WHERE body = 'theirs'")
        .fetch_one(&pool)
        .await?;
    assert!(!gateway.visible(&claims, table, &theirs_id.to_string()).await?);
    let mine_id: i64 = sqlx::query_scalar("SELECT id FROM messages WHERE body = 'mine'")
        .fetch_one(&pool)
        .await?;
    assert!(gateway.visible(&claims, table, &mine_id.to_string()).await?);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn job_claim_is_exclusive_and_sweep_requeues(pool: PgPool) -> Result<()> {
    let db = Db::from_pool(pool);
    let job = db.enqueue_job("noop", &json!({"k": 1}), 3, None).await?;
    assert_eq!(job.state, JobState::Queued);

    let claimed = db
        .claim_job(Duration::from_secs(0))
        .await?
        .expect("job claimed");
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.state, JobState::Running);
    assert_eq!(claimed.attempts, 1);

    // Nothing else is claimable while the first claim holds the row.
    assert!(db.claim_job(Duration::from_secs(30)).await?.is_none());

    // The zero-second lease has lapsed: the sweep restores the row with its
    // attempt count intact.
    let swept = db.sweep_expired_leases().await?;
    assert_eq!(swept, 1);
    let restored = db.fetch_job(job.id).await?.unwrap();
    assert_eq!(restored.state, JobState::Queued);
    assert_eq!(restored.attempts, 1);

    let reclaimed = db.claim_job(Duration::from_secs(30)).await?.unwrap();
    assert_eq!(reclaimed.attempts, 2);
    db.complete_job(reclaimed.id).await?;
    let done = db.fetch_job(job.id).await?.unwrap();
    assert_eq!(done.state, JobState::Completed);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn authorization_code_is_single_use(pool: PgPool) -> Result<()> {
    let db = Db::from_pool(pool);
    let user = db.create_user("oauth@example.com", None).await?;
    db.create_oauth_client(
        "client-1",
        None,
        Some("hash"),
        "Test Client",
        &["https://app.example/cb".to_string()],
        &["read".to_string()],
        "confidential",
    )
    .await?;
    db.insert_authorization_code(
        "code-hash",
        "client-1",
        user.id,
        "https://app.example/cb",
        &["read".to_string()],
        "challenge",
        chrono::Utc::now() + chrono::Duration::minutes(10),
    )
    .await?;

    let first = db.consume_authorization_code("code-hash").await?;
    assert!(first.is_some());
    let second = db.consume_authorization_code("code-hash").await?;
    assert!(second.is_none());
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn refresh_session_is_single_use(pool: PgPool) -> Result<()> {
    let db = Db::from_pool(pool);
    let user = db.create_user("session@example.com", Some("h")).await?;
    db.insert_session("rt-hash", user.id, chrono::Utc::now() + chrono::Duration::days(7))
        .await?;

    assert!(db.consume_session("rt-hash").await?.is_some());
    assert!(db.consume_session("rt-hash").await?.is_none());
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn duplicate_email_maps_to_conflict(pool: PgPool) -> Result<()> {
    let db = Db::from_pool(pool);
    db.create_user("Dup@Example.com", None).await?;
    let err = db.create_user("dup@example.com", None).await.unwrap_err();
    assert!(matches!(err, ayb_db::DbError::Conflict { .. }));
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn rpc_resolution_and_shapes(pool: PgPool) -> Result<()> {
    sqlx::query(
        "CREATE FUNCTION add_one(n int) RETURNS int AS $$ SELECT n + 1 $$ LANGUAGE sql",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        r#"
        CREATE FUNCTION series(up_to int) RETURNS TABLE (n int) AS $$
            SELECT generate_series(1, up_to)
        $$ LANGUAGE sql
        "#,
    )
    .execute(&pool)
    .await?;

    let mut conn = pool.acquire().await?;

    let scalar = rpc::resolve_function(&mut conn, "add_one", 1).await?;
    assert!(!scalar.returns_set);
    assert!(!scalar.returns_composite);
    let mut args = Map::new();
    args.insert("n".into(), json!(41));
    let result = rpc::call_function(&mut conn, &scalar, &args).await?;
    match result {
        rpc::RpcResult::Scalar(value) => assert_eq!(value, json!(42)),
        other => panic!("expected scalar result, got {other:?}"),
    }

    let setof = rpc::resolve_function(&mut conn, "series", 1).await?;
    assert!(setof.returns_set);
    let mut args = Map::new();
    args.insert("up_to".into(), json!(3));
    let result = rpc::call_function(&mut conn, &setof, &args).await?;
    match result {
        rpc::RpcResult::Rows(rows) => {
            assert_eq!(rows.len(), 3);
            assert_eq!(rows[0], json!({"n": 1}));
        }
        other => panic!("expected rows, got {other:?}"),
    }

    assert!(rpc::resolve_function(&mut conn, "missing_fn", 0).await.is_err());
    Ok(())
}
