//! Admin surface: admin login, resource management, and the raw SQL
//! executor. Everything here requires the admin bearer and runs on the
//! pool's own role, outside the RLS gateway.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use ayb_auth::{
    jwt::ROLE_ADMIN,
    password::hash_password,
    tokens::{display_prefix, generate_token, hash_token, API_KEY_PREFIX},
};
use ayb_db::{sqlsplit::split_statements, JobState, ScheduleRecord};
use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{Column, Either, Row, TypeInfo};
use uuid::Uuid;

use crate::{
    auth::{require_admin, AuthContext},
    error::ApiError,
    handlers::refresh_schema,
    state::SharedState,
};

const SQL_ROW_CAP: usize = 1000;

#[derive(Deserialize)]
pub struct AdminLoginBody {
    email: String,
    password: String,
}

/// `POST /api/admin/auth` — the configured admin credentials buy an admin
/// JWT. Separately rate-limited per IP.
pub async fn admin_login(
    State(state): State<SharedState>,
    Json(body): Json<AdminLoginBody>,
) -> Result<Json<Value>, ApiError> {
    let email_ok = body.email.eq_ignore_ascii_case(&state.config.admin_email);
    let password_ok = constant_time_eq(body.password.as_bytes(), state.config.admin_password.as_bytes());
    if !email_ok || !password_ok {
        return Err(ApiError::unauthorized("invalid admin credentials"));
    }
    let (token, claims) = state
        .jwt
        .issue(Uuid::nil(), &state.config.admin_email, ROLE_ADMIN, Duration::hours(1))
        .map_err(ApiError::from)?;
    Ok(Json(json!({
        "token": token,
        "expires_at": claims.exp,
    })))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ---- apps -----------------------------------------------------------------

fn app_json(app: &ayb_db::AppRecord) -> Value {
    json!({
        "id": app.id,
        "name": app.name,
        "ownerUserId": app.owner_user_id,
        "rateLimitRps": app.rate_limit_rps,
        "rateLimitWindowSeconds": app.rate_limit_window_seconds,
        "createdAt": app.created_at.to_rfc3339(),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppBody {
    name: String,
    #[serde(default)]
    owner_user_id: Option<Uuid>,
    #[serde(default)]
    rate_limit_rps: Option<i32>,
    #[serde(default)]
    rate_limit_window_seconds: Option<i32>,
}

pub async fn list_apps(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;
    let apps = state.db.list_apps().await?;
    Ok(Json(Value::Array(apps.iter().map(app_json).collect())))
}

pub async fn create_app(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<AppBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_admin(&ctx)?;
    let app = state
        .db
        .create_app(
            &body.name,
            body.owner_user_id,
            body.rate_limit_rps.unwrap_or(10),
            body.rate_limit_window_seconds.unwrap_or(1),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(app_json(&app))))
}

pub async fn update_app(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<AppBody>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;
    let app = state
        .db
        .update_app(
            id,
            &body.name,
            body.rate_limit_rps.unwrap_or(10),
            body.rate_limit_window_seconds.unwrap_or(1),
        )
        .await?
        .ok_or_else(|| ApiError::not_found("app not found"))?;
    Ok(Json(app_json(&app)))
}

pub async fn delete_app(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx)?;
    if !state.db.delete_app(id).await? {
        return Err(ApiError::not_found("app not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---- API keys -------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyBody {
    name: String,
    #[serde(default)]
    user_id: Option<Uuid>,
    #[serde(default)]
    app_id: Option<Uuid>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    allowed_tables: Vec<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

fn api_key_json(key: &ayb_db::ApiKeyRecord) -> Value {
    json!({
        "id": key.id,
        "name": key.name,
        "userId": key.user_id,
        "appId": key.app_id,
        "keyPrefix": key.key_prefix,
        "scope": key.scope,
        "allowedTables": key.allowed_tables,
        "expiresAt": key.expires_at.map(|e| e.to_rfc3339()),
        "revokedAt": key.revoked_at.map(|r| r.to_rfc3339()),
        "createdAt": key.created_at.to_rfc3339(),
    })
}

pub async fn list_api_keys(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;
    let keys = state.db.list_api_keys().await?;
    Ok(Json(Value::Array(keys.iter().map(api_key_json).collect())))
}

/// The plaintext key is returned exactly once, at creation.
pub async fn create_api_key(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<ApiKeyBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_admin(&ctx)?;
    let scope = body.scope.as_deref().unwrap_or("user");
    if !matches!(scope, "user" | "admin") {
        return Err(ApiError::bad_request("scope must be \"user\" or \"admin\""));
    }
    let token = generate_token(API_KEY_PREFIX);
    let record = state
        .db
        .insert_api_key(
            body.user_id,
            body.app_id,
            &body.name,
            &hash_token(&token),
            &display_prefix(&token),
            scope,
            &body.allowed_tables,
            body.expires_at,
        )
        .await?;
    let mut response = api_key_json(&record);
    response["key"] = json!(token);
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn revoke_api_key(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx)?;
    if !state.db.revoke_api_key(id).await? {
        return Err(ApiError::not_found("API key not found or already revoked"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---- webhooks -------------------------------------------------------------

#[derive(Deserialize)]
pub struct WebhookBody {
    url: String,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    tables: Vec<String>,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

fn webhook_json(hook: &ayb_db::WebhookRecord) -> Value {
    json!({
        "id": hook.id,
        "url": hook.url,
        "events": hook.events,
        "tables": hook.tables,
        "enabled": hook.enabled,
        "createdAt": hook.created_at.to_rfc3339(),
    })
}

pub async fn list_webhooks(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;
    let hooks = state.db.list_webhooks().await?;
    Ok(Json(Value::Array(hooks.iter().map(webhook_json).collect())))
}

/// The signing secret is generated server-side and returned once.
pub async fn create_webhook(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<WebhookBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_admin(&ctx)?;
    let secret = body.secret.unwrap_or_else(|| generate_token("whsec_"));
    let hook = state
        .db
        .create_webhook(&body.url, &secret, &body.events, &body.tables, body.enabled)
        .await?;
    let mut response = webhook_json(&hook);
    response["secret"] = json!(secret);
    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Deserialize)]
pub struct WebhookPatchBody {
    enabled: bool,
}

pub async fn update_webhook(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<WebhookPatchBody>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx)?;
    if !state.db.set_webhook_enabled(id, body.enabled).await? {
        return Err(ApiError::not_found("webhook not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_webhook(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx)?;
    if !state.db.delete_webhook(id).await? {
        return Err(ApiError::not_found("webhook not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_webhook_deliveries(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;
    let deliveries = state.db.list_deliveries_for_webhook(id, 100).await?;
    Ok(Json(Value::Array(
        deliveries
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "event": d.event,
                    "attempts": d.attempts,
                    "status": d.status.as_str(),
                    "nextAttemptAt": d.next_attempt_at.to_rfc3339(),
                    "lastError": d.last_error,
                    "createdAt": d.created_at.to_rfc3339(),
                })
            })
            .collect(),
    )))
}

// ---- OAuth clients --------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OauthClientBody {
    name: String,
    redirect_uris: Vec<String>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    client_type: Option<String>,
    #[serde(default)]
    app_id: Option<Uuid>,
}

pub async fn list_oauth_clients(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;
    let clients = state.db.list_oauth_clients().await?;
    Ok(Json(Value::Array(
        clients
            .iter()
            .map(|c| {
                json!({
                    "clientId": c.client_id,
                    "name": c.client_name,
                    "redirectUris": c.redirect_uris,
                    "scopes": c.scopes,
                    "clientType": c.client_type,
                    "revokedAt": c.revoked_at.map(|r| r.to_rfc3339()),
                    "createdAt": c.created_at.to_rfc3339(),
                })
            })
            .collect(),
    )))
}

/// Confidential clients get a generated secret, returned only here.
pub async fn create_oauth_client(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<OauthClientBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_admin(&ctx)?;
    let client_type = body.client_type.as_deref().unwrap_or("confidential");
    if !matches!(client_type, "confidential" | "public") {
        return Err(ApiError::bad_request(
            "clientType must be \"confidential\" or \"public\"",
        ));
    }
    if body.redirect_uris.is_empty() {
        return Err(ApiError::bad_request("at least one redirect URI is required"));
    }

    let client_id = Uuid::new_v4().to_string();
    let (secret, secret_hash) = if client_type == "confidential" {
        let secret = generate_token("aybcs_");
        let hash = hash_password(&secret, 10).map_err(ApiError::from)?;
        (Some(secret), Some(hash))
    } else {
        (None, None)
    };

    let client = state
        .db
        .create_oauth_client(
            &client_id,
            body.app_id,
            secret_hash.as_deref(),
            &body.name,
            &body.redirect_uris,
            &body.scopes,
            client_type,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "clientId": client.client_id,
            "clientSecret": secret,
            "name": client.client_name,
            "redirectUris": client.redirect_uris,
            "scopes": client.scopes,
            "clientType": client.client_type,
        })),
    ))
}

pub async fn revoke_oauth_client(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(client_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx)?;
    if !state.db.revoke_oauth_client(&client_id).await? {
        return Err(ApiError::not_found("client not found or already revoked"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---- jobs & schedules -----------------------------------------------------

fn job_json(job: &ayb_db::JobRecord) -> Value {
    json!({
        "id": job.id,
        "type": job.job_type,
        "payload": job.payload,
        "state": job.state.as_str(),
        "attempts": job.attempts,
        "maxAttempts": job.max_attempts,
        "runAfter": job.run_after.to_rfc3339(),
        "leaseExpiresAt": job.lease_expires_at.map(|l| l.to_rfc3339()),
        "lastError": job.last_error,
        "createdAt": job.created_at.to_rfc3339(),
        "updatedAt": job.updated_at.to_rfc3339(),
    })
}

#[derive(Deserialize)]
pub struct JobsQuery {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

pub async fn list_jobs(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;
    let job_state = query
        .state
        .as_deref()
        .map(|s| s.parse::<JobState>())
        .transpose()?;
    let jobs = state
        .db
        .list_jobs(job_state, query.limit.unwrap_or(100).clamp(1, 500))
        .await?;
    Ok(Json(Value::Array(jobs.iter().map(job_json).collect())))
}

pub async fn get_job(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;
    let job = state
        .db
        .fetch_job(id)
        .await?
        .ok_or_else(|| ApiError::not_found("job not found"))?;
    Ok(Json(job_json(&job)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueJobBody {
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    max_attempts: Option<i32>,
    #[serde(default)]
    run_after: Option<DateTime<Utc>>,
}

pub async fn enqueue_job(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<EnqueueJobBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_admin(&ctx)?;
    let job = state
        .db
        .enqueue_job(
            &body.job_type,
            &body.payload.unwrap_or_else(|| json!({})),
            body.max_attempts.unwrap_or(3).max(1),
            body.run_after,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(job_json(&job))))
}

pub async fn cancel_job(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx)?;
    if !state.db.cancel_job(id).await? {
        return Err(ApiError::not_found("job not found or not cancelable"));
    }
    Ok(StatusCode::NO_CONTENT)
}

fn schedule_json(schedule: &ScheduleRecord) -> Value {
    json!({
        "id": schedule.id,
        "name": schedule.name,
        "jobType": schedule.job_type,
        "cron": schedule.cron_expr,
        "timezone": schedule.timezone,
        "payload": schedule.payload,
        "enabled": schedule.enabled,
        "nextRunAt": schedule.next_run_at.map(|n| n.to_rfc3339()),
        "maxAttempts": schedule.max_attempts,
    })
}

pub async fn list_schedules(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;
    let schedules = state.db.list_schedules().await?;
    Ok(Json(Value::Array(
        schedules.iter().map(schedule_json).collect(),
    )))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleBody {
    name: String,
    job_type: String,
    cron: String,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    max_attempts: Option<i32>,
}

pub async fn upsert_schedule(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<ScheduleBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_admin(&ctx)?;
    let timezone = body.timezone.as_deref().unwrap_or("UTC");
    // Validate the cron/timezone pair up front so broken schedules never
    // reach the scheduler loop.
    ayb_jobs::scheduler::next_fire(&body.cron, timezone, Utc::now())?;
    let schedule = state
        .db
        .upsert_schedule(
            &body.name,
            &body.job_type,
            &body.cron,
            timezone,
            &body.payload.unwrap_or_else(|| json!({})),
            body.enabled,
            body.max_attempts.unwrap_or(3).max(1),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(schedule_json(&schedule))))
}

#[derive(Deserialize)]
pub struct SchedulePatchBody {
    enabled: bool,
}

pub async fn update_schedule(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    Json(body): Json<SchedulePatchBody>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx)?;
    if !state.db.update_schedule_enabled(id, body.enabled).await? {
        return Err(ApiError::not_found("schedule not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_schedule(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx)?;
    if !state.db.delete_schedule(id).await? {
        return Err(ApiError::not_found("schedule not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---- SQL executor ---------------------------------------------------------

#[derive(Deserialize)]
pub struct SqlBody {
    query: String,
}

/// `POST /api/admin/sql` — splits multi-statement input, runs each in
/// order on the admin connection, and returns the last statement's result.
pub async fn execute_sql(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<SqlBody>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&ctx)?;
    let statements = split_statements(&body.query);
    if statements.is_empty() {
        return Err(ApiError::bad_request("no SQL statements supplied"));
    }

    let (last, preceding) = statements.split_last().expect("non-empty");
    for statement in preceding {
        sqlx::query(statement)
            .execute(state.db.pool())
            .await
            .map_err(ayb_db::DbError::from)?;
    }

    // One round trip for both halves of the result: command tags carry the
    // affected-row count for statements without a result set (UPDATE,
    // DELETE, INSERT without RETURNING), rows carry the result set itself.
    let mut rows: Vec<sqlx::postgres::PgRow> = Vec::new();
    let mut affected: u64 = 0;
    {
        let mut results = sqlx::query(last).fetch_many(state.db.pool());
        while let Some(item) = results.try_next().await.map_err(ayb_db::DbError::from)? {
            match item {
                Either::Left(done) => affected += done.rows_affected(),
                Either::Right(row) => rows.push(row),
            }
        }
    }

    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_owned()).collect())
        .unwrap_or_default();
    let row_count = if rows.is_empty() {
        affected
    } else {
        rows.len() as u64
    };
    let rendered: Vec<Value> = rows
        .iter()
        .take(SQL_ROW_CAP)
        .map(|row| {
            Value::Array(
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| decode_column(row, idx, column.type_info().name()))
                    .collect(),
            )
        })
        .collect();

    if statements.iter().any(|s| is_ddl(s)) {
        refresh_schema(&state).await?;
    }

    Ok(Json(json!({
        "columns": columns,
        "rows": rendered,
        "rowCount": row_count,
    })))
}

pub async fn schema_refresh(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx)?;
    refresh_schema(&state).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn is_ddl(statement: &str) -> bool {
    let upper = statement.trim_start().to_ascii_uppercase();
    ["CREATE", "ALTER", "DROP", "TRUNCATE", "GRANT", "REVOKE", "COMMENT"]
        .iter()
        .any(|kw| upper.starts_with(kw))
}

/// Best-effort dynamic decode for the admin console; a type outside the
/// common set renders as null.
fn decode_column(row: &sqlx::postgres::PgRow, idx: usize, type_name: &str) -> Value {
    match type_name {
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" => row
            .try_get::<Option<String>, _>(idx)
            .map(|v| v.map(Value::String).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "INT2" => decode_number::<i16>(row, idx),
        "INT4" => decode_number::<i32>(row, idx),
        "INT8" => decode_number::<i64>(row, idx),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .ok()
            .flatten()
            .and_then(|v| serde_json::Number::from_f64(v as f64).map(Value::Number))
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .and_then(|v| serde_json::Number::from_f64(v).map(Value::Number))
            .unwrap_or(Value::Null),
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .map(|v| v.map(Value::Bool).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<Uuid>, _>(idx)
            .map(|v| v.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .map(|v| {
                v.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null)
            })
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(idx)
            .map(|v| v.unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .map(|v| v.map(Value::String).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
    }
}

fn decode_number<'r, T>(row: &'r sqlx::postgres::PgRow, idx: usize) -> Value
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres> + Into<i64>,
{
    row.try_get::<Option<T>, _>(idx)
        .map(|v| v.map(|n| Value::Number(n.into().into())).unwrap_or(Value::Null))
        .unwrap_or(Value::Null)
}
