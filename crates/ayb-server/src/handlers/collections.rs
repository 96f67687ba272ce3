//! Collections surface: CRUD, list, and batch over user tables. Every
//! operation runs inside an RLS gateway transaction under the caller's
//! claims; webhook deliveries are staged on that same transaction and
//! realtime events go out only after commit.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use ayb_db::{query, ListOptions, TableDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    auth::AuthContext,
    error::ApiError,
    events::{after_commit, stage_webhook_deliveries, ChangeEvent},
    state::SharedState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    sort: Option<String>,
    #[serde(default)]
    fields: Option<String>,
    #[serde(default)]
    expand: Option<String>,
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    page: Option<i64>,
    #[serde(default)]
    per_page: Option<i64>,
    #[serde(default)]
    skip_total: Option<bool>,
}

impl ListParams {
    fn into_options(self) -> ListOptions {
        ListOptions {
            filter: self.filter,
            sort: self.sort,
            fields: self.fields,
            expand: self.expand,
            search: self.search,
            page: self.page,
            per_page: self.per_page,
            skip_total: self.skip_total.unwrap_or(false),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    items: Vec<Value>,
    page: i64,
    per_page: i64,
    total_items: i64,
}

fn resolve_table(
    state: &SharedState,
    ctx: &AuthContext,
    name: &str,
) -> Result<(Arc<ayb_db::SchemaSnapshot>, TableDescriptor), ApiError> {
    if !ctx.allows_table(name) {
        return Err(ApiError::forbidden(format!(
            "API key does not grant access to \"{name}\""
        )));
    }
    let snapshot = state.schema.snapshot();
    let table = snapshot
        .resolve(name)
        .cloned()
        .ok_or_else(|| ApiError::not_found(format!("unknown table \"{name}\"")))?;
    Ok((snapshot, table))
}

fn body_object(body: Value) -> Result<Map<String, Value>, ApiError> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::bad_request("request body must be a JSON object")),
    }
}

pub async fn list_records(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(table_name): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let (snapshot, table) = resolve_table(&state, &ctx, &table_name)?;
    let opts = params.into_options();
    let expand = opts.expand.clone();

    let mut tx = state.gateway.begin(&ctx.session_claims()).await?;
    let mut result = query::run_list(&mut tx, &table, &opts).await?;
    if let Some(expand) = expand.as_deref().filter(|e| !e.trim().is_empty()) {
        query::resolve_expand(&mut tx, &snapshot, &table, &mut result.items, expand).await?;
    }
    tx.commit().await.map_err(ayb_db::DbError::from)?;

    Ok(Json(
        serde_json::to_value(ListResponse {
            items: result.items,
            page: result.page,
            per_page: result.per_page,
            total_items: result.total_items,
        })
        .map_err(ApiError::internal)?,
    ))
}

pub async fn get_record(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path((table_name, id)): Path<(String, String)>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let (snapshot, table) = resolve_table(&state, &ctx, &table_name)?;

    let mut tx = state.gateway.begin(&ctx.session_claims()).await?;
    let record = query::fetch_record(&mut tx, &table, &id, params.fields.as_deref())
        .await?
        .ok_or_else(|| ApiError::not_found("record not found"))?;
    let mut items = vec![record];
    if let Some(expand) = params.expand.as_deref().filter(|e| !e.trim().is_empty()) {
        query::resolve_expand(&mut tx, &snapshot, &table, &mut items, expand).await?;
    }
    tx.commit().await.map_err(ayb_db::DbError::from)?;

    Ok(Json(items.into_iter().next().unwrap_or(Value::Null)))
}

pub async fn create_record(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(table_name): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (_, table) = resolve_table(&state, &ctx, &table_name)?;
    let body = body_object(body)?;

    let mut tx = state.gateway.begin(&ctx.session_claims()).await?;
    let record = query::insert_record(&mut tx, &table, &body).await?;
    let event = ChangeEvent::new("create", &table, record.clone());
    stage_webhook_deliveries(&state, &mut tx, &event).await?;
    tx.commit().await.map_err(ayb_db::DbError::from)?;

    after_commit(&state, vec![event]);
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn update_record(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path((table_name, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let (_, table) = resolve_table(&state, &ctx, &table_name)?;
    let body = body_object(body)?;

    let mut tx = state.gateway.begin(&ctx.session_claims()).await?;
    let record = query::update_record(&mut tx, &table, &id, &body)
        .await?
        .ok_or_else(|| ApiError::not_found("record not found"))?;
    let event = ChangeEvent::new("update", &table, record.clone());
    stage_webhook_deliveries(&state, &mut tx, &event).await?;
    tx.commit().await.map_err(ayb_db::DbError::from)?;

    after_commit(&state, vec![event]);
    Ok(Json(record))
}

pub async fn delete_record(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path((table_name, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let (_, table) = resolve_table(&state, &ctx, &table_name)?;

    let mut tx = state.gateway.begin(&ctx.session_claims()).await?;
    let removed = query::delete_record(&mut tx, &table, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("record not found"))?;
    let event = ChangeEvent::new("delete", &table, pk_only(&table, &removed));
    stage_webhook_deliveries(&state, &mut tx, &event).await?;
    tx.commit().await.map_err(ayb_db::DbError::from)?;

    after_commit(&state, vec![event]);
    Ok(StatusCode::NO_CONTENT)
}

/// Delete events carry a PK-only payload.
fn pk_only(table: &TableDescriptor, record: &Value) -> Value {
    match table.primary_key.as_deref() {
        Some(pk) => json!({ pk: record[pk].clone() }),
        None => Value::Object(Map::new()),
    }
}

const MAX_BATCH_OPS: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    operations: Vec<BatchOperation>,
}

#[derive(Debug, Deserialize)]
struct BatchOperation {
    method: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    body: Option<Value>,
}

#[derive(Debug, Serialize)]
struct BatchResult {
    index: usize,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

/// All operations run in one transaction; the first failure aborts the
/// whole batch and its error becomes the response.
pub async fn batch(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(table_name): Path<String>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.operations.is_empty() {
        return Err(ApiError::bad_request("operations must not be empty"));
    }
    if request.operations.len() > MAX_BATCH_OPS {
        return Err(ApiError::bad_request(format!(
            "a batch is limited to {MAX_BATCH_OPS} operations"
        )));
    }
    let (_, table) = resolve_table(&state, &ctx, &table_name)?;

    let mut tx = state.gateway.begin(&ctx.session_claims()).await?;
    let mut results = Vec::with_capacity(request.operations.len());
    let mut events = Vec::new();

    for (index, op) in request.operations.iter().enumerate() {
        match apply_operation(&mut tx, &table, op).await {
            Ok((status, body, event)) => {
                if let Some(event) = event {
                    events.push(event);
                }
                results.push(BatchResult {
                    index,
                    status,
                    body,
                });
            }
            Err(err) => {
                // Abort everything; the failing op's error is the response.
                tx.rollback().await.ok();
                return Err(err);
            }
        }
    }

    for event in &events {
        stage_webhook_deliveries(&state, &mut tx, event).await?;
    }
    tx.commit().await.map_err(ayb_db::DbError::from)?;
    after_commit(&state, events);

    Ok(Json(
        serde_json::to_value(results).map_err(ApiError::internal)?,
    ))
}

async fn apply_operation(
    tx: &mut sqlx::PgConnection,
    table: &TableDescriptor,
    op: &BatchOperation,
) -> Result<(u16, Option<Value>, Option<ChangeEvent>), ApiError> {
    match op.method.to_ascii_uppercase().as_str() {
        "POST" => {
            let body = body_object(op.body.clone().unwrap_or_else(|| json!({})))?;
            let record = query::insert_record(tx, table, &body).await?;
            let event = ChangeEvent::new("create", table, record.clone());
            Ok((201, Some(record), Some(event)))
        }
        "PATCH" => {
            let id = op
                .id
                .as_deref()
                .ok_or_else(|| ApiError::bad_request("PATCH operations require an id"))?;
            let body = body_object(op.body.clone().unwrap_or_else(|| json!({})))?;
            let record = query::update_record(tx, table, id, &body)
                .await?
                .ok_or_else(|| ApiError::not_found("record not found"))?;
            let event = ChangeEvent::new("update", table, record.clone());
            Ok((200, Some(record), Some(event)))
        }
        "DELETE" => {
            let id = op
                .id
                .as_deref()
                .ok_or_else(|| ApiError::bad_request("DELETE operations require an id"))?;
            let removed = query::delete_record(tx, table, id)
                .await?
                .ok_or_else(|| ApiError::not_found("record not found"))?;
            let event = ChangeEvent::new("delete", table, pk_only(table, &removed));
            Ok((204, None, Some(event)))
        }
        other => Err(ApiError::bad_request(format!(
            "unsupported batch method \"{other}\""
        ))),
    }
}
