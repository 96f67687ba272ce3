pub mod admin;
pub mod auth_routes;
pub mod collections;
pub mod oauth_routes;
pub mod rpc;

use axum::{extract::State, Extension, Json};
use serde_json::{json, Value};

use crate::{
    auth::{require_authenticated, AuthContext},
    error::ApiError,
    state::SharedState,
};

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /api/schema` — the cached snapshot, for any authenticated bearer.
pub async fn schema(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    require_authenticated(&ctx)?;
    let snapshot = state.schema.snapshot();
    let tables = serde_json::to_value(&snapshot.tables).map_err(ApiError::internal)?;
    Ok(Json(json!({ "tables": tables })))
}

/// `POST /api/admin/schema/refresh` is in `admin`; this one is the shared
/// helper other handlers use after DDL ran.
pub async fn refresh_schema(state: &SharedState) -> Result<(), ApiError> {
    state.schema.refresh().await.map_err(ApiError::from)
}
