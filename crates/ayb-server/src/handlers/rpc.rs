//! `POST /api/rpc/{function}` — named-argument invocation of PostgreSQL
//! functions, inside the caller's RLS session.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use ayb_db::rpc::{call_function, resolve_function, RpcResult};
use serde_json::{Map, Value};

use crate::{auth::AuthContext, error::ApiError, state::SharedState};

pub async fn invoke(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Path(function): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Response, ApiError> {
    let args: Map<String, Value> = match body {
        None => Map::new(),
        Some(Json(Value::Object(map))) => map,
        Some(Json(Value::Null)) => Map::new(),
        Some(_) => {
            return Err(ApiError::bad_request(
                "rpc arguments must be a JSON object of named parameters",
            ))
        }
    };

    let mut tx = state.gateway.begin(&ctx.session_claims()).await?;
    let descriptor = resolve_function(&mut tx, &function, args.len()).await?;
    let result = call_function(&mut tx, &descriptor, &args).await?;
    tx.commit().await.map_err(ayb_db::DbError::from)?;

    Ok(match result {
        RpcResult::Void => StatusCode::NO_CONTENT.into_response(),
        RpcResult::Scalar(value) => Json(value).into_response(),
        RpcResult::Row(Some(value)) => Json(value).into_response(),
        RpcResult::Row(None) => Json(Value::Null).into_response(),
        RpcResult::Rows(values) => Json(Value::Array(values)).into_response(),
    })
}
