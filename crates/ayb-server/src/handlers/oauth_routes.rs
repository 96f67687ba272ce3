//! OAuth 2.1 authorization-server endpoints. Errors here follow RFC 6749
//! JSON rather than the standard envelope; token and revocation requests
//! are form-encoded per the RFC.

use axum::{
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Redirect, Response},
    Extension, Form, Json,
};
use ayb_auth::oauth_server::{
    AuthorizeOutcome, AuthorizeRequest, ClientAuth, OAuthErrorBody, TokenRequest,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

use crate::{
    auth::{require_user, AuthContext},
    error::{ApiError, OAuthErrorResponse},
    state::SharedState,
};

#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    client_id: String,
    redirect_uri: String,
    #[serde(default)]
    response_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    code_challenge: Option<String>,
    #[serde(default)]
    code_challenge_method: Option<String>,
}

impl AuthorizeParams {
    fn into_request(self) -> AuthorizeRequest {
        AuthorizeRequest {
            client_id: self.client_id,
            redirect_uri: self.redirect_uri,
            response_type: self.response_type.unwrap_or_default(),
            scope: self.scope,
            state: self.state,
            code_challenge: self.code_challenge,
            code_challenge_method: self.code_challenge_method,
        }
    }
}

/// `GET /api/auth/authorize` — requires a signed-in user session.
pub async fn authorize(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Query(params): Query<AuthorizeParams>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&ctx)?;
    let request = params.into_request();
    match state.oauth.authorize(user_id, &request).await? {
        AuthorizeOutcome::Redirect(url) => Ok(Redirect::to(&url).into_response()),
        AuthorizeOutcome::ConsentRequired {
            client_id,
            client_name,
            scopes,
        } => Ok(Json(json!({
            "consent_required": true,
            "client_id": client_id,
            "client_name": client_name,
            "scopes": scopes,
        }))
        .into_response()),
    }
}

/// `POST /api/auth/authorize/consent` — records approval and returns the
/// final redirect for the front-end to follow.
pub async fn consent(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Json(params): Json<AuthorizeParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_user(&ctx)?;
    let request = params.into_request();
    let redirect = state.oauth.consent(user_id, &request).await?;
    Ok(Json(json!({ "redirect": redirect })))
}

/// Basic header + form fields into a [`ClientAuth`], refusing credentials
/// in both places.
fn client_auth(headers: &axum::http::HeaderMap, form: &HashMap<String, String>) -> ClientAuth {
    let body_id = form.get("client_id").cloned();
    let body_secret = form.get("client_secret").cloned();

    if let Some((id, secret)) = basic_credentials(headers) {
        return ClientAuth {
            client_id: Some(id),
            client_secret: secret,
            via_basic: true,
            also_in_body: body_secret.is_some(),
        };
    }

    ClientAuth {
        client_id: body_id,
        client_secret: body_secret,
        via_basic: false,
        also_in_body: false,
    }
}

fn basic_credentials(headers: &axum::http::HeaderMap) -> Option<(String, Option<String>)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    match decoded.split_once(':') {
        Some((id, secret)) => Some((
            id.to_owned(),
            if secret.is_empty() {
                None
            } else {
                Some(secret.to_owned())
            },
        )),
        None => Some((decoded, None)),
    }
}

/// `POST /api/auth/token` — form-encoded per RFC 6749.
pub async fn token(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let auth = client_auth(&headers, &form);
    let request = TokenRequest {
        grant_type: form.get("grant_type").cloned().unwrap_or_default(),
        code: form.get("code").cloned(),
        redirect_uri: form.get("redirect_uri").cloned(),
        code_verifier: form.get("code_verifier").cloned(),
        refresh_token: form.get("refresh_token").cloned(),
        scope: form.get("scope").cloned(),
    };

    match state.oauth.token(&auth, &request).await {
        Ok(response) => Json(response).into_response(),
        Err(error) => OAuthErrorResponse(error).into_response(),
    }
}

/// `POST /api/auth/revoke` — RFC 7009: always 200.
pub async fn revoke(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let auth = client_auth(&headers, &form);
    let Some(token) = form.get("token") else {
        return OAuthErrorResponse(OAuthErrorBody::invalid_request("missing token parameter"))
            .into_response();
    };
    match state.oauth.revoke(&auth, token).await {
        Ok(()) => Json(json!({})).into_response(),
        Err(error) => OAuthErrorResponse(error).into_response(),
    }
}
