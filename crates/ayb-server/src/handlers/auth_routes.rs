//! Identity endpoints under `/api/auth`, plus the OAuth-consumer login
//! flow (`/api/auth/oauth/{provider}`).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    Extension, Json,
};
use ayb_auth::{
    identity::{LoginOutcome, TokenPair},
    oauth_provider::{complete_provider_login, Provider},
};
use ayb_db::UserRecord;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::{require_user, AuthContext},
    error::ApiError,
    state::SharedState,
};

fn user_json(user: &UserRecord) -> Value {
    json!({
        "id": user.id,
        "email": user.email,
        "emailVerified": user.email_verified,
        "mfaEnabled": user.mfa_enabled,
        "createdAt": user.created_at.to_rfc3339(),
        "updatedAt": user.updated_at.to_rfc3339(),
    })
}

fn pair_json(pair: &TokenPair, user: Option<&UserRecord>) -> Value {
    let mut body = json!({
        "access_token": pair.access_token,
        "refresh_token": pair.refresh_token,
        "token_type": "Bearer",
        "expires_in": pair.expires_in,
    });
    if let Some(user) = user {
        body["user"] = user_json(user);
    }
    body
}

#[derive(Deserialize)]
pub struct RegisterBody {
    email: String,
    password: String,
}

pub async fn register(
    State(state): State<SharedState>,
    Json(body): Json<RegisterBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (user, pair) = state.identity.register(&body.email, &body.password).await?;
    Ok((StatusCode::CREATED, Json(pair_json(&pair, Some(&user)))))
}

#[derive(Deserialize)]
pub struct LoginBody {
    email: String,
    password: String,
}

pub async fn login(
    State(state): State<SharedState>,
    Json(body): Json<LoginBody>,
) -> Result<Json<Value>, ApiError> {
    match state.identity.login(&body.email, &body.password).await? {
        LoginOutcome::Tokens(pair) => Ok(Json(pair_json(&pair, None))),
        LoginOutcome::MfaRequired { challenge_token } => Ok(Json(json!({
            "mfa_required": true,
            "challenge_token": challenge_token,
        }))),
    }
}

#[derive(Deserialize)]
pub struct RefreshBody {
    refresh_token: String,
}

pub async fn refresh(
    State(state): State<SharedState>,
    Json(body): Json<RefreshBody>,
) -> Result<Json<Value>, ApiError> {
    let pair = state.identity.refresh(&body.refresh_token).await?;
    Ok(Json(pair_json(&pair, None)))
}

pub async fn logout(
    State(state): State<SharedState>,
    Json(body): Json<RefreshBody>,
) -> Result<StatusCode, ApiError> {
    state.identity.logout(&body.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_user(&ctx)?;
    let user = state.identity.me(user_id).await?;
    Ok(Json(user_json(&user)))
}

pub async fn delete_me(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<StatusCode, ApiError> {
    let user_id = require_user(&ctx)?;
    state.identity.delete_account(user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct EmailBody {
    email: String,
}

/// Always 200: account existence is never revealed.
pub async fn password_reset_request(
    State(state): State<SharedState>,
    Json(body): Json<EmailBody>,
) -> Result<Json<Value>, ApiError> {
    state.identity.request_password_reset(&body.email).await?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
pub struct PasswordResetConfirmBody {
    token: String,
    password: String,
}

pub async fn password_reset_confirm(
    State(state): State<SharedState>,
    Json(body): Json<PasswordResetConfirmBody>,
) -> Result<StatusCode, ApiError> {
    state
        .identity
        .confirm_password_reset(&body.token, &body.password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct TokenBody {
    token: String,
}

pub async fn verify_email(
    State(state): State<SharedState>,
    Json(body): Json<TokenBody>,
) -> Result<StatusCode, ApiError> {
    state.identity.confirm_email_verification(&body.token).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn resend_verification(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_user(&ctx)?;
    state.identity.resend_email_verification(user_id).await?;
    Ok(Json(json!({})))
}

pub async fn magic_link_request(
    State(state): State<SharedState>,
    Json(body): Json<EmailBody>,
) -> Result<Json<Value>, ApiError> {
    state.identity.request_magic_link(&body.email).await?;
    Ok(Json(json!({})))
}

pub async fn magic_link_confirm(
    State(state): State<SharedState>,
    Json(body): Json<TokenBody>,
) -> Result<Json<Value>, ApiError> {
    let pair = state.identity.confirm_magic_link(&body.token).await?;
    Ok(Json(pair_json(&pair, None)))
}

#[derive(Deserialize)]
pub struct SmsRequestBody {
    phone: String,
}

pub async fn sms_request(
    State(state): State<SharedState>,
    Json(body): Json<SmsRequestBody>,
) -> Result<Json<Value>, ApiError> {
    state.identity.request_sms_code(&body.phone).await?;
    Ok(Json(json!({})))
}

#[derive(Deserialize)]
pub struct SmsConfirmBody {
    phone: String,
    code: String,
}

pub async fn sms_confirm(
    State(state): State<SharedState>,
    Json(body): Json<SmsConfirmBody>,
) -> Result<Json<Value>, ApiError> {
    let pair = state.identity.confirm_sms_code(&body.phone, &body.code).await?;
    Ok(Json(pair_json(&pair, None)))
}

pub async fn mfa_enroll(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ApiError> {
    let user_id = require_user(&ctx)?;
    let (secret, otpauth_url) = state.identity.mfa_enroll(user_id).await?;
    Ok(Json(json!({ "secret": secret, "otpauth_url": otpauth_url })))
}

#[derive(Deserialize)]
pub struct MfaVerifyBody {
    code: String,
}

pub async fn mfa_verify(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<MfaVerifyBody>,
) -> Result<StatusCode, ApiError> {
    let user_id = require_user(&ctx)?;
    state.identity.mfa_verify(user_id, &body.code).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct MfaChallengeBody {
    challenge_token: String,
    code: String,
}

pub async fn mfa_challenge(
    State(state): State<SharedState>,
    Json(body): Json<MfaChallengeBody>,
) -> Result<Json<Value>, ApiError> {
    let pair = state
        .identity
        .mfa_challenge(&body.challenge_token, &body.code)
        .await?;
    Ok(Json(pair_json(&pair, None)))
}

#[derive(Deserialize)]
pub struct ProviderStartQuery {
    /// SSE client id (or any opaque value) threaded through the provider
    /// round-trip.
    #[serde(default)]
    state: Option<String>,
}

fn provider_of(name: &str) -> Result<Provider, ApiError> {
    Provider::parse(name)
        .ok_or_else(|| ApiError::not_found(format!("unknown OAuth provider \"{name}\"")))
}

fn callback_url(state: &SharedState, provider: Provider) -> String {
    format!(
        "{}/api/auth/oauth/{}/callback",
        state.config.external_url.trim_end_matches('/'),
        provider.as_str()
    )
}

/// `GET /api/auth/oauth/{provider}` — bounce the browser to the provider.
pub async fn provider_start(
    State(state): State<SharedState>,
    Path(provider): Path<String>,
    Query(query): Query<ProviderStartQuery>,
) -> Result<Redirect, ApiError> {
    let provider = provider_of(&provider)?;
    let url = state
        .consumer
        .authorize_url(
            provider,
            &callback_url(&state, provider),
            query.state.as_deref().unwrap_or_default(),
        )
        .map_err(ApiError::from)?;
    Ok(Redirect::temporary(&url))
}

#[derive(Deserialize)]
pub struct ProviderCallbackQuery {
    code: String,
    #[serde(default)]
    state: Option<String>,
}

/// `GET /api/auth/oauth/{provider}/callback` — exchange the code, link or
/// create the user, and hand the tokens back: over the SSE return channel
/// when the state names a live subscriber, otherwise as JSON.
pub async fn provider_callback(
    State(state): State<SharedState>,
    Path(provider): Path<String>,
    Query(query): Query<ProviderCallbackQuery>,
) -> Result<Response, ApiError> {
    let provider = provider_of(&provider)?;
    let profile = state
        .consumer
        .exchange_code(provider, &query.code, &callback_url(&state, provider))
        .await
        .map_err(ApiError::from)?;
    let (user, pair) = complete_provider_login(&state.identity, provider, &profile)
        .await
        .map_err(ApiError::from)?;

    let payload = pair_json(&pair, Some(&user));
    if let Some(client_id) = query.state.as_deref().and_then(|s| Uuid::parse_str(s).ok()) {
        if state.hub.deliver_oauth_result(client_id, payload.clone()) {
            return Ok(Html(
                "<html><body>Signed in. You can close this window.</body></html>",
            )
            .into_response());
        }
    }
    Ok(Json(payload).into_response())
}
