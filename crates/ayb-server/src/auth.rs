//! Bearer resolution.
//!
//! One middleware pass classifies the bearer by shape — JWT (three dot
//! segments), API key (`ayb_…`), OAuth access token (`ayb_at_…`) — resolves
//! it against the database, and parks an [`AuthContext`] in the request
//! extensions for handlers and the rate limiter.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use ayb_auth::{
    jwt::{looks_like_jwt, ROLE_ADMIN, ROLE_AUTHENTICATED},
    tokens::{hash_token, OAUTH_ACCESS_PREFIX},
};
use ayb_db::SessionClaims;
use chrono::Utc;
use uuid::Uuid;

use crate::{error::ApiError, state::SharedState};

/// Resolved caller identity for one request.
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub admin: bool,
    /// App the API key belongs to, with its configured budget
    /// (requests, window seconds) — feeds the per-app rate limiter.
    pub app_limit: Option<(Uuid, i32, i32)>,
    /// Tables an API key is restricted to; empty means unrestricted.
    pub allowed_tables: Vec<String>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some() || self.admin
    }

    pub fn session_claims(&self) -> SessionClaims {
        match (self.user_id, self.email.as_deref()) {
            (Some(user_id), Some(email)) => SessionClaims::authenticated(user_id, email),
            _ => SessionClaims::anonymous(),
        }
    }

    pub fn allows_table(&self, table: &str) -> bool {
        self.allowed_tables.is_empty() || self.allowed_tables.iter().any(|t| t == table)
    }
}

/// Pulls `Bearer <token>` off the Authorization header. A malformed header
/// is an error; a missing one is an anonymous request.
pub fn bearer_from_headers(headers: &axum::http::HeaderMap) -> Result<Option<String>, ApiError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let header_value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid Authorization header encoding"))?;
    let token = header_value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("Authorization header must be a Bearer token"))?;
    Ok(Some(token.trim().to_owned()))
}

pub async fn resolve_bearer(
    state: &SharedState,
    token: &str,
) -> Result<AuthContext, ApiError> {
    // Order matters: `ayb_at_` also starts with the API-key prefix.
    if token.starts_with(OAUTH_ACCESS_PREFIX) {
        return resolve_oauth_access(state, token).await;
    }
    if token.starts_with("ayb_") {
        return resolve_api_key(state, token).await;
    }
    if looks_like_jwt(token) {
        return resolve_jwt(state, token);
    }
    Err(ApiError::unauthorized("unrecognized bearer token format"))
}

fn resolve_jwt(state: &SharedState, token: &str) -> Result<AuthContext, ApiError> {
    let claims = state.jwt.verify(token).map_err(ApiError::from)?;
    match claims.role.as_str() {
        ROLE_ADMIN => Ok(AuthContext {
            user_id: None,
            email: Some(claims.email),
            admin: true,
            app_limit: None,
            allowed_tables: Vec::new(),
        }),
        ROLE_AUTHENTICATED => Ok(AuthContext {
            user_id: Some(claims.user_id().map_err(ApiError::from)?),
            email: Some(claims.email),
            admin: false,
            app_limit: None,
            allowed_tables: Vec::new(),
        }),
        // mfa_pending and anything else cannot reach data routes.
        _ => Err(ApiError::unauthorized("token role is not accepted here")),
    }
}

async fn resolve_api_key(state: &SharedState, token: &str) -> Result<AuthContext, ApiError> {
    let record = state
        .db
        .find_api_key_by_hash(&hash_token(token))
        .await
        .map_err(ApiError::from)?
        .filter(|key| key.is_usable(Utc::now()))
        .ok_or_else(|| ApiError::unauthorized("invalid API key"))?;

    let app_limit = match record.app_id {
        Some(app_id) => state
            .db
            .fetch_app(app_id)
            .await
            .map_err(ApiError::from)?
            .map(|app| (app.id, app.rate_limit_rps, app.rate_limit_window_seconds)),
        None => None,
    };

    let (user_id, email) = match record.user_id {
        Some(user_id) => {
            let user = state
                .db
                .fetch_user(user_id)
                .await
                .map_err(ApiError::from)?
                .ok_or_else(|| ApiError::unauthorized("API key owner no longer exists"))?;
            (Some(user.id), Some(user.email))
        }
        None => (None, None),
    };

    Ok(AuthContext {
        user_id,
        email,
        admin: record.scope == "admin",
        app_limit,
        allowed_tables: record.allowed_tables,
    })
}

async fn resolve_oauth_access(state: &SharedState, token: &str) -> Result<AuthContext, ApiError> {
    let record = state
        .oauth
        .resolve_access_token(token)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::unauthorized("invalid or expired access token"))?;

    let (user_id, email) = match record.user_id {
        Some(user_id) => {
            let user = state
                .db
                .fetch_user(user_id)
                .await
                .map_err(ApiError::from)?
                .ok_or_else(|| ApiError::unauthorized("token subject no longer exists"))?;
            (Some(user.id), Some(user.email))
        }
        None => (None, None),
    };

    Ok(AuthContext {
        user_id,
        email,
        admin: false,
        app_limit: None,
        allowed_tables: Vec::new(),
    })
}

/// Middleware: resolve the bearer (if any) and stash the context. Missing
/// bearer means anonymous; an invalid one fails the request here.
pub async fn auth_middleware(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let context = match bearer_from_headers(request.headers())? {
        Some(token) => resolve_bearer(&state, &token).await?,
        None => AuthContext::anonymous(),
    };
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

/// Handler-side helpers over the parked context.
pub fn context(request_extensions: &axum::http::Extensions) -> AuthContext {
    request_extensions
        .get::<AuthContext>()
        .cloned()
        .unwrap_or_default()
}

pub fn require_authenticated(ctx: &AuthContext) -> Result<(), ApiError> {
    if ctx.is_authenticated() {
        Ok(())
    } else {
        Err(ApiError::unauthorized("authentication required"))
    }
}

pub fn require_user(ctx: &AuthContext) -> Result<Uuid, ApiError> {
    ctx.user_id
        .ok_or_else(|| ApiError::unauthorized("a user session is required"))
}

pub fn require_admin(ctx: &AuthContext) -> Result<(), ApiError> {
    if ctx.admin {
        Ok(())
    } else {
        Err(ApiError::forbidden("admin scope required"))
    }
}
