//! The HTTP error envelope `{code, message, data?}` and the conversions
//! from the engine and auth error types. OAuth endpoints bypass this and
//! answer in RFC 6749 shape.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ayb_auth::{oauth_server::OAuthErrorBody, AuthError};
use ayb_db::DbError;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub data: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unsupported_media(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, message)
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Validation(message) => ApiError::bad_request(message),
            DbError::NotFound(message) => ApiError::not_found(message),
            DbError::Conflict {
                message,
                constraint,
                detail,
            } => {
                let data = constraint.map(|name| {
                    json!({ name: { "code": "conflict", "message": detail.unwrap_or_default() } })
                });
                ApiError {
                    status: StatusCode::CONFLICT,
                    message,
                    data,
                }
            }
            DbError::Unprocessable {
                message,
                constraint,
            } => {
                let data = constraint.map(|name| {
                    json!({ name: { "code": "unprocessable", "message": message.clone() } })
                });
                ApiError {
                    status: StatusCode::UNPROCESSABLE_ENTITY,
                    message,
                    data,
                }
            }
            DbError::Database(inner) => ApiError::internal(inner),
            DbError::Migrate(inner) => ApiError::internal(inner),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => ApiError::unauthorized("invalid credentials"),
            AuthError::Unauthorized => ApiError::unauthorized("missing or invalid bearer token"),
            AuthError::Validation(message) => ApiError::bad_request(message),
            AuthError::NotFound(message) => ApiError::not_found(message),
            AuthError::Db(inner) => ApiError::from(inner),
            AuthError::Provider(message) => {
                ApiError::new(StatusCode::BAD_GATEWAY, format!("provider error: {message}"))
            }
            AuthError::Internal(message) => ApiError::internal(message),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'m> {
    code: u16,
    message: &'m str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'m Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "request failed");
        }
        let body = Envelope {
            code: self.status.as_u16(),
            message: &self.message,
            data: self.data.as_ref(),
        };
        (self.status, Json(body)).into_response()
    }
}

/// RFC 6749 error rendering for the OAuth endpoints.
pub struct OAuthErrorResponse(pub OAuthErrorBody);

impl IntoResponse for OAuthErrorResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_errors_map_to_spec_statuses() {
        let cases = [
            (DbError::validation("bad filter"), StatusCode::BAD_REQUEST),
            (DbError::not_found("no table"), StatusCode::NOT_FOUND),
            (
                DbError::Conflict {
                    message: "dup".into(),
                    constraint: Some("uniq".into()),
                    detail: None,
                },
                StatusCode::CONFLICT,
            ),
            (
                DbError::Unprocessable {
                    message: "null".into(),
                    constraint: None,
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn conflict_data_is_keyed_by_constraint() {
        let err = ApiError::from(DbError::Conflict {
            message: "duplicate key".into(),
            constraint: Some("tags_name_key".into()),
            detail: Some("Key (name)=(go) already exists.".into()),
        });
        let data = err.data.unwrap();
        assert!(data.get("tags_name_key").is_some());
    }

    #[test]
    fn auth_errors_map_to_401() {
        assert_eq!(
            ApiError::from(AuthError::InvalidCredentials).status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(AuthError::Unauthorized).status,
            StatusCode::UNAUTHORIZED
        );
    }
}
