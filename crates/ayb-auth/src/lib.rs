//! Identity service and OAuth 2.1 authorization server for AllYourBase.

pub mod identity;
pub mod jwt;
pub mod mfa;
pub mod oauth_provider;
pub mod oauth_server;
pub mod password;
pub mod tokens;

use ayb_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Wrong email/password, dead refresh token, bad OTP.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Db(#[from] DbError),

    /// Upstream OAuth provider misbehaved.
    #[error("provider request failed: {0}")]
    Provider(String),

    #[error("internal auth failure: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn validation(message: impl Into<String>) -> Self {
        AuthError::Validation(message.into())
    }
}
