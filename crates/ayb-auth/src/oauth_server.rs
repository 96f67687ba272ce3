//! OAuth 2.1 authorization server: authorization-code + PKCE and
//! client-credentials grants, opaque tokens with rotation and reuse
//! detection.

use ayb_db::{Db, OauthClientRecord, OauthTokenRecord};
use chrono::{Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    password::verify_password,
    tokens::{
        generate_token, hash_token, valid_code_challenge, verify_pkce_s256, OAUTH_ACCESS_PREFIX,
        OAUTH_REFRESH_PREFIX,
    },
    AuthError,
};

/// RFC 6749 §5.2 error body. `status` picks the HTTP code the handler
/// responds with.
#[derive(Debug, Serialize)]
pub struct OAuthErrorBody {
    pub error: &'static str,
    pub error_description: String,
    #[serde(skip)]
    pub status: u16,
}

impl OAuthErrorBody {
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self {
            error: "invalid_request",
            error_description: description.into(),
            status: 400,
        }
    }

    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self {
            error: "invalid_client",
            error_description: description.into(),
            status: 401,
        }
    }

    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self {
            error: "invalid_grant",
            error_description: description.into(),
            status: 400,
        }
    }

    pub fn unauthorized_client(description: impl Into<String>) -> Self {
        Self {
            error: "unauthorized_client",
            error_description: description.into(),
            status: 400,
        }
    }

    pub fn unsupported_grant_type() -> Self {
        Self {
            error: "unsupported_grant_type",
            error_description: "supported grants: authorization_code, client_credentials, refresh_token".into(),
            status: 400,
        }
    }

    pub fn invalid_scope(description: impl Into<String>) -> Self {
        Self {
            error: "invalid_scope",
            error_description: description.into(),
            status: 400,
        }
    }

    pub fn server_error(description: impl Into<String>) -> Self {
        Self {
            error: "server_error",
            error_description: description.into(),
            status: 500,
        }
    }
}

impl From<AuthError> for OAuthErrorBody {
    fn from(err: AuthError) -> Self {
        OAuthErrorBody::server_error(err.to_string())
    }
}

impl From<ayb_db::DbError> for OAuthErrorBody {
    fn from(err: ayb_db::DbError) -> Self {
        OAuthErrorBody::server_error(err.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct AuthorizeRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: String,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

#[derive(Debug)]
pub enum AuthorizeOutcome {
    /// Redirect back to the client, either with a code or an error.
    Redirect(String),
    /// No covering consent on file: the front-end must show a consent
    /// prompt and come back through `consent`.
    ConsentRequired {
        client_id: String,
        client_name: String,
        scopes: Vec<String>,
    },
}

/// Client credentials extracted by the HTTP layer: Basic auth or body
/// parameters, but never both.
#[derive(Clone, Debug, Default)]
pub struct ClientAuth {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub via_basic: bool,
    pub also_in_body: bool,
}

#[derive(Clone, Debug, Default)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub scope: String,
}

#[derive(Clone, Debug)]
pub struct OAuthServerConfig {
    pub code_ttl: Duration,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl Default for OAuthServerConfig {
    fn default() -> Self {
        Self {
            code_ttl: Duration::minutes(10),
            access_ttl: Duration::hours(1),
            refresh_ttl: Duration::days(30),
        }
    }
}

#[derive(Clone)]
pub struct OAuthServer {
    db: Db,
    config: OAuthServerConfig,
}

impl OAuthServer {
    pub fn new(db: Db, config: OAuthServerConfig) -> Self {
        Self { db, config }
    }

    /// Validates an authorization request for the signed-in `user_id`.
    /// Client and redirect URI problems are reported directly; everything
    /// after that redirects back to the client per RFC 6749 §4.1.2.1.
    pub async fn authorize(
        &self,
        user_id: Uuid,
        req: &AuthorizeRequest,
    ) -> Result<AuthorizeOutcome, AuthError> {
        let client = self.validated_client(&req.client_id).await?;
        if !client.redirect_uris.iter().any(|uri| uri == &req.redirect_uri) {
            return Err(AuthError::validation("redirect_uri is not registered"));
        }

        if req.response_type != "code" {
            return Ok(AuthorizeOutcome::Redirect(error_redirect(
                &req.redirect_uri,
                "unsupported_response_type",
                req.state.as_deref(),
            )));
        }
        match req.code_challenge_method.as_deref() {
            Some("S256") => {}
            // PKCE is mandatory and `plain` is rejected for every client.
            _ => {
                return Ok(AuthorizeOutcome::Redirect(error_redirect(
                    &req.redirect_uri,
                    "invalid_request",
                    req.state.as_deref(),
                )))
            }
        }
        let challenge = match req.code_challenge.as_deref() {
            Some(challenge) if valid_code_challenge(challenge) => challenge,
            _ => {
                return Ok(AuthorizeOutcome::Redirect(error_redirect(
                    &req.redirect_uri,
                    "invalid_request",
                    req.state.as_deref(),
                )))
            }
        };

        let scopes = parse_scopes(req.scope.as_deref());
        if !scopes.iter().all(|s| client.scopes.contains(s)) {
            return Ok(AuthorizeOutcome::Redirect(error_redirect(
                &req.redirect_uri,
                "invalid_scope",
                req.state.as_deref(),
            )));
        }

        let consented = self
            .db
            .find_oauth_consent(user_id, &client.client_id)
            .await?
            .map(|granted| scopes.iter().all(|s| granted.contains(s)))
            .unwrap_or(false);
        if !consented {
            return Ok(AuthorizeOutcome::ConsentRequired {
                client_id: client.client_id.clone(),
                client_name: client.client_name.clone(),
                scopes,
            });
        }

        let url = self
            .issue_code_redirect(user_id, &client, req, challenge, &scopes)
            .await?;
        Ok(AuthorizeOutcome::Redirect(url))
    }

    /// Records consent and finishes the authorization with a code redirect.
    pub async fn consent(
        &self,
        user_id: Uuid,
        req: &AuthorizeRequest,
    ) -> Result<String, AuthError> {
        let client = self.validated_client(&req.client_id).await?;
        if !client.redirect_uris.iter().any(|uri| uri == &req.redirect_uri) {
            return Err(AuthError::validation("redirect_uri is not registered"));
        }
        let challenge = req
            .code_challenge
            .as_deref()
            .filter(|c| valid_code_challenge(c))
            .ok_or_else(|| AuthError::validation("invalid code_challenge"))?;
        let scopes = parse_scopes(req.scope.as_deref());
        if !scopes.iter().all(|s| client.scopes.contains(s)) {
            return Err(AuthError::validation("requested scope exceeds the client"));
        }

        self.db
            .upsert_oauth_consent(user_id, &client.client_id, &scopes)
            .await?;
        self.issue_code_redirect(user_id, &client, req, challenge, &scopes)
            .await
    }

    async fn issue_code_redirect(
        &self,
        user_id: Uuid,
        client: &OauthClientRecord,
        req: &AuthorizeRequest,
        challenge: &str,
        scopes: &[String],
    ) -> Result<String, AuthError> {
        let code = generate_token("");
        self.db
            .insert_authorization_code(
                &hash_token(&code),
                &client.client_id,
                user_id,
                &req.redirect_uri,
                scopes,
                challenge,
                Utc::now() + self.config.code_ttl,
            )
            .await?;

        let mut url = format!(
            "{}{}code={}",
            req.redirect_uri,
            if req.redirect_uri.contains('?') { "&" } else { "?" },
            urlencoding::encode(&code),
        );
        if let Some(state) = req.state.as_deref() {
            url.push_str(&format!("&state={}", urlencoding::encode(state)));
        }
        Ok(url)
    }

    /// `POST /token` — all three grants.
    pub async fn token(
        &self,
        auth: &ClientAuth,
        req: &TokenRequest,
    ) -> Result<TokenResponse, OAuthErrorBody> {
        if auth.also_in_body && auth.via_basic {
            return Err(OAuthErrorBody::invalid_request(
                "client credentials must not be sent in both the header and the body",
            ));
        }
        let client_id = auth
            .client_id
            .as_deref()
            .ok_or_else(|| OAuthErrorBody::invalid_client("missing client_id"))?;
        let client = self
            .db
            .fetch_oauth_client(client_id)
            .await?
            .filter(|c| c.revoked_at.is_none())
            .ok_or_else(|| OAuthErrorBody::invalid_client("unknown client"))?;

        self.authenticate_client(&client, auth.client_secret.as_deref())?;

        match req.grant_type.as_str() {
            "authorization_code" => self.grant_authorization_code(&client, req).await,
            "client_credentials" => self.grant_client_credentials(&client, req).await,
            "refresh_token" => self.grant_refresh(&client, req).await,
            _ => Err(OAuthErrorBody::unsupported_grant_type()),
        }
    }

    fn authenticate_client(
        &self,
        client: &OauthClientRecord,
        secret: Option<&str>,
    ) -> Result<(), OAuthErrorBody> {
        if client.is_public() {
            // Public clients rely on PKCE alone and must not present a
            // secret.
            if secret.is_some() {
                return Err(OAuthErrorBody::invalid_client(
                    "public clients must not send a client secret",
                ));
            }
            return Ok(());
        }
        let secret =
            secret.ok_or_else(|| OAuthErrorBody::invalid_client("client secret required"))?;
        let hash = client
            .client_secret_hash
            .as_deref()
            .ok_or_else(|| OAuthErrorBody::invalid_client("client has no secret on file"))?;
        if !verify_password(secret, hash) {
            return Err(OAuthErrorBody::invalid_client("client authentication failed"));
        }
        Ok(())
    }

    async fn grant_authorization_code(
        &self,
        client: &OauthClientRecord,
        req: &TokenRequest,
    ) -> Result<TokenResponse, OAuthErrorBody> {
        let code = req
            .code
            .as_deref()
            .ok_or_else(|| OAuthErrorBody::invalid_request("missing code"))?;
        let verifier = req
            .code_verifier
            .as_deref()
            .ok_or_else(|| OAuthErrorBody::invalid_request("missing code_verifier"))?;
        let redirect_uri = req
            .redirect_uri
            .as_deref()
            .ok_or_else(|| OAuthErrorBody::invalid_request("missing redirect_uri"))?;

        let record = self
            .db
            .consume_authorization_code(&hash_token(code))
            .await?
            .ok_or_else(|| OAuthErrorBody::invalid_grant("authorization code is invalid or used"))?;

        if record.client_id != client.client_id {
            return Err(OAuthErrorBody::invalid_grant("code was issued to another client"));
        }
        if record.redirect_uri != redirect_uri {
            return Err(OAuthErrorBody::invalid_grant("redirect_uri mismatch"));
        }
        if !verify_pkce_s256(verifier, &record.code_challenge) {
            return Err(OAuthErrorBody::invalid_grant("PKCE verification failed"));
        }

        self.issue_pair(client, Some(record.user_id), &record.scopes, None)
            .await
    }

    async fn grant_client_credentials(
        &self,
        client: &OauthClientRecord,
        req: &TokenRequest,
    ) -> Result<TokenResponse, OAuthErrorBody> {
        if client.is_public() {
            return Err(OAuthErrorBody::unauthorized_client(
                "client_credentials requires a confidential client",
            ));
        }
        let scopes = match req.scope.as_deref() {
            Some(raw) => {
                let requested = parse_scopes(Some(raw));
                if !requested.iter().all(|s| client.scopes.contains(s)) {
                    return Err(OAuthErrorBody::invalid_scope("scope exceeds the client"));
                }
                requested
            }
            None => client.scopes.clone(),
        };

        // Machine grants never get a refresh token.
        let access_token = generate_token(OAUTH_ACCESS_PREFIX);
        self.db
            .insert_oauth_token(
                &hash_token(&access_token),
                None,
                Uuid::new_v4(),
                &client.client_id,
                None,
                &scopes,
                Utc::now() + self.config.access_ttl,
                None,
                None,
            )
            .await?;

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer",
            expires_in: self.config.access_ttl.num_seconds(),
            refresh_token: None,
            scope: scopes.join(" "),
        })
    }

    async fn grant_refresh(
        &self,
        client: &OauthClientRecord,
        req: &TokenRequest,
    ) -> Result<TokenResponse, OAuthErrorBody> {
        let refresh_token = req
            .refresh_token
            .as_deref()
            .ok_or_else(|| OAuthErrorBody::invalid_request("missing refresh_token"))?;

        let record = self
            .db
            .find_oauth_token_by_refresh_hash(&hash_token(refresh_token))
            .await?
            .ok_or_else(|| OAuthErrorBody::invalid_grant("unknown refresh token"))?;

        if record.client_id != client.client_id {
            return Err(OAuthErrorBody::invalid_grant("token belongs to another client"));
        }
        if record.revoked_at.is_some() {
            return Err(OAuthErrorBody::invalid_grant("token has been revoked"));
        }
        if record
            .refresh_expires_at
            .map(|e| e < Utc::now())
            .unwrap_or(true)
        {
            return Err(OAuthErrorBody::invalid_grant("refresh token expired"));
        }

        if !self.db.mark_oauth_refresh_used(record.id).await? {
            // Reuse detected: the whole grant is burned.
            self.db.revoke_oauth_grant(record.grant_id).await?;
            return Err(OAuthErrorBody::invalid_grant(
                "refresh token reuse detected; grant revoked",
            ));
        }

        self.issue_pair(
            client,
            record.user_id,
            &record.scopes,
            Some((record.grant_id, record.id)),
        )
        .await
    }

    async fn issue_pair(
        &self,
        client: &OauthClientRecord,
        user_id: Option<Uuid>,
        scopes: &[String],
        rotation: Option<(Uuid, Uuid)>,
    ) -> Result<TokenResponse, OAuthErrorBody> {
        let access_token = generate_token(OAUTH_ACCESS_PREFIX);
        let refresh_token = generate_token(OAUTH_REFRESH_PREFIX);
        let (grant_id, rotated_from) = match rotation {
            Some((grant, previous)) => (grant, Some(previous)),
            None => (Uuid::new_v4(), None),
        };

        self.db
            .insert_oauth_token(
                &hash_token(&access_token),
                Some(&hash_token(&refresh_token)),
                grant_id,
                &client.client_id,
                user_id,
                scopes,
                Utc::now() + self.config.access_ttl,
                Some(Utc::now() + self.config.refresh_ttl),
                rotated_from,
            )
            .await?;

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer",
            expires_in: self.config.access_ttl.num_seconds(),
            refresh_token: Some(refresh_token),
            scope: scopes.join(" "),
        })
    }

    /// RFC 7009: always succeeds. Revoking a refresh token burns the whole
    /// grant; revoking an access token only that row.
    pub async fn revoke(&self, auth: &ClientAuth, token: &str) -> Result<(), OAuthErrorBody> {
        let Some(client_id) = auth.client_id.as_deref() else {
            return Ok(());
        };
        let Some(client) = self
            .db
            .fetch_oauth_client(client_id)
            .await?
            .filter(|c| c.revoked_at.is_none())
        else {
            return Ok(());
        };
        if self.authenticate_client(&client, auth.client_secret.as_deref()).is_err() {
            return Ok(());
        }

        let hash = hash_token(token);
        if let Some(record) = self.db.find_oauth_token_by_refresh_hash(&hash).await? {
            if record.client_id == client.client_id {
                self.db.revoke_oauth_grant(record.grant_id).await?;
            }
            return Ok(());
        }
        if let Some(record) = self.db.find_oauth_token_by_access_hash(&hash).await? {
            if record.client_id == client.client_id {
                self.db.revoke_oauth_token(record.id).await?;
            }
        }
        Ok(())
    }

    /// Bearer resolution for `ayb_at_*` tokens.
    pub async fn resolve_access_token(
        &self,
        token: &str,
    ) -> Result<Option<OauthTokenRecord>, AuthError> {
        let record = self
            .db
            .find_oauth_token_by_access_hash(&hash_token(token))
            .await?;
        Ok(record.filter(|r| r.revoked_at.is_none() && r.expires_at > Utc::now()))
    }

    async fn validated_client(&self, client_id: &str) -> Result<OauthClientRecord, AuthError> {
        self.db
            .fetch_oauth_client(client_id)
            .await?
            .filter(|c| c.revoked_at.is_none())
            .ok_or_else(|| AuthError::validation("unknown or revoked client_id"))
    }
}

fn parse_scopes(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split_whitespace()
        .map(str::to_owned)
        .collect()
}

fn error_redirect(redirect_uri: &str, error: &str, state: Option<&str>) -> String {
    let mut url = format!(
        "{}{}error={}",
        redirect_uri,
        if redirect_uri.contains('?') { "&" } else { "?" },
        error,
    );
    if let Some(state) = state {
        url.push_str(&format!("&state={}", urlencoding::encode(state)));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parsing_splits_on_whitespace() {
        assert_eq!(parse_scopes(Some("read write")), vec!["read", "write"]);
        assert!(parse_scopes(None).is_empty());
    }

    #[test]
    fn error_redirects_carry_state() {
        let url = error_redirect("https://app/cb", "invalid_scope", Some("xyz"));
        assert_eq!(url, "https://app/cb?error=invalid_scope&state=xyz");
        let url = error_redirect("https://app/cb?k=v", "invalid_request", None);
        assert_eq!(url, "https://app/cb?k=v&error=invalid_request");
    }

    #[test]
    fn defaults_match_contracts() {
        let config = OAuthServerConfig::default();
        assert_eq!(config.code_ttl, Duration::minutes(10));
        assert_eq!(config.access_ttl, Duration::hours(1));
        assert_eq!(config.refresh_ttl, Duration::days(30));
    }
}
