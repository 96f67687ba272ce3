//! OAuth consumer: sign in with Google or GitHub.
//!
//! The flow is the usual three-legged dance: redirect the browser to the
//! provider, exchange the callback code for a provider access token, fetch
//! the user profile, upsert the account link, and issue AYB tokens.

use ayb_db::UserRecord;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    identity::{IdentityService, TokenPair},
    AuthError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    Google,
    Github,
}

impl Provider {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "google" => Some(Provider::Google),
            "github" => Some(Provider::Github),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Github => "github",
        }
    }

    fn authorize_endpoint(self) -> &'static str {
        match self {
            Provider::Google => "https://accounts.google.com/o/oauth2/v2/auth",
            Provider::Github => "https://github.com/login/oauth/authorize",
        }
    }

    fn token_endpoint(self) -> &'static str {
        match self {
            Provider::Google => "https://oauth2.googleapis.com/token",
            Provider::Github => "https://github.com/login/oauth/access_token",
        }
    }

    fn userinfo_endpoint(self) -> &'static str {
        match self {
            Provider::Google => "https://openidconnect.googleapis.com/v1/userinfo",
            Provider::Github => "https://api.github.com/user",
        }
    }

    fn scopes(self) -> &'static str {
        match self {
            Provider::Google => "openid email profile",
            Provider::Github => "read:user user:email",
        }
    }
}

/// Per-provider credentials from configuration.
#[derive(Clone, Debug, Default)]
pub struct ProviderCredentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Clone, Debug)]
pub struct ProviderUser {
    pub provider_user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone)]
pub struct OAuthConsumer {
    http: reqwest::Client,
    google: Option<ProviderCredentials>,
    github: Option<ProviderCredentials>,
}

impl OAuthConsumer {
    pub fn new(
        google: Option<ProviderCredentials>,
        github: Option<ProviderCredentials>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            google,
            github,
        }
    }

    fn credentials(&self, provider: Provider) -> Result<&ProviderCredentials, AuthError> {
        match provider {
            Provider::Google => self.google.as_ref(),
            Provider::Github => self.github.as_ref(),
        }
        .ok_or_else(|| {
            AuthError::validation(format!("provider \"{}\" is not configured", provider.as_str()))
        })
    }

    /// Browser redirect target starting the provider flow. `state` carries
    /// the SSE client id when the SDK drives the flow from a popup.
    pub fn authorize_url(
        &self,
        provider: Provider,
        redirect_uri: &str,
        state: &str,
    ) -> Result<String, AuthError> {
        let creds = self.credentials(provider)?;
        Ok(format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            provider.authorize_endpoint(),
            urlencoding::encode(&creds.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(provider.scopes()),
            urlencoding::encode(state),
        ))
    }

    /// Callback half: code -> provider token -> profile.
    pub async fn exchange_code(
        &self,
        provider: Provider,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderUser, AuthError> {
        let creds = self.credentials(provider)?;

        #[derive(Deserialize)]
        struct TokenBody {
            access_token: String,
        }

        let token: TokenBody = self
            .http
            .post(provider.token_endpoint())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", creds.client_id.as_str()),
                ("client_secret", creds.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await
            .map_err(|err| AuthError::Provider(err.to_string()))?
            .error_for_status()
            .map_err(|err| AuthError::Provider(err.to_string()))?
            .json()
            .await
            .map_err(|err| AuthError::Provider(err.to_string()))?;

        let profile: Value = self
            .http
            .get(provider.userinfo_endpoint())
            .bearer_auth(&token.access_token)
            .header(reqwest::header::USER_AGENT, "allyourbase")
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| AuthError::Provider(err.to_string()))?
            .error_for_status()
            .map_err(|err| AuthError::Provider(err.to_string()))?
            .json()
            .await
            .map_err(|err| AuthError::Provider(err.to_string()))?;

        parse_profile(provider, &profile)
    }
}

fn parse_profile(provider: Provider, profile: &Value) -> Result<ProviderUser, AuthError> {
    match provider {
        Provider::Google => {
            let id = profile["sub"]
                .as_str()
                .ok_or_else(|| AuthError::Provider("profile missing sub".into()))?;
            Ok(ProviderUser {
                provider_user_id: id.to_owned(),
                email: profile["email"].as_str().map(str::to_owned),
                name: profile["name"].as_str().map(str::to_owned),
            })
        }
        Provider::Github => {
            let id = profile["id"]
                .as_i64()
                .ok_or_else(|| AuthError::Provider("profile missing id".into()))?;
            // GitHub may hide the email; fall back to the noreply alias.
            let email = profile["email"].as_str().map(str::to_owned).or_else(|| {
                profile["login"]
                    .as_str()
                    .map(|login| format!("{login}@users.noreply.github.com"))
            });
            Ok(ProviderUser {
                provider_user_id: id.to_string(),
                email,
                name: profile["name"]
                    .as_str()
                    .or_else(|| profile["login"].as_str())
                    .map(str::to_owned),
            })
        }
    }
}

/// Finishes a provider login: links or creates the local user and issues
/// AYB tokens.
pub async fn complete_provider_login(
    identity: &IdentityService,
    provider: Provider,
    profile: &ProviderUser,
) -> Result<(UserRecord, TokenPair), AuthError> {
    let db = identity.db();

    let user = match db
        .find_oauth_account(provider.as_str(), &profile.provider_user_id)
        .await?
    {
        Some(account) => db
            .fetch_user(account.user_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("linked user missing".into()))?,
        None => {
            let email = profile
                .email
                .as_deref()
                .ok_or_else(|| AuthError::Provider("provider returned no email".into()))?;
            let user = match db.find_user_by_email(email).await? {
                Some(existing) => existing,
                // Provider-asserted email: the account starts verified.
                None => {
                    let created = db.create_user(email, None).await?;
                    db.mark_email_verified(created.id).await?;
                    created
                }
            };
            db.upsert_oauth_account(
                provider.as_str(),
                &profile.provider_user_id,
                user.id,
                profile.email.as_deref(),
                profile.name.as_deref(),
            )
            .await?;
            user
        }
    };

    let pair = identity.issue_token_pair(&user).await?;
    Ok((user, pair))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provider_names_round_trip() {
        assert_eq!(Provider::parse("google"), Some(Provider::Google));
        assert_eq!(Provider::parse("github"), Some(Provider::Github));
        assert_eq!(Provider::parse("gitlab"), None);
    }

    #[test]
    fn github_profile_falls_back_to_noreply_email() {
        let profile = json!({"id": 42, "login": "octocat", "email": null});
        let user = parse_profile(Provider::Github, &profile).unwrap();
        assert_eq!(user.provider_user_id, "42");
        assert_eq!(
            user.email.as_deref(),
            Some("octocat@users.noreply.github.com")
        );
    }

    #[test]
    fn google_profile_requires_sub() {
        let user = parse_profile(
            Provider::Google,
            &json!({"sub": "abc", "email": "a@b.co", "name": "A"}),
        )
        .unwrap();
        assert_eq!(user.provider_user_id, "abc");
        assert!(parse_profile(Provider::Google, &json!({})).is_err());
    }

    #[test]
    fn authorize_url_is_escaped() {
        let consumer = OAuthConsumer::new(
            Some(ProviderCredentials {
                client_id: "cid with space".into(),
                client_secret: "secret".into(),
            }),
            None,
        );
        let url = consumer
            .authorize_url(Provider::Google, "https://ayb/cb", "st&ate")
            .unwrap();
        assert!(url.contains("client_id=cid%20with%20space"));
        assert!(url.contains("state=st%26ate"));
        assert!(consumer
            .authorize_url(Provider::Github, "https://ayb/cb", "x")
            .is_err());
    }
}
