//! Identity service: registration, login, token rotation, and the
//! single-use auth flows (email verification, password reset, magic links,
//! SMS OTP, TOTP MFA).

use std::sync::Arc;

use ayb_db::{Db, UserRecord};
use chrono::{Duration, Utc};
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    jwt::{JwtKeys, ROLE_AUTHENTICATED, ROLE_MFA_PENDING},
    mfa,
    password::{check_password_policy, hash_password, verify_password, DEFAULT_BCRYPT_COST,
        DEFAULT_MIN_PASSWORD_LEN},
    tokens::{generate_refresh_token, hash_token},
    AuthError,
};

/// Outbound mail dispatch. Template rendering and SMTP live outside the
/// core; the default implementation records the dispatch in the log.
#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, template: &str, token: &str) -> Result<(), AuthError>;
}

pub struct LogMailer;

#[async_trait::async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, template: &str, _token: &str) -> Result<(), AuthError> {
        info!(to, template, "email dispatch (no mailer configured)");
        Ok(())
    }
}

/// Outbound SMS dispatch; provider integrations are external.
#[async_trait::async_trait]
pub trait SmsSender: Send + Sync {
    async fn send_code(&self, phone: &str, code: &str) -> Result<(), AuthError>;
}

pub struct LogSmsSender;

#[async_trait::async_trait]
impl SmsSender for LogSmsSender {
    async fn send_code(&self, phone: &str, _code: &str) -> Result<(), AuthError> {
        info!(phone, "sms dispatch (no provider configured)");
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub mfa_challenge_ttl: Duration,
    pub flow_token_ttl: Duration,
    pub sms_code_ttl: Duration,
    pub sms_max_attempts: i32,
    pub bcrypt_cost: u32,
    pub min_password_len: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
            mfa_challenge_ttl: Duration::minutes(5),
            flow_token_ttl: Duration::hours(1),
            sms_code_ttl: Duration::minutes(10),
            sms_max_attempts: 5,
            bcrypt_cost: DEFAULT_BCRYPT_COST,
            min_password_len: DEFAULT_MIN_PASSWORD_LEN,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

#[derive(Debug)]
pub enum LoginOutcome {
    Tokens(TokenPair),
    /// MFA is enabled: the caller must come back through `mfa_challenge`
    /// with this short-lived token plus a TOTP code.
    MfaRequired { challenge_token: String },
}

#[derive(Clone)]
pub struct IdentityService {
    db: Db,
    jwt: JwtKeys,
    config: IdentityConfig,
    mailer: Arc<dyn Mailer>,
    sms: Arc<dyn SmsSender>,
}

impl IdentityService {
    pub fn new(
        db: Db,
        jwt: JwtKeys,
        config: IdentityConfig,
        mailer: Arc<dyn Mailer>,
        sms: Arc<dyn SmsSender>,
    ) -> Self {
        Self {
            db,
            jwt,
            config,
            mailer,
            sms,
        }
    }

    pub fn jwt(&self) -> &JwtKeys {
        &self.jwt
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Access JWT + fresh single-use refresh token.
    pub async fn issue_token_pair(&self, user: &UserRecord) -> Result<TokenPair, AuthError> {
        let (access_token, _) = self.jwt.issue(
            user.id,
            &user.email,
            ROLE_AUTHENTICATED,
            self.config.access_ttl,
        )?;
        let refresh_token = generate_refresh_token();
        self.db
            .insert_session(
                &hash_token(&refresh_token),
                user.id,
                Utc::now() + self.config.refresh_ttl,
            )
            .await?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.config.access_ttl.num_seconds(),
        })
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(UserRecord, TokenPair), AuthError> {
        validate_email(email)?;
        check_password_policy(password, self.config.min_password_len)?;
        let hash = hash_password(password, self.config.bcrypt_cost)?;
        let user = self.db.create_user(email, Some(&hash)).await?;

        // Kick off verification; a mail failure never fails registration.
        if let Err(err) = self.start_email_verification(&user).await {
            warn!(user_id = %user.id, error = %err, "verification dispatch failed");
        }

        let pair = self.issue_token_pair(&user).await?;
        Ok((user, pair))
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, AuthError> {
        let user = self
            .db
            .find_user_by_email(email)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        let hash = user
            .password_hash
            .as_deref()
            .ok_or(AuthError::InvalidCredentials)?;
        if !verify_password(password, hash) {
            return Err(AuthError::InvalidCredentials);
        }

        if user.mfa_enabled {
            let (challenge_token, _) = self.jwt.issue(
                user.id,
                &user.email,
                ROLE_MFA_PENDING,
                self.config.mfa_challenge_ttl,
            )?;
            return Ok(LoginOutcome::MfaRequired { challenge_token });
        }

        Ok(LoginOutcome::Tokens(self.issue_token_pair(&user).await?))
    }

    pub async fn mfa_challenge(
        &self,
        challenge_token: &str,
        code: &str,
    ) -> Result<TokenPair, AuthError> {
        let claims = self.jwt.verify(challenge_token)?;
        if claims.role != ROLE_MFA_PENDING {
            return Err(AuthError::Unauthorized);
        }
        let user = self
            .db
            .fetch_user(claims.user_id()?)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        let secret = user.mfa_secret.as_deref().ok_or(AuthError::Unauthorized)?;
        if !mfa::verify_code(secret, &user.email, code)? {
            return Err(AuthError::InvalidCredentials);
        }
        self.issue_token_pair(&user).await
    }

    /// Rotation: the presented refresh token is consumed whether or not a
    /// new pair is issued.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let session = self
            .db
            .consume_session(&hash_token(refresh_token))
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        if session.expires_at < Utc::now() {
            return Err(AuthError::InvalidCredentials);
        }
        let user = self
            .db
            .fetch_user(session.user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        self.issue_token_pair(&user).await
    }

    pub async fn logout(&self, refresh_token: &str) -> Result<(), AuthError> {
        self.db.consume_session(&hash_token(refresh_token)).await?;
        Ok(())
    }

    pub async fn me(&self, user_id: Uuid) -> Result<UserRecord, AuthError> {
        self.db
            .fetch_user(user_id)
            .await?
            .ok_or_else(|| AuthError::NotFound("user not found".into()))
    }

    pub async fn delete_account(&self, user_id: Uuid) -> Result<(), AuthError> {
        if !self.db.delete_user(user_id).await? {
            return Err(AuthError::NotFound("user not found".into()));
        }
        Ok(())
    }

    /// Always succeeds from the caller's point of view; whether an account
    /// exists is never revealed.
    pub async fn request_password_reset(&self, email: &str) -> Result<(), AuthError> {
        let Some(user) = self.db.find_user_by_email(email).await? else {
            return Ok(());
        };
        let token = generate_refresh_token();
        self.db
            .insert_password_reset(
                user.id,
                &hash_token(&token),
                Utc::now() + self.config.flow_token_ttl,
            )
            .await?;
        if let Err(err) = self.mailer.send(&user.email, "password_reset", &token).await {
            warn!(error = %err, "password reset dispatch failed");
        }
        Ok(())
    }

    pub async fn confirm_password_reset(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        check_password_policy(new_password, self.config.min_password_len)?;
        let user_id = self
            .db
            .consume_password_reset(&hash_token(token))
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        let hash = hash_password(new_password, self.config.bcrypt_cost)?;
        self.db.set_user_password(user_id, &hash).await?;
        // A reset invalidates every open session.
        self.db.delete_sessions_for_user(user_id).await?;
        Ok(())
    }

    pub async fn resend_email_verification(&self, user_id: Uuid) -> Result<(), AuthError> {
        let user = self.me(user_id).await?;
        if user.email_verified {
            return Ok(());
        }
        self.start_email_verification(&user).await
    }

    pub async fn confirm_email_verification(&self, token: &str) -> Result<(), AuthError> {
        let user_id = self
            .db
            .consume_email_verification(&hash_token(token))
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        self.db.mark_email_verified(user_id).await?;
        Ok(())
    }

    pub async fn request_magic_link(&self, email: &str) -> Result<(), AuthError> {
        let Some(user) = self.db.find_user_by_email(email).await? else {
            return Ok(());
        };
        let token = generate_refresh_token();
        self.db
            .insert_magic_link(
                user.id,
                &hash_token(&token),
                Utc::now() + self.config.flow_token_ttl,
            )
            .await?;
        if let Err(err) = self.mailer.send(&user.email, "magic_link", &token).await {
            warn!(error = %err, "magic link dispatch failed");
        }
        Ok(())
    }

    pub async fn confirm_magic_link(&self, token: &str) -> Result<TokenPair, AuthError> {
        let user_id = self
            .db
            .consume_magic_link(&hash_token(token))
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        let user = self
            .db
            .fetch_user(user_id)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        // Following a mailed link proves control of the mailbox.
        if !user.email_verified {
            self.db.mark_email_verified(user.id).await?;
        }
        self.issue_token_pair(&user).await
    }

    /// Enumeration-safe: a code is generated and dispatched regardless of
    /// whether the phone maps to an account.
    pub async fn request_sms_code(&self, phone: &str) -> Result<(), AuthError> {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        self.db
            .insert_sms_code(
                phone,
                &hash_token(&code),
                Utc::now() + self.config.sms_code_ttl,
            )
            .await?;
        if let Err(err) = self.sms.send_code(phone, &code).await {
            warn!(error = %err, "sms dispatch failed");
        }
        Ok(())
    }

    pub async fn confirm_sms_code(&self, phone: &str, code: &str) -> Result<TokenPair, AuthError> {
        let record = self
            .db
            .latest_sms_code(phone)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        if record.attempts >= self.config.sms_max_attempts {
            return Err(AuthError::InvalidCredentials);
        }
        self.db.bump_sms_attempts(record.id).await?;
        if hash_token(code) != record.code_hash {
            return Err(AuthError::InvalidCredentials);
        }
        if !self.db.consume_sms_code(record.id).await? {
            return Err(AuthError::InvalidCredentials);
        }
        let user = self
            .db
            .find_user_by_phone(phone)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        self.issue_token_pair(&user).await
    }

    /// Generates a pending TOTP secret; `mfa_verify` flips it on once the
    /// user proves their authenticator works.
    pub async fn mfa_enroll(&self, user_id: Uuid) -> Result<(String, String), AuthError> {
        let user = self.me(user_id).await?;
        let (secret, otpauth_url) = mfa::enroll(&user.email)?;
        self.db.set_user_mfa_secret(user.id, &secret).await?;
        Ok((secret, otpauth_url))
    }

    pub async fn mfa_verify(&self, user_id: Uuid, code: &str) -> Result<(), AuthError> {
        let user = self.me(user_id).await?;
        let secret = user
            .mfa_secret
            .as_deref()
            .ok_or_else(|| AuthError::validation("no pending MFA enrollment"))?;
        if !mfa::verify_code(secret, &user.email, code)? {
            return Err(AuthError::InvalidCredentials);
        }
        self.db.set_user_mfa_enabled(user.id, true).await?;
        Ok(())
    }

    async fn start_email_verification(&self, user: &UserRecord) -> Result<(), AuthError> {
        let token = generate_refresh_token();
        self.db
            .insert_email_verification(
                user.id,
                &hash_token(&token),
                Utc::now() + self.config.flow_token_ttl,
            )
            .await?;
        self.mailer.send(&user.email, "verify_email", &token).await
    }
}

fn validate_email(email: &str) -> Result<(), AuthError> {
    let valid = email.len() <= 254
        && email
            .split_once('@')
            .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
            .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(AuthError::validation("invalid email address"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert!(validate_email("a@b.co").is_ok());
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("@b.co").is_err());
        assert!(validate_email("a@nodot").is_err());
    }

    #[test]
    fn default_config_matches_contracts() {
        let config = IdentityConfig::default();
        assert_eq!(config.access_ttl, Duration::minutes(15));
        assert_eq!(config.refresh_ttl, Duration::days(7));
        assert!(config.bcrypt_cost >= 8);
        assert_eq!(config.min_password_len, 8);
    }
}
