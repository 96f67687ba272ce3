//! HS256 access tokens.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AuthError;

pub const ROLE_AUTHENTICATED: &str = "authenticated";
pub const ROLE_ADMIN: &str = "admin";
/// Intermediate role carried by the short-lived token a login with MFA
/// enabled hands back; it cannot reach any data route.
pub const ROLE_MFA_PENDING: &str = "mfa_pending";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub email: String,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

impl AccessClaims {
    pub fn user_id(&self) -> Result<Uuid, AuthError> {
        Uuid::parse_str(&self.sub).map_err(|_| AuthError::Unauthorized)
    }
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn issue(
        &self,
        user_id: Uuid,
        email: &str,
        role: &str,
        ttl: Duration,
    ) -> Result<(String, AccessClaims), AuthError> {
        let now = Utc::now();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            email: email.to_owned(),
            role: role.to_owned(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| AuthError::Internal(err.to_string()))?;
        Ok((token, claims))
    }

    pub fn verify(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        decode::<AccessClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|_| AuthError::Unauthorized)
    }
}

/// Three dot-separated segments is the bearer-classification rule for JWTs.
pub fn looks_like_jwt(token: &str) -> bool {
    token.split('.').count() == 3 && !token.starts_with("ayb_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_verify_round_trip() {
        let keys = JwtKeys::new(b"test-secret");
        let id = Uuid::new_v4();
        let (token, issued) =
            keys.issue(id, "a@b.c", ROLE_AUTHENTICATED, Duration::minutes(15)).unwrap();
        assert!(looks_like_jwt(&token));

        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.sub, id.to_string());
        assert_eq!(claims.email, "a@b.c");
        assert_eq!(claims.role, ROLE_AUTHENTICATED);
        assert_eq!(claims.jti, issued.jti);
        assert_eq!(claims.user_id().unwrap(), id);
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let keys = JwtKeys::new(b"test-secret");
        let (token, _) = keys
            .issue(Uuid::new_v4(), "a@b.c", ROLE_AUTHENTICATED, Duration::seconds(-120))
            .unwrap();
        assert!(keys.verify(&token).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let keys = JwtKeys::new(b"test-secret");
        let other = JwtKeys::new(b"other-secret");
        let (token, _) = keys
            .issue(Uuid::new_v4(), "a@b.c", ROLE_AUTHENTICATED, Duration::minutes(5))
            .unwrap();
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn jwt_shape_detection() {
        assert!(looks_like_jwt("aaa.bbb.ccc"));
        assert!(!looks_like_jwt("ayb_at_x.y.z"));
        assert!(!looks_like_jwt("ayb_plainkey"));
    }
}
