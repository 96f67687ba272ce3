//! TOTP second factor.

use totp_rs::{Algorithm, Secret, TOTP};

use crate::AuthError;

const ISSUER: &str = "AllYourBase";

fn build_totp(secret_base32: &str, account: &str) -> Result<TOTP, AuthError> {
    let secret = Secret::Encoded(secret_base32.to_owned())
        .to_bytes()
        .map_err(|err| AuthError::Internal(format!("invalid TOTP secret: {err:?}")))?;
    TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret,
        Some(ISSUER.to_owned()),
        account.to_owned(),
    )
    .map_err(|err| AuthError::Internal(format!("totp setup failed: {err}")))
}

/// New enrollment: base32 secret plus the otpauth URL for authenticator
/// apps.
pub fn enroll(account: &str) -> Result<(String, String), AuthError> {
    let secret = Secret::generate_secret();
    let encoded = secret.to_encoded().to_string();
    let totp = build_totp(&encoded, account)?;
    Ok((encoded, totp.get_url()))
}

/// Checks a 6-digit code against the stored secret, allowing one time-step
/// of skew.
pub fn verify_code(secret_base32: &str, account: &str, code: &str) -> Result<bool, AuthError> {
    let totp = build_totp(secret_base32, account)?;
    totp.check_current(code)
        .map_err(|err| AuthError::Internal(format!("clock error: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_produces_usable_secret() {
        let (secret, url) = enroll("user@example.com").unwrap();
        assert!(!secret.is_empty());
        assert!(url.starts_with("otpauth://totp/"));

        let totp = build_totp(&secret, "user@example.com").unwrap();
        let code = totp.generate_current().unwrap();
        assert!(verify_code(&secret, "user@example.com", &code).unwrap());

        let wrong = if code == "123456" { "654321" } else { "123456" };
        assert!(!verify_code(&secret, "user@example.com", wrong).unwrap());
    }
}
