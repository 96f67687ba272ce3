//! Password hashing (bcrypt) and policy checks.

use crate::AuthError;

pub const MIN_BCRYPT_COST: u32 = 8;
pub const DEFAULT_BCRYPT_COST: u32 = 10;
pub const DEFAULT_MIN_PASSWORD_LEN: usize = 8;

pub fn hash_password(password: &str, cost: u32) -> Result<String, AuthError> {
    let cost = cost.max(MIN_BCRYPT_COST);
    bcrypt::hash(password, cost).map_err(|err| AuthError::Internal(err.to_string()))
}

/// Constant result shape: a malformed stored hash verifies as `false`
/// rather than erroring, so login failures stay uniform.
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

pub fn check_password_policy(password: &str, min_len: usize) -> Result<(), AuthError> {
    if password.chars().count() < min_len {
        return Err(AuthError::validation(format!(
            "password must be at least {min_len} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("hunter2!", MIN_BCRYPT_COST).unwrap();
        assert!(verify_password("hunter2!", &hash));
        assert!(!verify_password("hunter3!", &hash));
    }

    #[test]
    fn malformed_hash_fails_closed() {
        assert!(!verify_password("anything", "not-a-bcrypt-hash"));
    }

    #[test]
    fn policy_counts_characters() {
        assert!(check_password_policy("1234567", 8).is_err());
        assert!(check_password_policy("12345678", 8).is_ok());
    }
}
