//! Opaque token generation and hashing.
//!
//! Opaque tokens are high-entropy random strings stored only as SHA-256
//! hex digests; validation is a hash lookup, never signature verification.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};

/// Bearer prefix for API keys.
pub const API_KEY_PREFIX: &str = "ayb_";
/// Bearer prefix for OAuth access tokens.
pub const OAUTH_ACCESS_PREFIX: &str = "ayb_at_";
/// Prefix for OAuth refresh tokens (never used as a bearer).
pub const OAUTH_REFRESH_PREFIX: &str = "ayb_rt_";

const TOKEN_ENTROPY_CHARS: usize = 40;

/// `<prefix>` + 40 alphanumeric characters of entropy.
pub fn generate_token(prefix: &str) -> String {
    let entropy: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_ENTROPY_CHARS)
        .map(char::from)
        .collect();
    format!("{prefix}{entropy}")
}

/// Unprefixed opaque value for identity refresh tokens: 32 random bytes,
/// base64url.
pub fn generate_refresh_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex digest used for at-rest storage and lookup.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Short display prefix persisted next to the hash so keys can be
/// recognized in listings.
pub fn display_prefix(token: &str) -> String {
    token.chars().take(12).collect()
}

/// RFC 7636 S256: `base64url(SHA256(verifier)) == challenge`.
pub fn verify_pkce_s256(verifier: &str, challenge: &str) -> bool {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest) == challenge
}

/// Computes the S256 challenge for a verifier.
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Challenge syntax check: 43–128 characters from the base64url alphabet.
pub fn valid_code_challenge(challenge: &str) -> bool {
    (43..=128).contains(&challenge.len())
        && challenge
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_carry_their_prefix() {
        let key = generate_token(API_KEY_PREFIX);
        assert!(key.starts_with("ayb_"));
        assert_eq!(key.len(), API_KEY_PREFIX.len() + TOKEN_ENTROPY_CHARS);

        let at = generate_token(OAUTH_ACCESS_PREFIX);
        assert!(at.starts_with("ayb_at_"));
    }

    #[test]
    fn hashing_is_deterministic_and_hex() {
        let token = generate_token(API_KEY_PREFIX);
        let h1 = hash_token(&token);
        let h2 = hash_token(&token);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn pkce_round_trip() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = pkce_challenge(verifier);
        assert!(valid_code_challenge(&challenge));
        assert!(verify_pkce_s256(verifier, &challenge));
        assert!(!verify_pkce_s256("wrong-verifier", &challenge));
    }

    #[test]
    fn challenge_length_bounds() {
        assert!(!valid_code_challenge("short"));
        assert!(!valid_code_challenge(&"a".repeat(129)));
        assert!(!valid_code_challenge(&format!("{}!", "a".repeat(43))));
        assert!(valid_code_challenge(&"a".repeat(43)));
    }
}
