use std::sync::Arc;

use ayb_auth::{
    identity::{IdentityConfig, IdentityService, LogMailer, LogSmsSender, LoginOutcome},
    jwt::{JwtKeys, ROLE_AUTHENTICATED},
    oauth_server::{ClientAuth, OAuthServer, OAuthServerConfig, TokenRequest},
    password::hash_password,
    tokens::{hash_token, pkce_challenge},
    AuthError,
};
use ayb_db::Db;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

fn service(db: Db) -> IdentityService {
    IdentityService::new(
        db,
        JwtKeys::new(b"identity-test-secret-0123456789"),
        IdentityConfig::default(),
        Arc::new(LogMailer),
        Arc::new(LogSmsSender),
    )
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn register_login_and_jwt_subject(pool: PgPool) -> anyhow::Result<()> {
    let db = Db::from_pool(pool);
    let identity = service(db.clone());

    let (user, pair) = identity.register("alice@example.com", "password123").await?;
    assert_eq!(user.email, "alice@example.com");

    let claims = identity.jwt().verify(&pair.access_token)?;
    assert_eq!(claims.sub, user.id.to_string());
    assert_eq!(claims.role, ROLE_AUTHENTICATED);

    // Login with the right password yields a token whose subject is the
    // stored user id; the wrong password is indistinguishable from an
    // unknown account.
    match identity.login("alice@example.com", "password123").await? {
        LoginOutcome::Tokens(pair) => {
            let claims = identity.jwt().verify(&pair.access_token)?;
            assert_eq!(claims.sub, user.id.to_string());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(matches!(
        identity.login("alice@example.com", "wrong").await,
        Err(AuthError::InvalidCredentials)
    ));
    assert!(matches!(
        identity.login("nobody@example.com", "password123").await,
        Err(AuthError::InvalidCredentials)
    ));
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn weak_passwords_and_duplicate_emails_are_rejected(pool: PgPool) -> anyhow::Result<()> {
    let db = Db::from_pool(pool);
    let identity = service(db);

    assert!(matches!(
        identity.register("short@example.com", "seven77").await,
        Err(AuthError::Validation(_))
    ));
    assert!(matches!(
        identity.register("not-an-email", "password123").await,
        Err(AuthError::Validation(_))
    ));

    identity.register("dup@example.com", "password123").await?;
    assert!(identity.register("DUP@example.com", "password123").await.is_err());
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn password_reset_consumes_token_and_sessions(pool: PgPool) -> anyhow::Result<()> {
    let db = Db::from_pool(pool);
    let identity = service(db.clone());
    let (user, pair) = identity.register("reset@example.com", "password123").await?;

    // The endpoint never reveals whether the account exists.
    identity.request_password_reset("missing@example.com").await?;
    identity.request_password_reset("reset@example.com").await?;

    // Drive the reset with a token planted directly, as the mailed token
    // is an external side effect.
    let token = "reset-token-plain";
    db.insert_password_reset(
        user.id,
        &hash_token(token),
        Utc::now() + chrono::Duration::hours(1),
    )
    .await?;

    identity.confirm_password_reset(token, "newpassword456").await?;
    assert!(matches!(
        identity.confirm_password_reset(token, "again-7890").await,
        Err(AuthError::InvalidCredentials)
    ));

    // Old sessions died with the reset; the old refresh token is useless.
    assert!(matches!(
        identity.refresh(&pair.refresh_token).await,
        Err(AuthError::InvalidCredentials)
    ));

    match identity.login("reset@example.com", "newpassword456").await? {
        LoginOutcome::Tokens(_) => {}
        other => panic!("unexpected outcome {other:?}"),
    }
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn magic_link_logs_in_and_verifies_email(pool: PgPool) -> anyhow::Result<()> {
    let db = Db::from_pool(pool);
    let identity = service(db.clone());
    let (user, _) = identity.register("magic@example.com", "password123").await?;
    assert!(!user.email_verified);

    let token = "magic-token-plain";
    db.insert_magic_link(
        user.id,
        &hash_token(token),
        Utc::now() + chrono::Duration::hours(1),
    )
    .await?;

    let pair = identity.confirm_magic_link(token).await?;
    let claims = identity.jwt().verify(&pair.access_token)?;
    assert_eq!(claims.sub, user.id.to_string());

    let reloaded = identity.me(user.id).await?;
    assert!(reloaded.email_verified);

    assert!(identity.confirm_magic_link(token).await.is_err());
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn sms_codes_are_hashed_and_attempt_limited(pool: PgPool) -> anyhow::Result<()> {
    let db = Db::from_pool(pool);
    let identity = service(db.clone());

    // Codes are issued even for unknown phones (enumeration safety) but
    // cannot log anyone in.
    identity.request_sms_code("+15550000000").await?;
    assert!(matches!(
        identity.confirm_sms_code("+15550000000", "000000").await,
        Err(AuthError::InvalidCredentials)
    ));

    // A known phone: plant the code directly.
    let user = db.create_user("sms@example.com", None).await?;
    sqlx::query("UPDATE _ayb_users SET phone = $1 WHERE id = $2")
        .bind("+15551234567")
        .bind(user.id)
        .execute(db.pool())
        .await?;
    db.insert_sms_code(
        "+15551234567",
        &hash_token("123456"),
        Utc::now() + chrono::Duration::minutes(10),
    )
    .await?;

    // The stored value is a digest, never the code itself.
    let stored: String = sqlx::query_scalar("SELECT code_hash FROM _ayb_sms_codes WHERE phone = $1")
        .bind("+15551234567")
        .fetch_one(db.pool())
        .await?;
    assert_ne!(stored, "123456");

    assert!(identity.confirm_sms_code("+15551234567", "999999").await.is_err());
    let pair = identity.confirm_sms_code("+15551234567", "123456").await?;
    let claims = identity.jwt().verify(&pair.access_token)?;
    assert_eq!(claims.sub, user.id.to_string());

    // Consumed: the same code cannot be replayed.
    assert!(identity.confirm_sms_code("+15551234567", "123456").await.is_err());
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn client_credentials_grant_is_confidential_only(pool: PgPool) -> anyhow::Result<()> {
    let db = Db::from_pool(pool);
    let oauth = OAuthServer::new(db.clone(), OAuthServerConfig::default());

    let secret_hash = hash_password("machine-secret", 8)?;
    db.create_oauth_client(
        "machine",
        None,
        Some(&secret_hash),
        "Machine",
        &[],
        &["read".to_string()],
        "confidential",
    )
    .await?;
    db.create_oauth_client(
        "spa",
        None,
        None,
        "Browser App",
        &["https://spa.example/cb".to_string()],
        &["read".to_string()],
        "public",
    )
    .await?;

    let request = TokenRequest {
        grant_type: "client_credentials".into(),
        ..Default::default()
    };

    let auth = ClientAuth {
        client_id: Some("machine".into()),
        client_secret: Some("machine-secret".into()),
        via_basic: false,
        also_in_body: false,
    };
    let response = oauth.token(&auth, &request).await.expect("token issued");
    assert!(response.access_token.starts_with("ayb_at_"));
    // Machine grants carry no refresh token.
    assert!(response.refresh_token.is_none());

    let bad_secret = ClientAuth {
        client_secret: Some("wrong".into()),
        ..auth.clone()
    };
    let err = oauth.token(&bad_secret, &request).await.unwrap_err();
    assert_eq!(err.error, "invalid_client");

    let public = ClientAuth {
        client_id: Some("spa".into()),
        client_secret: None,
        via_basic: false,
        also_in_body: false,
    };
    let err = oauth.token(&public, &request).await.unwrap_err();
    assert_eq!(err.error, "unauthorized_client");
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn pkce_mismatch_is_invalid_grant(pool: PgPool) -> anyhow::Result<()> {
    let db = Db::from_pool(pool);
    let oauth = OAuthServer::new(db.clone(), OAuthServerConfig::default());
    let user = db.create_user("pkce@example.com", None).await?;

    let secret_hash = hash_password("web-secret", 8)?;
    db.create_oauth_client(
        "web",
        None,
        Some(&secret_hash),
        "Web",
        &["https://web.example/cb".to_string()],
        &["read".to_string()],
        "confidential",
    )
    .await?;

    let code = "the-authorization-code";
    db.insert_authorization_code(
        &hash_token(code),
        "web",
        user.id,
        "https://web.example/cb",
        &["read".to_string()],
        &pkce_challenge("right-verifier-right-verifier-right-verifier"),
        Utc::now() + chrono::Duration::minutes(10),
    )
    .await?;

    let auth = ClientAuth {
        client_id: Some("web".into()),
        client_secret: Some("web-secret".into()),
        via_basic: false,
        also_in_body: false,
    };
    let request = TokenRequest {
        grant_type: "authorization_code".into(),
        code: Some(code.into()),
        redirect_uri: Some("https://web.example/cb".into()),
        code_verifier: Some("wrong-verifier-wrong-verifier-wrong-verifier".into()),
        ..Default::default()
    };
    let err = oauth.token(&auth, &request).await.unwrap_err();
    assert_eq!(err.error, "invalid_grant");

    // The code was consumed by the failed attempt; even the right verifier
    // cannot resurrect it.
    let retry = TokenRequest {
        code_verifier: Some("right-verifier-right-verifier-right-verifier".into()),
        ..request
    };
    let err = oauth.token(&auth, &retry).await.unwrap_err();
    assert_eq!(err.error, "invalid_grant");
    Ok(())
}

#[sqlx::test(migrations = "../ayb-db/migrations")]
async fn revoking_a_refresh_token_burns_the_grant(pool: PgPool) -> anyhow::Result<()> {
    let db = Db::from_pool(pool);
    let oauth = OAuthServer::new(db.clone(), OAuthServerConfig::default());
    let user = db.create_user("revoke@example.com", None).await?;

    let secret_hash = hash_password("cli-secret", 8)?;
    db.create_oauth_client(
        "cli",
        None,
        Some(&secret_hash),
        "CLI",
        &["https://cli.example/cb".to_string()],
        &["read".to_string()],
        "confidential",
    )
    .await?;

    let grant_id = Uuid::new_v4();
    let access = "ayb_at_fixed_access";
    let refresh = "ayb_rt_fixed_refresh";
    db.insert_oauth_token(
        &hash_token(access),
        Some(&hash_token(refresh)),
        grant_id,
        "cli",
        Some(user.id),
        &["read".to_string()],
        Utc::now() + chrono::Duration::hours(1),
        Some(Utc::now() + chrono::Duration::days(30)),
        None,
    )
    .await?;

    let auth = ClientAuth {
        client_id: Some("cli".into()),
        client_secret: Some("cli-secret".into()),
        via_basic: false,
        also_in_body: false,
    };

    // RFC 7009: revocation always reports success.
    oauth.revoke(&auth, refresh).await.expect("revoke is 200");

    assert!(oauth.resolve_access_token(access).await?.is_none());
    let reuse = TokenRequest {
        grant_type: "refresh_token".into(),
        refresh_token: Some(refresh.into()),
        ..Default::default()
    };
    let err = oauth.token(&auth, &reuse).await.unwrap_err();
    assert_eq!(err.error, "invalid_grant");
    Ok(())
}
