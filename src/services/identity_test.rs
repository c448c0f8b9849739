use super::*;
use crate::services::directory::{MemoryDirectory, UserRecord};

fn config() -> AuthConfig {
    AuthConfig { secret: "test-secret".into() }
}

#[test]
fn token_round_trip() {
    let cfg = config();
    let user_id = Uuid::new_v4();
    let token = mint_token(&cfg, user_id, 2_000);

    assert_eq!(verify_token(&cfg, &token, 1_000).unwrap(), user_id);
}

#[test]
fn expired_token_rejected() {
    let cfg = config();
    let token = mint_token(&cfg, Uuid::new_v4(), 1_000);

    assert!(matches!(verify_token(&cfg, &token, 1_000), Err(AuthError::Expired)));
    assert!(matches!(verify_token(&cfg, &token, 5_000), Err(AuthError::Expired)));
}

#[test]
fn tampered_token_rejected() {
    let cfg = config();
    let user_id = Uuid::new_v4();
    let token = mint_token(&cfg, user_id, i64::MAX);

    // Flip the expiry without re-signing.
    let forged = token.replacen(&i64::MAX.to_string(), "9999999999999", 1);
    assert!(matches!(verify_token(&cfg, &forged, 0), Err(AuthError::BadSignature)));
}

#[test]
fn wrong_secret_rejected() {
    let token = mint_token(&config(), Uuid::new_v4(), i64::MAX);
    let other = AuthConfig { secret: "other".into() };
    assert!(matches!(verify_token(&other, &token, 0), Err(AuthError::BadSignature)));
}

#[test]
fn malformed_tokens_rejected() {
    let cfg = config();
    for raw in ["", "abc", "a.b", "not-a-uuid.123.deadbeef", "00.nan.sig"] {
        assert!(matches!(verify_token(&cfg, raw, 0), Err(AuthError::Malformed)), "{raw}");
    }
}

#[test]
fn anonymous_identities_are_free_tier_guests() {
    let a = anonymous_identity();
    let b = anonymous_identity();

    assert!(a.is_anonymous);
    assert_eq!(a.plan, crate::services::plan::PlanTier::Free);
    assert!(a.name.starts_with("guest-"));
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn authenticate_without_token_yields_guest() {
    let dir = MemoryDirectory::new();
    let identity = authenticate(&dir, &config(), None, 0).await.unwrap();
    assert!(identity.is_anonymous);
}

#[tokio::test]
async fn authenticate_resolves_persisted_user() {
    let dir = MemoryDirectory::new();
    let cfg = config();
    let user_id = Uuid::new_v4();
    dir.add_user(UserRecord {
        id: user_id,
        name: "ada".into(),
        avatar_url: Some("https://example.com/a.png".into()),
        plan: crate::services::plan::PlanTier::Team,
    });
    dir.add_session(user_id);

    let token = mint_token(&cfg, user_id, i64::MAX);
    let identity = authenticate(&dir, &cfg, Some(&token), 0).await.unwrap();

    assert_eq!(identity.id, user_id);
    assert_eq!(identity.name, "ada");
    assert_eq!(identity.plan, crate::services::plan::PlanTier::Team);
    assert!(!identity.is_anonymous);
}

#[tokio::test]
async fn authenticate_unknown_user_fails() {
    let dir = MemoryDirectory::new();
    let cfg = config();
    let token = mint_token(&cfg, Uuid::new_v4(), i64::MAX);

    assert!(matches!(
        authenticate(&dir, &cfg, Some(&token), 0).await,
        Err(AuthError::UnknownUser(_))
    ));
}

#[tokio::test]
async fn missing_session_does_not_block() {
    let dir = MemoryDirectory::new();
    let cfg = config();
    let user_id = Uuid::new_v4();
    dir.add_user(UserRecord {
        id: user_id,
        name: "no-session".into(),
        avatar_url: None,
        plan: crate::services::plan::PlanTier::Free,
    });
    // No session record seeded.

    let token = mint_token(&cfg, user_id, i64::MAX);
    let identity = authenticate(&dir, &cfg, Some(&token), 0).await.unwrap();
    assert_eq!(identity.id, user_id);
}
