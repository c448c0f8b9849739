//! Identity resolution for incoming realtime connections.
//!
//! ARCHITECTURE
//! ============
//! A connection presents either a signed bearer token (verified locally:
//! keyed digest + expiry, then resolved against the user directory) or
//! nothing, in which case a throwaway guest identity is synthesized. The
//! resolved `Identity` is fixed into the connection context at upgrade time
//! and threaded explicitly into every handler.
//!
//! TRADE-OFFS
//! ==========
//! A missing session record downgrades to a warning instead of rejecting
//! the connection: losing the session store must not take realtime
//! collaboration down with it.

use std::fmt::Write;

use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::services::directory::{Directory, DirectoryError};
use crate::services::plan::PlanTier;

const GUEST_SUFFIX_LEN: usize = 4;
const GUEST_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

// =============================================================================
// TYPES
// =============================================================================

/// Who a connection is acting as.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
    pub plan: PlanTier,
    pub is_anonymous: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    Malformed,
    #[error("invalid token")]
    BadSignature,
    #[error("expired token")]
    Expired,
    #[error("authentication failed")]
    UnknownUser(Uuid),
    #[error("authentication failed")]
    Directory(#[from] DirectoryError),
}

impl crate::frame::ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Malformed | Self::BadSignature => "E_TOKEN_INVALID",
            Self::Expired => "E_TOKEN_EXPIRED",
            Self::UnknownUser(_) | Self::Directory(_) => "E_AUTH_FAILED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Expired | Self::Directory(_))
    }
}

/// Signing configuration for bearer tokens.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
}

impl AuthConfig {
    /// Load from `AUTH_TOKEN_SECRET`. Falls back to a development secret
    /// with a warning so local runs work out of the box.
    #[must_use]
    pub fn from_env() -> Self {
        let secret = std::env::var("AUTH_TOKEN_SECRET").unwrap_or_else(|_| {
            warn!("AUTH_TOKEN_SECRET not set; using development secret");
            "inkroom-dev-secret".into()
        });
        Self { secret }
    }
}

// =============================================================================
// TOKEN CODEC
// =============================================================================

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn sign(secret: &str, user_id: Uuid, expires_ms: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(expires_ms.to_be_bytes());
    bytes_to_hex(&hasher.finalize())
}

/// Mint a signed bearer token: `<user_id>.<expires_ms>.<digest>`.
#[must_use]
pub fn mint_token(config: &AuthConfig, user_id: Uuid, expires_ms: i64) -> String {
    let sig = sign(&config.secret, user_id, expires_ms);
    format!("{}.{expires_ms}.{sig}", user_id.simple())
}

/// Verify a token's signature and expiry, returning the embedded user id.
///
/// # Errors
///
/// `Malformed` for structural problems, `BadSignature` for digest mismatch,
/// `Expired` when `expires_ms <= now_ms`.
pub fn verify_token(config: &AuthConfig, token: &str, now_ms: i64) -> Result<Uuid, AuthError> {
    let mut parts = token.splitn(3, '.');
    let (Some(id_part), Some(exp_part), Some(sig_part)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::Malformed);
    };

    let user_id: Uuid = id_part.parse().map_err(|_| AuthError::Malformed)?;
    let expires_ms: i64 = exp_part.parse().map_err(|_| AuthError::Malformed)?;

    let expected = sign(&config.secret, user_id, expires_ms);
    if sig_part != expected {
        return Err(AuthError::BadSignature);
    }
    if expires_ms <= now_ms {
        return Err(AuthError::Expired);
    }
    Ok(user_id)
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Synthesize a guest identity for a tokenless connection.
#[must_use]
pub fn anonymous_identity() -> Identity {
    let mut rng = rand::rng();
    let suffix: String = (0..GUEST_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.random_range(0..GUEST_ALPHABET.len());
            GUEST_ALPHABET[idx] as char
        })
        .collect();

    Identity {
        id: Uuid::new_v4(),
        name: format!("guest-{suffix}"),
        avatar_url: None,
        plan: PlanTier::Free,
        is_anonymous: true,
    }
}

/// Resolve the identity for a new connection.
///
/// No token → anonymous. Token → verify locally, then resolve the persisted
/// user. A missing session record logs a warning but does not block.
///
/// # Errors
///
/// Returns a typed [`AuthError`] so the gateway can reject the upgrade with
/// a reason the client can act on (refresh vs. fall back to anonymous).
pub async fn authenticate(
    directory: &dyn Directory,
    config: &AuthConfig,
    token: Option<&str>,
    now_ms: i64,
) -> Result<Identity, AuthError> {
    let Some(token) = token else {
        return Ok(anonymous_identity());
    };

    let user_id = verify_token(config, token, now_ms)?;
    let user = directory
        .user(user_id)
        .await?
        .ok_or(AuthError::UnknownUser(user_id))?;

    match directory.session_exists(user_id).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(%user_id, "no session record for verified token; allowing connection");
        }
        Err(e) => {
            warn!(%user_id, error = %e, "session lookup failed; allowing connection");
        }
    }

    Ok(Identity {
        id: user.id,
        name: user.name,
        avatar_url: user.avatar_url,
        plan: user.plan,
        is_anonymous: false,
    })
}

#[cfg(test)]
#[path = "identity_test.rs"]
mod tests;
