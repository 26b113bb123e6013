//! Compact signed tokens for the settings flow.
//!
//! A token is `base64url(claims json) "." base64url(hmac-sha256)`. Tokens are opaque to the
//! browser and verified statelessly.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;

use crate::bitmask::Mask;

type HmacSha256 = Hmac<Sha256>;

/// Cookie values may not contain spaces, so multiple tokens are joined with this.
pub const TOKEN_SEPARATOR: char = '|';

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    /// Unix seconds.
    pub exp: i64,
    pub version: u32,
    pub variant: Mask,
    pub privilege: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid signing key")]
    InvalidKey,
}

#[derive(Clone)]
pub struct TokenService {
    mac: HmacSha256,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService").finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self, TokenError> {
        let mac = HmacSha256::new_from_slice(key.as_ref()).map_err(|_| TokenError::InvalidKey)?;
        Ok(Self { mac })
    }

    /// Key that lives as long as the process; tokens do not survive restarts.
    pub fn ephemeral() -> Result<Self, TokenError> {
        let key = format!("{}{}", uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        Self::new(key)
    }

    pub fn claims(
        &self,
        sub: impl Into<String>,
        privilege: impl Into<String>,
        version: u32,
        variant: Mask,
        ttl: Duration,
    ) -> Claims {
        Claims {
            sub: sub.into(),
            exp: (Utc::now() + ttl).timestamp(),
            version,
            variant,
            privilege: privilege.into(),
            extra: Map::new(),
        }
    }

    pub fn issue(&self, claims: &Claims) -> String {
        let payload = serde_json::to_vec(claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(payload);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(payload.as_bytes()));
        format!("{payload}.{signature}")
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let (payload, signature) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;
        if claims.exp < Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Every valid token in a separator-joined cookie value.
    pub fn verify_all(&self, joined: &str) -> Vec<Claims> {
        joined
            .split(TOKEN_SEPARATOR)
            .filter(|t| !t.is_empty())
            .filter_map(|t| self.verify(t).ok())
            .collect()
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_verify() {
        let service = TokenService::new("secret").unwrap();
        let claims = service.claims("127.0.0.1", "nochange", 2, 95, Duration::hours(12));
        let token = service.issue(&claims);
        assert_eq!(service.verify(&token), Ok(claims));
    }

    #[test]
    fn tampered_and_foreign_tokens_are_rejected() {
        let service = TokenService::new("secret").unwrap();
        let token = service.issue(&service.claims("a", "nochange", 2, 0, Duration::hours(1)));
        let other = TokenService::new("other").unwrap();
        assert_eq!(other.verify(&token), Err(TokenError::BadSignature));

        let (_, signature) = token.split_once('.').unwrap();
        let forged_claims = service.claims("a", "update", 2, 0, Duration::hours(1));
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        assert_eq!(
            service.verify(&format!("{forged_payload}.{signature}")),
            Err(TokenError::BadSignature)
        );
        assert_eq!(service.verify("garbage"), Err(TokenError::Malformed));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let service = TokenService::new("secret").unwrap();
        let token = service.issue(&service.claims("a", "nochange", 2, 0, Duration::seconds(-5)));
        assert_eq!(service.verify(&token), Err(TokenError::Expired));
    }

    #[test]
    fn joined_values_yield_every_valid_token() {
        let service = TokenService::new("secret").unwrap();
        let a = service.issue(&service.claims("a", "nochange", 2, 0, Duration::hours(1)));
        let b = service.issue(&service.claims("a", "update", 2, 0, Duration::hours(1)));
        let joined = format!("{a}{TOKEN_SEPARATOR}junk{TOKEN_SEPARATOR}{b}");
        let privileges: Vec<_> = service
            .verify_all(&joined)
            .into_iter()
            .map(|c| c.privilege)
            .collect();
        assert_eq!(privileges, ["nochange", "update"]);
    }
}
