//! Dual-token issuance and verification.
//!
//! Both tokens are HS256 JWTs carrying the same identity claims; they differ
//! only in audience and lifetime. Refresh is stateless: a refresh token stays
//! valid until it expires, even after it has been exchanged.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::error::AppError;
use crate::model::{Identity, PermissionGrant};

pub const ACCESS_AUDIENCE: &str = "access";
pub const REFRESH_AUDIENCE: &str = "refresh";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token signing failed: {0}")]
    Signing(String),
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Signing(_) => AppError::Upstream(err.to_string()),
            _ => AppError::Unauthenticated("token invalid or expired".into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub id: Ulid,
    pub username: String,
    pub email: String,
    pub is_admin: bool,
    pub roles: Vec<String>,
    pub permissions: Vec<PermissionGrant>,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            is_admin: self.is_admin,
            roles: self.roles.clone(),
            permissions: self.permissions.clone(),
        }
    }

    pub fn has_permission(&self, name: &str) -> bool {
        self.permissions.iter().any(|p| p.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl TokenService {
    pub fn new(secret: &[u8], access_ttl_secs: u64, refresh_ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            access_ttl_secs: access_ttl_secs as i64,
            refresh_ttl_secs: refresh_ttl_secs as i64,
        }
    }

    pub fn issue(&self, identity: &Identity) -> Result<TokenPair, TokenError> {
        self.issue_at(identity, now_secs())
    }

    /// Issue a pair as if the current time were `now` (Unix seconds).
    pub fn issue_at(&self, identity: &Identity, now: i64) -> Result<TokenPair, TokenError> {
        Ok(TokenPair {
            access_token: self.sign(identity, ACCESS_AUDIENCE, now, self.access_ttl_secs)?,
            refresh_token: self.sign(identity, REFRESH_AUDIENCE, now, self.refresh_ttl_secs)?,
        })
    }

    fn sign(&self, identity: &Identity, aud: &str, now: i64, ttl: i64) -> Result<String, TokenError> {
        let claims = Claims {
            id: identity.id,
            username: identity.username.clone(),
            email: identity.email.clone(),
            is_admin: identity.is_admin,
            roles: identity.roles.clone(),
            permissions: identity.permissions.clone(),
            aud: aud.to_string(),
            iat: now,
            exp: now.saturating_add(ttl),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    pub fn verify_access(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify(token, ACCESS_AUDIENCE)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify(token, REFRESH_AUDIENCE)
    }

    fn verify(&self, token: &str, aud: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_audience(&[aud]);
        validation.set_required_spec_claims(&["exp", "aud"]);

        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => TokenError::Malformed(e.to_string()),
                _ => TokenError::Invalid(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn service() -> TokenService {
        TokenService::new(SECRET, 1800, 7 * 24 * 3600)
    }

    fn identity() -> Identity {
        Identity {
            id: Ulid::new(),
            username: "alice".into(),
            email: "alice@example.com".into(),
            is_admin: false,
            roles: vec!["user".into(), "reviewer".into()],
            permissions: vec![PermissionGrant {
                id: Ulid::new(),
                name: "booking:review".into(),
                description: "approve or reject booking requests".into(),
            }],
        }
    }

    #[test]
    fn round_trip_recovers_identity() {
        let svc = service();
        let who = identity();
        let pair = svc.issue(&who).unwrap();

        let claims = svc.verify_access(&pair.access_token).unwrap();
        assert_eq!(claims.identity(), who);
        assert_eq!(claims.aud, ACCESS_AUDIENCE);
        assert_eq!(claims.exp - claims.iat, 1800);
        assert!(claims.has_permission("booking:review"));
        assert!(!claims.has_permission("room:manage"));

        let refreshed = svc.verify_refresh(&pair.refresh_token).unwrap();
        assert_eq!(refreshed.identity(), who);
        assert_eq!(refreshed.exp - refreshed.iat, 7 * 24 * 3600);
    }

    #[test]
    fn claims_are_deterministic_for_fixed_time() {
        let svc = service();
        let who = identity();
        assert_eq!(svc.issue_at(&who, 1_000).unwrap(), svc.issue_at(&who, 1_000).unwrap());
    }

    #[test]
    fn audiences_are_not_interchangeable() {
        let svc = service();
        let pair = svc.issue(&identity()).unwrap();
        assert!(matches!(
            svc.verify_access(&pair.refresh_token),
            Err(TokenError::Invalid(_))
        ));
        assert!(matches!(
            svc.verify_refresh(&pair.access_token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let svc = service();
        let pair = svc.issue_at(&identity(), now_secs() - 1801).unwrap();
        assert_eq!(svc.verify_access(&pair.access_token), Err(TokenError::Expired));
        assert!(svc.verify_refresh(&pair.refresh_token).is_ok());
    }

    #[test]
    fn foreign_signature_is_invalid() {
        let other = TokenService::new(b"ffffffffffffffffffffffffffffffff", 1800, 3600);
        let pair = other.issue(&identity()).unwrap();
        assert!(matches!(
            service().verify_access(&pair.access_token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            service().verify_access("not-a-jwt"),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn every_failure_collapses_to_unauthenticated() {
        for err in [
            TokenError::Expired,
            TokenError::Invalid("x".into()),
            TokenError::Malformed("y".into()),
        ] {
            assert!(matches!(AppError::from(err), AppError::Unauthenticated(_)));
        }
    }
}
