//! Verification of internal upload requests.
//!
//! The front proxy that streams large uploads signs every request it
//! forwards with an HS256 JWT in [`INTERNAL_REQUEST_HEADER`]. The token is
//! never logged.

use axum::http::HeaderMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use vreg_core::config::InternalConfig;

pub const INTERNAL_REQUEST_HEADER: &str = "x-vreg-internal-request";

/// Default lifetime of tokens minted by [`InternalVerifier::sign`].
const SIGNED_TOKEN_TTL_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalClaims {
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InternalAuthError {
    #[error("internal uploads are disabled")]
    Disabled,
    #[error("missing internal request header")]
    Missing,
    #[error("internal request token expired")]
    Expired,
    #[error("invalid internal request token")]
    Invalid,
}

/// Checks the signed header of internal requests.
#[derive(Clone)]
pub struct InternalVerifier {
    secret: Option<Vec<u8>>,
    issuer: String,
}

impl std::fmt::Debug for InternalVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalVerifier")
            .field("enabled", &self.secret.is_some())
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl InternalVerifier {
    pub fn from_config(config: &InternalConfig) -> Self {
        Self {
            secret: config
                .workhorse_secret
                .as_ref()
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec()),
            issuer: config.issuer.clone(),
        }
    }

    pub fn verify(&self, headers: &HeaderMap) -> Result<InternalClaims, InternalAuthError> {
        let secret = self.secret.as_deref().ok_or(InternalAuthError::Disabled)?;
        let token = headers
            .get(INTERNAL_REQUEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(InternalAuthError::Missing)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);

        decode::<InternalClaims>(token, &DecodingKey::from_secret(secret), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => InternalAuthError::Expired,
                _ => InternalAuthError::Invalid,
            })
    }

    /// Mint a header value. Used by tests and tooling that stands in for the
    /// front proxy.
    pub fn sign(&self) -> Result<String, InternalAuthError> {
        let secret = self.secret.as_deref().ok_or(InternalAuthError::Disabled)?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = InternalClaims {
            iss: self.issuer.clone(),
            iat: now,
            exp: now + SIGNED_TOKEN_TTL_SECS,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .map_err(|_| InternalAuthError::Invalid)
    }
}
