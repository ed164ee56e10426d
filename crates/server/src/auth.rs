//! Authentication and authorization middleware.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use time::OffsetDateTime;
use tracing::Instrument;
use uuid::Uuid;
use vreg_core::token::{Token, TokenId, TokenScope};
use vreg_metadata::repos::TokenRepo;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Longer client trace ids are truncated.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID for request correlation.
#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Sanitize a client-provided value: at most `MAX_TRACE_ID_LEN` chars,
    /// printable ASCII only.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated request extension.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub token: Token,
}

impl AuthenticatedUser {
    pub fn has_scope(&self, scope: TokenScope) -> bool {
        self.token.has_scope(scope)
    }

    pub fn require_scope(&self, scope: TokenScope) -> ApiResult<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!("missing required scope: {scope}")))
        }
    }

    /// Require pull access to registries of `group_id`.
    pub fn require_group_read(&self, group_id: Uuid) -> ApiResult<()> {
        if self.token.can_read_group(group_id) {
            Ok(())
        } else {
            Err(ApiError::Forbidden("access to this registry denied".to_string()))
        }
    }
}

/// Bearer token from the Authorization header. The scheme is
/// case-insensitive (RFC 6750).
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(v[7..].trim())
            } else {
                None
            }
        })
}

fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

/// Hash a token for storage lookup.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Validates bearer tokens and runs the request in a `request` span.
///
/// Requests without a token pass through unauthenticated; handlers decide
/// whether that is acceptable. An unknown token is treated the same way. An
/// expired or revoked one is rejected.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let trace_id_str = trace_id.0.clone();
    req.extensions_mut().insert(trace_id);

    if let Some(token_str) = extract_bearer_token(&req) {
        let token_hash = hash_token(token_str);

        if let Some(token_row) = state.metadata.get_token_by_hash(&token_hash).await? {
            let scopes: Vec<String> = serde_json::from_str(&token_row.scopes)
                .map_err(|e| ApiError::Internal(format!("invalid token scopes: {e}")))?;

            let scopes: HashSet<TokenScope> = scopes
                .iter()
                .filter_map(|s| {
                    TokenScope::parse(s)
                        .inspect_err(|_| {
                            tracing::warn!(
                                token_id = %token_row.token_id,
                                invalid_scope = %s,
                                "Token contains invalid scope, ignoring"
                            )
                        })
                        .ok()
                })
                .collect();

            let token = Token {
                id: TokenId::parse(&token_row.token_id.to_string())?,
                group_id: token_row.group_id,
                scopes,
                expires_at: token_row.expires_at,
                revoked_at: token_row.revoked_at,
                created_at: token_row.created_at,
                description: token_row.description,
            };

            if !token.is_valid() {
                return Err(ApiError::Unauthorized(
                    "token expired or revoked".to_string(),
                ));
            }

            let metadata = state.metadata.clone();
            let token_id = token_row.token_id;
            tokio::spawn(async move {
                let _ = metadata
                    .touch_token(token_id, OffsetDateTime::now_utc())
                    .await;
            });

            req.extensions_mut().insert(AuthenticatedUser { token });
        }
    }

    let mut response = next
        .run(req)
        .instrument(tracing::info_span!("request", trace_id = %trace_id_str))
        .await;

    if let Ok(value) = HeaderValue::from_str(&trace_id_str) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    Ok(response)
}

/// Require authentication (token must be present).
pub fn require_auth(req: &Request) -> ApiResult<&AuthenticatedUser> {
    req.extensions()
        .get::<AuthenticatedUser>()
        .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
}

pub fn get_trace_id(req: &Request) -> Option<&TraceId> {
    req.extensions().get::<TraceId>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_sanitized() {
        let long = "a".repeat(500);
        assert_eq!(TraceId::from_client(&long).as_str().len(), MAX_TRACE_ID_LEN);
        assert_eq!(TraceId::from_client("abc\ndef").as_str(), "abcdef");
        assert!(Uuid::parse_str(TraceId::from_client("\u{1F600}").as_str()).is_ok());
    }

    #[test]
    fn test_hash_token_is_sha256_hex() {
        assert_eq!(
            hash_token("test-admin-token"),
            "9f735e0df9a1ddc702bf0a1a7b83033f9f7153a00c29de82cedadc9957289b05"
        );
    }

    #[test]
    fn test_bearer_scheme_case_insensitive() {
        let req = Request::builder()
            .header(AUTHORIZATION, "BEARER abc")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&req), Some("abc"));

        let req = Request::builder()
            .header(AUTHORIZATION, "Basic abc")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&req), None);
    }
}
