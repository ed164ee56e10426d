//! Authentication-related endpoints.

use crate::auth::require_auth;
use crate::error::{ApiError, ApiResult};
use axum::Json;
use axum::extract::Request;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

/// Response for the authenticated caller.
#[derive(Debug, Serialize)]
pub struct WhoamiResponse {
    pub token_id: String,
    pub group_id: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: Option<String>,
}

/// GET /v1/auth/whoami - Return token identity and group restriction.
pub async fn whoami(req: Request) -> ApiResult<Json<WhoamiResponse>> {
    let auth = require_auth(&req)?;
    let token = &auth.token;

    let mut scopes: Vec<String> = token
        .scopes
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();
    scopes.sort();

    let expires_at = match token.expires_at {
        Some(ts) => Some(
            ts.format(&Rfc3339)
                .map_err(|e| ApiError::Internal(format!("failed to format expires_at: {e}")))?,
        ),
        None => None,
    };

    Ok(Json(WhoamiResponse {
        token_id: token.id.to_string(),
        group_id: token.group_id.map(|id| id.to_string()),
        scopes,
        expires_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthenticatedUser;
    use axum::body::Body;
    use std::collections::HashSet;
    use time::OffsetDateTime;
    use uuid::Uuid;
    use vreg_core::token::{Token, TokenId, TokenScope};

    #[tokio::test]
    async fn test_whoami_reports_group_and_scopes() {
        let now = OffsetDateTime::now_utc();
        let group_id = Uuid::new_v4();
        let expires_at = now + time::Duration::seconds(3600);
        let token = Token {
            id: TokenId::new(),
            group_id: Some(group_id),
            scopes: HashSet::from([TokenScope::RegistryRead, TokenScope::RegistryAdmin]),
            expires_at: Some(expires_at),
            revoked_at: None,
            created_at: now,
            description: None,
        };

        let mut req = Request::new(Body::empty());
        req.extensions_mut().insert(AuthenticatedUser {
            token: token.clone(),
        });

        let Json(response) = whoami(req).await.unwrap();

        assert_eq!(response.token_id, token.id.to_string());
        assert_eq!(response.group_id, Some(group_id.to_string()));
        assert_eq!(
            response.scopes,
            vec!["registry:admin".to_string(), "registry:read".to_string()]
        );
        assert_eq!(
            response.expires_at,
            Some(expires_at.format(&Rfc3339).unwrap())
        );
    }

    #[tokio::test]
    async fn test_whoami_requires_token() {
        let err = whoami(Request::new(Body::empty())).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }
}
