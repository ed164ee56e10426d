//! Token types and authorization.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for a token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(Uuid);

impl TokenId {
    /// Generate a new random token ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidToken(format!("invalid token ID: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", self.0)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token scopes for authorization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenScope {
    /// Pull artifacts through a virtual registry.
    #[serde(rename = "registry:read")]
    RegistryRead,
    /// Manage registries, upstreams, cleanup policies and tokens.
    #[serde(rename = "registry:admin")]
    RegistryAdmin,
}

impl TokenScope {
    /// Parse from string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "registry:read" => Ok(Self::RegistryRead),
            "registry:admin" => Ok(Self::RegistryAdmin),
            _ => Err(crate::Error::InvalidToken(format!("unknown scope: {s}"))),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegistryRead => "registry:read",
            Self::RegistryAdmin => "registry:admin",
        }
    }

    /// Check if this scope implies another scope.
    pub fn implies(&self, other: &Self) -> bool {
        match self {
            Self::RegistryAdmin => true,
            Self::RegistryRead => matches!(other, Self::RegistryRead),
        }
    }
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated token with its metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    /// Token identifier.
    pub id: TokenId,
    /// Group this token is restricted to. `None` grants every group.
    pub group_id: Option<Uuid>,
    /// Granted scopes.
    pub scopes: HashSet<TokenScope>,
    /// When the token expires.
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    /// When the token was revoked (if revoked).
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    /// When the token was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Description for the token.
    pub description: Option<String>,
}

impl Token {
    /// Check if the token is valid (not expired or revoked).
    pub fn is_valid(&self) -> bool {
        let now = OffsetDateTime::now_utc();

        if self.revoked_at.is_some() {
            return false;
        }

        if let Some(expires_at) = self.expires_at
            && now > expires_at
        {
            return false;
        }

        true
    }

    /// Check if the token has a specific scope.
    pub fn has_scope(&self, scope: TokenScope) -> bool {
        self.scopes.iter().any(|s| s.implies(&scope))
    }

    /// Whether the token may pull from registries owned by `group_id`.
    pub fn can_read_group(&self, group_id: Uuid) -> bool {
        self.is_valid()
            && self.has_scope(TokenScope::RegistryRead)
            && self.group_id.is_none_or(|g| g == group_id)
    }

    /// Check if the token has admin access.
    pub fn is_admin(&self) -> bool {
        self.is_valid() && self.has_scope(TokenScope::RegistryAdmin)
    }
}

/// Request to create a token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    /// Scopes to grant.
    pub scopes: Vec<String>,
    /// Restrict the token to one group.
    pub group_id: Option<Uuid>,
    /// Expiration duration in seconds (optional).
    pub expires_in: Option<u64>,
    /// Description for the token.
    pub description: Option<String>,
}

/// Response from creating a token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateTokenResponse {
    /// The token ID.
    pub token_id: String,
    /// The token secret (only returned once).
    pub token_secret: String,
    /// When the token expires.
    pub expires_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(scopes: &[TokenScope], group_id: Option<Uuid>) -> Token {
        Token {
            id: TokenId::new(),
            group_id,
            scopes: scopes.iter().copied().collect(),
            expires_at: None,
            revoked_at: None,
            created_at: OffsetDateTime::now_utc(),
            description: None,
        }
    }

    #[test]
    fn test_scope_implies() {
        assert!(TokenScope::RegistryAdmin.implies(&TokenScope::RegistryRead));
        assert!(TokenScope::RegistryAdmin.implies(&TokenScope::RegistryAdmin));
        assert!(TokenScope::RegistryRead.implies(&TokenScope::RegistryRead));
        assert!(!TokenScope::RegistryRead.implies(&TokenScope::RegistryAdmin));
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(
            TokenScope::parse("registry:read").unwrap(),
            TokenScope::RegistryRead
        );
        assert_eq!(
            TokenScope::parse("registry:admin").unwrap(),
            TokenScope::RegistryAdmin
        );
        assert!(TokenScope::parse("cache:write").is_err());
    }

    #[test]
    fn test_group_restriction() {
        let group = Uuid::new_v4();
        let other = Uuid::new_v4();

        let global = token(&[TokenScope::RegistryRead], None);
        assert!(global.can_read_group(group));
        assert!(global.can_read_group(other));

        let scoped = token(&[TokenScope::RegistryRead], Some(group));
        assert!(scoped.can_read_group(group));
        assert!(!scoped.can_read_group(other));
        assert!(!scoped.is_admin());
    }

    #[test]
    fn test_revoked_and_expired_tokens_cannot_read() {
        let mut revoked = token(&[TokenScope::RegistryAdmin], None);
        revoked.revoked_at = Some(OffsetDateTime::now_utc());
        assert!(!revoked.can_read_group(Uuid::new_v4()));

        let mut expired = token(&[TokenScope::RegistryRead], None);
        expired.expires_at = Some(OffsetDateTime::now_utc() - time::Duration::hours(1));
        assert!(!expired.is_valid());
    }
}
