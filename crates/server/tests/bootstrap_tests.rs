//! Tests for bootstrap token initialization behavior.

mod common;

use axum::http::StatusCode;
use common::{ADMIN_TOKEN, TestServer, sha256_hash};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use vreg_core::config::AdminConfig;
use vreg_metadata::models::TokenRow;
use vreg_metadata::repos::{BootstrapRepo, TokenRepo};
use vreg_server::bootstrap::ensure_admin_token;

fn admin_config(raw_token: &str) -> AdminConfig {
    AdminConfig {
        token_hash: sha256_hash(raw_token.as_bytes()),
        token_description: Some("Rotated admin".to_string()),
    }
}

#[tokio::test]
async fn test_bootstrap_is_idempotent() {
    let server = TestServer::new().await;
    let metadata = server.metadata();
    let first = metadata.get_bootstrap_token_id().await.unwrap().unwrap();

    ensure_admin_token(metadata.as_ref(), &AdminConfig::for_testing())
        .await
        .unwrap();

    assert_eq!(metadata.get_bootstrap_token_id().await.unwrap(), Some(first));
    assert_eq!(metadata.list_tokens(None).await.unwrap().len(), 1);

    let token = metadata.get_token(first).await.unwrap().unwrap();
    assert_eq!(token.group_id, None);
    assert_eq!(token.scopes, r#"["registry:admin"]"#);
}

#[tokio::test]
async fn test_rotation_revokes_previous_admin_token() {
    let server = TestServer::new().await;
    let metadata = server.metadata();
    let previous = metadata.get_bootstrap_token_id().await.unwrap().unwrap();

    ensure_admin_token(metadata.as_ref(), &admin_config("rotated-admin-token"))
        .await
        .unwrap();

    let current = metadata.get_bootstrap_token_id().await.unwrap().unwrap();
    assert_ne!(current, previous);
    let old = metadata.get_token(previous).await.unwrap().unwrap();
    assert!(old.revoked_at.is_some());

    let (status, _) = server.json("GET", "/v1/auth/whoami", None, Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, body) = server
        .json("GET", "/v1/auth/whoami", None, Some("rotated-admin-token"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_id"], current.to_string());
}

#[tokio::test]
async fn test_accepts_prefixed_uppercase_hash() {
    let server = TestServer::new().await;
    let metadata = server.metadata();
    let config = AdminConfig {
        token_hash: format!("sha256:{}", sha256_hash(b"another-token").to_uppercase()),
        token_description: None,
    };

    ensure_admin_token(metadata.as_ref(), &config).await.unwrap();

    let (status, _) = server
        .json("GET", "/v1/auth/whoami", None, Some("another-token"))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_rejects_malformed_hash() {
    let server = TestServer::new().await;
    let config = AdminConfig {
        token_hash: "not-a-hash".to_string(),
        token_description: None,
    };
    assert!(ensure_admin_token(server.metadata().as_ref(), &config).await.is_err());
}

#[tokio::test]
async fn test_rejects_revoked_or_expired_hash() {
    let server = TestServer::new().await;
    let metadata = server.metadata();
    let now = OffsetDateTime::now_utc();

    for (raw, revoked_at, expires_at) in [
        ("revoked-token", Some(now), None),
        ("expired-token", None, Some(now - Duration::hours(1))),
    ] {
        metadata
            .create_token(&TokenRow {
                token_id: Uuid::new_v4(),
                group_id: None,
                token_hash: sha256_hash(raw.as_bytes()),
                scopes: r#"["registry:admin"]"#.to_string(),
                expires_at,
                revoked_at,
                created_at: now,
                last_used_at: None,
                description: None,
            })
            .await
            .unwrap();

        let err = ensure_admin_token(metadata.as_ref(), &admin_config(raw))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("use a new token hash"));
    }
}
