//! Virtual registry endpoint tests: pulls through remote upstreams and
//! signed internal uploads.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{TestServer, blob_path, body_bytes, sha256_hash};
use httpmock::prelude::*;
use httpmock::Method::HEAD;
use serde_json::Value;
use uuid::Uuid;

async fn maven_registry_with_upstream(server: &TestServer, upstream_url: &str) -> (Uuid, Uuid, Value) {
    let group_id = Uuid::new_v4();
    let registry_id = server.create_registry(group_id, "maven").await;
    let upstream = server.add_remote_upstream(registry_id, upstream_url, 24).await;
    (group_id, registry_id, upstream)
}

#[tokio::test]
async fn test_pull_fills_cache_once() {
    let server = TestServer::new().await;
    let upstream = MockServer::start_async().await;
    let head = upstream
        .mock_async(|when, then| {
            when.method(HEAD).path("/com/example/lib/1.0/lib-1.0.jar");
            then.status(200).header("etag", "\"v1\"");
        })
        .await;
    let get = upstream
        .mock_async(|when, then| {
            when.method(GET).path("/com/example/lib/1.0/lib-1.0.jar");
            then.status(200)
                .header("etag", "\"v1\"")
                .header("content-type", "application/java-archive")
                .header("last-modified", "Tue, 03 Sep 2024 10:00:00 GMT")
                .header("set-cookie", "session=upstream")
                .body("jar-bytes");
        })
        .await;
    let (_, registry_id, _) = maven_registry_with_upstream(&server, &upstream.base_url()).await;

    let first = server
        .pull(registry_id, "com/example/lib/1.0/lib-1.0.jar", Some(common::ADMIN_TOKEN))
        .await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["content-type"], "application/java-archive");
    assert_eq!(first.headers()["etag"], "\"v1\"");
    assert_eq!(first.headers()["last-modified"], "Tue, 03 Sep 2024 10:00:00 GMT");
    assert_eq!(
        first.headers()["content-security-policy"],
        "sandbox; default-src 'none'; require-trusted-types-for 'script'"
    );
    assert_eq!(first.headers()["x-content-type-options"], "nosniff");
    assert!(first.headers().get("docker-distribution-api-version").is_none());
    assert_eq!(body_bytes(first).await.as_ref(), b"jar-bytes");

    let second = server
        .pull(registry_id, "com/example/lib/1.0/lib-1.0.jar", Some(common::ADMIN_TOKEN))
        .await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["etag"], "\"v1\"");
    assert_eq!(second.headers()["last-modified"], "Tue, 03 Sep 2024 10:00:00 GMT");
    assert!(second.headers().get("set-cookie").is_none());
    assert_eq!(body_bytes(second).await.as_ref(), b"jar-bytes");

    head.assert_hits_async(1).await;
    get.assert_hits_async(1).await;

    let (status, entries) = server
        .admin("GET", &format!("/v1/admin/registries/{registry_id}/cache_entries"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["relative_path"], "com/example/lib/1.0/lib-1.0.jar");
    assert_eq!(entries[0]["sha256"], sha256_hash(b"jar-bytes"));
    assert_eq!(entries[0]["status"], "default");
}

#[tokio::test]
async fn test_pull_requires_group_read_access() {
    let server = TestServer::new().await;
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.path("/a/b/1.0/b-1.0.pom");
            then.status(200).header("etag", "\"p\"").body("<project/>");
        })
        .await;
    let (group_id, registry_id, _) = maven_registry_with_upstream(&server, &upstream.base_url()).await;

    let anonymous = server.pull(registry_id, "a/b/1.0/b-1.0.pom", None).await;
    assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);

    let bogus = server.pull(registry_id, "a/b/1.0/b-1.0.pom", Some("not-a-token")).await;
    assert_eq!(bogus.status(), StatusCode::UNAUTHORIZED);

    let other_group = server
        .create_token(&["registry:read"], Some(Uuid::new_v4()))
        .await;
    let denied = server
        .pull(registry_id, "a/b/1.0/b-1.0.pom", Some(&other_group))
        .await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let own_group = server.create_token(&["registry:read"], Some(group_id)).await;
    let allowed = server
        .pull(registry_id, "a/b/1.0/b-1.0.pom", Some(&own_group))
        .await;
    assert_eq!(allowed.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_pull_error_statuses() {
    let server = TestServer::new().await;

    let missing = server
        .pull(Uuid::new_v4(), "a/b.jar", Some(common::ADMIN_TOKEN))
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let group_id = Uuid::new_v4();
    let empty_registry = server.create_registry(group_id, "maven").await;
    let no_upstreams = server
        .pull(empty_registry, "a/b.jar", Some(common::ADMIN_TOKEN))
        .await;
    assert_eq!(no_upstreams.status(), StatusCode::NOT_FOUND);

    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(HEAD);
            then.status(404);
        })
        .await;
    let (_, registry_id, _) = maven_registry_with_upstream(&server, &upstream.base_url()).await;
    let not_found = server
        .pull(registry_id, "a/b.jar", Some(common::ADMIN_TOKEN))
        .await;
    assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

    let traversal = server
        .pull(registry_id, "a/../../etc/passwd", Some(common::ADMIN_TOKEN))
        .await;
    assert_eq!(traversal.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_head_returns_headers_only() {
    let server = TestServer::new().await;
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.path("/x/y/2.0/y-2.0.jar");
            then.status(200).header("etag", "\"h\"").body("12345");
        })
        .await;
    let (_, registry_id, _) = maven_registry_with_upstream(&server, &upstream.base_url()).await;

    let request = Request::builder()
        .method("HEAD")
        .uri(format!("/registry/{registry_id}/x/y/2.0/y-2.0.jar"))
        .header("Authorization", format!("Bearer {}", common::ADMIN_TOKEN))
        .body(Body::empty())
        .unwrap();
    let response = server.send(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "5");
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn test_container_manifest_headers() {
    let server = TestServer::new().await;
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.path("/v2/library/alpine/manifests/3.20");
            then.status(200)
                .header("docker-content-digest", "sha256:0123abcd")
                .header("content-type", "application/vnd.oci.image.index.v1+json")
                .body("{}");
        })
        .await;
    let group_id = Uuid::new_v4();
    let registry_id = server.create_registry(group_id, "container").await;
    server
        .add_remote_upstream(registry_id, &upstream.base_url(), 24)
        .await;

    let response = server
        .pull(registry_id, "library/alpine/manifests/3.20", Some(common::ADMIN_TOKEN))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["docker-distribution-api-version"], "registry/2.0");
    assert_eq!(response.headers()["docker-content-digest"], "sha256:0123abcd");
    assert_eq!(
        response.headers()["content-type"],
        "application/vnd.oci.image.index.v1+json"
    );
}

#[tokio::test]
async fn test_upload_commits_entry_served_without_upstream() {
    let server = TestServer::new().await;
    // Nothing listens here; the pull must be answered from the cache.
    let (_, registry_id, upstream) = maven_registry_with_upstream(&server, "http://127.0.0.1:9").await;
    let gid = upstream["global_id"].as_str().unwrap();

    let request = server
        .upload_request(registry_id, gid, "org/demo/1.0/demo-1.0.jar")
        .header("etag", "\"uploaded\"")
        .header("content-type", "application/java-archive")
        .body(Body::from("uploaded-jar"))
        .unwrap();
    let response = server.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["relative_path"], "org/demo/1.0/demo-1.0.jar");
    assert_eq!(body["size"], 12);
    assert_eq!(body["sha256"], sha256_hash(b"uploaded-jar"));

    let pulled = server
        .pull(registry_id, "org/demo/1.0/demo-1.0.jar", Some(common::ADMIN_TOKEN))
        .await;
    assert_eq!(pulled.status(), StatusCode::OK);
    assert_eq!(pulled.headers()["etag"], "\"uploaded\"");
    assert_eq!(body_bytes(pulled).await.as_ref(), b"uploaded-jar");
}

#[tokio::test]
async fn test_upload_rejections() {
    let server = TestServer::with_config(|config| {
        config.server.max_file_size = 8;
    })
    .await;
    let (_, registry_id, upstream) = maven_registry_with_upstream(&server, "http://127.0.0.1:9").await;
    let gid = upstream["global_id"].as_str().unwrap();

    let unsigned = Request::builder()
        .method("PUT")
        .uri(format!("/registry/{registry_id}/a/b.jar"))
        .header("x-vreg-virtual-registry-upstream-global-id", gid)
        .body(Body::from("x"))
        .unwrap();
    assert_eq!(server.send(unsigned).await.status(), StatusCode::UNAUTHORIZED);

    let foreign = server
        .upload_request(registry_id, &format!("gid://vreg/Upstream/{}", Uuid::new_v4()), "a/b.jar")
        .body(Body::from("x"))
        .unwrap();
    assert_eq!(server.send(foreign).await.status(), StatusCode::NOT_FOUND);

    let wrong_model = server
        .upload_request(registry_id, "gid://vreg/Project/42", "a/b.jar")
        .body(Body::from("x"))
        .unwrap();
    assert_eq!(server.send(wrong_model).await.status(), StatusCode::BAD_REQUEST);

    let too_large = server
        .upload_request(registry_id, gid, "a/b.jar")
        .header("content-length", "9")
        .body(Body::from("123456789"))
        .unwrap();
    assert_eq!(server.send(too_large).await.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let streamed_too_large = server
        .upload_request(registry_id, gid, "a/b.jar")
        .body(Body::from("123456789"))
        .unwrap();
    assert_eq!(
        server.send(streamed_too_large).await.status(),
        StatusCode::PAYLOAD_TOO_LARGE
    );
}

#[tokio::test]
async fn test_upload_blob_digest_is_verified() {
    let server = TestServer::new().await;
    let group_id = Uuid::new_v4();
    let registry_id = server.create_registry(group_id, "container").await;
    let upstream = server
        .add_remote_upstream(registry_id, "http://127.0.0.1:9", 24)
        .await;
    let gid = upstream["global_id"].as_str().unwrap();

    let mismatched = server
        .upload_request(registry_id, gid, &blob_path("library/alpine", b"expected"))
        .body(Body::from("something else"))
        .unwrap();
    assert_eq!(server.send(mismatched).await.status(), StatusCode::BAD_REQUEST);

    let matching = server
        .upload_request(registry_id, gid, &blob_path("library/alpine", b"expected"))
        .body(Body::from("expected"))
        .unwrap();
    assert_eq!(server.send(matching).await.status(), StatusCode::OK);

    let (_, entries) = server
        .admin("GET", &format!("/v1/admin/registries/{registry_id}/cache_entries"), None)
        .await;
    assert_eq!(entries.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_higher_ranked_upstream_wins() {
    let server = TestServer::new().await;
    let first = MockServer::start_async().await;
    let second = MockServer::start_async().await;
    let first_head = first
        .mock_async(|when, then| {
            when.method(HEAD);
            then.status(404);
        })
        .await;
    second
        .mock_async(|when, then| {
            when.path("/g/a/1/a-1.jar");
            then.status(200).header("etag", "\"second\"").body("from-second");
        })
        .await;

    let group_id = Uuid::new_v4();
    let registry_id = server.create_registry(group_id, "maven").await;
    server.add_remote_upstream(registry_id, &first.base_url(), 24).await;
    server.add_remote_upstream(registry_id, &second.base_url(), 24).await;

    let response = server
        .pull(registry_id, "g/a/1/a-1.jar", Some(common::ADMIN_TOKEN))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await.as_ref(), b"from-second");
    first_head.assert_hits_async(1).await;
}
