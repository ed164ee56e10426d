//! Cleanup policy API tests.

mod common;

use axum::http::StatusCode;
use common::{TestServer, body_bytes};
use serde_json::json;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use vreg_metadata::repos::{CacheEntryRepo, NewCacheEntry};
use vreg_storage::ObjectStore;

fn policy_uri(group_id: Uuid) -> String {
    format!("/v1/admin/groups/{group_id}/cleanup_policy")
}

async fn seed_entry(server: &TestServer, upstream_id: Uuid, group_id: Uuid, path: &str, age_days: i64) {
    let key = format!("cache/maven/{upstream_id}/{}", Uuid::new_v4());
    server
        .state
        .storage
        .put(&key, bytes::Bytes::from_static(b"0123456789"))
        .await
        .unwrap();
    server
        .metadata()
        .create_cache_entry(&NewCacheEntry {
            upstream_id,
            group_id,
            registry_type: "maven".to_string(),
            relative_path: path.to_string(),
            object_key: key,
            content_type: "application/java-archive".to_string(),
            size_bytes: 10,
            upstream_etag: None,
            upstream_last_modified: None,
            file_sha256: String::new(),
            downloaded_at: OffsetDateTime::now_utc() - Duration::days(age_days),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_policy_validation() {
    let server = TestServer::new().await;
    let group_id = Uuid::new_v4();

    for body in [
        json!({ "keep_n_days_after_download": 0, "cadence": 7 }),
        json!({ "keep_n_days_after_download": 366, "cadence": 7 }),
        json!({ "keep_n_days_after_download": 30, "cadence": 3 }),
    ] {
        let (status, _) = server.admin("PUT", &policy_uri(group_id), Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    let (status, _) = server.admin("GET", &policy_uri(group_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_policy_save_get_delete() {
    let server = TestServer::new().await;
    let group_id = Uuid::new_v4();

    let before = OffsetDateTime::now_utc();
    let (status, saved) = server
        .admin(
            "PUT",
            &policy_uri(group_id),
            Some(json!({ "keep_n_days_after_download": 30, "cadence": 14, "notify_on_failure": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["status"], "scheduled");
    assert_eq!(saved["enabled"], true);
    assert_eq!(saved["cadence"], 14);
    let next_run = OffsetDateTime::parse(
        saved["next_run_at"].as_str().unwrap(),
        &time::format_description::well_known::Rfc3339,
    )
    .unwrap();
    assert!(next_run >= before + Duration::days(14));
    assert!(next_run <= OffsetDateTime::now_utc() + Duration::days(14));

    let (status, fetched) = server.admin("GET", &policy_uri(group_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["keep_n_days_after_download"], 30);
    assert_eq!(fetched["notify_on_failure"], true);

    let (status, _) = server.admin("DELETE", &policy_uri(group_id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = server.admin("DELETE", &policy_uri(group_id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, events) = server
        .admin("GET", &format!("/v1/admin/groups/{group_id}/audit_events"), None)
        .await;
    let names: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec![
            "virtual_registry_cleanup_policy_deleted",
            "virtual_registry_cleanup_policy_saved"
        ]
    );
}

#[tokio::test]
async fn test_manual_run_marks_old_entries() {
    let server = TestServer::new().await;
    let group_id = Uuid::new_v4();
    let registry_id = server.create_registry(group_id, "maven").await;
    let upstream = server
        .add_remote_upstream(registry_id, "http://127.0.0.1:9", 24)
        .await;
    let upstream_id: Uuid = upstream["upstream_id"].as_str().unwrap().parse().unwrap();

    seed_entry(&server, upstream_id, group_id, "old/a/1/a-1.jar", 10).await;
    seed_entry(&server, upstream_id, group_id, "old/b/1/b-1.jar", 8).await;
    seed_entry(&server, upstream_id, group_id, "fresh/c/1/c-1.jar", 1).await;

    let (status, _) = server
        .admin(
            "POST",
            &format!("{}/run", policy_uri(group_id)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server
        .admin(
            "PUT",
            &policy_uri(group_id),
            Some(json!({ "keep_n_days_after_download": 7, "cadence": 1 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, report) = server
        .admin("POST", &format!("{}/run", policy_uri(group_id)), None)
        .await;
    assert_eq!(status, StatusCode::OK, "run: {report}");
    assert_eq!(report["status"], "scheduled");
    assert_eq!(report["deleted_entries_count"], 2);
    assert_eq!(report["deleted_size"], 20);
    assert_eq!(report["detailed_metrics"]["maven"]["deleted_entries_count"], 2);

    // Marked entries are no longer served or listed as live.
    let old = server
        .pull(registry_id, "old/a/1/a-1.jar", Some(common::ADMIN_TOKEN))
        .await;
    assert_ne!(old.status(), StatusCode::OK);
    let fresh = server
        .pull(registry_id, "fresh/c/1/c-1.jar", Some(common::ADMIN_TOKEN))
        .await;
    assert_eq!(fresh.status(), StatusCode::OK);
    assert_eq!(body_bytes(fresh).await.as_ref(), b"0123456789");

    let (_, policy) = server.admin("GET", &policy_uri(group_id), None).await;
    assert_eq!(policy["last_run_deleted_entries_count"], 2);
    assert_eq!(policy["last_run_deleted_size"], 20);
    assert!(policy["last_run_at"].is_string());

    // A second run finds nothing new.
    let (_, report) = server
        .admin("POST", &format!("{}/run", policy_uri(group_id)), None)
        .await;
    assert_eq!(report["deleted_entries_count"], 0);

    let (_, events) = server
        .admin("GET", &format!("/v1/admin/groups/{group_id}/audit_events"), None)
        .await;
    let marked: Vec<_> = events
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["event_name"] == "virtual_registry_cache_entries_marked_for_destruction")
        .collect();
    assert_eq!(marked.len(), 1);
    assert_eq!(marked[0]["target_id"], upstream_id.to_string());
    assert_eq!(marked[0]["details"]["entries"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_disabled_policy_cannot_run() {
    let server = TestServer::new().await;
    let group_id = Uuid::new_v4();
    let (status, _) = server
        .admin(
            "PUT",
            &policy_uri(group_id),
            Some(json!({ "enabled": false, "keep_n_days_after_download": 7, "cadence": 7 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = server
        .admin("POST", &format!("{}/run", policy_uri(group_id)), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
