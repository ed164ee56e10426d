//! Server test utilities.

use super::fixtures::ADMIN_TOKEN;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;
use vreg_core::config::{AppConfig, MetadataConfig, StorageConfig};
use vreg_metadata::{MetadataStore, SqliteStore};
use vreg_server::bootstrap::ensure_admin_token;
use vreg_server::internal::INTERNAL_REQUEST_HEADER;
use vreg_server::state::CleanupTaskRegistry;
use vreg_server::{AppState, create_router};
use vreg_storage::{FilesystemBackend, ObjectStore};

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let storage_path = temp_dir.path().join("storage");
        std::fs::create_dir_all(&storage_path).expect("Failed to create storage directory");
        let storage: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );

        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let mut config = AppConfig::for_testing();
        config.storage = StorageConfig::Filesystem {
            path: storage_path,
        };
        config.metadata = MetadataConfig::Sqlite {
            path: db_path,
            query_timeout_secs: None,
        };
        modifier(&mut config);

        ensure_admin_token(metadata.as_ref(), &config.admin)
            .await
            .expect("Failed to bootstrap admin token");

        let cleanup_tasks = Arc::new(CleanupTaskRegistry::new(metadata.clone()));
        let state = AppState::new(config, storage, metadata, cleanup_tasks)
            .expect("Failed to build state");
        let router = create_router(state.clone());

        Self {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }

    /// Get access to the underlying metadata.
    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    /// Send a request through the router.
    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    /// Send a JSON request and decode the JSON response (Null when empty).
    pub async fn json(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
        auth_token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = auth_token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(v) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_vec(&v).unwrap())
            }
            None => Body::empty(),
        };

        let response = self.send(builder.body(body).unwrap()).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// Admin JSON request.
    pub async fn admin(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        self.json(method, uri, body, Some(ADMIN_TOKEN)).await
    }

    /// Create a registry through the admin API.
    pub async fn create_registry(&self, group_id: Uuid, registry_type: &str) -> Uuid {
        let (status, body) = self
            .admin(
                "POST",
                "/v1/admin/registries",
                Some(json!({
                    "group_id": group_id,
                    "name": format!("{registry_type} registry"),
                    "registry_type": registry_type,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create registry: {body}");
        body["registry_id"].as_str().unwrap().parse().unwrap()
    }

    /// Append a remote upstream and return its API representation.
    pub async fn add_remote_upstream(&self, registry_id: Uuid, url: &str, validity_hours: i64) -> Value {
        let (status, body) = self
            .admin(
                "POST",
                &format!("/v1/admin/registries/{registry_id}/upstreams"),
                Some(json!({
                    "name": "remote",
                    "url": url,
                    "cache_validity_hours": validity_hours,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create upstream: {body}");
        body
    }

    /// Create an API token and return its secret.
    pub async fn create_token(&self, scopes: &[&str], group_id: Option<Uuid>) -> String {
        let (status, body) = self
            .admin(
                "POST",
                "/v1/admin/tokens",
                Some(json!({ "scopes": scopes, "group_id": group_id })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create token: {body}");
        body["token_secret"].as_str().unwrap().to_string()
    }

    /// GET an artifact through the registry endpoint.
    pub async fn pull(&self, registry_id: Uuid, path: &str, token: Option<&str>) -> Response {
        let mut builder = Request::builder()
            .method("GET")
            .uri(format!("/registry/{registry_id}/{path}"));
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    /// Builder of a signed internal upload request.
    pub fn upload_request(
        &self,
        registry_id: Uuid,
        upstream_gid: &str,
        path: &str,
    ) -> axum::http::request::Builder {
        Request::builder()
            .method("PUT")
            .uri(format!("/registry/{registry_id}/{path}"))
            .header(INTERNAL_REQUEST_HEADER, self.state.internal.sign().unwrap())
            .header("x-vreg-virtual-registry-upstream-global-id", upstream_gid)
    }
}

/// Read a response body to bytes.
#[allow(dead_code)]
pub async fn body_bytes(response: Response) -> bytes::Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}
