//! Virtual registry endpoints: artifact download (`show`) and the signed
//! internal upload that commits an artifact into the cache.

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, ApiResult};
use crate::ingest::{IngestError, cache_object_key, commit_cache_entry, store_stream};
use crate::internal::InternalAuthError;
use crate::metrics::{BYTES_UPLOADED, UPLOADS_COMMITTED};
use crate::ratelimit::SCOPE_REGISTRY_SHOW;
use crate::state::AppState;
use crate::upstream::DOCKER_CONTENT_DIGEST;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;
use vreg_core::{ArtifactPath, DEFAULT_CONTENT_TYPE, GlobalId, RegistryType};
use vreg_metadata::models::RegistryRow;
use vreg_metadata::repos::{NewCacheEntry, RegistryRepo, UpstreamRepo};

/// Request header naming the upstream an internal upload is committed to.
pub const UPSTREAM_GLOBAL_ID_HEADER: HeaderName =
    HeaderName::from_static("x-vreg-virtual-registry-upstream-global-id");

const DOCKER_DISTRIBUTION_API_VERSION: HeaderName =
    HeaderName::from_static("docker-distribution-api-version");

const CONTENT_SECURITY_POLICY: &str = "sandbox; default-src 'none'; require-trusted-types-for 'script'";

/// Adds the fixed security header bundle to every registry response.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    headers.insert(
        axum::http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// GET|HEAD /registry/{registry_id}/{*path} - Serve an artifact.
pub async fn show(
    State(state): State<AppState>,
    Path((registry_id, path)): Path<(Uuid, String)>,
    req: Request,
) -> Response {
    let user = req.extensions().get::<AuthenticatedUser>().cloned();
    let client_ip = state.rate_limit.client_ip(&req);
    let head_only = req.method() == Method::HEAD;

    match serve_artifact(&state, registry_id, &path, user.as_ref(), &client_ip, head_only).await {
        Ok(response) => response,
        Err(e) => show_error(e).into_response(),
    }
}

async fn serve_artifact(
    state: &AppState,
    registry_id: Uuid,
    path: &str,
    user: Option<&AuthenticatedUser>,
    client_ip: &str,
    head_only: bool,
) -> ApiResult<Response> {
    let registry = find_registry(state, registry_id).await?;

    match user {
        Some(user) => user.require_group_read(registry.group_id)?,
        None => {
            return Err(ApiError::Forbidden(
                "access to this registry denied".to_string(),
            ));
        }
    }

    if let Err(limited) = state.rate_limit.check(SCOPE_REGISTRY_SHOW, client_ip) {
        return Ok(limited.into_response());
    }

    let served = state.proxy.serve(&registry, path).await?;
    let registry_type = registry.registry_type()?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(served.content_type())
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(served.size()));
    if let Some(etag) = served.etag()
        && let Ok(value) = HeaderValue::from_str(etag)
    {
        headers.insert(ETAG, value);
    }
    if let Some(last_modified) = served.last_modified()
        && let Ok(value) = HeaderValue::from_str(last_modified)
    {
        headers.insert(LAST_MODIFIED, value);
    }
    if registry_type == RegistryType::Container {
        headers.insert(
            DOCKER_DISTRIBUTION_API_VERSION,
            HeaderValue::from_static("registry/2.0"),
        );
        if is_manifest_path(path)
            && let Some(digest) = served.etag().map(|etag| etag.trim_matches('"'))
            && let Ok(value) = HeaderValue::from_str(digest)
        {
            headers.insert(DOCKER_CONTENT_DIGEST, value);
        }
    }

    if head_only {
        return Ok((StatusCode::OK, headers).into_response());
    }

    let object_key = served.object_key().to_string();
    let stream = state
        .storage
        .get_stream(&object_key)
        .await?
        .map(move |chunk| {
            chunk.map_err(|e| {
                tracing::error!(object_key = %object_key, error = %e, "artifact streaming failed mid-transfer");
                std::io::Error::other(e.to_string())
            })
        });

    Ok((StatusCode::OK, headers, Body::from_stream(stream)).into_response())
}

fn is_manifest_path(path: &str) -> bool {
    path.split('/').any(|segment| segment == "manifests")
}

/// Failure statuses of `show`: 403, 404 and 503 pass through, server errors
/// stay 500, everything else is a 400.
fn show_error(err: ApiError) -> ApiError {
    match err.status_code() {
        StatusCode::UNAUTHORIZED => ApiError::Forbidden("access to this registry denied".to_string()),
        StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::BAD_REQUEST => err,
        status if status.is_server_error() => err,
        _ => ApiError::BadRequest(err.to_string()),
    }
}

async fn find_registry(state: &AppState, registry_id: Uuid) -> ApiResult<RegistryRow> {
    state
        .metadata
        .get_registry(registry_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("registry not found".to_string()))
}

/// Response of a committed upload.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub entry_id: String,
    pub relative_path: String,
    pub size: u64,
    pub sha256: String,
}

/// PUT|POST /registry/{registry_id}/{*path} - Commit an artifact streamed by
/// the front proxy into the cache of one upstream.
pub async fn upload(
    State(state): State<AppState>,
    Path((registry_id, path)): Path<(Uuid, String)>,
    req: Request,
) -> ApiResult<Json<UploadResponse>> {
    state.internal.verify(req.headers()).map_err(|e| match e {
        InternalAuthError::Disabled => ApiError::Forbidden(e.to_string()),
        _ => ApiError::Unauthorized(e.to_string()),
    })?;

    let upstream_gid = req
        .headers()
        .get(&UPSTREAM_GLOBAL_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing upstream global id".to_string()))?;
    let upstream_id = GlobalId::parse(upstream_gid)?.uuid_for("Upstream")?;

    let registry = find_registry(&state, registry_id).await?;
    let upstream = state
        .metadata
        .get_upstream(upstream_id)
        .await?
        .filter(|u| u.registry_id == registry.registry_id)
        .ok_or_else(|| ApiError::NotFound("upstream not found".to_string()))?;
    if upstream.is_local() {
        return Err(ApiError::BadRequest(
            "local upstreams do not hold cache entries".to_string(),
        ));
    }

    let artifact_path = ArtifactPath::parse(&path)?;
    let etag = req
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let last_modified = req
        .headers()
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();

    let limit = state.config.server.max_file_size;
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Err(ApiError::PayloadTooLarge { limit });
    }

    let registry_type = upstream.registry_type()?;
    let object_key = cache_object_key(registry_type, upstream.upstream_id);
    let stored = store_stream(
        state.storage.as_ref(),
        &object_key,
        req.into_body().into_data_stream(),
        limit,
        artifact_path.blob_sha256(),
    )
    .await
    .map_err(|e| match e {
        IngestError::TooLarge { limit } => ApiError::PayloadTooLarge { limit },
        IngestError::Storage(e) => ApiError::Storage(e),
        other => ApiError::BadRequest(other.to_string()),
    })?;

    let entry = NewCacheEntry {
        upstream_id: upstream.upstream_id,
        group_id: upstream.group_id,
        registry_type: registry_type.as_str().to_string(),
        relative_path: artifact_path.as_str().to_string(),
        object_key: stored.object_key.clone(),
        content_type,
        size_bytes: i64::try_from(stored.size).unwrap_or(i64::MAX),
        upstream_etag: etag,
        upstream_last_modified: last_modified,
        file_sha256: stored.sha256.clone(),
        downloaded_at: OffsetDateTime::now_utc(),
    };
    let committed =
        commit_cache_entry(state.metadata.as_ref(), state.storage.as_ref(), &entry).await?;

    UPLOADS_COMMITTED.inc();
    BYTES_UPLOADED.inc_by(stored.size);
    tracing::info!(
        registry_id = %registry.registry_id,
        upstream_id = %upstream.upstream_id,
        entry_id = %committed.entry_id,
        relative_path = %committed.relative_path,
        size = stored.size,
        "upload committed"
    );

    Ok(Json(UploadResponse {
        entry_id: committed.entry_id.to_string(),
        relative_path: committed.relative_path,
        size: stored.size,
        sha256: stored.sha256,
    }))
}
