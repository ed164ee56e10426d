//! Administrative endpoints.

use crate::audit::{self, UPSTREAM_CREATED, UPSTREAM_DELETED, UPSTREAM_UPDATED};
use crate::auth::{AuthenticatedUser, hash_token, require_auth};
use crate::error::{ApiError, ApiResult};
use crate::ingest::{IngestError, package_object_key, store_stream};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;
use vreg_core::token::{CreateTokenRequest, CreateTokenResponse, TokenScope};
use vreg_core::{
    ArtifactPath, Credentials, DEFAULT_CONTENT_TYPE, GlobalId, MAX_UPSTREAMS_PER_REGISTRY,
    RegistryType,
};
use vreg_metadata::models::{
    CacheEntryRow, PackageFileRow, RegistryRow, TokenRow, UpstreamRow,
};
use vreg_metadata::repos::{
    CacheEntryRepo, PackageFileRepo, RegistryRepo, TokenRepo, UpstreamRepo, UpstreamUpdate,
};

/// Maximum request body size for JSON admin requests (1 MiB).
const MAX_ADMIN_BODY_SIZE: usize = 1024 * 1024;

/// Default and maximum page size of cache entry listings.
const DEFAULT_ENTRY_LIMIT: u32 = 100;
const MAX_ENTRY_LIMIT: u32 = 1000;

const MAX_NAME_LEN: usize = 255;

/// Require a token with `registry:admin`.
pub(crate) fn require_admin(req: &Request) -> ApiResult<AuthenticatedUser> {
    let auth = require_auth(req)?.clone();
    auth.require_scope(TokenScope::RegistryAdmin)?;
    Ok(auth)
}

/// Group-restricted admin tokens only manage their own group.
pub(crate) fn ensure_group_access(auth: &AuthenticatedUser, group_id: Uuid) -> ApiResult<()> {
    match auth.token.group_id {
        Some(own) if own != group_id => Err(ApiError::Forbidden(
            "token is restricted to another group".to_string(),
        )),
        _ => Ok(()),
    }
}

pub(crate) async fn read_json<T: DeserializeOwned>(req: Request) -> ApiResult<T> {
    let bytes = axum::body::to_bytes(req.into_body(), MAX_ADMIN_BODY_SIZE)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}

pub(crate) fn format_ts(ts: OffsetDateTime, field: &str) -> ApiResult<String> {
    ts.format(&Rfc3339)
        .map_err(|e| ApiError::Internal(format!("failed to format {field}: {e}")))
}

fn validate_name(name: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "name must be 1..={MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

// =============================================================================
// Health
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /v1/health - Health check.
///
/// Unauthenticated so load balancers and orchestrator probes can reach it.
/// Returns only status and version.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;
    state.storage.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

// =============================================================================
// Tokens
// =============================================================================

/// Token listing response.
#[derive(Debug, Serialize)]
pub struct TokenInfo {
    pub token_id: String,
    pub group_id: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: Option<String>,
    pub revoked_at: Option<String>,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub description: Option<String>,
}

impl TryFrom<TokenRow> for TokenInfo {
    type Error = ApiError;

    fn try_from(token: TokenRow) -> ApiResult<Self> {
        let scopes: Vec<String> = serde_json::from_str(&token.scopes)
            .map_err(|e| ApiError::Internal(format!("invalid token scopes: {e}")))?;
        Ok(Self {
            token_id: token.token_id.to_string(),
            group_id: token.group_id.map(|id| id.to_string()),
            scopes,
            expires_at: token.expires_at.map(|t| format_ts(t, "expires_at")).transpose()?,
            revoked_at: token.revoked_at.map(|t| format_ts(t, "revoked_at")).transpose()?,
            created_at: format_ts(token.created_at, "created_at")?,
            last_used_at: token
                .last_used_at
                .map(|t| format_ts(t, "last_used_at"))
                .transpose()?,
            description: token.description,
        })
    }
}

/// POST /v1/admin/tokens - Create a new token.
pub async fn create_token(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<CreateTokenResponse>)> {
    let auth = require_admin(&req)?;
    let body: CreateTokenRequest = read_json(req).await?;

    if body.scopes.is_empty() {
        return Err(ApiError::BadRequest("at least one scope is required".to_string()));
    }
    for scope in &body.scopes {
        TokenScope::parse(scope)
            .map_err(|_| ApiError::BadRequest(format!("invalid scope: {scope}")))?;
    }

    // A group-restricted admin can only mint tokens for its own group.
    let group_id = match auth.token.group_id {
        Some(own) => {
            if body.group_id.is_some_and(|g| g != own) {
                return Err(ApiError::Forbidden(
                    "token is restricted to another group".to_string(),
                ));
            }
            Some(own)
        }
        None => body.group_id,
    };

    let now = OffsetDateTime::now_utc();
    let expires_at = match body.expires_in {
        Some(secs) => {
            let secs: i64 = secs.try_into().map_err(|_| {
                ApiError::BadRequest(format!("expires_in too large: {secs}"))
            })?;
            Some(now + time::Duration::seconds(secs))
        }
        None => None,
    };

    let token_secret = generate_token_secret();
    let token_row = TokenRow {
        token_id: Uuid::new_v4(),
        group_id,
        token_hash: hash_token(&token_secret),
        scopes: serde_json::to_string(&body.scopes)
            .map_err(|e| ApiError::Internal(format!("failed to serialize scopes: {e}")))?,
        expires_at,
        revoked_at: None,
        created_at: now,
        last_used_at: None,
        description: body.description,
    };
    state.metadata.create_token(&token_row).await?;
    tracing::info!(token_id = %token_row.token_id, "token created");

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            token_id: token_row.token_id.to_string(),
            token_secret,
            expires_at: expires_at.map(|t| format_ts(t, "expires_at")).transpose()?,
        }),
    ))
}

/// GET /v1/admin/tokens - List tokens.
pub async fn list_tokens(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<Vec<TokenInfo>>> {
    let auth = require_admin(&req)?;
    let tokens = state.metadata.list_tokens(auth.token.group_id).await?;
    let infos = tokens
        .into_iter()
        .map(TokenInfo::try_from)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(infos))
}

/// DELETE /v1/admin/tokens/{token_id} - Revoke a token.
pub async fn revoke_token(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
    req: Request,
) -> ApiResult<StatusCode> {
    let auth = require_admin(&req)?;

    let token_id = Uuid::parse_str(&token_id)
        .map_err(|e| ApiError::BadRequest(format!("invalid token ID: {e}")))?;
    let token = state
        .metadata
        .get_token(token_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("token not found".to_string()))?;

    // Unrestricted admins revoke anything; restricted ones only their group.
    if auth.token.group_id.is_some() && token.group_id != auth.token.group_id {
        return Err(ApiError::Forbidden(
            "cannot revoke a token of another group".to_string(),
        ));
    }

    state
        .metadata
        .revoke_token(token_id, OffsetDateTime::now_utc())
        .await?;
    tracing::info!(token_id = %token_id, "token revoked");

    Ok(StatusCode::NO_CONTENT)
}

/// Random token secret from a CSPRNG.
fn generate_token_secret() -> String {
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

// =============================================================================
// Registries
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateRegistryRequest {
    pub group_id: Uuid,
    pub name: String,
    pub registry_type: String,
}

#[derive(Debug, Deserialize)]
pub struct ListRegistriesQuery {
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct RegistryResponse {
    pub registry_id: String,
    pub group_id: String,
    pub name: String,
    pub registry_type: String,
    pub created_at: String,
}

impl TryFrom<RegistryRow> for RegistryResponse {
    type Error = ApiError;

    fn try_from(row: RegistryRow) -> ApiResult<Self> {
        Ok(Self {
            registry_id: row.registry_id.to_string(),
            group_id: row.group_id.to_string(),
            name: row.name,
            registry_type: row.registry_type,
            created_at: format_ts(row.created_at, "created_at")?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub entries_marked: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_marked: Option<u64>,
}

/// Load a registry the caller may administer.
async fn admin_registry(
    state: &AppState,
    auth: &AuthenticatedUser,
    registry_id: Uuid,
) -> ApiResult<RegistryRow> {
    let registry = state
        .metadata
        .get_registry(registry_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("registry not found".to_string()))?;
    ensure_group_access(auth, registry.group_id)?;
    Ok(registry)
}

/// POST /v1/admin/registries - Create a registry.
pub async fn create_registry(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<RegistryResponse>)> {
    let auth = require_admin(&req)?;
    let body: CreateRegistryRequest = read_json(req).await?;
    ensure_group_access(&auth, body.group_id)?;

    let registry_type = RegistryType::parse(&body.registry_type)?;
    let now = OffsetDateTime::now_utc();
    let row = RegistryRow {
        registry_id: Uuid::new_v4(),
        group_id: body.group_id,
        name: validate_name(&body.name)?,
        registry_type: registry_type.as_str().to_string(),
        created_at: now,
        updated_at: now,
    };
    state.metadata.create_registry(&row).await?;
    tracing::info!(
        registry_id = %row.registry_id,
        group_id = %row.group_id,
        registry_type = %registry_type,
        "registry created"
    );

    Ok((StatusCode::CREATED, Json(row.try_into()?)))
}

/// GET /v1/admin/registries - List registries.
pub async fn list_registries(
    State(state): State<AppState>,
    Query(query): Query<ListRegistriesQuery>,
    req: Request,
) -> ApiResult<Json<Vec<RegistryResponse>>> {
    let auth = require_admin(&req)?;
    let group_id = match (auth.token.group_id, query.group_id) {
        (Some(own), Some(requested)) if own != requested => {
            return Err(ApiError::Forbidden(
                "token is restricted to another group".to_string(),
            ));
        }
        (Some(own), _) => Some(own),
        (None, requested) => requested,
    };

    let registries = state.metadata.list_registries(group_id).await?;
    let response = registries
        .into_iter()
        .map(RegistryResponse::try_from)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(response))
}

/// GET /v1/admin/registries/{registry_id} - Get a registry.
pub async fn get_registry(
    State(state): State<AppState>,
    Path(registry_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<RegistryResponse>> {
    let auth = require_admin(&req)?;
    let registry = admin_registry(&state, &auth, registry_id).await?;
    Ok(Json(registry.try_into()?))
}

/// DELETE /v1/admin/registries/{registry_id} - Delete a registry and its
/// upstreams. Their cache entries are marked pending destruction.
pub async fn delete_registry(
    State(state): State<AppState>,
    Path(registry_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<DeletedResponse>> {
    let auth = require_admin(&req)?;
    let registry = admin_registry(&state, &auth, registry_id).await?;

    let upstreams = state.metadata.list_upstreams(registry_id).await?;
    let entries_marked = state.metadata.delete_registry(registry_id).await?;
    for upstream in &upstreams {
        audit::record_admin_event(
            state.metadata.as_ref(),
            audit::event(
                UPSTREAM_DELETED,
                registry.group_id,
                "Upstream",
                Some(upstream.upstream_id.to_string()),
                serde_json::json!({
                    "registry_id": registry_id,
                    "reason": "registry deleted",
                }),
            ),
        )
        .await;
    }
    tracing::info!(registry_id = %registry_id, entries_marked, "registry deleted");

    Ok(Json(DeletedResponse {
        entries_marked,
        bytes_marked: None,
    }))
}

// =============================================================================
// Upstreams
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateUpstreamRequest {
    pub name: String,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub project_gid: Option<String>,
    pub cache_validity_hours: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUpstreamRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub clear_credentials: bool,
    pub cache_validity_hours: Option<i64>,
    pub position: Option<i64>,
}

/// Upstream as returned by the API. Credentials are never included.
#[derive(Debug, Serialize)]
pub struct UpstreamResponse {
    pub upstream_id: String,
    pub global_id: String,
    pub registry_id: String,
    pub name: String,
    pub position: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_gid: Option<String>,
    pub has_credentials: bool,
    pub cache_validity_hours: i64,
    pub created_at: String,
}

impl TryFrom<UpstreamRow> for UpstreamResponse {
    type Error = ApiError;

    fn try_from(row: UpstreamRow) -> ApiResult<Self> {
        Ok(Self {
            upstream_id: row.upstream_id.to_string(),
            global_id: row.global_id().to_string(),
            registry_id: row.registry_id.to_string(),
            name: row.name,
            position: row.position,
            has_credentials: row.username.is_some() && row.password.is_some(),
            url: row.url,
            project_gid: row.project_gid,
            cache_validity_hours: row.cache_validity_hours,
            created_at: format_ts(row.created_at, "created_at")?,
        })
    }
}

fn validate_validity_hours(hours: i64) -> ApiResult<i64> {
    if hours < 0 {
        return Err(ApiError::BadRequest(
            "cache_validity_hours must not be negative".to_string(),
        ));
    }
    Ok(hours)
}

fn credentials_pair(
    username: Option<String>,
    password: Option<String>,
) -> ApiResult<Option<(String, String)>> {
    match (username, password) {
        (None, None) => Ok(None),
        (username, password) => Credentials::from_parts(username, password)
            .map(|c| Some((c.username, c.password)))
            .ok_or_else(|| {
                ApiError::BadRequest("username and password must be given together".to_string())
            }),
    }
}

/// Load an upstream the caller may administer.
async fn admin_upstream(
    state: &AppState,
    auth: &AuthenticatedUser,
    upstream_id: Uuid,
) -> ApiResult<UpstreamRow> {
    let upstream = state
        .metadata
        .get_upstream(upstream_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("upstream not found".to_string()))?;
    ensure_group_access(auth, upstream.group_id)?;
    Ok(upstream)
}

/// POST /v1/admin/registries/{registry_id}/upstreams - Append an upstream.
pub async fn create_upstream(
    State(state): State<AppState>,
    Path(registry_id): Path<Uuid>,
    req: Request,
) -> ApiResult<(StatusCode, Json<UpstreamResponse>)> {
    let auth = require_admin(&req)?;
    let body: CreateUpstreamRequest = read_json(req).await?;
    let registry = admin_registry(&state, &auth, registry_id).await?;
    let registry_type = registry.registry_type()?;

    let (url, project_gid, credentials) = match (body.url, body.project_gid) {
        (Some(url), None) => {
            let checked = state.upstream.check_url(&url).await?;
            let url = checked.as_str().trim_end_matches('/').to_string();
            (Some(url), None, credentials_pair(body.username, body.password)?)
        }
        (None, Some(gid)) => {
            if !registry_type.supports_local_upstreams() {
                return Err(ApiError::BadRequest(format!(
                    "{registry_type} registries do not support local upstreams"
                )));
            }
            if body.username.is_some() || body.password.is_some() {
                return Err(ApiError::BadRequest(
                    "local upstreams take no credentials".to_string(),
                ));
            }
            let gid = GlobalId::parse(&gid)?;
            if gid.model() != "Project" {
                return Err(ApiError::BadRequest(format!(
                    "project_gid must reference a Project, got {}",
                    gid.model()
                )));
            }
            (None, Some(gid.to_string()), None)
        }
        _ => {
            return Err(ApiError::BadRequest(
                "exactly one of url and project_gid is required".to_string(),
            ));
        }
    };

    let cache_validity_hours = validate_validity_hours(
        body.cache_validity_hours
            .unwrap_or(i64::from(state.config.cache.default_cache_validity_hours)),
    )?;

    let now = OffsetDateTime::now_utc();
    let (username, password) = credentials.unzip();
    let row = UpstreamRow {
        upstream_id: Uuid::new_v4(),
        registry_id,
        group_id: registry.group_id,
        registry_type: registry.registry_type.clone(),
        name: validate_name(&body.name)?,
        position: 0,
        url,
        project_gid,
        username,
        password,
        cache_validity_hours,
        created_at: now,
        updated_at: now,
    };
    let created = state
        .metadata
        .create_upstream(&row, MAX_UPSTREAMS_PER_REGISTRY)
        .await?;

    audit::record_admin_event(
        state.metadata.as_ref(),
        audit::event(
            UPSTREAM_CREATED,
            registry.group_id,
            "Upstream",
            Some(created.upstream_id.to_string()),
            serde_json::json!({
                "registry_id": registry_id,
                "position": created.position,
                "local": created.is_local(),
            }),
        ),
    )
    .await;
    tracing::info!(
        registry_id = %registry_id,
        upstream_id = %created.upstream_id,
        position = created.position,
        "upstream created"
    );

    Ok((StatusCode::CREATED, Json(created.try_into()?)))
}

/// GET /v1/admin/registries/{registry_id}/upstreams - Upstreams in order.
pub async fn list_upstreams(
    State(state): State<AppState>,
    Path(registry_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<Vec<UpstreamResponse>>> {
    let auth = require_admin(&req)?;
    admin_registry(&state, &auth, registry_id).await?;

    let upstreams = state.metadata.list_upstreams(registry_id).await?;
    let response = upstreams
        .into_iter()
        .map(UpstreamResponse::try_from)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(response))
}

/// PATCH /v1/admin/upstreams/{upstream_id} - Update an upstream.
pub async fn update_upstream(
    State(state): State<AppState>,
    Path(upstream_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<UpstreamResponse>> {
    let auth = require_admin(&req)?;
    let body: UpdateUpstreamRequest = read_json(req).await?;
    let upstream = admin_upstream(&state, &auth, upstream_id).await?;

    let mut changed: Vec<&str> = Vec::new();
    let mut update = UpstreamUpdate::default();

    if let Some(name) = &body.name {
        update.name = Some(validate_name(name)?);
        changed.push("name");
    }
    if let Some(url) = &body.url {
        if upstream.is_local() {
            return Err(ApiError::BadRequest(
                "local upstreams have no url".to_string(),
            ));
        }
        let checked = state.upstream.check_url(url).await?;
        update.url = Some(checked.as_str().trim_end_matches('/').to_string());
        changed.push("url");
    }
    if body.clear_credentials {
        update.credentials = Some(None);
        changed.push("credentials");
    } else if let Some(pair) = credentials_pair(body.username, body.password)? {
        if upstream.is_local() {
            return Err(ApiError::BadRequest(
                "local upstreams take no credentials".to_string(),
            ));
        }
        update.credentials = Some(Some(pair));
        changed.push("credentials");
    }
    if let Some(hours) = body.cache_validity_hours {
        update.cache_validity_hours = Some(validate_validity_hours(hours)?);
        changed.push("cache_validity_hours");
    }

    if body.position.is_some_and(|p| p < 1) {
        return Err(ApiError::BadRequest("position starts at 1".to_string()));
    }

    state.metadata.update_upstream(upstream_id, &update).await?;
    if let Some(position) = body.position {
        state.metadata.move_upstream(upstream_id, position).await?;
        changed.push("position");
    }

    let updated = state
        .metadata
        .get_upstream(upstream_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("upstream not found".to_string()))?;

    if !changed.is_empty() {
        audit::record_admin_event(
            state.metadata.as_ref(),
            audit::event(
                UPSTREAM_UPDATED,
                upstream.group_id,
                "Upstream",
                Some(upstream_id.to_string()),
                serde_json::json!({ "fields": changed }),
            ),
        )
        .await;
    }

    Ok(Json(updated.try_into()?))
}

/// DELETE /v1/admin/upstreams/{upstream_id} - Remove an upstream. Its live
/// cache entries are marked pending destruction in the same transaction.
pub async fn delete_upstream(
    State(state): State<AppState>,
    Path(upstream_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<DeletedResponse>> {
    let auth = require_admin(&req)?;
    let upstream = admin_upstream(&state, &auth, upstream_id).await?;

    let (entries_marked, bytes_marked) = state.metadata.delete_upstream(upstream_id).await?;
    audit::record_admin_event(
        state.metadata.as_ref(),
        audit::event(
            UPSTREAM_DELETED,
            upstream.group_id,
            "Upstream",
            Some(upstream_id.to_string()),
            serde_json::json!({
                "registry_id": upstream.registry_id,
                "entries_marked": entries_marked,
                "bytes_marked": bytes_marked,
            }),
        ),
    )
    .await;
    tracing::info!(upstream_id = %upstream_id, entries_marked, "upstream deleted");

    Ok(Json(DeletedResponse {
        entries_marked,
        bytes_marked: Some(bytes_marked),
    }))
}

// =============================================================================
// Cache entries
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListEntriesQuery {
    pub upstream_id: Option<Uuid>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CacheEntryResponse {
    pub entry_id: String,
    pub upstream_id: String,
    pub relative_path: String,
    pub size: i64,
    pub content_type: String,
    pub upstream_etag: Option<String>,
    pub sha256: String,
    pub status: String,
    pub downloaded_at: String,
    pub upstream_checked_at: String,
}

impl TryFrom<CacheEntryRow> for CacheEntryResponse {
    type Error = ApiError;

    fn try_from(row: CacheEntryRow) -> ApiResult<Self> {
        Ok(Self {
            entry_id: row.entry_id.to_string(),
            upstream_id: row.upstream_id.to_string(),
            relative_path: row.relative_path,
            size: row.size_bytes,
            content_type: row.content_type,
            upstream_etag: row.upstream_etag,
            sha256: row.file_sha256,
            status: row.status,
            downloaded_at: format_ts(row.downloaded_at, "downloaded_at")?,
            upstream_checked_at: format_ts(row.upstream_checked_at, "upstream_checked_at")?,
        })
    }
}

/// GET /v1/admin/registries/{registry_id}/cache_entries - Inspect cached
/// artifacts, newest first per upstream.
pub async fn list_cache_entries(
    State(state): State<AppState>,
    Path(registry_id): Path<Uuid>,
    Query(query): Query<ListEntriesQuery>,
    req: Request,
) -> ApiResult<Json<Vec<CacheEntryResponse>>> {
    let auth = require_admin(&req)?;
    admin_registry(&state, &auth, registry_id).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ENTRY_LIMIT)
        .clamp(1, MAX_ENTRY_LIMIT);

    let upstreams = state.metadata.list_upstreams(registry_id).await?;
    let upstream_ids: Vec<Uuid> = match query.upstream_id {
        Some(id) if upstreams.iter().any(|u| u.upstream_id == id) => vec![id],
        Some(_) => return Err(ApiError::NotFound("upstream not found".to_string())),
        None => upstreams
            .iter()
            .filter(|u| !u.is_local())
            .map(|u| u.upstream_id)
            .collect(),
    };

    let mut entries = Vec::new();
    for upstream_id in upstream_ids {
        let remaining = limit.saturating_sub(u32::try_from(entries.len()).unwrap_or(u32::MAX));
        if remaining == 0 {
            break;
        }
        entries.extend(state.metadata.list_cache_entries(upstream_id, remaining).await?);
    }

    let response = entries
        .into_iter()
        .map(CacheEntryResponse::try_from)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(response))
}

// =============================================================================
// Project package files
// =============================================================================

#[derive(Debug, Serialize)]
pub struct PackageFileResponse {
    pub package_file_id: String,
    pub project_gid: String,
    pub relative_path: String,
    pub size: u64,
    pub sha256: String,
}

fn validate_project_id(project_id: &str) -> ApiResult<()> {
    let valid = !project_id.is_empty()
        && project_id.len() <= 64
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("invalid project id: {project_id}")))
    }
}

/// POST /v1/admin/projects/{project_id}/package_files/{*path} - Publish a
/// file into a project's package storage. The request body is the file.
pub async fn publish_package_file(
    State(state): State<AppState>,
    Path((project_id, path)): Path<(String, String)>,
    req: Request,
) -> ApiResult<(StatusCode, Json<PackageFileResponse>)> {
    let auth = require_admin(&req)?;
    if auth.token.group_id.is_some() {
        return Err(ApiError::Forbidden(
            "publishing package files requires an unrestricted admin token".to_string(),
        ));
    }
    validate_project_id(&project_id)?;
    let artifact_path = ArtifactPath::parse(&path)?;
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();

    let limit = state.config.server.max_file_size;
    let object_key = package_object_key(&project_id);
    let stored = store_stream(
        state.storage.as_ref(),
        &object_key,
        req.into_body().into_data_stream(),
        limit,
        None,
    )
    .await
    .map_err(|e| match e {
        IngestError::TooLarge { limit } => ApiError::PayloadTooLarge { limit },
        IngestError::Storage(e) => ApiError::Storage(e),
        other => ApiError::BadRequest(other.to_string()),
    })?;

    let row = PackageFileRow {
        package_file_id: Uuid::new_v4(),
        project_gid: GlobalId::project(project_id.as_str()).to_string(),
        relative_path: artifact_path.as_str().to_string(),
        object_key: stored.object_key.clone(),
        content_type,
        size_bytes: i64::try_from(stored.size).unwrap_or(i64::MAX),
        file_sha256: stored.sha256.clone(),
        created_at: OffsetDateTime::now_utc(),
    };

    let replaced = match state.metadata.upsert_package_file(&row).await {
        Ok(replaced) => replaced,
        Err(e) => {
            if let Err(cleanup) = state.storage.delete(&stored.object_key).await {
                tracing::warn!(object_key = %stored.object_key, error = %cleanup, "failed to remove orphaned object");
            }
            return Err(e.into());
        }
    };
    if let Some(old_key) = replaced
        && let Err(e) = state.storage.delete(&old_key).await
        && !e.is_not_found()
    {
        tracing::warn!(object_key = %old_key, error = %e, "failed to remove replaced package file");
    }

    tracing::info!(
        project_gid = %row.project_gid,
        relative_path = %row.relative_path,
        size = stored.size,
        "package file published"
    );

    Ok((
        StatusCode::CREATED,
        Json(PackageFileResponse {
            package_file_id: row.package_file_id.to_string(),
            project_gid: row.project_gid,
            relative_path: row.relative_path,
            size: stored.size,
            sha256: stored.sha256,
        }),
    ))
}
