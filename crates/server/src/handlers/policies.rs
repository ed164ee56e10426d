//! Cleanup policy endpoints.

use crate::audit::{self, CLEANUP_POLICY_DELETED, CLEANUP_POLICY_SAVED};
use crate::cleanup::CleanupRunReport;
use crate::error::{ApiError, ApiResult};
use crate::handlers::admin::{ensure_group_access, format_ts, read_json, require_admin};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use vreg_core::policy::{CleanupMetrics, validate_keep_days};
use vreg_core::Cadence;
use vreg_metadata::models::{AuditEventRow, CleanupPolicyRow};
use vreg_metadata::repos::{AuditRepo, CleanupPolicyRepo};

fn default_enabled() -> bool {
    true
}

/// Body of `PUT .../cleanup_policy`.
#[derive(Debug, Deserialize)]
pub struct SaveCleanupPolicyRequest {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub keep_n_days_after_download: u32,
    /// Days between runs: 1, 7, 14, 30 or 90.
    pub cadence: u32,
    #[serde(default)]
    pub notify_on_success: bool,
    #[serde(default)]
    pub notify_on_failure: bool,
}

#[derive(Debug, Serialize)]
pub struct CleanupPolicyResponse {
    pub group_id: String,
    pub enabled: bool,
    pub keep_n_days_after_download: i64,
    pub cadence: i64,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub status: String,
    pub next_run_at: Option<String>,
    pub last_run_at: Option<String>,
    pub last_run_deleted_entries_count: i64,
    pub last_run_deleted_size: i64,
    pub last_run_detailed_metrics: Option<CleanupMetrics>,
    pub failure_message: Option<String>,
}

impl TryFrom<CleanupPolicyRow> for CleanupPolicyResponse {
    type Error = ApiError;

    fn try_from(row: CleanupPolicyRow) -> ApiResult<Self> {
        let last_run_detailed_metrics = row.detailed_metrics()?;
        Ok(Self {
            group_id: row.group_id.to_string(),
            enabled: row.enabled,
            keep_n_days_after_download: row.keep_n_days_after_download,
            cadence: row.cadence,
            notify_on_success: row.notify_on_success,
            notify_on_failure: row.notify_on_failure,
            status: row.status,
            next_run_at: row.next_run_at.map(|t| format_ts(t, "next_run_at")).transpose()?,
            last_run_at: row.last_run_at.map(|t| format_ts(t, "last_run_at")).transpose()?,
            last_run_deleted_entries_count: row.last_run_deleted_entries_count,
            last_run_deleted_size: row.last_run_deleted_size,
            last_run_detailed_metrics,
            failure_message: row.failure_message,
        })
    }
}

/// PUT /v1/admin/groups/{group_id}/cleanup_policy - Create or update the
/// group's policy. Saving reschedules it one cadence from now and clears a
/// previous failure.
pub async fn save_cleanup_policy(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<CleanupPolicyResponse>> {
    let auth = require_admin(&req)?;
    ensure_group_access(&auth, group_id)?;
    let body: SaveCleanupPolicyRequest = read_json(req).await?;

    let keep_days = validate_keep_days(body.keep_n_days_after_download)?;
    let cadence = Cadence::from_days(body.cadence)?;

    let now = OffsetDateTime::now_utc();
    let created_at = state
        .metadata
        .get_cleanup_policy(group_id)
        .await?
        .map_or(now, |existing| existing.created_at);

    let row = CleanupPolicyRow {
        group_id,
        enabled: body.enabled,
        keep_n_days_after_download: i64::from(keep_days),
        cadence: i64::from(cadence.days()),
        notify_on_success: body.notify_on_success,
        notify_on_failure: body.notify_on_failure,
        status: "scheduled".to_string(),
        next_run_at: Some(cadence.next_run_after(now)),
        last_run_at: None,
        last_run_deleted_entries_count: 0,
        last_run_deleted_size: 0,
        last_run_detailed_metrics: None,
        failure_message: None,
        created_at,
        updated_at: now,
    };
    let saved = state.metadata.upsert_cleanup_policy(&row).await?;

    audit::record_admin_event(
        state.metadata.as_ref(),
        audit::event(
            CLEANUP_POLICY_SAVED,
            group_id,
            "Group",
            Some(group_id.to_string()),
            serde_json::json!({
                "enabled": saved.enabled,
                "keep_n_days_after_download": saved.keep_n_days_after_download,
                "cadence": saved.cadence,
            }),
        ),
    )
    .await;
    tracing::info!(
        group_id = %group_id,
        keep_days,
        cadence_days = cadence.days(),
        "cleanup policy saved"
    );

    Ok(Json(saved.try_into()?))
}

/// GET /v1/admin/groups/{group_id}/cleanup_policy - Get the group's policy.
pub async fn get_cleanup_policy(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<CleanupPolicyResponse>> {
    let auth = require_admin(&req)?;
    ensure_group_access(&auth, group_id)?;

    let policy = state
        .metadata
        .get_cleanup_policy(group_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("cleanup policy not found".to_string()))?;
    Ok(Json(policy.try_into()?))
}

/// DELETE /v1/admin/groups/{group_id}/cleanup_policy - Remove the policy.
pub async fn delete_cleanup_policy(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    req: Request,
) -> ApiResult<StatusCode> {
    let auth = require_admin(&req)?;
    ensure_group_access(&auth, group_id)?;

    state.metadata.delete_cleanup_policy(group_id).await?;
    audit::record_admin_event(
        state.metadata.as_ref(),
        audit::event(
            CLEANUP_POLICY_DELETED,
            group_id,
            "Group",
            Some(group_id.to_string()),
            serde_json::json!({}),
        ),
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/admin/groups/{group_id}/cleanup_policy/run - Run the policy now.
///
/// Fails with 409 while a run for the group is in progress.
pub async fn run_cleanup_policy(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    req: Request,
) -> ApiResult<Json<CleanupRunReport>> {
    let auth = require_admin(&req)?;
    ensure_group_access(&auth, group_id)?;

    let report = state
        .cleanup
        .run_policy(group_id, OffsetDateTime::now_utc())
        .await?;
    Ok(Json(report))
}

const DEFAULT_AUDIT_LIMIT: u32 = 50;
const MAX_AUDIT_LIMIT: u32 = 500;

#[derive(Debug, Deserialize)]
pub struct ListAuditEventsQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct AuditEventResponse {
    pub event_id: String,
    pub event_name: String,
    pub target_type: String,
    pub target_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: String,
}

impl TryFrom<AuditEventRow> for AuditEventResponse {
    type Error = ApiError;

    fn try_from(row: AuditEventRow) -> ApiResult<Self> {
        let details = serde_json::from_str(&row.details)
            .map_err(|e| ApiError::Internal(format!("corrupt audit details: {e}")))?;
        Ok(Self {
            event_id: row.event_id.to_string(),
            event_name: row.event_name,
            target_type: row.target_type,
            target_id: row.target_id,
            details,
            created_at: format_ts(row.created_at, "created_at")?,
        })
    }
}

/// GET /v1/admin/groups/{group_id}/audit_events - Most recent events first.
pub async fn list_audit_events(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
    Query(query): Query<ListAuditEventsQuery>,
    req: Request,
) -> ApiResult<Json<Vec<AuditEventResponse>>> {
    let auth = require_admin(&req)?;
    ensure_group_access(&auth, group_id)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .clamp(1, MAX_AUDIT_LIMIT);

    let events = state.metadata.list_audit_events(group_id, limit).await?;
    let response = events
        .into_iter()
        .map(AuditEventResponse::try_from)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(response))
}
