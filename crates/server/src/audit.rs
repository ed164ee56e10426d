//! Audit events emitted by the proxy, the cleanup executor and the admin API.

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;
use vreg_metadata::MetadataStore;
use vreg_metadata::models::{AuditEventRow, CacheEntryRow};
use vreg_metadata::repos::AuditRepo;

pub const CACHE_ENTRIES_MARKED_FOR_DESTRUCTION: &str =
    "virtual_registry_cache_entries_marked_for_destruction";
pub const UPSTREAM_CREATED: &str = "virtual_registry_upstream_created";
pub const UPSTREAM_UPDATED: &str = "virtual_registry_upstream_updated";
pub const UPSTREAM_DELETED: &str = "virtual_registry_upstream_deleted";
pub const CLEANUP_POLICY_SAVED: &str = "virtual_registry_cleanup_policy_saved";
pub const CLEANUP_POLICY_DELETED: &str = "virtual_registry_cleanup_policy_deleted";

/// One marked entry as it appears in the audit payload.
#[derive(Debug, Serialize)]
pub struct MarkedEntry<'a> {
    pub entry_id: Uuid,
    pub relative_path: &'a str,
    pub size: i64,
}

impl<'a> From<&'a CacheEntryRow> for MarkedEntry<'a> {
    fn from(entry: &'a CacheEntryRow) -> Self {
        Self {
            entry_id: entry.entry_id,
            relative_path: &entry.relative_path,
            size: entry.size_bytes,
        }
    }
}

/// Build an audit row targeting an upstream or a group.
pub fn event(
    name: &str,
    group_id: Uuid,
    target_type: &str,
    target_id: Option<String>,
    details: Value,
) -> AuditEventRow {
    AuditEventRow {
        event_id: Uuid::new_v4(),
        event_name: name.to_string(),
        group_id: Some(group_id),
        target_type: target_type.to_string(),
        target_id,
        details: details.to_string(),
        created_at: OffsetDateTime::now_utc(),
    }
}

/// Audit row for one cleanup batch of one upstream.
pub fn entries_marked(
    group_id: Uuid,
    upstream_id: Uuid,
    registry_type: &str,
    entries: &[CacheEntryRow],
) -> AuditEventRow {
    let marked: Vec<MarkedEntry<'_>> = entries.iter().map(MarkedEntry::from).collect();
    event(
        CACHE_ENTRIES_MARKED_FOR_DESTRUCTION,
        group_id,
        "Upstream",
        Some(upstream_id.to_string()),
        serde_json::json!({
            "upstream_id": upstream_id,
            "registry_type": registry_type,
            "entries": marked,
        }),
    )
}

/// Record an event for an administrative action. Failures are logged, not
/// returned: the action already happened.
pub async fn record_admin_event(metadata: &dyn MetadataStore, row: AuditEventRow) {
    if let Err(e) = metadata.record_audit_event(&row).await {
        warn!(event = %row.event_name, error = %e, "failed to record audit event");
    }
}
