//! Audit event repository.

use crate::error::MetadataResult;
use crate::models::AuditEventRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for audit events.
#[async_trait]
pub trait AuditRepo: Send + Sync {
    /// Append an event.
    async fn record_audit_event(&self, event: &AuditEventRow) -> MetadataResult<()>;

    /// Most recent events for a group.
    async fn list_audit_events(
        &self,
        group_id: Uuid,
        limit: u32,
    ) -> MetadataResult<Vec<AuditEventRow>>;
}
