//! Upstream repository.

use crate::error::MetadataResult;
use crate::models::UpstreamRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Mutable upstream attributes. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UpstreamUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    /// `Some(None)` clears stored credentials.
    pub credentials: Option<Option<(String, String)>>,
    pub cache_validity_hours: Option<i64>,
}

/// Repository for upstreams of a registry.
#[async_trait]
pub trait UpstreamRepo: Send + Sync {
    /// Append an upstream at the next position of its registry.
    ///
    /// The stored position is assigned here. Fails with `Constraint` once the
    /// registry holds `max_per_registry` upstreams.
    async fn create_upstream(
        &self,
        upstream: &UpstreamRow,
        max_per_registry: usize,
    ) -> MetadataResult<UpstreamRow>;

    /// Find an upstream by id.
    async fn get_upstream(&self, upstream_id: Uuid) -> MetadataResult<Option<UpstreamRow>>;

    /// Upstreams of a registry ordered by position.
    async fn list_upstreams(&self, registry_id: Uuid) -> MetadataResult<Vec<UpstreamRow>>;

    /// Every upstream owned by a group for one registry type, in a stable order.
    async fn list_group_upstreams(
        &self,
        group_id: Uuid,
        registry_type: &str,
    ) -> MetadataResult<Vec<UpstreamRow>>;

    /// Apply an update and return the new row.
    async fn update_upstream(
        &self,
        upstream_id: Uuid,
        update: &UpstreamUpdate,
    ) -> MetadataResult<UpstreamRow>;

    /// Move an upstream to `position` (1-based, clamped), shifting the others.
    async fn move_upstream(&self, upstream_id: Uuid, position: i64) -> MetadataResult<()>;

    /// Delete an upstream, mark its live cache entries pending destruction and
    /// close the gap in positions. Returns (entries marked, bytes marked).
    async fn delete_upstream(&self, upstream_id: Uuid) -> MetadataResult<(u64, u64)>;
}
