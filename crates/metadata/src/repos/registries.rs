//! Registry repository.

use crate::error::MetadataResult;
use crate::models::RegistryRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for virtual registries.
#[async_trait]
pub trait RegistryRepo: Send + Sync {
    /// Create a registry. Names are unique per group and type.
    async fn create_registry(&self, registry: &RegistryRow) -> MetadataResult<()>;

    /// Find a registry by id.
    async fn get_registry(&self, registry_id: Uuid) -> MetadataResult<Option<RegistryRow>>;

    /// List registries, optionally for one group.
    async fn list_registries(&self, group_id: Option<Uuid>) -> MetadataResult<Vec<RegistryRow>>;

    /// Delete a registry and its upstreams. Live cache entries of those
    /// upstreams are marked pending destruction. Returns the number of
    /// entries marked.
    async fn delete_registry(&self, registry_id: Uuid) -> MetadataResult<u64>;
}
