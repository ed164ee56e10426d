//! Cache entry repository.

use crate::error::MetadataResult;
use crate::models::{CacheEntryRow, UpsertedEntry};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Attributes of a freshly stored artifact.
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub upstream_id: Uuid,
    pub group_id: Uuid,
    pub registry_type: String,
    pub relative_path: String,
    pub object_key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub upstream_etag: Option<String>,
    /// Upstream `Last-Modified`, replayed verbatim to clients.
    pub upstream_last_modified: Option<String>,
    pub file_sha256: String,
    pub downloaded_at: OffsetDateTime,
}

/// Repository for cached artifacts.
///
/// At most one live entry exists per (upstream, relative path). Reads never
/// take application-level locks.
#[async_trait]
pub trait CacheEntryRepo: Send + Sync {
    /// Insert a live entry. Fails with `Constraint` when a live entry for the
    /// same (upstream, path) already exists.
    async fn create_cache_entry(&self, entry: &NewCacheEntry) -> MetadataResult<CacheEntryRow>;

    /// Insert, or update the live entry for the same (upstream, path) in place.
    async fn upsert_cache_entry(&self, entry: &NewCacheEntry) -> MetadataResult<UpsertedEntry>;

    /// Live entry for (upstream, path).
    async fn find_live_entry(
        &self,
        upstream_id: Uuid,
        relative_path: &str,
    ) -> MetadataResult<Option<CacheEntryRow>>;

    /// Live entries for a path across the given upstreams.
    async fn find_live_entries_for_path(
        &self,
        upstream_ids: &[Uuid],
        relative_path: &str,
    ) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Get an entry by id regardless of status.
    async fn get_cache_entry(&self, entry_id: Uuid) -> MetadataResult<Option<CacheEntryRow>>;

    /// List entries of an upstream (admin inspection), newest first.
    async fn list_cache_entries(
        &self,
        upstream_id: Uuid,
        limit: u32,
    ) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Record a successful revalidation.
    async fn touch_upstream_checked(
        &self,
        entry_id: Uuid,
        checked_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Live entries of an upstream downloaded before `cutoff`, ordered by
    /// entry id and starting strictly after `after`. Pending entries are
    /// never returned, so a re-run finds nothing already marked.
    async fn find_eligible_for_cleanup(
        &self,
        upstream_id: Uuid,
        cutoff: OffsetDateTime,
        batch_size: u32,
        after: Option<Uuid>,
    ) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Mark entries pending destruction and return the rows actually marked.
    /// Entries already pending, or downloaded again at or after `cutoff`
    /// since they were selected, are skipped.
    async fn mark_pending_destruction(
        &self,
        entry_ids: &[Uuid],
        cutoff: OffsetDateTime,
    ) -> MetadataResult<Vec<CacheEntryRow>>;

    /// Count live entries of an upstream.
    async fn count_live_entries(&self, upstream_id: Uuid) -> MetadataResult<u64>;
}
