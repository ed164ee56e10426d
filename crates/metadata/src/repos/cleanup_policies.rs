//! Cleanup policy repository.

use crate::error::MetadataResult;
use crate::models::{CleanupPolicyRow, CleanupRunRecord};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for per-group cleanup policies.
#[async_trait]
pub trait CleanupPolicyRepo: Send + Sync {
    /// Create or replace the group's policy configuration.
    ///
    /// Saving a policy that is not running resets it to `scheduled`, clears
    /// the failure message and stores the given `next_run_at`. Run
    /// statistics are preserved.
    async fn upsert_cleanup_policy(&self, policy: &CleanupPolicyRow)
    -> MetadataResult<CleanupPolicyRow>;

    /// Get the group's policy.
    async fn get_cleanup_policy(&self, group_id: Uuid) -> MetadataResult<Option<CleanupPolicyRow>>;

    /// Delete the group's policy.
    async fn delete_cleanup_policy(&self, group_id: Uuid) -> MetadataResult<()>;

    /// Enabled policies in `scheduled` state whose `next_run_at` has passed,
    /// oldest first.
    async fn next_runnable_schedule(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<CleanupPolicyRow>>;

    /// Atomically move the policy from `scheduled` to `running`.
    /// Returns false when another run holds it or it is not scheduled.
    async fn claim_cleanup_run(&self, group_id: Uuid, now: OffsetDateTime)
    -> MetadataResult<bool>;

    /// Move a `running` policy to `scheduled` (success) or `failed`, recording
    /// the run statistics.
    async fn finish_cleanup_run(
        &self,
        group_id: Uuid,
        record: &CleanupRunRecord,
    ) -> MetadataResult<()>;

    /// Mark every `running` policy `failed` with `message`. Used at startup
    /// to release runs orphaned by a previous process. Returns the groups.
    async fn fail_orphaned_cleanup_runs(
        &self,
        message: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<Uuid>>;
}
