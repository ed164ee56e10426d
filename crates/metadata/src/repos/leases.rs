//! Exclusive lease repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Time-bounded exclusive leases keyed by string.
#[async_trait]
pub trait LeaseRepo: Send + Sync {
    /// Take `key` for `holder` until `expires_at` if it is free or its
    /// previous lease has expired. Returns whether the lease was taken.
    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Release `key` if `holder` still owns it. Returns whether a lease was removed.
    async fn release_lease(&self, key: &str, holder: &str) -> MetadataResult<bool>;
}
