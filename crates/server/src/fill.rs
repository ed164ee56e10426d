//! Download-on-miss with one upstream fetch per (upstream, path).
//!
//! A filler takes the lease for its key before contacting the upstream.
//! Concurrent requesters for the same key wait on the lease and, once they
//! hold it, find the entry the first filler committed instead of fetching
//! again. A failed fill commits nothing: the object is discarded and the
//! next requester starts over.

use crate::ingest::{IngestError, cache_object_key, commit_cache_entry, store_stream};
use crate::locks::{LockError, LockManager};
use crate::metrics;
use crate::upstream::{ArtifactFetcher, UpstreamError};
use axum::http::header::LAST_MODIFIED;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vreg_core::config::{LockConfig, ServerConfig};
use vreg_core::{ArtifactPath, DEFAULT_CONTENT_TYPE};
use vreg_metadata::models::{CacheEntryRow, UpstreamRow};
use vreg_metadata::repos::{CacheEntryRepo, NewCacheEntry};
use vreg_metadata::{MetadataError, MetadataStore};
use vreg_storage::{ObjectStore, StorageError};

/// Cache fill failures.
#[derive(Debug, thiserror::Error)]
pub enum FillError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("artifact exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("digest mismatch: expected sha256:{expected}, got sha256:{actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl From<IngestError> for FillError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::TooLarge { limit } => Self::TooLarge { limit },
            IngestError::DigestMismatch { expected, actual } => {
                Self::DigestMismatch { expected, actual }
            }
            IngestError::Source(msg) => Self::Upstream(UpstreamError::Transport(msg)),
            IngestError::Storage(e) => Self::Storage(e),
        }
    }
}

impl FillError {
    fn outcome_label(&self) -> &'static str {
        match self {
            Self::Upstream(_) => "upstream_error",
            Self::Lock(_) => "lock_timeout",
            Self::TooLarge { .. } => "too_large",
            Self::DigestMismatch { .. } => "digest_mismatch",
            Self::Storage(_) | Self::Metadata(_) => "internal_error",
        }
    }
}

/// Limits applied to every fill.
#[derive(Debug, Clone)]
pub struct FillSettings {
    pub max_file_size: u64,
    pub lease_ttl: Duration,
    pub retry_interval: Duration,
    pub max_wait: Duration,
}

impl FillSettings {
    pub fn from_config(server: &ServerConfig, locks: &LockConfig) -> Self {
        Self {
            max_file_size: server.max_file_size,
            lease_ttl: locks.fill_ttl(),
            retry_interval: locks.retry_interval(),
            max_wait: locks.max_wait(),
        }
    }
}

/// Lease key for filling `path` from `upstream_id`. The path is hashed to
/// keep keys short.
pub fn fill_lock_key(upstream_id: Uuid, path: &ArtifactPath) -> String {
    let digest = hex::encode(Sha256::digest(path.as_str().as_bytes()));
    format!("vreg:fill:{upstream_id}:{digest}")
}

#[derive(Clone)]
pub struct CacheFillCoordinator {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    locks: LockManager,
    settings: FillSettings,
}

impl CacheFillCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
        locks: LockManager,
        settings: FillSettings,
    ) -> Self {
        Self {
            metadata,
            storage,
            fetcher,
            locks,
            settings,
        }
    }

    /// Fetch `path` from `upstream` and commit it as the live cache entry.
    ///
    /// `replacing` is the stale entry a revalidation wants refreshed; `None`
    /// for a plain miss. Returns the entry committed by this call or by a
    /// concurrent filler for the same key.
    #[instrument(skip(self, upstream, path, replacing), fields(upstream_id = %upstream.upstream_id, path = %path))]
    pub async fn fill(
        &self,
        upstream: &UpstreamRow,
        path: &ArtifactPath,
        replacing: Option<&CacheEntryRow>,
    ) -> Result<CacheEntryRow, FillError> {
        let key = fill_lock_key(upstream.upstream_id, path);
        let guard = match self
            .locks
            .acquire(
                &key,
                self.settings.lease_ttl,
                self.settings.retry_interval,
                self.settings.max_wait,
            )
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                metrics::UPSTREAM_FILLS
                    .with_label_values(&["lock_timeout"])
                    .inc();
                return Err(e.into());
            }
        };

        let result = self.fill_locked(upstream, path, replacing).await;

        if let Err(e) = guard.release().await {
            warn!(%key, error = %e, "failed to release fill lease");
        }
        result
    }

    async fn fill_locked(
        &self,
        upstream: &UpstreamRow,
        path: &ArtifactPath,
        replacing: Option<&CacheEntryRow>,
    ) -> Result<CacheEntryRow, FillError> {
        if let Some(existing) = self
            .metadata
            .find_live_entry(upstream.upstream_id, path.as_str())
            .await?
        {
            let refreshed = replacing.is_none_or(|old| old.object_key != existing.object_key);
            if refreshed {
                debug!(entry_id = %existing.entry_id, "entry committed by concurrent fill");
                return Ok(existing);
            }
        }

        let started = Instant::now();
        let result = self.download(upstream, path).await;
        metrics::FILL_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(entry) => {
                metrics::UPSTREAM_FILLS.with_label_values(&["success"]).inc();
                metrics::BYTES_FILLED.inc_by(u64::try_from(entry.size_bytes).unwrap_or(0));
                info!(
                    entry_id = %entry.entry_id,
                    size = entry.size_bytes,
                    "cached artifact from upstream"
                );
            }
            Err(e) => {
                metrics::UPSTREAM_FILLS
                    .with_label_values(&[e.outcome_label()])
                    .inc();
                warn!(error = %e, "cache fill failed");
            }
        }
        result
    }

    async fn download(
        &self,
        upstream: &UpstreamRow,
        path: &ArtifactPath,
    ) -> Result<CacheEntryRow, FillError> {
        let registry_type = upstream.registry_type()?;
        let limit = self.settings.max_file_size;

        let fetched = self.fetcher.fetch(upstream, path).await?;
        if fetched.content_length.is_some_and(|len| len > limit) {
            return Err(FillError::TooLarge { limit });
        }

        let last_modified = fetched
            .headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let object_key = cache_object_key(registry_type, upstream.upstream_id);
        let stored = store_stream(
            self.storage.as_ref(),
            &object_key,
            fetched.body,
            limit,
            path.blob_sha256(),
        )
        .await?;

        let entry = NewCacheEntry {
            upstream_id: upstream.upstream_id,
            group_id: upstream.group_id,
            registry_type: registry_type.as_str().to_string(),
            relative_path: path.as_str().to_string(),
            object_key: stored.object_key.clone(),
            content_type: fetched
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            size_bytes: i64::try_from(stored.size).unwrap_or(i64::MAX),
            upstream_etag: fetched.etag,
            upstream_last_modified: last_modified,
            file_sha256: stored.sha256,
            downloaded_at: OffsetDateTime::now_utc(),
        };

        let committed =
            commit_cache_entry(self.metadata.as_ref(), self.storage.as_ref(), &entry).await?;
        Ok(committed)
    }
}
