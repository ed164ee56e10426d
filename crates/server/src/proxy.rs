//! Read path of a virtual registry: cache, resolve, fill.

use crate::fill::{CacheFillCoordinator, FillError};
use crate::metrics;
use crate::resolver::{ResolveError, UpstreamResolver, resolution_order};
use crate::upstream::{ProbeOutcome, UpstreamProber};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vreg_core::{ArtifactPath, UpstreamLocation};
use vreg_metadata::models::{CacheEntryRow, PackageFileRow, RegistryRow, UpstreamRow};
use vreg_metadata::repos::{CacheEntryRepo, PackageFileRepo, UpstreamRepo};
use vreg_metadata::{MetadataError, MetadataStore};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Fill(#[from] FillError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// What a `show` request is answered with.
#[derive(Debug, Clone)]
pub enum Served {
    /// A cache entry of a remote upstream.
    Cached(CacheEntryRow),
    /// A file from a project-backed upstream.
    Package(PackageFileRow),
}

impl Served {
    pub fn object_key(&self) -> &str {
        match self {
            Self::Cached(entry) => &entry.object_key,
            Self::Package(file) => &file.object_key,
        }
    }

    pub fn content_type(&self) -> &str {
        match self {
            Self::Cached(entry) => &entry.content_type,
            Self::Package(file) => &file.content_type,
        }
    }

    pub fn size(&self) -> u64 {
        let size = match self {
            Self::Cached(entry) => entry.size_bytes,
            Self::Package(file) => file.size_bytes,
        };
        u64::try_from(size).unwrap_or(0)
    }

    /// Upstream ETag or digest recorded for the artifact.
    pub fn etag(&self) -> Option<&str> {
        match self {
            Self::Cached(entry) => entry.upstream_etag.as_deref(),
            Self::Package(_) => None,
        }
    }

    pub fn last_modified(&self) -> Option<&str> {
        match self {
            Self::Cached(entry) => entry.upstream_last_modified.as_deref(),
            Self::Package(_) => None,
        }
    }
}

/// Serves artifacts of a registry.
///
/// Project-backed upstreams are consulted first, then live cache entries
/// (highest ranked upstream wins). Stale entries are revalidated against
/// their upstream. A miss goes through the [`UpstreamResolver`] and the
/// [`CacheFillCoordinator`].
#[derive(Clone)]
pub struct RegistryProxy {
    metadata: Arc<dyn MetadataStore>,
    prober: Arc<dyn UpstreamProber>,
    resolver: UpstreamResolver,
    filler: CacheFillCoordinator,
}

impl RegistryProxy {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        prober: Arc<dyn UpstreamProber>,
        filler: CacheFillCoordinator,
    ) -> Self {
        let resolver = UpstreamResolver::new(metadata.clone(), prober.clone());
        Self {
            metadata,
            prober,
            resolver,
            filler,
        }
    }

    #[instrument(skip(self, registry), fields(registry_id = %registry.registry_id))]
    pub async fn serve(&self, registry: &RegistryRow, path: &str) -> Result<Served, ProxyError> {
        let upstreams = self.metadata.list_upstreams(registry.registry_id).await?;
        if upstreams.is_empty() {
            return Err(ResolveError::NoUpstreams.into());
        }
        let path = ArtifactPath::parse(path).map_err(|e| ResolveError::BadRequest(e.to_string()))?;
        let ordered = resolution_order(&upstreams);

        for upstream in ordered.iter().filter(|u| u.is_local()) {
            if let UpstreamLocation::Local { project } = upstream.location()?
                && let Some(file) = self
                    .metadata
                    .find_package_file(&project.to_string(), path.as_str())
                    .await?
            {
                metrics::CACHE_HITS.with_label_values(&["local"]).inc();
                return Ok(Served::Package(file));
            }
        }

        let remote_ids: Vec<Uuid> = ordered
            .iter()
            .filter(|u| !u.is_local())
            .map(|u| u.upstream_id)
            .collect();
        let entries = self
            .metadata
            .find_live_entries_for_path(&remote_ids, path.as_str())
            .await?;
        let hit = ordered.iter().find_map(|upstream| {
            entries
                .iter()
                .find(|e| e.upstream_id == upstream.upstream_id)
                .map(|entry| (*upstream, entry.clone()))
        });

        if let Some((upstream, entry)) = hit {
            metrics::CACHE_HITS.with_label_values(&["cache"]).inc();
            let now = OffsetDateTime::now_utc();
            if entry.is_stale(upstream.cache_validity_hours, now) {
                return Ok(Served::Cached(
                    self.revalidate(upstream, &path, entry, now).await,
                ));
            }
            debug!(entry_id = %entry.entry_id, "cache hit");
            return Ok(Served::Cached(entry));
        }

        metrics::CACHE_MISSES.inc();
        let resolution = self.resolver.resolve(&upstreams, path.as_str()).await?;
        if let Some(file) = resolution.package_file {
            return Ok(Served::Package(file));
        }

        let entry = self.filler.fill(&resolution.upstream, &path, None).await?;
        Ok(Served::Cached(entry))
    }

    /// Check a stale entry against its upstream. Always yields something to
    /// serve: the stale copy is used whenever the upstream cannot confirm or
    /// replace it.
    async fn revalidate(
        &self,
        upstream: &UpstreamRow,
        path: &ArtifactPath,
        entry: CacheEntryRow,
        now: OffsetDateTime,
    ) -> CacheEntryRow {
        match self.prober.probe(upstream, path).await {
            Ok(ProbeOutcome::Found { etag })
                if etag.is_none() || etag == entry.upstream_etag =>
            {
                metrics::REVALIDATIONS
                    .with_label_values(&["unchanged"])
                    .inc();
                if let Err(e) = self
                    .metadata
                    .touch_upstream_checked(entry.entry_id, now)
                    .await
                {
                    warn!(entry_id = %entry.entry_id, error = %e, "failed to record revalidation");
                }
                entry
            }
            Ok(ProbeOutcome::Found { .. }) => {
                metrics::REVALIDATIONS.with_label_values(&["changed"]).inc();
                info!(entry_id = %entry.entry_id, "upstream artifact changed, refilling");
                match self.filler.fill(upstream, path, Some(&entry)).await {
                    Ok(refreshed) => refreshed,
                    Err(e) => {
                        warn!(entry_id = %entry.entry_id, error = %e, "refill failed, serving stale copy");
                        entry
                    }
                }
            }
            Ok(ProbeOutcome::NotFound { status }) => {
                metrics::REVALIDATIONS.with_label_values(&["stale"]).inc();
                warn!(entry_id = %entry.entry_id, status, "upstream no longer has artifact, serving stale copy");
                entry
            }
            Err(e) => {
                metrics::REVALIDATIONS.with_label_values(&["stale"]).inc();
                warn!(entry_id = %entry.entry_id, error = %e, "upstream unreachable, serving stale copy");
                entry
            }
        }
    }
}
