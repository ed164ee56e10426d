//! Upstream resolution: which upstream of a registry has an artifact.

use crate::upstream::{ProbeOutcome, UpstreamError, UpstreamProber};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;
use vreg_core::{ArtifactPath, UpstreamLocation};
use vreg_metadata::models::{PackageFileRow, UpstreamRow};
use vreg_metadata::repos::PackageFileRepo;
use vreg_metadata::{MetadataError, MetadataStore};

/// Why resolution produced no upstream.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("registry has no upstreams")]
    NoUpstreams,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("file not found on any upstream")]
    FileNotFoundOnUpstreams,

    #[error("upstream {upstream_id} unavailable: {source}")]
    Upstream {
        upstream_id: Uuid,
        #[source]
        source: UpstreamError,
    },

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// The upstream that has the artifact.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub upstream: UpstreamRow,
    /// Set when a project-backed upstream matched.
    pub package_file: Option<PackageFileRow>,
    /// Upstream ETag reported by the probe.
    pub etag: Option<String>,
}

/// Order upstreams for resolution: project-backed first, each group keeping
/// the caller's order.
pub fn resolution_order(upstreams: &[UpstreamRow]) -> Vec<&UpstreamRow> {
    let (local, remote): (Vec<&UpstreamRow>, Vec<&UpstreamRow>) =
        upstreams.iter().partition(|u| u.is_local());
    local.into_iter().chain(remote).collect()
}

/// Finds the first upstream holding a path.
///
/// Upstreams are tried strictly in order and one at a time. Project-backed
/// upstreams are looked up in the metadata store with no network traffic.
/// Remote upstreams are probed; a non-2xx answer moves on to the next
/// upstream while a transport failure aborts resolution. Nothing after the
/// first match is probed.
#[derive(Clone)]
pub struct UpstreamResolver {
    metadata: Arc<dyn MetadataStore>,
    prober: Arc<dyn UpstreamProber>,
}

impl UpstreamResolver {
    pub fn new(metadata: Arc<dyn MetadataStore>, prober: Arc<dyn UpstreamProber>) -> Self {
        Self { metadata, prober }
    }

    /// Resolve `path` over `upstreams` (in registry position order).
    #[instrument(skip(self, upstreams), fields(upstreams = upstreams.len()))]
    pub async fn resolve(
        &self,
        upstreams: &[UpstreamRow],
        path: &str,
    ) -> Result<Resolution, ResolveError> {
        if upstreams.is_empty() {
            return Err(ResolveError::NoUpstreams);
        }
        let path = ArtifactPath::parse(path).map_err(|e| ResolveError::BadRequest(e.to_string()))?;

        for upstream in resolution_order(upstreams) {
            let location = upstream.location()?;
            match location {
                UpstreamLocation::Local { project } => {
                    if let Some(file) = self
                        .metadata
                        .find_package_file(&project.to_string(), path.as_str())
                        .await?
                    {
                        debug!(upstream_id = %upstream.upstream_id, "resolved to project package");
                        return Ok(Resolution {
                            upstream: upstream.clone(),
                            package_file: Some(file),
                            etag: None,
                        });
                    }
                }
                UpstreamLocation::Remote { .. } => {
                    let outcome = self.prober.probe(upstream, &path).await.map_err(|source| {
                        ResolveError::Upstream {
                            upstream_id: upstream.upstream_id,
                            source,
                        }
                    })?;
                    if let ProbeOutcome::Found { etag } = outcome {
                        debug!(upstream_id = %upstream.upstream_id, "resolved to remote upstream");
                        return Ok(Resolution {
                            upstream: upstream.clone(),
                            package_file: None,
                            etag,
                        });
                    }
                }
            }
        }

        Err(ResolveError::FileNotFoundOnUpstreams)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use time::OffsetDateTime;
    use vreg_metadata::SqliteStore;

    /// Prober answering from a table and recording every call.
    #[derive(Default)]
    pub(crate) struct ScriptedProber {
        answers: Mutex<HashMap<Uuid, Result<ProbeOutcome, String>>>,
        pub(crate) calls: Mutex<Vec<Uuid>>,
    }

    impl ScriptedProber {
        pub(crate) fn found(&self, upstream: Uuid, etag: Option<&str>) {
            self.answers.lock().unwrap().insert(
                upstream,
                Ok(ProbeOutcome::Found {
                    etag: etag.map(str::to_string),
                }),
            );
        }

        pub(crate) fn missing(&self, upstream: Uuid) {
            self.answers
                .lock()
                .unwrap()
                .insert(upstream, Ok(ProbeOutcome::NotFound { status: 404 }));
        }

        pub(crate) fn failing(&self, upstream: Uuid) {
            self.answers
                .lock()
                .unwrap()
                .insert(upstream, Err("connection reset".to_string()));
        }

        pub(crate) fn calls(&self) -> Vec<Uuid> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamProber for ScriptedProber {
        async fn probe(
            &self,
            upstream: &UpstreamRow,
            _path: &ArtifactPath,
        ) -> Result<ProbeOutcome, UpstreamError> {
            self.calls.lock().unwrap().push(upstream.upstream_id);
            match self.answers.lock().unwrap().get(&upstream.upstream_id) {
                Some(Ok(outcome)) => Ok(outcome.clone()),
                Some(Err(msg)) => Err(UpstreamError::Transport(msg.clone())),
                None => Ok(ProbeOutcome::NotFound { status: 404 }),
            }
        }
    }

    pub(crate) fn remote_row(position: i64) -> UpstreamRow {
        let now = OffsetDateTime::now_utc();
        UpstreamRow {
            upstream_id: Uuid::new_v4(),
            registry_id: Uuid::nil(),
            group_id: Uuid::nil(),
            registry_type: "maven".to_string(),
            name: format!("remote-{position}"),
            position,
            url: Some(format!("https://r{position}.example.com/maven2")),
            project_gid: None,
            username: None,
            password: None,
            cache_validity_hours: 24,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn local_row(position: i64, project: &str) -> UpstreamRow {
        UpstreamRow {
            url: None,
            project_gid: Some(format!("gid://vreg/Project/{project}")),
            name: format!("local-{position}"),
            ..remote_row(position)
        }
    }

    async fn resolver(prober: Arc<ScriptedProber>) -> (tempfile::TempDir, Arc<SqliteStore>, UpstreamResolver) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("m.db"), None).await.unwrap());
        let resolver = UpstreamResolver::new(store.clone(), prober);
        (dir, store, resolver)
    }

    async fn publish(store: &SqliteStore, project: &str, path: &str) {
        store
            .upsert_package_file(&PackageFileRow {
                package_file_id: Uuid::new_v4(),
                project_gid: format!("gid://vreg/Project/{project}"),
                relative_path: path.to_string(),
                object_key: format!("packages/{project}/{}", Uuid::new_v4()),
                content_type: "application/java-archive".to_string(),
                size_bytes: 3,
                file_sha256: "00".repeat(32),
                created_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_upstreams_checked_first() {
        let prober = Arc::new(ScriptedProber::default());
        let (_dir, _store, resolver) = resolver(prober.clone()).await;

        // Blank path would also be an error, but no upstreams wins.
        assert!(matches!(
            resolver.resolve(&[], "").await,
            Err(ResolveError::NoUpstreams)
        ));
        assert!(matches!(
            resolver.resolve(&[remote_row(1)], "  ").await,
            Err(ResolveError::BadRequest(_))
        ));
        assert!(prober.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stops_at_first_match() {
        let prober = Arc::new(ScriptedProber::default());
        let upstreams: Vec<_> = (1..=5).map(remote_row).collect();
        prober.missing(upstreams[0].upstream_id);
        prober.missing(upstreams[1].upstream_id);
        prober.found(upstreams[2].upstream_id, Some("\"e3\""));
        prober.found(upstreams[3].upstream_id, None);
        prober.failing(upstreams[4].upstream_id);

        let (_dir, _store, resolver) = resolver(prober.clone()).await;
        let resolution = resolver.resolve(&upstreams, "com/x/1.0/a.jar").await.unwrap();

        assert_eq!(resolution.upstream.upstream_id, upstreams[2].upstream_id);
        assert_eq!(resolution.etag.as_deref(), Some("\"e3\""));
        assert_eq!(
            prober.calls(),
            upstreams[..3].iter().map(|u| u.upstream_id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_local_match_needs_no_probe() {
        let prober = Arc::new(ScriptedProber::default());
        let remote = remote_row(1);
        let local = local_row(2, "41");
        prober.found(remote.upstream_id, None);

        let (_dir, store, resolver) = resolver(prober.clone()).await;
        publish(&store, "41", "com/x/1.0/a.jar").await;

        // Listed after the remote, still tried first.
        let resolution = resolver
            .resolve(&[remote, local.clone()], "com/x/1.0/a.jar")
            .await
            .unwrap();
        assert_eq!(resolution.upstream.upstream_id, local.upstream_id);
        assert!(resolution.package_file.is_some());
        assert!(prober.calls().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_after_not_found_propagates() {
        let prober = Arc::new(ScriptedProber::default());
        let first = remote_row(1);
        let second = remote_row(2);
        prober.missing(first.upstream_id);
        prober.failing(second.upstream_id);

        let (_dir, _store, resolver) = resolver(prober.clone()).await;
        let err = resolver
            .resolve(&[first, second.clone()], "com/x/1.0/a.jar")
            .await
            .unwrap_err();
        match err {
            ResolveError::Upstream { upstream_id, .. } => {
                assert_eq!(upstream_id, second.upstream_id)
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_falls_through_local_and_remote_to_last() {
        let prober = Arc::new(ScriptedProber::default());
        let local = local_row(1, "7");
        let r1 = remote_row(2);
        let r2 = remote_row(3);
        prober.missing(r1.upstream_id);
        prober.found(r2.upstream_id, None);

        let (_dir, store, resolver) = resolver(prober.clone()).await;
        publish(&store, "7", "com/x/1.0/other.jar").await;

        let resolution = resolver
            .resolve(&[local, r1.clone(), r2.clone()], "com/x/1.0/a.jar")
            .await
            .unwrap();
        assert_eq!(resolution.upstream.upstream_id, r2.upstream_id);
        assert!(resolution.package_file.is_none());
        assert_eq!(prober.calls(), vec![r1.upstream_id, r2.upstream_id]);
    }

    #[tokio::test]
    async fn test_exhausted_is_file_not_found() {
        let prober = Arc::new(ScriptedProber::default());
        let (_dir, _store, resolver) = resolver(prober.clone()).await;
        assert!(matches!(
            resolver.resolve(&[remote_row(1), remote_row(2)], "a/b.jar").await,
            Err(ResolveError::FileNotFoundOnUpstreams)
        ));
        assert_eq!(prober.calls().len(), 2);
    }
}
