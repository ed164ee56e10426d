//! Streaming artifact bytes into the object store.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::fmt::Display;
use tracing::warn;
use uuid::Uuid;
use vreg_core::RegistryType;
use vreg_metadata::models::CacheEntryRow;
use vreg_metadata::repos::{CacheEntryRepo, NewCacheEntry};
use vreg_metadata::{MetadataError, MetadataStore};
use vreg_storage::{ObjectStore, StorageError};

/// Failure while storing a byte stream. The partial object is always discarded.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("artifact exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("digest mismatch: expected sha256:{expected}, got sha256:{actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("source stream failed: {0}")]
    Source(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A stored object.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub object_key: String,
    pub size: u64,
    /// Lowercase hex sha256 of the content.
    pub sha256: String,
}

/// Fresh object key for a cached artifact. Keys are never reused, so an
/// object is never overwritten while it may be streaming to a client.
pub fn cache_object_key(registry_type: RegistryType, upstream_id: Uuid) -> String {
    format!("cache/{registry_type}/{upstream_id}/{}", Uuid::new_v4())
}

/// Fresh object key for a project package file.
pub fn package_object_key(project_id: &str) -> String {
    format!("packages/{project_id}/{}", Uuid::new_v4())
}

/// Copy `body` into `key`, enforcing `max_size` and, when given, the sha256.
pub async fn store_stream<S, E>(
    storage: &dyn ObjectStore,
    key: &str,
    mut body: S,
    max_size: u64,
    expected_sha256: Option<&str>,
) -> Result<StoredObject, IngestError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
    E: Display + Send,
{
    let mut upload = storage.put_stream(key).await?;
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;

    let outcome = async {
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| IngestError::Source(e.to_string()))?;
            size = size.saturating_add(chunk.len() as u64);
            if size > max_size {
                return Err(IngestError::TooLarge { limit: max_size });
            }
            hasher.update(&chunk);
            upload.write(chunk).await?;
        }
        Ok(())
    }
    .await;

    if let Err(e) = outcome {
        let _ = upload.abort().await;
        return Err(e);
    }

    let sha256 = hex::encode(hasher.finalize());
    if let Some(expected) = expected_sha256
        && !expected.eq_ignore_ascii_case(&sha256)
    {
        let _ = upload.abort().await;
        return Err(IngestError::DigestMismatch {
            expected: expected.to_ascii_lowercase(),
            actual: sha256,
        });
    }

    upload.finish().await?;
    Ok(StoredObject {
        object_key: key.to_string(),
        size,
        sha256,
    })
}

/// Record a stored object as the live entry for its (upstream, path).
///
/// The object is removed again when the row cannot be written. The object of
/// a replaced entry is deleted once the new row is visible.
pub async fn commit_cache_entry(
    metadata: &dyn MetadataStore,
    storage: &dyn ObjectStore,
    entry: &NewCacheEntry,
) -> Result<CacheEntryRow, MetadataError> {
    let upserted = match metadata.upsert_cache_entry(entry).await {
        Ok(upserted) => upserted,
        Err(e) => {
            if let Err(cleanup) = storage.delete(&entry.object_key).await {
                warn!(object_key = %entry.object_key, error = %cleanup, "failed to remove orphaned object");
            }
            return Err(e);
        }
    };

    if let Some(old_key) = upserted.replaced_object_key
        && let Err(e) = storage.delete(&old_key).await
        && !e.is_not_found()
    {
        warn!(object_key = %old_key, error = %e, "failed to remove replaced object");
    }

    Ok(upserted.entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use vreg_storage::FilesystemBackend;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Unpin + Send {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_store_hashes_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemBackend::new(dir.path()).await.unwrap();

        let stored = store_stream(&storage, "cache/maven/u/1", chunks(&["hello ", "world"]), 1024, None)
            .await
            .unwrap();
        assert_eq!(stored.size, 11);
        assert_eq!(
            stored.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(storage.get("cache/maven/u/1").await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_oversized_stream_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemBackend::new(dir.path()).await.unwrap();

        let err = store_stream(&storage, "cache/maven/u/2", chunks(&["12345", "67890"]), 8, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::TooLarge { limit: 8 }));
        assert!(!storage.exists("cache/maven/u/2").await.unwrap());
    }

    #[tokio::test]
    async fn test_digest_mismatch_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemBackend::new(dir.path()).await.unwrap();
        let wrong = "0".repeat(64);

        let err = store_stream(&storage, "cache/container/u/3", chunks(&["layer"]), 1024, Some(&wrong))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::DigestMismatch { .. }));
        assert!(!storage.exists("cache/container/u/3").await.unwrap());
    }

    #[tokio::test]
    async fn test_source_error_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemBackend::new(dir.path()).await.unwrap();
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"part")),
            Err(std::io::Error::other("reset by peer")),
        ]);

        let err = store_stream(&storage, "cache/maven/u/4", body, 1024, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Source(_)));
        assert!(!storage.exists("cache/maven/u/4").await.unwrap());
    }
}
