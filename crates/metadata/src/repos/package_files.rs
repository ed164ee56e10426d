//! Package files stored by local projects.

use crate::error::MetadataResult;
use crate::models::PackageFileRow;
use async_trait::async_trait;

/// Repository for project package files, used by local upstreams.
#[async_trait]
pub trait PackageFileRepo: Send + Sync {
    /// Insert or replace the file at (project, path). Returns the previous
    /// object key when one was replaced.
    async fn upsert_package_file(&self, file: &PackageFileRow) -> MetadataResult<Option<String>>;

    /// Find the file at (project, path).
    async fn find_package_file(
        &self,
        project_gid: &str,
        relative_path: &str,
    ) -> MetadataResult<Option<PackageFileRow>>;
}
