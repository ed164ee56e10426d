//! Artifact paths relative to a registry.

use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_PATH_LEN: usize = 1024;

/// The logical address of an artifact within a registry, e.g.
/// `com/example/lib/1.0.0/lib-1.0.0.jar` or `library/alpine/manifests/3.20`.
///
/// Always relative, `/`-separated, free of empty, `.` and `..` segments.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactPath(String);

impl ArtifactPath {
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let trimmed = raw.trim().trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidPath("path is blank".to_string()));
        }
        if trimmed.len() > MAX_PATH_LEN {
            return Err(crate::Error::InvalidPath(format!(
                "path exceeds {MAX_PATH_LEN} bytes"
            )));
        }
        if trimmed.chars().any(|c| c.is_control() || c == '\\') {
            return Err(crate::Error::InvalidPath(
                "path contains control characters or backslashes".to_string(),
            ));
        }
        for segment in trimmed.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(crate::Error::InvalidPath(format!(
                    "invalid path segment: {segment:?}"
                )));
            }
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Container manifest paths carry a `/manifests/` segment.
    pub fn is_manifest(&self) -> bool {
        self.0.contains("/manifests/")
    }

    pub fn is_blob(&self) -> bool {
        self.0.contains("/blobs/")
    }

    /// Image name for container paths: the part before `/manifests/` or `/blobs/`.
    pub fn container_image(&self) -> Option<&str> {
        ["/manifests/", "/blobs/"]
            .iter()
            .find_map(|marker| self.0.split_once(marker).map(|(image, _)| image))
            .filter(|image| !image.is_empty())
    }

    /// Pull scope requested from a container registry token service.
    pub fn container_scope(&self) -> Option<String> {
        self.container_image()
            .map(|image| format!("repository:{image}:pull"))
    }

    /// Lowercase hex sha256 of a `blobs/sha256:<hex>` path.
    pub fn blob_sha256(&self) -> Option<&str> {
        let (_, reference) = self.0.split_once("/blobs/")?;
        let hex = reference.strip_prefix("sha256:")?;
        (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())).then_some(hex)
    }
}

impl TryFrom<String> for ArtifactPath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<ArtifactPath> for String {
    fn from(value: ArtifactPath) -> Self {
        value.0
    }
}

impl fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArtifactPath({})", self.0)
    }
}
