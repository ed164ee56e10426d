//! Outbound access to upstream registries.
//!
//! [`UpstreamProber`] answers "does this upstream have the artifact?" with a
//! lightweight request; [`ArtifactFetcher`] streams the artifact body. Both
//! are implemented by [`UpstreamClient`] and faked in tests.

pub mod challenge;
pub mod client;

pub use client::UpstreamClient;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::{CONTENT_TYPE, ETAG, HeaderName, LAST_MODIFIED};
use bytes::Bytes;
use futures::stream::BoxStream;
use vreg_core::{ArtifactPath, RegistryType};
use vreg_metadata::models::UpstreamRow;

/// Header carrying a container manifest digest.
pub const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");

/// Upstream response headers passed on to clients. Everything else is dropped.
pub const FORWARDED_HEADERS: [HeaderName; 4] =
    [CONTENT_TYPE, DOCKER_CONTENT_DIGEST, ETAG, LAST_MODIFIED];

/// Upstream access errors.
///
/// Messages never contain request URLs: signed redirect targets and
/// credentials must not reach logs or clients.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("outbound request denied: {0}")]
    Denied(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream responded with status {0}")]
    Status(u16),

    #[error("upstream authentication failed: {0}")]
    Auth(String),

    #[error("upstream misconfigured: {0}")]
    Config(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        let e = e.without_url();
        if e.is_timeout() {
            Self::Transport(format!("timed out: {e}"))
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Result of an existence probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// 2xx. `etag` is the upstream ETag or, for containers, the content digest.
    Found { etag: Option<String> },
    /// Any non-2xx status.
    NotFound { status: u16 },
}

/// An upstream response whose body has not been read yet.
pub struct FetchedArtifact {
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub content_length: Option<u64>,
    /// Allow-listed response headers.
    pub headers: HeaderMap,
    pub body: BoxStream<'static, Result<Bytes, UpstreamError>>,
}

impl std::fmt::Debug for FetchedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedArtifact")
            .field("content_type", &self.content_type)
            .field("etag", &self.etag)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Existence checks against a single remote upstream.
#[async_trait]
pub trait UpstreamProber: Send + Sync {
    async fn probe(
        &self,
        upstream: &UpstreamRow,
        path: &ArtifactPath,
    ) -> Result<ProbeOutcome, UpstreamError>;
}

/// Downloads from a single remote upstream.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Start a download. Non-2xx responses are errors.
    async fn fetch(
        &self,
        upstream: &UpstreamRow,
        path: &ArtifactPath,
    ) -> Result<FetchedArtifact, UpstreamError>;
}

/// Keep only allow-listed headers.
pub fn forwarded_headers(source: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = source.get(&name) {
            headers.insert(name, value.clone());
        }
    }
    headers
}

/// ETag of a response, falling back to the container content digest.
pub fn response_etag(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .or_else(|| headers.get(DOCKER_CONTENT_DIGEST))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Full URL of `path` on an upstream rooted at `base`.
pub fn artifact_url(registry_type: RegistryType, base: &str, path: &ArtifactPath) -> String {
    let base = base.trim_end_matches('/');
    match registry_type {
        RegistryType::Maven => format!("{base}/{}", path.as_str()),
        RegistryType::Container => format!("{base}/v2/{}", path.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_artifact_url_layouts() {
        let jar = ArtifactPath::parse("com/x/1.0/a.jar").unwrap();
        assert_eq!(
            artifact_url(RegistryType::Maven, "https://repo1.maven.org/maven2/", &jar),
            "https://repo1.maven.org/maven2/com/x/1.0/a.jar"
        );

        let manifest = ArtifactPath::parse("library/alpine/manifests/3.20").unwrap();
        assert_eq!(
            artifact_url(RegistryType::Container, "https://registry-1.docker.io", &manifest),
            "https://registry-1.docker.io/v2/library/alpine/manifests/3.20"
        );
    }

    #[test]
    fn test_forwarded_headers_drop_everything_else() {
        let mut source = HeaderMap::new();
        source.insert(CONTENT_TYPE, HeaderValue::from_static("application/java-archive"));
        source.insert(ETAG, HeaderValue::from_static("\"abc\""));
        source.insert("set-cookie", HeaderValue::from_static("session=1"));
        source.insert("x-amz-request-id", HeaderValue::from_static("internal"));
        source.insert("server", HeaderValue::from_static("nginx"));

        let forwarded = forwarded_headers(&source);
        assert_eq!(forwarded.len(), 2);
        assert!(forwarded.get("set-cookie").is_none());
        assert!(forwarded.get("server").is_none());
    }

    #[test]
    fn test_etag_falls_back_to_digest() {
        let mut headers = HeaderMap::new();
        headers.insert(
            DOCKER_CONTENT_DIGEST,
            HeaderValue::from_static("sha256:0123"),
        );
        assert_eq!(response_etag(&headers).as_deref(), Some("sha256:0123"));

        headers.insert(ETAG, HeaderValue::from_static("\"etag-1\""));
        assert_eq!(response_etag(&headers).as_deref(), Some("\"etag-1\""));
    }
}
