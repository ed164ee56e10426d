//! Registry and upstream descriptions.

use crate::GlobalId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Package format served by a virtual registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryType {
    /// Maven repository layout (`group/artifact/version/file`).
    Maven,
    /// OCI / Docker distribution API (`image/manifests/ref`, `image/blobs/digest`).
    Container,
}

impl RegistryType {
    /// Every registry type, in the order cleanup processes them.
    pub const ALL: [RegistryType; 2] = [RegistryType::Maven, RegistryType::Container];

    /// Parse from string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "maven" => Ok(Self::Maven),
            "container" => Ok(Self::Container),
            other => Err(crate::Error::InvalidRegistryType(other.to_string())),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maven => "maven",
            Self::Container => "container",
        }
    }

    /// Whether project-backed (local) upstreams can serve this registry type.
    pub fn supports_local_upstreams(&self) -> bool {
        matches!(self, Self::Maven)
    }
}

impl fmt::Display for RegistryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Basic credentials for a remote upstream.
///
/// `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Build credentials when both halves are present and non-empty.
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Option<Self> {
        match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(Self {
                username: u,
                password: p,
            }),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Where an upstream's artifacts come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpstreamLocation {
    /// External registry reached over HTTP(S).
    Remote {
        url: String,
        credentials: Option<Credentials>,
    },
    /// Package storage of a project on this instance.
    Local { project: GlobalId },
}

impl UpstreamLocation {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }

    /// Base URL for remote upstreams, without a trailing slash.
    pub fn base_url(&self) -> Option<&str> {
        match self {
            Self::Remote { url, .. } => Some(url.trim_end_matches('/')),
            Self::Local { .. } => None,
        }
    }
}
