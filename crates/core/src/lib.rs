//! Core domain types for the vreg virtual registry.
//!
//! This crate defines the data model shared by the storage, metadata and
//! server crates:
//! - Registry types and upstream locations (remote URL or local project)
//! - Validated artifact paths and container scopes
//! - Global object references (`gid://vreg/<Model>/<id>`)
//! - Cleanup policy values: cadence, status and per-type run metrics
//! - Outbound request guard for upstream URLs
//! - Token scopes and authorization

pub mod config;
pub mod error;
pub mod global_id;
pub mod outbound;
pub mod path;
pub mod policy;
pub mod registry;
pub mod token;

pub use error::{Error, Result};
pub use global_id::GlobalId;
pub use outbound::{Allowed, Denied, OutboundGuard};
pub use path::ArtifactPath;
pub use policy::{Cadence, CleanupMetrics, CleanupStatus, RegistryTypeMetrics};
pub use registry::{Credentials, RegistryType, UpstreamLocation};
pub use token::{Token, TokenId, TokenScope};

/// Maximum number of upstreams a single registry may reference.
pub const MAX_UPSTREAMS_PER_REGISTRY: usize = 20;

/// Default upper bound on a cached artifact: 5 GiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Content type used when neither the upstream nor the uploader supplies one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
