//! Repository traits for metadata operations.

pub mod audit;
pub mod bootstrap;
pub mod cache_entries;
pub mod cleanup_policies;
pub mod leases;
pub mod package_files;
pub mod registries;
pub mod tokens;
pub mod upstreams;

pub use audit::AuditRepo;
pub use bootstrap::BootstrapRepo;
pub use cache_entries::{CacheEntryRepo, NewCacheEntry};
pub use cleanup_policies::CleanupPolicyRepo;
pub use leases::LeaseRepo;
pub use package_files::PackageFileRepo;
pub use registries::RegistryRepo;
pub use tokens::TokenRepo;
pub use upstreams::{UpstreamRepo, UpstreamUpdate};
