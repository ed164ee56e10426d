//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use sqlx::FromRow;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;
use vreg_core::{
    Cadence, CleanupMetrics, CleanupStatus, Credentials, GlobalId, RegistryType, UpstreamLocation,
};

/// Live cache entry status.
pub const ENTRY_STATUS_DEFAULT: &str = "default";
/// Soft-deleted cache entry awaiting physical removal.
pub const ENTRY_STATUS_PENDING_DESTRUCTION: &str = "pending_destruction";

fn parse_registry_type(raw: &str) -> MetadataResult<RegistryType> {
    RegistryType::parse(raw).map_err(|e| MetadataError::Internal(e.to_string()))
}

// =============================================================================
// Registries and upstreams
// =============================================================================

/// A virtual registry: one logical endpoint over ordered upstreams.
#[derive(Debug, Clone, FromRow)]
pub struct RegistryRow {
    pub registry_id: Uuid,
    pub group_id: Uuid,
    pub name: String,
    pub registry_type: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl RegistryRow {
    pub fn registry_type(&self) -> MetadataResult<RegistryType> {
        parse_registry_type(&self.registry_type)
    }
}

/// Upstream record. Exactly one of `url` and `project_gid` is set.
#[derive(Clone, FromRow)]
pub struct UpstreamRow {
    pub upstream_id: Uuid,
    pub registry_id: Uuid,
    pub group_id: Uuid,
    pub registry_type: String,
    pub name: String,
    /// 1-based order within the registry.
    pub position: i64,
    pub url: Option<String>,
    pub project_gid: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Hours before a cached copy is revalidated. 0 disables revalidation.
    pub cache_validity_hours: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UpstreamRow {
    pub fn registry_type(&self) -> MetadataResult<RegistryType> {
        parse_registry_type(&self.registry_type)
    }

    pub fn global_id(&self) -> GlobalId {
        GlobalId::upstream(self.upstream_id)
    }

    pub fn is_local(&self) -> bool {
        self.project_gid.is_some()
    }

    pub fn location(&self) -> MetadataResult<UpstreamLocation> {
        match (&self.url, &self.project_gid) {
            (Some(url), None) => Ok(UpstreamLocation::Remote {
                url: url.clone(),
                credentials: Credentials::from_parts(self.username.clone(), self.password.clone()),
            }),
            (None, Some(gid)) => Ok(UpstreamLocation::Local {
                project: GlobalId::parse(gid).map_err(|e| MetadataError::Internal(e.to_string()))?,
            }),
            _ => Err(MetadataError::Internal(format!(
                "upstream {} must have exactly one of url or project_gid",
                self.upstream_id
            ))),
        }
    }
}

impl fmt::Debug for UpstreamRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamRow")
            .field("upstream_id", &self.upstream_id)
            .field("registry_id", &self.registry_id)
            .field("group_id", &self.group_id)
            .field("registry_type", &self.registry_type)
            .field("name", &self.name)
            .field("position", &self.position)
            .field("url", &self.url)
            .field("project_gid", &self.project_gid)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("cache_validity_hours", &self.cache_validity_hours)
            .finish()
    }
}

// =============================================================================
// Cache entries
// =============================================================================

/// One cached artifact for an (upstream, path).
#[derive(Debug, Clone, FromRow)]
pub struct CacheEntryRow {
    pub entry_id: Uuid,
    pub upstream_id: Uuid,
    pub group_id: Uuid,
    pub registry_type: String,
    pub relative_path: String,
    /// Object store key of the stored file. Owned exclusively by this entry.
    pub object_key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub upstream_etag: Option<String>,
    pub upstream_last_modified: Option<String>,
    pub file_sha256: String,
    pub downloaded_at: OffsetDateTime,
    pub upstream_checked_at: OffsetDateTime,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl CacheEntryRow {
    pub fn is_live(&self) -> bool {
        self.status == ENTRY_STATUS_DEFAULT
    }

    pub fn registry_type(&self) -> MetadataResult<RegistryType> {
        parse_registry_type(&self.registry_type)
    }

    /// Whether the entry is older than the upstream's validity window.
    pub fn is_stale(&self, cache_validity_hours: i64, now: OffsetDateTime) -> bool {
        cache_validity_hours > 0
            && now - self.upstream_checked_at > time::Duration::hours(cache_validity_hours)
    }
}

/// Result of a create-or-update of a cache entry.
#[derive(Debug, Clone)]
pub struct UpsertedEntry {
    pub entry: CacheEntryRow,
    /// Object key the entry pointed at before the update, if it was replaced.
    pub replaced_object_key: Option<String>,
}

// =============================================================================
// Cleanup policies
// =============================================================================

/// Per-group cleanup policy.
#[derive(Debug, Clone, FromRow)]
pub struct CleanupPolicyRow {
    pub group_id: Uuid,
    pub enabled: bool,
    pub keep_n_days_after_download: i64,
    /// Days between runs.
    pub cadence: i64,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub status: String,
    pub next_run_at: Option<OffsetDateTime>,
    pub last_run_at: Option<OffsetDateTime>,
    pub last_run_deleted_entries_count: i64,
    pub last_run_deleted_size: i64,
    pub last_run_detailed_metrics: Option<String>,
    pub failure_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl CleanupPolicyRow {
    pub fn status(&self) -> MetadataResult<CleanupStatus> {
        CleanupStatus::parse(&self.status).map_err(|e| MetadataError::Internal(e.to_string()))
    }

    pub fn cadence(&self) -> MetadataResult<Cadence> {
        u32::try_from(self.cadence)
            .map_err(|_| MetadataError::Internal(format!("invalid cadence {}", self.cadence)))
            .and_then(|d| {
                Cadence::from_days(d).map_err(|e| MetadataError::Internal(e.to_string()))
            })
    }

    pub fn detailed_metrics(&self) -> MetadataResult<Option<CleanupMetrics>> {
        self.last_run_detailed_metrics
            .as_deref()
            .map(|json| {
                CleanupMetrics::from_json(json).map_err(|e| MetadataError::Internal(e.to_string()))
            })
            .transpose()
    }
}

/// Outcome recorded when a cleanup run ends.
#[derive(Debug, Clone)]
pub struct CleanupRunRecord {
    pub finished_at: OffsetDateTime,
    pub next_run_at: OffsetDateTime,
    pub deleted_entries_count: u64,
    pub deleted_size: u64,
    pub metrics: CleanupMetrics,
    /// Set when the run failed.
    pub failure_message: Option<String>,
}

// =============================================================================
// Audit events
// =============================================================================

/// Audit event record. `details` never carries credentials.
#[derive(Debug, Clone, FromRow)]
pub struct AuditEventRow {
    pub event_id: Uuid,
    pub event_name: String,
    pub group_id: Option<Uuid>,
    pub target_type: String,
    pub target_id: Option<String>,
    /// JSON object.
    pub details: String,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Local project packages
// =============================================================================

/// A file stored in a project's own package registry.
#[derive(Debug, Clone, FromRow)]
pub struct PackageFileRow {
    pub package_file_id: Uuid,
    pub project_gid: String,
    pub relative_path: String,
    pub object_key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub file_sha256: String,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Tokens
// =============================================================================

/// Token record.
#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub token_id: Uuid,
    pub group_id: Option<Uuid>,
    pub token_hash: String,
    pub scopes: String, // JSON array
    pub expires_at: Option<OffsetDateTime>,
    pub revoked_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub description: Option<String>,
}
