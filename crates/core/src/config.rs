//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Largest artifact accepted from an upstream or an internal upload, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Enable request tracing.
    #[serde(default)]
    pub enable_tracing: bool,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// SECURITY: When enabled, ensure this endpoint is network-restricted
    /// to authorized Prometheus scraper IPs only at the infrastructure level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_file_size() -> u64 {
    crate::DEFAULT_MAX_FILE_SIZE
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_file_size: default_max_file_size(),
            enable_tracing: false,
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_file_size == 0 {
            return Err("server.max_file_size must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Admin token configuration.
///
/// The admin token is required for server operation. It provides initial access
/// to create registries and manage the server. If the token hash changes between
/// restarts, the previous admin token is automatically revoked and a new one
/// is created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Pre-computed hash of the admin token (SHA256 hex, 64 characters).
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub token_hash: String,
    /// Description for the admin token.
    pub token_description: Option<String>,
}

impl AdminConfig {
    /// Create a test configuration with a dummy token hash.
    ///
    /// **For testing only.** The hash is deterministic but not a real token.
    pub fn for_testing() -> Self {
        Self {
            // SHA256 of "test-admin-token"
            token_hash: "9f735e0df9a1ddc702bf0a1a7b83033f9f7153a00c29de82cedadc9957289b05"
                .to_string(),
            token_description: Some("Test admin token".to_string()),
        }
    }
}

/// Storage backend configuration for cached artifact bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds (advisory only - SQLite cannot force-cancel queries).
        /// Logs warnings for queries exceeding this duration.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

/// Outbound upstream request settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// TCP/TLS connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Total timeout for an existence probe (HEAD) in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Timeout between body chunks while downloading, in seconds.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// User-Agent sent to upstreams.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Permit loopback and private addresses. Development and tests only.
    #[serde(default)]
    pub allow_local_requests: bool,
    /// Hostnames, IPs or CIDR ranges exempt from the outbound address filter.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    300
}

fn default_user_agent() -> String {
    format!("vreg/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            user_agent: default_user_agent(),
            allow_local_requests: false,
            allowed_hosts: Vec::new(),
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout_secs == 0
            || self.probe_timeout_secs == 0
            || self.read_timeout_secs == 0
        {
            return Err("upstream timeouts must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Verification of internal (workhorse-signed) upload requests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InternalConfig {
    /// Shared HS256 secret. Uploads are rejected while unset.
    /// WARNING: Prefer VREG_INTERNAL__WORKHORSE_SECRET over storing in config.
    #[serde(default)]
    pub workhorse_secret: Option<String>,
    /// Expected `iss` claim.
    #[serde(default = "default_internal_issuer")]
    pub issuer: String,
}

fn default_internal_issuer() -> String {
    "gitlab-workhorse".to_string()
}

impl Default for InternalConfig {
    fn default() -> Self {
        Self {
            workhorse_secret: None,
            issuer: default_internal_issuer(),
        }
    }
}

/// Backend for exclusive leases.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockBackendKind {
    /// Leases stored in the metadata database; shared by every process using it.
    #[default]
    Metadata,
    /// Process-local leases.
    Memory,
}

/// Lease timings for cache fills and cleanup runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default)]
    pub backend: LockBackendKind,
    /// Lease lifetime for a single cache fill.
    #[serde(default = "default_fill_ttl_secs")]
    pub fill_ttl_secs: u64,
    /// Delay between attempts while another holder owns the lease.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Give up waiting after this long.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// Lease lifetime for a group's cleanup run.
    #[serde(default = "default_cleanup_ttl_secs")]
    pub cleanup_ttl_secs: u64,
}

fn default_fill_ttl_secs() -> u64 {
    600
}

fn default_retry_interval_ms() -> u64 {
    250
}

fn default_max_wait_secs() -> u64 {
    600
}

fn default_cleanup_ttl_secs() -> u64 {
    3600
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackendKind::default(),
            fill_ttl_secs: default_fill_ttl_secs(),
            retry_interval_ms: default_retry_interval_ms(),
            max_wait_secs: default_max_wait_secs(),
            cleanup_ttl_secs: default_cleanup_ttl_secs(),
        }
    }
}

impl LockConfig {
    pub fn fill_ttl(&self) -> Duration {
        Duration::from_secs(self.fill_ttl_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn cleanup_ttl(&self) -> Duration {
        Duration::from_secs(self.cleanup_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.retry_interval_ms == 0 {
            return Err("locks.retry_interval_ms cannot be 0".to_string());
        }
        if self.fill_ttl_secs == 0 || self.cleanup_ttl_secs == 0 {
            return Err("locks ttl values must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Cleanup policy execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Run due policies in the background.
    #[serde(default = "default_scheduler_enabled")]
    pub scheduler_enabled: bool,
    /// Seconds between scheduler ticks.
    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,
    /// Cache entries marked per batch.
    #[serde(default = "default_cleanup_batch_size")]
    pub batch_size: u32,
    /// Stop a run after this many batches per upstream (guards runaway loops).
    #[serde(default = "default_max_batches_per_upstream")]
    pub max_batches_per_upstream: u64,
    /// Policies started per scheduler tick.
    #[serde(default = "default_max_policies_per_tick")]
    pub max_policies_per_tick: u32,
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_scheduler_interval_secs() -> u64 {
    60
}

fn default_cleanup_batch_size() -> u32 {
    50
}

fn default_max_batches_per_upstream() -> u64 {
    100_000
}

fn default_max_policies_per_tick() -> u32 {
    10
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            scheduler_enabled: default_scheduler_enabled(),
            scheduler_interval_secs: default_scheduler_interval_secs(),
            batch_size: default_cleanup_batch_size(),
            max_batches_per_upstream: default_max_batches_per_upstream(),
            max_policies_per_tick: default_max_policies_per_tick(),
        }
    }
}

impl CleanupConfig {
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(1..=1000).contains(&self.batch_size) {
            return Err(format!(
                "cleanup.batch_size must be between 1 and 1000, got {}",
                self.batch_size
            ));
        }
        if self.scheduler_enabled && self.scheduler_interval_secs == 0 {
            return Err("cleanup.scheduler_interval_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Cache freshness defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Validity window assigned to new upstreams that do not specify one.
    #[serde(default = "default_cache_validity_hours")]
    pub default_cache_validity_hours: u32,
}

fn default_cache_validity_hours() -> u32 {
    24
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_cache_validity_hours: default_cache_validity_hours(),
        }
    }
}

/// Rate limiting configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    #[serde(default)]
    pub enabled: bool,
    /// Requests per minute per client IP and endpoint scope.
    #[serde(default = "default_ip_requests_per_minute")]
    pub ip_requests_per_minute: u32,
    /// Burst size (allows temporary burst above rate limit).
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// Trusted proxy IP addresses/CIDR ranges.
    /// Only requests from these IPs will have X-Forwarded-For/X-Real-IP headers trusted.
    /// If empty, forwarded headers are never trusted (only direct connection IP is used).
    /// Use ["*"] to trust all proxies (NOT recommended for production).
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Maximum number of tracked keys before rejecting new entries (default: 100000).
    /// Prevents memory exhaustion from attackers spraying unique IPs.
    #[serde(default = "default_max_entries")]
    pub max_entries: u32,
    /// Interval in seconds between cleanup sweeps of stale entries (default: 60).
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Time-to-live in seconds for rate limit entries (default: 300).
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: u64,
}

fn default_ip_requests_per_minute() -> u32 {
    600
}

fn default_burst_size() -> u32 {
    50
}

fn default_max_entries() -> u32 {
    100_000
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_entry_ttl_secs() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ip_requests_per_minute: default_ip_requests_per_minute(),
            burst_size: default_burst_size(),
            trusted_proxies: Vec::new(),
            max_entries: default_max_entries(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            entry_ttl_secs: default_entry_ttl_secs(),
        }
    }
}

impl RateLimitConfig {
    /// Validate rate limit configuration for dangerous settings.
    /// Returns warnings for configs that are insecure but allowed,
    /// and errors for configs that are unsafe and should be rejected.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if !self.enabled {
            return Ok(warnings);
        }

        if self.cleanup_interval_secs == 0 {
            return Err("rate_limit.cleanup_interval_secs cannot be 0. \
                 Use a value >= 1 second."
                .to_string());
        }

        if self.trusted_proxies.len() == 1 && self.trusted_proxies[0] == "*" {
            warnings.push(
                "rate_limit.trusted_proxies=['*'] trusts ALL forwarded headers. \
                 Clients can spoof their IP address and bypass rate limits."
                    .to_string(),
            );
        }

        if self.entry_ttl_secs < 120 {
            warnings.push(format!(
                "rate_limit.entry_ttl_secs={} is very short. \
                 Entries may be evicted before rate limits reset. \
                 Recommended minimum: 120 seconds.",
                self.entry_ttl_secs
            ));
        }

        Ok(warnings)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Admin token configuration (required).
    pub admin: AdminConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub internal: InternalConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage, SQLite metadata,
    /// a dummy admin token, permits loopback upstreams and disables the
    /// background cleanup scheduler.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            metadata: MetadataConfig::default(),
            admin: AdminConfig::for_testing(),
            upstream: UpstreamConfig {
                allow_local_requests: true,
                ..UpstreamConfig::default()
            },
            internal: InternalConfig {
                workhorse_secret: Some("test-workhorse-secret".to_string()),
                ..InternalConfig::default()
            },
            locks: LockConfig {
                retry_interval_ms: 20,
                max_wait_secs: 30,
                ..LockConfig::default()
            },
            cleanup: CleanupConfig {
                scheduler_enabled: false,
                ..CleanupConfig::default()
            },
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }

    /// Validate every section. Returns warnings for risky but allowed settings.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        self.server.validate()?;
        self.upstream.validate()?;
        self.locks.validate()?;
        self.cleanup.validate()?;
        let mut warnings = self.rate_limit.validate()?;
        if self.upstream.allow_local_requests {
            warnings.push(
                "upstream.allow_local_requests=true permits requests to loopback and \
                 private addresses. Use only in development."
                    .to_string(),
            );
        }
        if self.internal.workhorse_secret.is_none() {
            warnings.push(
                "internal.workhorse_secret is not set; internal uploads will be rejected"
                    .to_string(),
            );
        }
        Ok(warnings)
    }
}
