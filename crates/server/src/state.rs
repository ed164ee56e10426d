//! Application state shared across handlers.

use crate::cleanup::{CleanupPolicyExecutor, CleanupSettings};
use crate::fill::{CacheFillCoordinator, FillSettings};
use crate::internal::InternalVerifier;
use crate::locks::LockManager;
use crate::proxy::RegistryProxy;
use crate::ratelimit::RateLimitState;
use crate::upstream::{UpstreamClient, UpstreamError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;
use vreg_core::Cadence;
use vreg_core::config::AppConfig;
use vreg_core::policy::CleanupMetrics;
use vreg_metadata::MetadataStore;
use vreg_metadata::models::CleanupRunRecord;
use vreg_metadata::repos::CleanupPolicyRepo;
use vreg_storage::ObjectStore;

/// Tracks spawned cleanup runs and detects panics.
///
/// A run that panics leaves its policy in `running`, which the scheduler
/// never picks up again. The watchdog marks such policies `failed`.
pub struct CleanupTaskRegistry {
    /// group_id -> task handle
    tasks: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
    metadata: Arc<dyn MetadataStore>,
}

impl CleanupTaskRegistry {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            metadata,
        }
    }

    pub async fn register(&self, group_id: Uuid, handle: JoinHandle<()>) {
        self.tasks.lock().await.insert(group_id, handle);
    }

    /// Whether a run for the group is still in flight.
    pub async fn is_tracked(&self, group_id: Uuid) -> bool {
        self.tasks
            .lock()
            .await
            .get(&group_id)
            .is_some_and(|h| !h.is_finished())
    }

    /// Spawn the watchdog. Keep the handle alive for the server lifetime.
    pub fn spawn_watchdog(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                self.check_tasks().await;
            }
        })
    }

    /// Wait for every tracked run to finish and reap it.
    pub async fn wait_idle(&self) {
        let handles: Vec<(Uuid, JoinHandle<()>)> = self.tasks.lock().await.drain().collect();
        for (group_id, handle) in handles {
            self.reap(group_id, handle).await;
        }
    }

    async fn check_tasks(&self) {
        // Collect under the mutex, await outside of it.
        let finished: Vec<(Uuid, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock().await;
            let done: Vec<Uuid> = tasks
                .iter()
                .filter(|(_, h)| h.is_finished())
                .map(|(id, _)| *id)
                .collect();
            done.into_iter()
                .filter_map(|id| tasks.remove(&id).map(|h| (id, h)))
                .collect()
        };

        for (group_id, handle) in finished {
            self.reap(group_id, handle).await;
        }
    }

    async fn reap(&self, group_id: Uuid, handle: JoinHandle<()>) {
        match handle.await {
            Ok(()) => tracing::debug!(group_id = %group_id, "cleanup task completed"),
            Err(join_err) if join_err.is_panic() => {
                crate::metrics::CLEANUP_JOBS_ACTIVE.dec();
                crate::metrics::CLEANUP_JOBS_PANICKED.inc();
                tracing::error!(
                    group_id = %group_id,
                    panic = ?join_err,
                    "cleanup task panicked, marking policy as failed"
                );
                self.fail_policy(group_id, "cleanup run panicked").await;
            }
            Err(join_err) => {
                crate::metrics::CLEANUP_JOBS_ACTIVE.dec();
                tracing::warn!(group_id = %group_id, error = ?join_err, "cleanup task was cancelled");
                self.fail_policy(group_id, "cleanup run was cancelled").await;
            }
        }
    }

    async fn fail_policy(&self, group_id: Uuid, message: &str) {
        let now = OffsetDateTime::now_utc();
        let cadence = match self.metadata.get_cleanup_policy(group_id).await {
            Ok(Some(policy)) => policy.cadence().unwrap_or(Cadence::Daily),
            Ok(None) => return,
            Err(e) => {
                tracing::error!(group_id = %group_id, error = %e, "failed to load policy of crashed run");
                Cadence::Daily
            }
        };
        let record = CleanupRunRecord {
            finished_at: now,
            next_run_at: cadence.next_run_after(now),
            deleted_entries_count: 0,
            deleted_size: 0,
            metrics: CleanupMetrics::new(),
            failure_message: Some(message.to_string()),
        };
        if let Err(e) = self.metadata.finish_cleanup_run(group_id, &record).await {
            tracing::error!(group_id = %group_id, error = %e, "failed to mark crashed cleanup run as failed");
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Cached artifact bytes and project package files.
    pub storage: Arc<dyn ObjectStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub rate_limit: RateLimitState,
    /// Outbound client for remote upstreams.
    pub upstream: Arc<UpstreamClient>,
    pub locks: LockManager,
    pub proxy: RegistryProxy,
    pub cleanup: CleanupPolicyExecutor,
    pub cleanup_tasks: Arc<CleanupTaskRegistry>,
    pub internal: InternalVerifier,
}

impl AppState {
    /// Build the state and its services.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid. Warnings are logged.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        cleanup_tasks: Arc<CleanupTaskRegistry>,
    ) -> Result<Self, UpstreamError> {
        match config.validate() {
            Ok(warnings) => {
                for warning in warnings {
                    tracing::warn!("Configuration warning: {}", warning);
                }
            }
            Err(error) => panic!("Invalid configuration: {error}"),
        }

        let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
        let locks = LockManager::from_config(&config.locks, metadata.clone());
        let filler = CacheFillCoordinator::new(
            metadata.clone(),
            storage.clone(),
            upstream.clone(),
            locks.clone(),
            FillSettings::from_config(&config.server, &config.locks),
        );
        let proxy = RegistryProxy::new(metadata.clone(), upstream.clone(), filler);
        let cleanup = CleanupPolicyExecutor::new(
            metadata.clone(),
            locks.clone(),
            CleanupSettings::from_config(&config.cleanup, &config.locks),
        );

        Ok(Self {
            rate_limit: RateLimitState::new(&config.rate_limit),
            internal: InternalVerifier::from_config(&config.internal),
            config: Arc::new(config),
            storage,
            metadata,
            upstream,
            locks,
            proxy,
            cleanup,
            cleanup_tasks,
        })
    }

    /// Rate limiter sweep interval, when rate limiting is enabled. A zero
    /// interval falls back to 60 seconds.
    pub fn rate_limit_cleanup_interval(&self) -> Option<Duration> {
        if !self.rate_limit.is_enabled() {
            return None;
        }
        match self.config.rate_limit.cleanup_interval_secs {
            0 => {
                tracing::warn!("rate_limit.cleanup_interval_secs is 0, using default of 60 seconds");
                Some(Duration::from_secs(60))
            }
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vreg_metadata::SqliteStore;
    use vreg_storage::FilesystemBackend;

    async fn build_state(config: AppConfig) -> (tempfile::TempDir, AppState) {
        let temp = tempfile::tempdir().unwrap();
        let storage: Arc<dyn ObjectStore> =
            Arc::new(FilesystemBackend::new(temp.path()).await.unwrap());
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(SqliteStore::new(temp.path().join("metadata.db"), None).await.unwrap());
        let tasks = Arc::new(CleanupTaskRegistry::new(metadata.clone()));

        let state = AppState::new(config, storage, metadata, tasks).unwrap();
        (temp, state)
    }

    #[tokio::test]
    async fn rate_limit_cleanup_interval_none_when_disabled() {
        let (_temp, state) = build_state(AppConfig::for_testing()).await;
        assert!(state.rate_limit_cleanup_interval().is_none());
    }

    #[tokio::test]
    async fn rate_limit_cleanup_interval_zero_uses_default() {
        let mut config = AppConfig::for_testing();
        config.rate_limit.enabled = true;
        config.rate_limit.cleanup_interval_secs = 0;

        let (_temp, state) = build_state(config).await;
        assert_eq!(
            state.rate_limit_cleanup_interval(),
            Some(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn watchdog_fails_policy_of_panicked_run() {
        let (_temp, state) = build_state(AppConfig::for_testing()).await;
        let group_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        state
            .metadata
            .upsert_cleanup_policy(&vreg_metadata::models::CleanupPolicyRow {
                group_id,
                enabled: true,
                keep_n_days_after_download: 30,
                cadence: 1,
                notify_on_success: false,
                notify_on_failure: false,
                status: "scheduled".to_string(),
                next_run_at: Some(now),
                last_run_at: None,
                last_run_deleted_entries_count: 0,
                last_run_deleted_size: 0,
                last_run_detailed_metrics: None,
                failure_message: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        assert!(state.metadata.claim_cleanup_run(group_id, now).await.unwrap());
        crate::metrics::CLEANUP_JOBS_ACTIVE.inc();

        let handle: JoinHandle<()> = tokio::spawn(async { panic!("boom") });
        state.cleanup_tasks.register(group_id, handle).await;
        state.cleanup_tasks.wait_idle().await;

        let policy = state
            .metadata
            .get_cleanup_policy(group_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(policy.status, "failed");
        assert_eq!(policy.failure_message.as_deref(), Some("cleanup run panicked"));
    }
}
