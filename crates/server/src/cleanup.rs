//! Cleanup policy execution and scheduling.
//!
//! A run walks every upstream of the policy's group, one registry type at a
//! time, and marks cache entries older than the retention window pending
//! destruction in keyset-paginated batches. Each batch is its own
//! transaction and emits one audit event; a failure mid-run keeps the
//! batches already committed. Pending entries are excluded from the
//! eligibility query, so re-running is idempotent. Physical deletion of the
//! stored files is left to a separate reaper.

use crate::audit;
use crate::locks::{LockError, LockManager};
use crate::metrics;
use crate::state::CleanupTaskRegistry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use vreg_core::RegistryType;
use vreg_core::config::{CleanupConfig, LockConfig};
use vreg_core::policy::{CleanupMetrics, CleanupStatus, validate_keep_days};
use vreg_metadata::models::{CleanupPolicyRow, CleanupRunRecord};
use vreg_metadata::repos::{AuditRepo, CacheEntryRepo, CleanupPolicyRepo, UpstreamRepo};
use vreg_metadata::{MetadataError, MetadataStore};

/// Largest accepted batch.
const MAX_BATCH_SIZE: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("cleanup policy missing")]
    NoPolicy,

    #[error("no cleanup policy for group {0}")]
    PolicyMissing(Uuid),

    #[error("cleanup already running for group {0}")]
    AlreadyRunning(Uuid),

    #[error("{0}")]
    NotRunnable(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Knobs for a cleanup run.
#[derive(Debug, Clone, Copy)]
pub struct CleanupSettings {
    pub batch_size: u32,
    pub max_batches_per_upstream: u64,
    pub lease_ttl: Duration,
}

impl CleanupSettings {
    pub fn from_config(cleanup: &CleanupConfig, locks: &LockConfig) -> Self {
        Self {
            batch_size: cleanup.batch_size.clamp(1, MAX_BATCH_SIZE),
            max_batches_per_upstream: cleanup.max_batches_per_upstream.max(1),
            lease_ttl: locks.cleanup_ttl(),
        }
    }
}

/// Lease key serializing runs of one group.
pub fn cleanup_lock_key(group_id: Uuid) -> String {
    format!("vreg:cleanup:{group_id}")
}

/// Result of a scheduled or manual run, as recorded on the policy.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupRunReport {
    pub group_id: Uuid,
    pub status: CleanupStatus,
    pub deleted_entries_count: u64,
    pub deleted_size: u64,
    pub detailed_metrics: CleanupMetrics,
    #[serde(with = "time::serde::rfc3339")]
    pub next_run_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

#[derive(Clone)]
pub struct CleanupPolicyExecutor {
    metadata: Arc<dyn MetadataStore>,
    locks: LockManager,
    settings: CleanupSettings,
}

impl CleanupPolicyExecutor {
    pub fn new(metadata: Arc<dyn MetadataStore>, locks: LockManager, settings: CleanupSettings) -> Self {
        Self {
            metadata,
            locks,
            settings,
        }
    }

    /// Mark the group's expired cache entries pending destruction and return
    /// the counts per registry type.
    ///
    /// A missing policy fails before anything is touched. This does not move
    /// the policy through its status lifecycle; see [`Self::run_policy`].
    pub async fn execute(
        &self,
        policy: Option<&CleanupPolicyRow>,
        now: OffsetDateTime,
    ) -> Result<CleanupMetrics, CleanupError> {
        let policy = policy.ok_or(CleanupError::NoPolicy)?;
        let mut totals = CleanupMetrics::new();
        self.execute_into(policy, now, &mut totals).await?;
        Ok(totals)
    }

    /// Claim the group's policy, execute it and record the outcome.
    ///
    /// Execution failures are recorded on the policy (status `failed`) and
    /// reported in the returned report. Errors are returned only when the
    /// run could not start or its outcome could not be stored.
    #[instrument(skip(self), fields(group_id = %group_id))]
    pub async fn run_policy(
        &self,
        group_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<CleanupRunReport, CleanupError> {
        let policy = self
            .metadata
            .get_cleanup_policy(group_id)
            .await?
            .ok_or(CleanupError::PolicyMissing(group_id))?;
        if !policy.enabled {
            return Err(CleanupError::NotRunnable(format!(
                "cleanup policy for group {group_id} is disabled"
            )));
        }
        let cadence = policy.cadence()?;

        if !self.metadata.claim_cleanup_run(group_id, now).await? {
            return match policy.status()? {
                CleanupStatus::Running => Err(CleanupError::AlreadyRunning(group_id)),
                status => Err(CleanupError::NotRunnable(format!(
                    "cleanup policy for group {group_id} is {status}"
                ))),
            };
        }

        metrics::CLEANUP_JOBS_ACTIVE.inc();
        let mut totals = CleanupMetrics::new();
        let result = self.execute_into(&policy, now, &mut totals).await;
        metrics::CLEANUP_JOBS_ACTIVE.dec();

        let finished_at = OffsetDateTime::now_utc();
        let failure_message = result.err().map(|e| e.to_string());
        let record = CleanupRunRecord {
            finished_at,
            next_run_at: cadence.next_run_after(now),
            deleted_entries_count: totals.total_count(),
            deleted_size: totals.total_size(),
            metrics: totals.clone(),
            failure_message: failure_message.clone(),
        };
        self.metadata.finish_cleanup_run(group_id, &record).await?;

        let status = if failure_message.is_some() {
            CleanupStatus::Failed
        } else {
            CleanupStatus::Scheduled
        };
        notify(&policy, status, &record);

        Ok(CleanupRunReport {
            group_id,
            status,
            deleted_entries_count: record.deleted_entries_count,
            deleted_size: record.deleted_size,
            detailed_metrics: totals,
            next_run_at: record.next_run_at,
            failure_message,
        })
    }

    async fn execute_into(
        &self,
        policy: &CleanupPolicyRow,
        now: OffsetDateTime,
        totals: &mut CleanupMetrics,
    ) -> Result<(), CleanupError> {
        let keep_days = u32::try_from(policy.keep_n_days_after_download)
            .map_err(|_| {
                CleanupError::NotRunnable(format!(
                    "invalid retention of {} days",
                    policy.keep_n_days_after_download
                ))
            })
            .and_then(|d| validate_keep_days(d).map_err(|e| CleanupError::NotRunnable(e.to_string())))?;
        let cutoff = now - time::Duration::days(i64::from(keep_days));

        let key = cleanup_lock_key(policy.group_id);
        let lease = self
            .locks
            .try_acquire(&key, self.settings.lease_ttl)
            .await?
            .ok_or(CleanupError::AlreadyRunning(policy.group_id))?;

        let result = self.mark_expired(policy.group_id, cutoff, totals).await;

        if let Err(e) = lease.release().await {
            warn!(group_id = %policy.group_id, error = %e, "failed to release cleanup lease");
        }

        match &result {
            Ok(()) => info!(
                group_id = %policy.group_id,
                deleted_entries_count = totals.total_count(),
                deleted_size = totals.total_size(),
                "cleanup finished"
            ),
            Err(e) => error!(
                group_id = %policy.group_id,
                deleted_entries_count = totals.total_count(),
                deleted_size = totals.total_size(),
                error = %e,
                "cleanup failed"
            ),
        }
        result
    }

    async fn mark_expired(
        &self,
        group_id: Uuid,
        cutoff: OffsetDateTime,
        totals: &mut CleanupMetrics,
    ) -> Result<(), CleanupError> {
        for registry_type in RegistryType::ALL {
            let upstreams = self
                .metadata
                .list_group_upstreams(group_id, registry_type.as_str())
                .await?;

            for upstream in upstreams.iter().filter(|u| !u.is_local()) {
                let mut after = None;
                let mut batches: u64 = 0;

                loop {
                    if batches >= self.settings.max_batches_per_upstream {
                        warn!(
                            upstream_id = %upstream.upstream_id,
                            batches,
                            "batch limit reached, remaining entries wait for the next run"
                        );
                        break;
                    }

                    let batch = self
                        .metadata
                        .find_eligible_for_cleanup(
                            upstream.upstream_id,
                            cutoff,
                            self.settings.batch_size,
                            after,
                        )
                        .await?;
                    let Some(last) = batch.last() else { break };
                    after = Some(last.entry_id);
                    batches += 1;

                    let ids: Vec<Uuid> = batch.iter().map(|e| e.entry_id).collect();
                    let marked = self
                        .metadata
                        .mark_pending_destruction(&ids, cutoff)
                        .await?;
                    let count = marked.len() as u64;
                    let size: u64 = marked
                        .iter()
                        .map(|e| u64::try_from(e.size_bytes).unwrap_or(0))
                        .sum();
                    if !marked.is_empty() {
                        self.metadata
                            .record_audit_event(&audit::entries_marked(
                                group_id,
                                upstream.upstream_id,
                                registry_type.as_str(),
                                &marked,
                            ))
                            .await?;
                    }
                    totals.record(registry_type, count, size);
                    metrics::CLEANUP_ENTRIES_MARKED.inc_by(count);
                    metrics::CLEANUP_BYTES_MARKED.inc_by(size);
                    debug!(upstream_id = %upstream.upstream_id, count, size, "batch marked");

                    if batch.len() < self.settings.batch_size as usize {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

fn notify(policy: &CleanupPolicyRow, status: CleanupStatus, record: &CleanupRunRecord) {
    match status {
        CleanupStatus::Failed => {
            metrics::CLEANUP_RUNS.with_label_values(&["failure"]).inc();
            if policy.notify_on_failure {
                warn!(
                    target: "vreg::notifications",
                    group_id = %policy.group_id,
                    failure_message = record.failure_message.as_deref().unwrap_or_default(),
                    deleted_entries_count = record.deleted_entries_count,
                    "virtual registry cache cleanup failed"
                );
            }
        }
        _ => {
            metrics::CLEANUP_RUNS.with_label_values(&["success"]).inc();
            if policy.notify_on_success {
                info!(
                    target: "vreg::notifications",
                    group_id = %policy.group_id,
                    deleted_entries_count = record.deleted_entries_count,
                    deleted_size = record.deleted_size,
                    "virtual registry cache cleanup succeeded"
                );
            }
        }
    }
}

/// Start every due policy not already being tracked. Returns how many runs
/// were spawned.
pub async fn run_due_policies(
    executor: &CleanupPolicyExecutor,
    registry: &CleanupTaskRegistry,
    now: OffsetDateTime,
    limit: u32,
) -> Result<usize, MetadataError> {
    let due = executor.metadata.next_runnable_schedule(now, limit).await?;
    let mut spawned = 0;

    for policy in due {
        let group_id = policy.group_id;
        if registry.is_tracked(group_id).await {
            continue;
        }
        let executor = executor.clone();
        let handle = tokio::spawn(async move {
            match executor.run_policy(group_id, now).await {
                Ok(report) => debug!(group_id = %group_id, status = %report.status, "scheduled cleanup done"),
                Err(CleanupError::AlreadyRunning(_)) => {
                    debug!(group_id = %group_id, "cleanup already running elsewhere, skipping")
                }
                Err(e) => error!(group_id = %group_id, error = %e, "scheduled cleanup could not run"),
            }
        });
        registry.register(group_id, handle).await;
        spawned += 1;
    }
    Ok(spawned)
}

/// Background loop starting due policies every `interval`.
pub fn spawn_scheduler(
    executor: CleanupPolicyExecutor,
    registry: Arc<CleanupTaskRegistry>,
    interval: Duration,
    limit: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "cleanup scheduler enabled");
        loop {
            tokio::time::sleep(interval).await;
            match run_due_policies(&executor, &registry, OffsetDateTime::now_utc(), limit).await {
                Ok(0) => {}
                Ok(n) => info!(started = n, "cleanup runs started"),
                Err(e) => error!(error = %e, "failed to load due cleanup policies"),
            }
        }
    })
}
