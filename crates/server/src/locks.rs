//! Exclusive, time-bounded leases.
//!
//! Cache fills and cleanup runs take a lease keyed by what they work on so
//! that only one holder does the work at a time. The default backend stores
//! leases in the metadata database, which makes them visible to every
//! process sharing it; a process-local backend exists for single-node setups
//! and tests.

use crate::metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;
use vreg_core::config::{LockBackendKind, LockConfig};
use vreg_metadata::MetadataStore;

/// Lease errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms waiting for lease {key}")]
    Timeout { key: String, waited_ms: u64 },

    #[error("lease backend error: {0}")]
    Backend(String),
}

/// Storage for leases.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Take `key` for `holder` if it is free or expired.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Release `key` if `holder` still owns it.
    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError>;
}

/// Leases in the metadata store's `leases` table.
pub struct MetadataLeaseBackend {
    metadata: Arc<dyn MetadataStore>,
}

impl MetadataLeaseBackend {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl LeaseBackend for MetadataLeaseBackend {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = OffsetDateTime::now_utc();
        let ttl = time::Duration::try_from(ttl).map_err(|e| LockError::Backend(e.to_string()))?;
        self.metadata
            .try_acquire_lease(key, holder, now, now + ttl)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError> {
        self.metadata
            .release_lease(key, holder)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}

/// Process-local leases.
#[derive(Default)]
pub struct MemoryLeaseBackend {
    leases: DashMap<String, (String, Instant)>,
}

impl MemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseBackend for MemoryLeaseBackend {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().1 <= now {
                    occupied.insert((holder.to_string(), now + ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert((holder.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, LockError> {
        Ok(self
            .leases
            .remove_if(key, |_, (owner, _)| owner == holder)
            .is_some())
    }
}

/// Hands out leases on behalf of this process.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LeaseBackend>,
    node_id: String,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LeaseBackend>) -> Self {
        Self {
            backend,
            node_id: format!("vregd-{}", Uuid::new_v4()),
        }
    }

    /// Build the manager for the configured backend.
    pub fn from_config(config: &LockConfig, metadata: Arc<dyn MetadataStore>) -> Self {
        let backend: Arc<dyn LeaseBackend> = match config.backend {
            LockBackendKind::Metadata => Arc::new(MetadataLeaseBackend::new(metadata)),
            LockBackendKind::Memory => Arc::new(MemoryLeaseBackend::new()),
        };
        Self::new(backend)
    }

    /// Take the lease once, without waiting.
    pub async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LeaseGuard>, LockError> {
        // Each guard gets its own holder id so two tasks in this process
        // never mistake each other's lease for their own.
        let holder = format!("{}:{}", self.node_id, Uuid::new_v4());
        if self.backend.try_acquire(key, &holder, ttl).await? {
            debug!(%key, %holder, "lease acquired");
            Ok(Some(LeaseGuard {
                backend: Some(self.backend.clone()),
                key: key.to_string(),
                holder,
            }))
        } else {
            Ok(None)
        }
    }

    /// Take the lease, retrying every `retry_interval` until `max_wait` elapses.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retry_interval: Duration,
        max_wait: Duration,
    ) -> Result<LeaseGuard, LockError> {
        let started = tokio::time::Instant::now();
        let deadline = started + max_wait;

        loop {
            if let Some(guard) = self.try_acquire(key, ttl).await? {
                metrics::LOCK_WAIT_SECONDS.observe(started.elapsed().as_secs_f64());
                return Ok(guard);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                metrics::LOCK_TIMEOUTS.inc();
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                warn!(%key, waited_ms, "gave up waiting for lease");
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited_ms,
                });
            }

            tokio::time::sleep(retry_interval.min(remaining)).await;
        }
    }
}

/// A held lease. Released by [`LeaseGuard::release`] or, best effort, on drop.
pub struct LeaseGuard {
    backend: Option<Arc<dyn LeaseBackend>>,
    key: String,
    holder: String,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lease now.
    pub async fn release(mut self) -> Result<(), LockError> {
        if let Some(backend) = self.backend.take() {
            let released = backend.release(&self.key, &self.holder).await?;
            if released {
                debug!(key = %self.key, "lease released");
            } else {
                warn!(key = %self.key, "lease expired or taken over before release");
            }
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);
        // Without a runtime the lease simply expires after its ttl.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = backend.release(&key, &holder).await {
                    warn!(%key, error = %e, "failed to release dropped lease");
                }
            });
        }
    }
}
