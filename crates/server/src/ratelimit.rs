//! Per-IP rate limiting, keyed by endpoint scope.
//!
//! Each `(scope, client ip)` pair gets its own token bucket, so heavy artifact
//! pulls do not starve the admin API of the same client and vice versa.
//!
//! Tracked keys are bounded by `max_entries` and evicted after `entry_ttl_secs`
//! of inactivity by a background task. Forwarded headers are only honoured
//! for connections from `trusted_proxies`.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::{DashMap, mapref::entry::Entry};
use governor::{
    Quota, RateLimiter, clock::DefaultClock, middleware::NoOpMiddleware, state::InMemoryState,
};
use ipnet::IpNet;
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use vreg_core::config::RateLimitConfig;

/// Scope of artifact downloads through a virtual registry.
pub const SCOPE_REGISTRY_SHOW: &str = "virtual_registries_endpoints_api_limit";
/// Scope of the admin API.
pub const SCOPE_ADMIN_API: &str = "admin_api";

type KeyedLimiter =
    RateLimiter<String, DashMap<String, InMemoryState>, DefaultClock, NoOpMiddleware>;

/// Rate limiter state shared across requests.
#[derive(Clone)]
pub struct RateLimitState {
    inner: Option<Arc<RateLimitStateInner>>,
}

/// Rebuild the governor map once this share of keys has been evicted.
const REBUILD_EVICTION_THRESHOLD_FRACTION: f64 = 0.10;
const REBUILD_EVICTION_MIN_COUNT: usize = 100;
/// Rebuild at least this often when anything was evicted.
const REBUILD_MIN_INTERVAL: Duration = Duration::from_secs(300);

struct RateLimitStateInner {
    limiter: RwLock<KeyedLimiter>,
    last_access: DashMap<String, Instant>,
    trusted_proxies: TrustedProxies,
    max_entries: u32,
    entry_ttl: Duration,
    quota: Quota,
    last_rebuild: RwLock<Instant>,
    connect_info_warned: AtomicBool,
    at_capacity_warned: AtomicBool,
}

#[derive(Clone, Debug)]
enum TrustedEntry {
    Ip(IpAddr),
    Cidr(IpNet),
}

#[derive(Clone, Debug)]
enum TrustedProxies {
    None,
    All,
    List(Vec<TrustedEntry>),
}

impl TrustedProxies {
    fn from_config(proxies: &[String]) -> Self {
        if proxies.is_empty() {
            return Self::None;
        }
        if proxies.len() == 1 && proxies[0] == "*" {
            return Self::All;
        }
        let entries = proxies
            .iter()
            .filter_map(|p| {
                let parsed = if p.contains('/') {
                    p.parse::<IpNet>().map(TrustedEntry::Cidr).map_err(|e| e.to_string())
                } else {
                    p.parse::<IpAddr>().map(TrustedEntry::Ip).map_err(|e| e.to_string())
                };
                parsed
                    .inspect_err(|e| tracing::warn!(entry = %p, error = %e, "ignoring invalid trusted proxy"))
                    .ok()
            })
            .collect();
        Self::List(entries)
    }

    fn is_trusted(&self, connection_ip: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::List(entries) => {
                let Ok(ip) = connection_ip.parse::<IpAddr>() else {
                    return false;
                };
                entries.iter().any(|entry| match entry {
                    TrustedEntry::Ip(trusted) => *trusted == ip,
                    TrustedEntry::Cidr(network) => network.contains(&ip),
                })
            }
        }
    }
}

impl RateLimitState {
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self { inner: None };
        }

        let per_minute = NonZeroU32::new(config.ip_requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(per_minute).allow_burst(burst);

        Self {
            inner: Some(Arc::new(RateLimitStateInner {
                limiter: RwLock::new(RateLimiter::dashmap(quota)),
                last_access: DashMap::new(),
                trusted_proxies: TrustedProxies::from_config(&config.trusted_proxies),
                max_entries: config.max_entries,
                entry_ttl: Duration::from_secs(config.entry_ttl_secs),
                quota,
                last_rebuild: RwLock::new(Instant::now()),
                connect_info_warned: AtomicBool::new(false),
                at_capacity_warned: AtomicBool::new(false),
            })),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Check one request of `ip` against the bucket of `scope`.
    pub fn check(&self, scope: &str, ip: &str) -> Result<(), RateLimitError> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        let key = format!("{scope}:{ip}");
        let now = Instant::now();

        // len() before entry(): DashMap can deadlock if len() runs while an
        // entry guard is held.
        let current_len = inner.last_access.len();
        match inner.last_access.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.insert(now);
            }
            Entry::Vacant(entry) => {
                if current_len >= inner.max_entries as usize {
                    if !inner.at_capacity_warned.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            current_entries = current_len,
                            max_entries = inner.max_entries,
                            "rate limiter at capacity, rejecting new clients"
                        );
                    }
                    return Err(RateLimitError {
                        retry_after_secs: 60,
                        reason: RateLimitReason::AtCapacity,
                    });
                }
                entry.insert(now);
            }
        }

        let limiter = inner.limiter.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        limiter.check_key(&key).map_err(|not_until| {
            let wait = not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()));
            RateLimitError {
                retry_after_secs: wait.as_secs() + 1,
                reason: RateLimitReason::RateLimited,
            }
        })
    }

    /// Evict keys idle for longer than the TTL. Returns the number evicted.
    ///
    /// governor's map cannot drop keys, so the limiter itself is rebuilt when
    /// enough keys went away. A rebuild resets every bucket.
    pub fn cleanup(&self) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };

        let now = Instant::now();
        let ttl = inner.entry_ttl;
        let stale: Vec<String> = inner
            .last_access
            .iter()
            .filter(|entry| now.duration_since(*entry.value()) > ttl)
            .map(|entry| entry.key().clone())
            .collect();

        let evicted = stale
            .into_iter()
            .filter(|key| {
                inner
                    .last_access
                    .remove_if(key, |_, last| now.duration_since(*last) > ttl)
                    .is_some()
            })
            .count();

        if evicted > 0 {
            let before = inner.last_access.len() + evicted;
            let threshold = ((before as f64 * REBUILD_EVICTION_THRESHOLD_FRACTION) as usize)
                .max(REBUILD_EVICTION_MIN_COUNT);
            let interval_elapsed = {
                let last = inner.last_rebuild.read().unwrap_or_else(|p| p.into_inner());
                now.duration_since(*last) >= REBUILD_MIN_INTERVAL
            };
            if evicted >= threshold || interval_elapsed {
                *inner.limiter.write().unwrap_or_else(|p| p.into_inner()) =
                    RateLimiter::dashmap(inner.quota);
                *inner.last_rebuild.write().unwrap_or_else(|p| p.into_inner()) = Instant::now();
                tracing::debug!(evicted, remaining = inner.last_access.len(), "rebuilt rate limiter");
            }
            inner.at_capacity_warned.store(false, Ordering::Relaxed);
        }
        evicted
    }

    pub fn entry_count(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.last_access.len())
    }

    /// Client address of a request, honouring forwarded headers only from
    /// trusted proxies.
    pub fn client_ip(&self, req: &Request<Body>) -> String {
        let Some(inner) = &self.inner else {
            return "unknown".to_string();
        };

        let connection_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string());

        let trust_headers = match &connection_ip {
            Some(ip) => inner.trusted_proxies.is_trusted(ip),
            None => matches!(inner.trusted_proxies, TrustedProxies::All),
        };
        if trust_headers && let Some(forwarded) = forwarded_ip(req) {
            return forwarded;
        }

        connection_ip.unwrap_or_else(|| {
            if !inner.connect_info_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "ConnectInfo not available, all clients share one rate limit bucket; \
                     serve with into_make_service_with_connect_info::<SocketAddr>()"
                );
            }
            "unknown".to_string()
        })
    }
}

fn forwarded_ip(req: &Request<Body>) -> Option<String> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(s) = forwarded.to_str()
        && let Some(first) = s.split(',').next()
    {
        return Some(first.trim().to_string());
    }
    req.headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitReason {
    RateLimited,
    AtCapacity,
}

#[derive(Debug)]
pub struct RateLimitError {
    pub retry_after_secs: u64,
    pub reason: RateLimitReason,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        let (code, message) = match self.reason {
            RateLimitReason::RateLimited => (
                "rate_limit_exceeded",
                format!(
                    "Rate limit exceeded. Retry after {} seconds.",
                    self.retry_after_secs
                ),
            ),
            RateLimitReason::AtCapacity => (
                "rate_limiter_at_capacity",
                "Server is experiencing high load. Please retry later.".to_string(),
            ),
        };

        let body = serde_json::json!({
            "code": code,
            "message": message,
            "retry_after": self.retry_after_secs,
        });

        (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", self.retry_after_secs.to_string())],
            axum::Json(body),
        )
            .into_response()
    }
}

/// Rate limit middleware for the admin API.
pub async fn admin_rate_limit_middleware(
    State(rate_limit): State<RateLimitState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !rate_limit.is_enabled() {
        return next.run(req).await;
    }
    let ip = rate_limit.client_ip(&req);
    match rate_limit.check(SCOPE_ADMIN_API, &ip) {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

/// Periodically evict idle keys.
pub fn spawn_cleanup_task(state: RateLimitState, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let evicted = state.cleanup();
            if evicted > 0 {
                tracing::info!(evicted, "rate limiter evicted idle clients");
            }
        }
    })
}
