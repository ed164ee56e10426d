//! Prometheus metrics for the registry proxy.
//!
//! Covers cache hits and misses, upstream traffic, lease contention and
//! cleanup runs. Labels never carry group ids, paths or upstream URLs.
//!
//! The `/metrics` endpoint is unauthenticated and must be network-restricted
//! to the Prometheus scrapers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Read path
pub static CACHE_HITS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "vreg_cache_hits_total",
            "Requests answered without resolution, by source (cache or local)",
        ),
        &["source"],
    )
    .expect("metric creation failed")
});

pub static CACHE_MISSES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_cache_misses_total",
        "Requests that required upstream resolution",
    )
    .expect("metric creation failed")
});

pub static REVALIDATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "vreg_cache_revalidations_total",
            "Stale cache entries checked against their upstream, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

// Upstream traffic
pub static UPSTREAM_PROBES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "vreg_upstream_probes_total",
            "Existence checks sent to remote upstreams, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static UPSTREAM_FILLS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "vreg_upstream_fills_total",
            "Cache fills from remote upstreams, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static BYTES_FILLED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_bytes_filled_total",
        "Bytes downloaded from upstreams into the cache",
    )
    .expect("metric creation failed")
});

pub static FILL_DURATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "vreg_fill_duration_seconds",
            "Time taken to download and commit one artifact",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
    )
    .expect("metric creation failed")
});

// Leases
pub static LOCK_WAIT_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("vreg_lock_wait_seconds", "Time spent waiting for a lease")
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
    )
    .expect("metric creation failed")
});

pub static LOCK_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_lock_timeouts_total",
        "Lease acquisitions that gave up waiting",
    )
    .expect("metric creation failed")
});

// Uploads
pub static UPLOADS_COMMITTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_uploads_committed_total",
        "Artifacts pushed into the cache by the front proxy",
    )
    .expect("metric creation failed")
});

pub static BYTES_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_bytes_uploaded_total",
        "Bytes pushed into the cache by the front proxy",
    )
    .expect("metric creation failed")
});

// Cleanup
pub static CLEANUP_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "vreg_cleanup_runs_total",
            "Cleanup policy executions, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static CLEANUP_ENTRIES_MARKED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_cleanup_entries_marked_total",
        "Cache entries marked for destruction",
    )
    .expect("metric creation failed")
});

pub static CLEANUP_BYTES_MARKED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "vreg_cleanup_bytes_marked_total",
        "Bytes of cache entries marked for destruction",
    )
    .expect("metric creation failed")
});

pub static CLEANUP_JOBS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("vreg_cleanup_jobs_active", "Cleanup runs currently in flight")
        .expect("metric creation failed")
});

pub static CLEANUP_JOBS_PANICKED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("vreg_cleanup_jobs_panicked_total", "Cleanup runs that panicked")
        .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so integration tests can build several routers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(CACHE_HITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_MISSES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REVALIDATIONS.clone()))
            .expect("metric registration failed");

        REGISTRY
            .register(Box::new(UPSTREAM_PROBES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPSTREAM_FILLS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_FILLED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FILL_DURATION_SECONDS.clone()))
            .expect("metric registration failed");

        REGISTRY
            .register(Box::new(LOCK_WAIT_SECONDS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(LOCK_TIMEOUTS.clone()))
            .expect("metric registration failed");

        REGISTRY
            .register(Box::new(UPLOADS_COMMITTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_UPLOADED.clone()))
            .expect("metric registration failed");

        // Cleanup
        REGISTRY
            .register(Box::new(CLEANUP_RUNS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CLEANUP_ENTRIES_MARKED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CLEANUP_BYTES_MARKED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CLEANUP_JOBS_ACTIVE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CLEANUP_JOBS_PANICKED.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}
