//! Virtual registry server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vreg_core::config::AppConfig;
use vreg_server::bootstrap::ensure_admin_token;
use vreg_server::state::CleanupTaskRegistry;
use vreg_server::{AppState, cleanup, create_router, ratelimit};

/// vreg - pull-through caching proxy for Maven and container registries
#[derive(Parser, Debug)]
#[command(name = "vregd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "VREG_CONFIG", default_value = "config/server.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("vreg v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    vreg_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = vreg_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!("Storage backend connectivity verified");

    let metadata = vreg_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    ensure_admin_token(metadata.as_ref(), &config.admin).await?;

    // Runs interrupted by the previous process would otherwise stay `running`.
    let orphaned = metadata
        .fail_orphaned_cleanup_runs("server restarted during cleanup run", OffsetDateTime::now_utc())
        .await
        .context("failed to recover orphaned cleanup runs")?;
    for group_id in &orphaned {
        tracing::warn!(group_id = %group_id, "Orphaned cleanup run marked failed");
    }

    let cleanup_tasks = Arc::new(CleanupTaskRegistry::new(metadata.clone()));
    let _watchdog_handle = cleanup_tasks.clone().spawn_watchdog();
    tracing::info!("Cleanup task watchdog spawned");

    let state = AppState::new(config.clone(), storage, metadata, cleanup_tasks.clone())
        .context("failed to build upstream client")?;

    if let Some(interval) = state.rate_limit_cleanup_interval() {
        ratelimit::spawn_cleanup_task(state.rate_limit.clone(), interval);
        tracing::info!(
            interval_secs = interval.as_secs(),
            "Rate limiter cleanup task spawned"
        );
    }

    if config.cleanup.scheduler_enabled {
        cleanup::spawn_scheduler(
            state.cleanup.clone(),
            cleanup_tasks,
            config.cleanup.scheduler_interval(),
            config.cleanup.max_policies_per_tick,
        );
    } else {
        tracing::info!("Cleanup scheduler disabled");
    }

    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    // ConnectInfo feeds client IP extraction for rate limiting.
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Load configuration from the TOML file (optional) and `VREG_*` variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("VREG_") && key != "VREG_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: vregd --config /path/to/config.toml\n  \
             2. Environment variables: VREG_SERVER__BIND=0.0.0.0:8080 \
             VREG_ADMIN__TOKEN_HASH=sha256:YOUR_TOKEN_HASH_HERE vregd\n\n\
             See config/server.example.toml for example configuration."
        );
    }

    figment
        .merge(Env::prefixed("VREG_").split("__"))
        .extract()
        .context("failed to load configuration")
}
