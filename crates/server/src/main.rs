//! DirectDriveX upload server binary.

use anyhow::{Context, Result};
use clap::Parser;
use drivex_core::config::AppConfig;
use drivex_metadata::MetadataStore;
use drivex_server::memory::MemoryMonitor;
use drivex_server::{AppState, create_router};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// DirectDriveX - chunked upload relay server
#[derive(Parser, Debug)]
#[command(name = "drivexd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "DRIVEX_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Startup banner
    tracing::info!("DirectDriveX v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    // Register Prometheus metrics
    drivex_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    // Initialize the primary destination and verify it before accepting uploads.
    let storage = drivex_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend initialized");

    let backup = match &config.backup {
        Some(backup_config) => {
            let backup = drivex_storage::from_config(backup_config)
                .await
                .context("failed to initialize backup storage")?;
            backup
                .health_check()
                .await
                .context("backup storage health check failed")?;
            tracing::info!(backend = backup.backend_name(), "Backup destination initialized");
            Some(backup)
        }
        None => {
            tracing::info!("No backup destination configured");
            None
        }
    };

    // Initialize metadata store
    let metadata = drivex_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    recover_interrupted_sessions(&metadata).await?;

    let memory = Arc::new(MemoryMonitor::from_config(&config.upload));
    tracing::info!(
        total_bytes = memory.total_bytes(),
        ceiling_bytes = memory.ceiling_bytes(),
        "Memory monitor initialized"
    );
    let _sampler_handle = memory
        .clone()
        .spawn_sampler(config.upload.memory_sample_interval());

    // Create application state
    let state = AppState::new(config.clone(), storage, backup, metadata, memory);

    // Spawn watchdog task to detect panicked backup copies
    if let Some(registry) = &state.backup_registry {
        let _watchdog_handle = registry.clone().spawn_watchdog();
        tracing::info!("Backup task watchdog spawned");
    }

    // Create router
    let app = create_router(state);

    // Parse bind address
    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Load configuration (file is optional, env vars can provide/override everything).
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

    // Check for DRIVEX_ environment variables (excluding DRIVEX_CONFIG which is just the path)
    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("DRIVEX_") && key != "DRIVEX_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: drivexd --config /path/to/config.toml\n  \
             2. Environment variables: DRIVEX_SERVER__BIND=0.0.0.0:8080 \
             DRIVEX_STORAGE__TYPE=filesystem DRIVEX_STORAGE__PATH=./data/storage drivexd\n\n\
             See config/server.example.toml for example configuration.\n\
             Set DRIVEX_CONFIG env var to specify a default config file path."
        );
    }

    if !has_config_file {
        tracing::info!("Using environment variables for configuration");
    }

    figment
        .merge(Env::prefixed("DRIVEX_").split("__"))
        .extract()
        .context("failed to load configuration")
}

/// Fail sessions left `uploading` by a previous process.
///
/// Their admission tickets and destination sessions died with that process,
/// so nothing will ever finish them.
async fn recover_interrupted_sessions(metadata: &Arc<dyn MetadataStore>) -> Result<()> {
    let recovered = metadata
        .recover_interrupted(OffsetDateTime::now_utc())
        .await
        .context("failed to recover interrupted uploads")?;

    if recovered > 0 {
        tracing::warn!(
            count = recovered,
            "Marked uploads interrupted by the previous server instance as failed"
        );
    }
    Ok(())
}
