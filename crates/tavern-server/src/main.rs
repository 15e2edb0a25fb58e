// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tavern_actions::{JsonStore, MemoryStore};
use tavern_config::{BrokerConfig, load_config, validate_config};
use tavern_protocol::now_epoch;
use tavern_server::{AppState, BrokerTiming, ConnectionManager, LocalPresigner, build_app};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tavern-server", version, about = "Realtime tabletop session broker")]
struct Args {
    /// Bind address (overrides the config file).
    #[arg(long)]
    bind: Option<String>,

    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for persisted tables and characters (overrides the config
    /// file). Without one, state lives in memory only.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Base URL of the blob store used for presigned asset transfers.
    #[arg(long)]
    blob_base_url: Option<String>,

    /// Additional newline-delimited TCP bind address for legacy clients.
    #[arg(long)]
    legacy_bind: Option<String>,

    /// Enable verbose protocol logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("load config")?;
    apply_cli_overrides(&mut config, &args);

    let filter = if args.debug {
        EnvFilter::new("tavern=debug,tavern_server=debug")
    } else {
        EnvFilter::new(
            config
                .log_level
                .as_deref()
                .map(|level| format!("tavern={level},tavern_server={level}"))
                .unwrap_or_else(|| "tavern=info".to_string()),
        )
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for warning in validate_config(&config).context("validate config")? {
        warn!(%warning, "config warning");
    }

    let timing = BrokerTiming::from(&config.timing);
    let manager = match &config.data_dir {
        Some(dir) => {
            let store = Arc::new(JsonStore::new(dir));
            info!(data_dir = %dir, "persisting session state to disk");
            ConnectionManager::new(store.clone(), store, presigner(&config), timing)
        }
        None => {
            let store = Arc::new(MemoryStore::new());
            warn!("no data_dir configured, session state is volatile");
            ConnectionManager::new(store.clone(), store, presigner(&config), timing)
        }
    };

    let state = Arc::new(AppState {
        manager,
        started_at: now_epoch(),
    });
    let app = build_app(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(bind = %config.bind, "tavern-server listening");

    if let Some(legacy_bind) = &args.legacy_bind {
        let legacy_listener = tokio::net::TcpListener::bind(legacy_bind)
            .await
            .with_context(|| format!("bind legacy {legacy_bind}"))?;
        let legacy_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = tavern_server::serve_legacy_tcp(legacy_listener, legacy_state).await {
                tracing::error!(error = %e, "legacy endpoint failed");
            }
        });
    }

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining sessions");
            shutdown_state.manager.shutdown().await;
        })
        .await
        .context("serve")
}

fn apply_cli_overrides(config: &mut BrokerConfig, args: &Args) {
    if let Some(bind) = &args.bind {
        config.bind = bind.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = Some(data_dir.display().to_string());
    }
    if let Some(blob_base_url) = &args.blob_base_url {
        config.blob_base_url = Some(blob_base_url.clone());
    }
}

fn presigner(config: &BrokerConfig) -> Arc<LocalPresigner> {
    let base = config
        .blob_base_url
        .clone()
        .unwrap_or_else(|| format!("http://{}/blobs", config.bind));
    Arc::new(LocalPresigner::new(base, config.timing.presign_expiry_secs))
}
