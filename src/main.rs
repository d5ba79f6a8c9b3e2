mod api;
mod cluster;
mod config;
mod executor;
mod metrics;
mod probe;
mod protocol;
mod router;
mod service;
mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use cluster::Cluster;
use config::Config;
use executor::QueryExecutor;
use probe::LatencyProbe;
use router::ReplicaSelector;
use service::{RoutingOptions, RoutingService};
use tunnel::{SshForwarder, TunnelManager};

/// Environment variable naming an explicit config file
const CONFIG_ENV: &str = "REPLICA_ROUTER_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_config()?;
    let cluster = Arc::new(Cluster::from_config(&config).context("Invalid configuration")?);

    info!(
        primary = %cluster.primary().addr(),
        secondaries = cluster.secondaries().len(),
        query = %config.database.query,
        "Cluster configured"
    );

    // Tunnels come up before the listener accepts anything
    let tunnel_manager = TunnelManager::new(Arc::new(SshForwarder::new(config.tunnel.clone())));
    let report = tunnel_manager
        .start(cluster.secondaries(), cluster.primary())
        .await
        .context("Failed to start tunnels")?;
    let tunnels = Arc::new(report.table);
    if !report.failures.is_empty() {
        let failed: Vec<&str> = report.failures.iter().map(|(name, _)| name.as_str()).collect();
        if config.tunnel.require_all {
            tunnel_manager.stop(&tunnels).await;
            anyhow::bail!("Tunnels failed to start: {}", failed.join(", "));
        }
        warn!(failed = ?failed, "Continuing without some tunnels");
    }
    if tunnels.is_empty() {
        warn!("No tunnel is up; only the primary can serve requests");
    }

    let service = Arc::new(RoutingService::new(
        cluster.clone(),
        tunnels.clone(),
        ReplicaSelector::new(LatencyProbe::tcp(&config.probe)),
        QueryExecutor::mysql(&config.database),
        RoutingOptions::from(&config),
    ));
    let app = api::create_router(service);

    let addr = config.server.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tunnel_manager.stop(&tunnels).await;
            return Err(e).with_context(|| format!("Failed to bind {}", addr));
        }
    };

    info!(addr = %addr, "Replica router listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tunnel_manager.stop(&tunnels).await;
    served.context("Server error")?;
    info!("Replica router stopped");
    Ok(())
}

/// Load the first config file found
///
/// `$REPLICA_ROUTER_CONFIG` wins when set. There is no built-in topology, so
/// finding no usable file is fatal.
fn load_config() -> anyhow::Result<Config> {
    let config_paths: Vec<PathBuf> = match std::env::var_os(CONFIG_ENV) {
        Some(path) => vec![PathBuf::from(path)],
        None => vec![
            PathBuf::from("config/replica-router.toml"),
            PathBuf::from("replica-router.toml"),
        ],
    };

    for path in &config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded configuration");
                return Ok(config);
            }
            Err(config::ConfigError::IoError(e)) => {
                warn!(path = %path.display(), error = %e, "Failed to read config");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Invalid config file {}", path.display()));
            }
        }
    }

    anyhow::bail!(
        "No configuration found (tried {:?}; set {} to choose a file)",
        config_paths,
        CONFIG_ENV
    )
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
