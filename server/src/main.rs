//! Speed test server
//!
//! Serves the download/upload/ping data plane for browser speed tests,
//! records submitted results in the configured telemetry store, and exposes
//! health and Prometheus metrics on a separate admin listener.

use anyhow::{Context, Result};
use clap::Parser;
use speedtest_server::{
    config::{LogFormat, ServerConfig},
    locator::{ClientLocator, IpInfoClient, ServerLocation},
    payload::{DownloadLimits, PayloadPool},
    server::{serve_admin, serve_api, ApiState},
    storage,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "speedtest")]
#[command(about = "Bandwidth test server with telemetry storage", long_about = None)]
#[command(version)]
struct Args {
    /// Settings file (TOML). Defaults to ./settings.toml when present.
    #[arg(short, long, env = "SPEEDTEST_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(config.log_format, args.verbose);
    config.validate().context("Invalid configuration")?;

    let storage_config = config.storage()?;
    let store = storage::open(&storage_config)
        .await
        .context("Failed to open telemetry storage")?;

    let payload = PayloadPool::generate(config.chunk_size)
        .context("Failed to generate random download payload")?;
    info!("Generated {} byte download payload", payload.chunk_size());

    let lookup = IpInfoClient::new(&config.lookup()).context("Failed to build IP lookup client")?;
    let server_location =
        ServerLocation::resolve(&lookup, config.server_lat, config.server_lng).await;
    let locator = Arc::new(ClientLocator::new(lookup, server_location));

    let state = Arc::new(ApiState {
        payload,
        locator,
        store: store.clone(),
        download: DownloadLimits {
            default_chunks: config.download_chunks,
            max_chunks: config.max_chunks,
        },
        redact_ip: config.redact_ip_addresses,
        stats_password: config.statistics_password.clone(),
    });

    let listen_addr = config.listen_addr();
    let listener = std::net::TcpListener::bind(&listen_addr)
        .with_context(|| format!("Failed to bind {}", listen_addr))?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    if let Some(admin) = config.admin_addr() {
        let admin_addr: SocketAddr = admin
            .parse()
            .with_context(|| format!("Invalid admin_listen address {}", admin))?;
        let store = store.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_admin(admin_addr, store, shutdown).await {
                error!("Admin HTTP server error: {}", e);
            }
        });
    }

    info!("Starting speedtest server on {}", listen_addr);
    serve_api(listener, state, shutdown)
        .await
        .context("HTTP server error")?;

    info!("Server stopped");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(format: LogFormat, verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
    }
}
