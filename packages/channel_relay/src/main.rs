use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use channel_relay::config::{CliOverrides, FileConfig, load_config};
use channel_relay::tls::load_tls_acceptor;
use channel_relay::{RelayConfig, RelayMetrics, build_relay, serve};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "WebSocket relay that fans messages out to everyone on the same path")]
struct Args {
    /// Port to listen on (also read from PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Do not assign identities or announce disconnects
    #[arg(long)]
    noid: bool,

    /// Only log connection-level events
    #[arg(long)]
    nolog: bool,

    /// PEM certificate chain; enables TLS together with --key
    #[arg(long)]
    cert: Option<PathBuf>,

    /// PEM private key; enables TLS together with --cert
    #[arg(long)]
    key: Option<PathBuf>,

    /// Config file (defaults to ./relay.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            host: self.host.clone(),
            port: self.port,
            no_identity: self.noid,
            no_log: self.nolog,
            cert: self.cert.clone(),
            key: self.key.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file_config: FileConfig = args
        .overrides()
        .apply(load_config(args.config.as_deref()))
        .extract()
        .context("Failed to load configuration")?;
    let config = RelayConfig::from_file(&file_config).context("Invalid configuration")?;

    // Setup logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_directive()));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let tls = match &config.tls {
        Some(tls_config) => {
            info!("Using TLS (cert: {})", tls_config.cert.display());
            Some(load_tls_acceptor(tls_config).context("Failed to load TLS material")?)
        }
        None => None,
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    let local_addr = listener.local_addr()?;

    let metrics = Arc::new(RelayMetrics::new());
    let relay = build_relay(&config, metrics.clone());

    info!(
        "LISTENING on {}{}{}{}",
        local_addr,
        if tls.is_some() { " (wss)" } else { "" },
        if config.identity { "" } else { " --noid" },
        if config.verbose { "" } else { " --nolog" },
    );

    serve(listener, relay, tls, shutdown_signal())
        .await
        .context("Server error")?;

    match serde_json::to_string(&metrics.snapshot()) {
        Ok(json) => info!("Shutting down: {}", json),
        Err(e) => warn!("Failed to serialize metrics: {}", e),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal, exiting gracefully");
}
