use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use backhaul::api::{self, AppState};
use backhaul::approval::ApprovalGate;
use backhaul::broker::Broker;
use backhaul::command::CommandBroker;
use backhaul::config::ServerConfig;
use backhaul::fsops::FileOpBroker;
use backhaul::transfer::TransferService;

#[derive(Parser, Debug)]
#[command(name = "backhaul", version)]
#[command(about = "Correlation broker bridging AI coding agents with polling legacy executors")]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, default_value = "backhaul.yml")]
    config: PathBuf,

    /// Override the API port from the config file
    #[arg(long)]
    api_port: Option<u16>,

    /// Override the shared secret (or use BACKHAUL_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "backhaul=debug"
    } else {
        "backhaul=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let mut config = ServerConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    if let Some(port) = cli.api_port {
        config.api_port = port;
    }
    if let Some(key) = cli.api_key.or_else(|| std::env::var("BACKHAUL_API_KEY").ok()) {
        config.api_key = key;
    }

    let approvals = Arc::new(ApprovalGate::new());
    let commands = CommandBroker::new(
        Broker::new("cmd"),
        approvals.clone(),
        config.command_timeout(),
    );
    let files = FileOpBroker::new(
        Broker::new("op"),
        approvals.clone(),
        config.read_timeout(),
        config.write_timeout(),
        config.max_read_size,
        config.transfer_root.clone(),
    );

    let shutdown = CancellationToken::new();
    let transfer = Arc::new(TransferService::new(
        config.transfer_root.clone(),
        config.api_key.clone(),
        config.max_transfer_bytes,
    ));

    let download_addr = SocketAddr::from(([0, 0, 0, 0], config.download_port));
    let download_listener = TcpListener::bind(download_addr)
        .await
        .with_context(|| format!("failed to bind download listener on {download_addr}"))?;
    info!("file download listener on tcp port {}", config.download_port);
    tokio::spawn(
        transfer
            .clone()
            .serve_download(download_listener, shutdown.clone()),
    );

    let upload_addr = SocketAddr::from(([0, 0, 0, 0], config.upload_port));
    let upload_listener = TcpListener::bind(upload_addr)
        .await
        .with_context(|| format!("failed to bind upload listener on {upload_addr}"))?;
    info!("file upload listener on tcp port {}", config.upload_port);
    tokio::spawn(
        transfer
            .clone()
            .serve_upload(upload_listener, shutdown.clone()),
    );

    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let api_listener = TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {api_addr}"))?;

    info!("backhaul API listening on http://{api_addr}");
    info!(
        transfer_root = %config.transfer_root.display(),
        command_timeout_secs = config.command_timeout_secs,
        read_timeout_secs = config.read_timeout_secs,
        write_timeout_secs = config.write_timeout_secs,
        "configuration loaded"
    );

    let state = Arc::new(AppState {
        config,
        commands,
        files,
        approvals,
    });
    let app = api::router(state);

    let shutdown_on_signal = shutdown.clone();
    axum::serve(api_listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_on_signal.cancel();
        })
        .await
        .context("API server encountered an unrecoverable error")?;

    Ok(())
}
