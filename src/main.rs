use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weft::config::RelayConfig;
use weft::{rest, AppContext};

#[derive(Parser)]
#[command(
    name = "weftd",
    about = "Weft relay — real-time messaging fabric between PWA clients and sidecars",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Bind address (default: 0.0.0.0, or HOST env var)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (default: 8000, or PORT env var)
    #[arg(long)]
    port: Option<u16>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long)]
    log: Option<String>,

    /// Optional TOML config file
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the relay server (default when no subcommand given).
    ///
    /// Examples:
    ///   weftd serve
    ///   weftd
    Serve,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = RelayConfig::load(
        args.host.clone(),
        args.port,
        args.log.clone(),
        args.config.as_deref(),
    )?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Some(Command::Serve) | None => serve(config),
    }
}

#[tokio::main]
async fn serve(config: RelayConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.host, config.port))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (ctx, background) = AppContext::build(config, shutdown_rx);

    let (bind_tx, _bind_rx) = tokio::sync::oneshot::channel();
    let result = rest::serve(ctx, addr, bind_tx, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await;

    // Stop the router and sweepers; each loop quiesces within one tick.
    let _ = shutdown_tx.send(true);
    for task in background {
        task.abort();
    }

    result.context("relay server failed")?;
    info!("clean shutdown");
    Ok(())
}
