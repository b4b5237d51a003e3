#![forbid(unsafe_code)]

//! HTTP entry point: resolves configuration, checks that yt-dlp is usable and
//! serves the API until Ctrl+C.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tubefetch::{
    api::{AppState, router},
    config::{ConfigOverrides, resolve_server_config},
    extractor::YtDlp,
};

const DEFAULT_LOG_FILTER: &str = "tubefetch=info,tower_http=info";

/// Proxy that lists and streams YouTube downloads through yt-dlp.
#[derive(Debug, Parser)]
#[command(name = "tubefetch", version)]
struct Args {
    /// Address to bind (overrides TUBEFETCH_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides TUBEFETCH_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Single origin allowed to call the API (overrides TUBEFETCH_ALLOWED_ORIGIN).
    #[arg(long)]
    allowed_origin: Option<String>,
    /// Path to the yt-dlp executable (overrides YTDLP_BIN).
    #[arg(long)]
    ytdlp: Option<PathBuf>,
    /// Dotenv file to read settings from.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl Args {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host,
            port: self.port,
            allowed_origin: self.allowed_origin,
            ytdlp_bin: self.ytdlp,
            env_path: self.env_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = resolve_server_config(Args::parse().into_overrides())?;

    let ytdlp = YtDlp::new(config.ytdlp_bin.clone(), config.user_agent.clone());
    let version = ytdlp
        .version()
        .await
        .with_context(|| format!("checking {}", config.ytdlp_bin.display()))?;
    tracing::info!(version = %version, binary = %config.ytdlp_bin.display(), "using yt-dlp");

    let app = router(AppState::new(Arc::new(ytdlp)), &config.allowed_origin)?;

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!(%addr, origin = %config.allowed_origin, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates.
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
    }
}
