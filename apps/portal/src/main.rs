use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use portal::{ProxyConfig, ProxyMode, spawn_proxy};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portal")]
#[command(about = "Reverse proxy that lets a browser visit remote sites through one origin")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "PORTAL_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration file
    #[arg(short, long, env = "PORTAL_BIND")]
    bind: Option<SocketAddr>,

    /// `worker` or `rewrite`
    #[arg(short, long, env = "PORTAL_MODE")]
    mode: Option<ProxyMode>,

    /// Emit logs as JSON lines
    #[arg(long, env = "PORTAL_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => ProxyConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }

    let handle = spawn_proxy(config).await.context("failed to start proxy")?;
    info!(addr = %handle.addr, "press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
