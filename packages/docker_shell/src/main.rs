use anyhow::{Context, Result};
use clap::Parser;
use pty_manager::NativeAllocator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;

mod auth;
mod config;
mod dispatch;
mod ready;
mod server;
mod session;

use crate::config::ShellConfig;
use crate::server::ShellServer;

#[derive(Parser)]
#[command(name = "docksh")]
#[command(about = "SSH server whose prompt only runs docker")]
struct Cli {
    /// Port to listen on
    port: u16,

    /// Config file (defaults to ./docksh.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "docksh=debug,pty_manager=debug,russh=info,info"
    } else {
        "docksh=info,pty_manager=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = ShellConfig::resolve(cli.port, cli.config.as_deref())?;
    info!(
        program = %config.session.program,
        host_key = %config.host_key.display(),
        "starting docksh"
    );

    let host_key = server::load_host_key(&config.host_key)?;
    let policy = config
        .auth
        .build_policy()
        .context("Failed to set up authentication")?;

    let server = ShellServer::new(&config, host_key, policy, Arc::new(NativeAllocator));
    server.serve(config.listen_addr).await
}
