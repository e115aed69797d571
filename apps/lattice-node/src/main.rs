mod cli;
mod config;
mod console;
mod server;
mod signaling_ws;

use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info, warn};

use lattice_mesh::{AccountManager, ChannelManager, Validators};

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::console::Console;

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    match cli.command {
        Commands::V => {
            println!("lattice-node {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Run { stream } => {
            if let Err(err) = run(stream).await {
                error!("fatal: {err:#}");
                std::process::exit(2);
            }
        }
    }
}

async fn run(stream: bool) -> anyhow::Result<()> {
    let config = Config::from_env();
    if let Some(connection) = &config.telemetry_connection_string {
        info!(
            length = connection.len(),
            "telemetry connection string present; no sink wired in this build"
        );
    }

    let accounts = match &config.private_key {
        Some(key) => Arc::new(AccountManager::from_key(key.clone())),
        None => {
            warn!("PRIVATE_KEY not set; using an ephemeral signer");
            Arc::new(AccountManager::generate())
        }
    };
    info!(signer = %accounts.address(), port = config.port, "lattice node starting");

    let manager = ChannelManager::new(accounts, Validators::default());
    let server = tokio::spawn(server::serve(config.port, Arc::clone(&manager)));

    let console = Console::new(Arc::clone(&manager), config.max_latency);
    console.run(stream).await?;

    manager.dispose().await;
    server.abort();
    info!("lattice node stopped");
    Ok(())
}
