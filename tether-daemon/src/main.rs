#![forbid(unsafe_code)]

//! `tetherd`: the friend-to-friend file-exchange daemon.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tether_core::Config;
use tether_daemon::directory::OfflineDirectory;
use tether_daemon::{NullCatalog, Services};

#[derive(Parser, Debug)]
#[command(name = "tetherd", about = "Friend-to-friend file exchange daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the per-user state directory.
    #[arg(long)]
    user_dir: Option<PathBuf>,

    /// Override the listen port (0 picks a random port).
    #[arg(long)]
    port: Option<u16>,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(config: &Config, verbose: u8) {
    let level = match verbose {
        0 => config.log_level.as_deref().unwrap_or("info").to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let exit = match run().await {
        Ok(()) => 0,
        Err(e) => {
            // Tracing may not be initialized yet when startup fails.
            error!("fatal: {e:#}");
            eprintln!("tetherd: fatal: {e:#}");
            1
        }
    };
    std::process::exit(exit);
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_env(),
    };
    if let Some(dir) = args.user_dir {
        config.user_dir = dir;
    }
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    init_tracing(&config, args.verbose);
    info!("user directory {}", config.user_dir.display());

    // The directory website client plugs in here; until one is wired up
    // the daemon runs from the roster snapshot.
    let services = Services::build(config, Arc::new(OfflineDirectory), Arc::new(NullCatalog))
        .await
        .context("startup failed")?;

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    services.run(shutdown).await?;
    info!("clean shutdown");
    Ok(())
}
