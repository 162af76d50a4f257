#![warn(missing_docs)]

//! GatewayFS metadata daemon: replays the journal and runs the transaction
//! pipeline until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use gatewayfs_meta::{GatewayConfig, MemoryCoordinationStore, MetaJournal, TransactionManager};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gfs-meta", about = "GatewayFS metadata transaction daemon")]
struct Args {
    /// Path to a .toml or .json gateway config.
    #[arg(short, long, env = "GFS_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the journal directory from the config.
    #[arg(long)]
    journal_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) if path.exists() => GatewayConfig::from_file(path)?,
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            GatewayConfig::default()
        }
        None => GatewayConfig::default(),
    };
    if let Some(dir) = args.journal_dir {
        config.journal_dir = dir;
    }
    config.validate()?;

    tracing::info!(
        gateway = %config.gateway_name,
        gateway_id = config.gateway_id,
        journal = %config.journal_dir.display(),
        "GatewayFS metadata daemon starting..."
    );

    let journal = Arc::new(MetaJournal::open(config.journal_config())?);
    journal.start_cleaner();

    // The daemon runs against an in-process store; gateway deployments
    // supply their ensemble client through `CoordinationStore`.
    let store = Arc::new(MemoryCoordinationStore::new());
    let manager = TransactionManager::start(config.manager_config(), store, journal.clone())?;

    let recovered = journal.recover(&manager)?;
    manager.flush().await?;
    tracing::info!(
        resubmitted = recovered.resubmitted,
        discarded = recovered.discarded,
        "journal replayed"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    manager.flush().await?;
    manager.stop();
    journal.compact()?;
    Ok(())
}
