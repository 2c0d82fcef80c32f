// src/main.rs

use anyhow::{Context as _, Result};
use clap::Parser;
use ferryd::jobs::WorkerPool;
use ferryd::lock::LockFile;
use ferryd::transit::TransitListener;
use ferryd::{Config, Manager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "ferryd")]
#[command(author, version, about = "Package repository daemon", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/ferryd/ferryd.toml")]
    config: PathBuf,

    /// Override the base directory from the configuration
    #[arg(short, long)]
    base_dir: Option<PathBuf>,

    /// Override the number of workers (0 = half the available CPUs)
    #[arg(short, long)]
    workers: Option<usize>,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if cli.config.exists() {
        Config::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        info!("No configuration at {}, using defaults", cli.config.display());
        Config::default()
    };
    if let Some(base_dir) = &cli.base_dir {
        config.paths.base_dir = base_dir.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers.count = workers;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(load_config(&cli)?);
    info!("Starting ferryd version {}", env!("CARGO_PKG_VERSION"));

    std::fs::create_dir_all(config.base_dir())
        .with_context(|| format!("creating {}", config.base_dir().display()))?;
    let _lock = LockFile::acquire(config.lock_path())?;

    let manager = Manager::open(config.clone())?;
    let workers = WorkerPool::start(manager.context(), config.worker_count());
    let listener = TransitListener::start(manager.context())?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for the shutdown signal")?;
    info!("Received shutdown signal");

    listener.stop().await;
    workers.stop().await;
    info!("ferryd shut down");
    Ok(())
}
