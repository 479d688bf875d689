mod wiring;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use flotilla_repo::GitCliFetcher;
use flotilla_store::InMemoryStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Fleet rollout and device reconciliation worker.
#[derive(Debug, Parser)]
#[command(name = "flotillad")]
struct Args {
    /// Organization to serve.
    #[arg(long, default_value = "default")]
    org: String,

    /// Worker tasks per controller pool.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Seconds between resource sync and repository probes.
    #[arg(long, default_value_t = 30)]
    sync_interval: u64,

    /// Seconds between full fleet and device sweeps.
    #[arg(long, default_value_t = 60)]
    sweep_interval: u64,

    /// Directory for cached git checkouts.
    #[arg(long, default_value = "/var/lib/flotilla/checkouts")]
    git_workdir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    info!(org = %args.org, workers = args.workers, "starting flotillad");

    let store = Arc::new(InMemoryStore::new());
    let fetcher = Arc::new(GitCliFetcher::new(&args.git_workdir));

    let engine = wiring::Engine::start(
        store,
        fetcher,
        wiring::EngineOptions {
            org: args.org,
            workers: args.workers,
            sync_interval: std::time::Duration::from_secs(args.sync_interval),
            sweep_interval: std::time::Duration::from_secs(args.sweep_interval),
        },
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    engine.shutdown();
    Ok(())
}
