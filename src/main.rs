use clap::{Parser, Subcommand};
use crucible::error::Result;
use crucible::{config, Coordinator, WorkerAgent};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator: queue, scheduler, and RPC surface.
    Coordinate {
        /// Path to the coordinator configuration file
        #[arg(short, long, default_value = "crucible.toml")]
        config: PathBuf,

        /// Scan the library, print the report, and exit
        #[arg(long)]
        scan_only: bool,
    },
    /// Run a worker against a coordinator.
    Work {
        /// Path to the worker configuration file
        #[arg(short, long, default_value = "crucible-worker.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    match run().await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Application error: {}", e);
            Err(e)
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    info!("crucible {}", env!("CARGO_PKG_VERSION"));
    info!(
        "  OS: {} ({}), CPUs: {}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        num_cpus::get()
    );

    match args.command {
        Command::Coordinate { config, scan_only } => {
            let config = config::Config::load(&config)
                .map_err(|e| crucible::CrucibleError::Config(e.to_string()))?;
            if config.library.directories.is_empty() {
                error!("No library directories configured; nothing to do.");
                return Err(crucible::CrucibleError::Config(
                    "library.directories is empty".into(),
                ));
            }

            info!("Library roots: {:?}", config.library.directories);
            info!("Queue order: {}", config.cluster.file_order);
            info!(
                "Savings floor: {:.1}%  Max attempts: {}  Testing mode: {}",
                config.cluster.min_savings_pct,
                config.cluster.max_attempts,
                config.cluster.testing_mode
            );

            let coordinator = Coordinator::new(config).await?;
            if scan_only {
                let report = coordinator.scan().await?;
                info!(
                    "Scan report: {} added, {} updated",
                    report.added, report.updated
                );
                return Ok(());
            }
            coordinator.run().await
        }
        Command::Work { config } => {
            let config = config::WorkerConfig::load(&config)
                .map_err(|e| crucible::CrucibleError::Config(e.to_string()))?;
            let agent = WorkerAgent::new(config)?;
            agent.run().await
        }
    }
}
