pub mod lifecycle;
pub mod registry;
pub mod replace;
pub mod scheduler;
pub mod server;
pub mod transfer;

use crate::config::Config;
use crate::error::Result;
use crate::events::EventBus;
use crate::scanner::Scanner;
use crate::store::Store;
use lifecycle::Lifecycle;
use registry::Registry;
use scheduler::Scheduler;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use transfer::{SourceHashes, Uploads};

/// Cadence of the stall sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub struct Coordinator {
    pub config: Config,
    pub store: Arc<Store>,
    pub registry: Arc<Registry>,
    pub events: Arc<EventBus>,
    pub uploads: Arc<Uploads>,
    pub hashes: Arc<SourceHashes>,
    pub lifecycle: Arc<Lifecycle>,
    pub scheduler: Arc<Scheduler>,
}

impl Coordinator {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let store = Arc::new(Store::new(Path::new(&config.library.db_path)).await?);
        let registry = Arc::new(Registry::new());
        let events = Arc::new(EventBus::new());
        let uploads = Arc::new(Uploads::new());
        let hashes = Arc::new(SourceHashes::new());

        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            registry.clone(),
            events.clone(),
            uploads.clone(),
            config.cluster.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            registry.clone(),
            events.clone(),
            hashes.clone(),
            config.cluster.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            store,
            registry,
            events,
            uploads,
            hashes,
            lifecycle,
            scheduler,
        }))
    }

    /// Periodic liveness sweep: offline workers lose their assignments,
    /// progress-silent jobs are force-failed.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let liveness = Duration::from_secs(coordinator.config.cluster.liveness_timeout_s);
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let newly_offline = coordinator
                    .registry
                    .sweep_offline(liveness, &coordinator.events);
                if let Err(e) = coordinator.lifecycle.sweep(&newly_offline).await {
                    error!("Sweep failed: {}", e);
                }
            }
        })
    }

    pub async fn scan(&self) -> Result<crate::scanner::ScanReport> {
        let directories: Vec<PathBuf> = self
            .config
            .library
            .directories
            .iter()
            .map(PathBuf::from)
            .collect();
        let scanner = Scanner::new();
        let report = scanner.scan_into(&self.store, &directories).await?;
        self.events.publish(crate::events::Event::ScanFinished {
            added: report.added,
            updated: report.updated,
        });
        Ok(report)
    }

    /// Bring the farm up: initial scan, sweeper, then the RPC server.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            "Cluster config digest: {}",
            self.config.cluster.digest()
        );

        if let Err(e) = self.scan().await {
            error!("Initial scan failed: {}", e);
        }

        self.spawn_sweeper();
        server::serve(self.clone()).await
    }
}
