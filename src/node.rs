use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{FleetConfig, ProviderConfig};
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::store::{JobStore, SqliteJobStore};
use crate::worker::{DockerProvider, MemoryProvider, WorkerProvider};

/// One scheduler process: the reconciliation loop plus the optional dashboard.
pub struct Node {
    pub config: FleetConfig,
    scheduler: Scheduler,
}

impl Node {
    /// Build every component from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Config`](crate::error::FleetError::Config) if the
    /// configuration is invalid, before anything external is contacted, and
    /// [`FleetError::Store`](crate::error::FleetError::Store) if the job
    /// database cannot be opened.
    pub async fn new(config: FleetConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(&config.database).await?);
        let provider: Arc<dyn WorkerProvider> = match &config.provider {
            ProviderConfig::Docker(docker) => Arc::new(DockerProvider::new(
                docker.clone(),
                config.scheduler.scheduler_id.clone(),
            )),
            ProviderConfig::Memory => {
                tracing::warn!("Using simulated workers, nothing will be executed");
                Arc::new(MemoryProvider::new())
            }
        };

        let scheduler = Scheduler::new(config.scheduler.clone(), store, provider)?;
        Ok(Self { config, scheduler })
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// The dashboard (if configured) is spawned as a task; the scheduler loop
    /// runs on the calling task so its final drain completes before return.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let dashboard = self.config.dashboard_addr.map(|addr| {
            let state = DashboardState {
                snapshots: self.scheduler.subscribe(),
            };
            let token = shutdown.clone();
            tokio::spawn(async move {
                run_dashboard(addr, state, token).await;
            })
        });

        self.scheduler.run(shutdown.clone()).await;

        if let Some(handle) = dashboard {
            shutdown.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Dashboard task ended abnormally");
            }
        }
        Ok(())
    }
}
