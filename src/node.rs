use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::{Result, UrsaError};
use crate::region::MultiRegionCoordinator;
use crate::scheduler::Scheduler;
use crate::store::{InMemoryStateStore, StateStore};
use crate::worker::{
    ClusterProvisioner, CommandProvisioner, ConcurrentProcessor, NotificationSink, TracingSink,
};

/// One coordinator process: store, optional region routing, scheduler and
/// processor, plus the dashboard.
pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<dyn StateStore>,
    pub coordinator: Option<Arc<MultiRegionCoordinator>>,
    pub scheduler: Arc<Scheduler>,
    pub processor: Arc<ConcurrentProcessor>,
}

impl Node {
    /// Builds a node from configuration alone, running worksets through the
    /// configured provisioner command and logging lifecycle events.
    pub async fn from_config(config: NodeConfig) -> Result<Self> {
        let command = config.provisioner_command.clone().ok_or_else(|| {
            UrsaError::InvalidArgument("a provisioner command is required".to_string())
        })?;
        Self::new(
            config,
            Arc::new(CommandProvisioner::new(command)),
            Arc::new(TracingSink),
        )
        .await
    }

    pub async fn new(
        config: NodeConfig,
        provisioner: Arc<dyn ClusterProvisioner>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let local: Arc<dyn StateStore> =
            Arc::new(InMemoryStateStore::open(config.store.clone(), &config.retry).await?);

        // A single local table stands in for every region's replica; a real
        // deployment plugs one store per region into the coordinator.
        let (store, coordinator) = match config.coordinator.clone() {
            Some(coordinator_config) => {
                let stores: BTreeMap<String, Arc<dyn StateStore>> = coordinator_config
                    .regions
                    .iter()
                    .map(|r| (r.region_id.clone(), local.clone()))
                    .collect();
                let coordinator =
                    Arc::new(MultiRegionCoordinator::new(coordinator_config, stores)?);
                let store: Arc<dyn StateStore> = coordinator.clone();
                (store, Some(coordinator))
            }
            None => (local, None),
        };

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            &config.scheduler,
            config.processor.default_requirements,
        ));
        for cluster in &config.clusters {
            scheduler.register_cluster(cluster.clone());
        }

        let processor = Arc::new(ConcurrentProcessor::new(
            store.clone(),
            scheduler.clone(),
            provisioner,
            sink,
            config.processor.clone(),
        ));

        Ok(Self {
            config,
            store,
            coordinator,
            scheduler,
            processor,
        })
    }

    /// Run the node until `shutdown` fires.
    ///
    /// Spawns the region health loop and the dashboard when configured, then
    /// runs the processor in the foreground. Returns once every worker has
    /// drained.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        if self.config.clusters.is_empty() {
            tracing::warn!("No clusters registered, worksets will wait for capacity");
        }

        if let Some(coordinator) = self.coordinator.clone() {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                coordinator.run_health_checks(shutdown).await;
            });
        }

        if let Some(dashboard_addr) = self.config.dashboard_addr {
            let dashboard_state = DashboardState {
                store: self.store.clone(),
                scheduler: self.scheduler.clone(),
                coordinator: self.coordinator.clone(),
            };
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_dashboard(dashboard_addr, dashboard_state, shutdown).await;
            });
        }

        tracing::info!(
            instance_id = %self.processor.instance_id(),
            clusters = self.config.clusters.len(),
            regions = self.config.coordinator.as_ref().map_or(0, |c| c.regions.len()),
            "Node started"
        );
        self.processor.clone().run(shutdown).await;
        Ok(())
    }
}
