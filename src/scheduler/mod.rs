//! Dispatch decisions: which READY workset runs next, and on which cluster.
//!
//! The scheduler reads the [`StateStore`] but never writes to it. Cluster
//! capacity is process-local and lives behind a single mutex, which is the
//! only shared mutable state in the process.

pub mod assigner;
pub mod capacity;
pub mod queue;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::store::{QueueStats, StateStore, Workset};

pub use assigner::{AffinityPolicy, ClusterAssigner, Decision, PlacementReason};
pub use capacity::{ClusterCapacity, ClusterUtilization, WorksetRequirements};
pub use queue::ReadyQueue;

/// Result of [`Scheduler::schedule`]. `NoCapacity` is not an error: the caller
/// leaves the workset READY and re-polls later.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    Placed(Decision),
    NoCapacity,
}

pub struct Scheduler {
    queue: ReadyQueue,
    store: Arc<dyn StateStore>,
    clusters: Mutex<ClusterAssigner>,
    default_requirements: WorksetRequirements,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        config: &SchedulerConfig,
        default_requirements: WorksetRequirements,
    ) -> Self {
        Self {
            queue: ReadyQueue::new(store.clone()),
            store,
            clusters: Mutex::new(ClusterAssigner::new(config.affinity_policy)),
            default_requirements,
        }
    }

    fn clusters(&self) -> MutexGuard<'_, ClusterAssigner> {
        // Every critical section is plain arithmetic; a poisoned table is still
        // consistent.
        self.clusters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The READY workset that should run next.
    pub async fn next_workset(&self) -> Result<Option<Workset>> {
        self.queue.next().await
    }

    pub fn queue(&self) -> &ReadyQueue {
        &self.queue
    }

    /// Resolves the requirements for a workset: explicit, declared, or default.
    pub fn requirements_for(
        &self,
        workset: &Workset,
        requirements: Option<WorksetRequirements>,
    ) -> WorksetRequirements {
        requirements
            .or(workset.requirements)
            .unwrap_or(self.default_requirements)
    }

    /// Chooses a cluster for `workset_id` and reserves capacity on it.
    pub async fn schedule(
        &self,
        workset_id: &str,
        requirements: Option<WorksetRequirements>,
    ) -> Result<ScheduleOutcome> {
        let workset = self.store.get(workset_id).await?;
        Ok(self.schedule_workset(&workset, requirements))
    }

    /// As [`schedule`](Self::schedule), for a workset already in hand.
    pub fn schedule_workset(
        &self,
        workset: &Workset,
        requirements: Option<WorksetRequirements>,
    ) -> ScheduleOutcome {
        let req = self.requirements_for(workset, requirements);
        let decision = self
            .clusters()
            .place(workset.cluster_affinity.as_deref(), &req);

        match decision {
            Some(decision) => {
                tracing::debug!(
                    workset_id = %workset.workset_id,
                    cluster = %decision.cluster_name,
                    reason = %decision.reason,
                    "Workset placed"
                );
                ScheduleOutcome::Placed(decision)
            }
            None => {
                tracing::debug!(
                    workset_id = %workset.workset_id,
                    vcpus = req.vcpus,
                    memory_gb = req.memory_gb,
                    "No cluster capacity"
                );
                ScheduleOutcome::NoCapacity
            }
        }
    }

    pub fn has_capacity_for(&self, requirements: &WorksetRequirements) -> bool {
        self.clusters().has_capacity_for(requirements)
    }

    /// Whether `workset` could be placed right now, honoring its affinity.
    pub fn can_place(&self, workset: &Workset) -> bool {
        let req = self.requirements_for(workset, None);
        self.clusters()
            .can_place(workset.cluster_affinity.as_deref(), &req)
    }

    /// Whether `workset` could be placed once running work releases its
    /// capacity. `false` means waiting will never help.
    pub fn could_ever_place(&self, workset: &Workset) -> bool {
        let req = self.requirements_for(workset, None);
        self.clusters()
            .could_ever_place(workset.cluster_affinity.as_deref(), &req)
    }

    /// Whether any cluster could take a workset with default requirements.
    pub fn has_any_capacity(&self) -> bool {
        self.has_capacity_for(&self.default_requirements)
    }

    pub fn register_cluster(&self, capacity: ClusterCapacity) {
        self.clusters().register_cluster(capacity);
    }

    pub fn deregister_cluster(&self, cluster_name: &str) -> Option<ClusterCapacity> {
        self.clusters().deregister_cluster(cluster_name)
    }

    pub fn release_capacity(&self, cluster_name: &str, vcpus: u32, memory_gb: u32) -> bool {
        self.clusters().release(cluster_name, vcpus, memory_gb)
    }

    pub fn release_decision(&self, decision: &Decision) -> bool {
        self.release_capacity(
            &decision.cluster_name,
            decision.requirements.vcpus,
            decision.requirements.memory_gb,
        )
    }

    pub fn cluster(&self, cluster_name: &str) -> Option<ClusterCapacity> {
        self.clusters().get(cluster_name).cloned()
    }

    /// Workset counts per state.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.store.count_by_state().await
    }

    /// Per-cluster utilization, ordered by cluster name.
    pub fn scheduler_stats(&self) -> Vec<ClusterUtilization> {
        self.clusters().utilization()
    }
}
