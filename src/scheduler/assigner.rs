use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::scheduler::capacity::{ClusterCapacity, ClusterUtilization, WorksetRequirements};

/// How a workset's `cluster_affinity` is honored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AffinityPolicy {
    /// Prefer the affine cluster, fall back to general placement when it has
    /// no room or is unknown.
    #[default]
    Advisory,
    /// Only ever place on the affine cluster.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlacementReason {
    Affinity,
    /// Affine cluster was full or unknown; general placement was used.
    AffinityFallback { requested: String },
    BestFit { cost_per_vcpu_hour: f64, latency_ms: u32 },
}

impl fmt::Display for PlacementReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementReason::Affinity => write!(f, "cluster affinity"),
            PlacementReason::AffinityFallback { requested } => {
                write!(f, "affinity fallback (requested {requested})")
            }
            PlacementReason::BestFit {
                cost_per_vcpu_hour,
                latency_ms,
            } => write!(
                f,
                "best fit (cost {cost_per_vcpu_hour:.4}/vcpu-h, latency {latency_ms}ms)"
            ),
        }
    }
}

/// A reservation on one cluster. Hand back through
/// [`Scheduler::release_decision`](crate::scheduler::Scheduler::release_decision).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub cluster_name: String,
    pub reason: PlacementReason,
    pub requirements: WorksetRequirements,
}

/// Arena of cluster capacities keyed by name. Not thread-safe on its own;
/// the [`Scheduler`](crate::scheduler::Scheduler) serializes access.
#[derive(Debug, Default)]
pub struct ClusterAssigner {
    clusters: BTreeMap<String, ClusterCapacity>,
    policy: AffinityPolicy,
}

impl ClusterAssigner {
    pub fn new(policy: AffinityPolicy) -> Self {
        Self {
            clusters: BTreeMap::new(),
            policy,
        }
    }

    /// Adds a cluster, or replaces its limits while keeping current usage.
    pub fn register_cluster(&mut self, mut capacity: ClusterCapacity) {
        if let Some(existing) = self.clusters.get(&capacity.cluster_name) {
            capacity.used_vcpus = existing.used_vcpus;
            capacity.used_memory_gb = existing.used_memory_gb;
            capacity.active_worksets = existing.active_worksets;
        }
        tracing::info!(
            cluster = %capacity.cluster_name,
            az = %capacity.availability_zone,
            max_concurrent = capacity.max_concurrent_worksets,
            "Cluster registered"
        );
        self.clusters
            .insert(capacity.cluster_name.clone(), capacity);
    }

    pub fn deregister_cluster(&mut self, cluster_name: &str) -> Option<ClusterCapacity> {
        self.clusters.remove(cluster_name)
    }

    pub fn release(&mut self, cluster_name: &str, vcpus: u32, memory_gb: u32) -> bool {
        match self.clusters.get_mut(cluster_name) {
            Some(cluster) => {
                cluster.release(vcpus, memory_gb);
                true
            }
            None => {
                tracing::warn!(cluster = cluster_name, "Release for unknown cluster");
                false
            }
        }
    }

    pub fn has_capacity_for(&self, req: &WorksetRequirements) -> bool {
        self.clusters.values().any(|c| c.fits(req))
    }

    /// Whether [`place`](Self::place) would succeed, without reserving.
    pub fn can_place(&self, affinity: Option<&str>, req: &WorksetRequirements) -> bool {
        if let Some(affine) = affinity {
            if self.clusters.get(affine).is_some_and(|c| c.fits(req)) {
                return true;
            }
            if self.policy == AffinityPolicy::Strict {
                return false;
            }
        }
        self.has_capacity_for(req)
    }

    /// Whether [`place`](Self::place) could succeed once running work drains.
    /// `false` means no registered cluster is large enough, or strict
    /// affinity names a cluster that is missing or too small. With no
    /// clusters registered nothing is known yet, so this is `true`.
    pub fn could_ever_place(&self, affinity: Option<&str>, req: &WorksetRequirements) -> bool {
        if self.clusters.is_empty() {
            return true;
        }
        if let Some(affine) = affinity {
            if self.clusters.get(affine).is_some_and(|c| c.could_ever_fit(req)) {
                return true;
            }
            if self.policy == AffinityPolicy::Strict {
                return false;
            }
        }
        self.clusters.values().any(|c| c.could_ever_fit(req))
    }

    /// Picks a cluster and reserves capacity on it.
    pub fn place(
        &mut self,
        affinity: Option<&str>,
        req: &WorksetRequirements,
    ) -> Option<Decision> {
        if let Some(affine) = affinity {
            if let Some(cluster) = self.clusters.get_mut(affine).filter(|c| c.fits(req)) {
                cluster.reserve(req);
                return Some(Decision {
                    cluster_name: cluster.cluster_name.clone(),
                    reason: PlacementReason::Affinity,
                    requirements: *req,
                });
            }
            if self.policy == AffinityPolicy::Strict {
                return None;
            }
        }

        let best = self
            .clusters
            .values()
            .filter(|c| c.fits(req))
            .min_by(|a, b| compare_candidates(a, b))?
            .cluster_name
            .clone();
        let cluster = self.clusters.get_mut(&best)?;
        cluster.reserve(req);

        let reason = match affinity {
            Some(requested) => PlacementReason::AffinityFallback {
                requested: requested.to_string(),
            },
            None => PlacementReason::BestFit {
                cost_per_vcpu_hour: cluster.cost_per_vcpu_hour,
                latency_ms: cluster.latency_ms,
            },
        };
        Some(Decision {
            cluster_name: best,
            reason,
            requirements: *req,
        })
    }

    pub fn get(&self, cluster_name: &str) -> Option<&ClusterCapacity> {
        self.clusters.get(cluster_name)
    }

    pub fn utilization(&self) -> Vec<ClusterUtilization> {
        self.clusters.values().map(ClusterCapacity::utilization).collect()
    }
}

/// Cheapest first, then closest, then most spare slots, then name.
fn compare_candidates(a: &ClusterCapacity, b: &ClusterCapacity) -> Ordering {
    a.cost_per_vcpu_hour
        .total_cmp(&b.cost_per_vcpu_hour)
        .then(a.latency_ms.cmp(&b.latency_ms))
        .then(b.spare_slots().cmp(&a.spare_slots()))
        .then_with(|| a.cluster_name.cmp(&b.cluster_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> WorksetRequirements {
        WorksetRequirements::new(4, 16)
    }

    #[test]
    fn cheapest_cluster_wins() {
        let mut a = ClusterAssigner::default();
        a.register_cluster(ClusterCapacity::new("pricey", "az-a", 64, 256, 4, 0.09));
        a.register_cluster(ClusterCapacity::new("cheap", "az-b", 64, 256, 4, 0.03));

        let d = a.place(None, &req()).unwrap();
        assert_eq!(d.cluster_name, "cheap");
        assert!(matches!(d.reason, PlacementReason::BestFit { .. }));
    }

    #[test]
    fn latency_then_spare_capacity_break_ties() {
        let mut a = ClusterAssigner::default();
        a.register_cluster(ClusterCapacity::new("far", "az-a", 64, 256, 4, 0.05).with_latency_ms(40));
        a.register_cluster(ClusterCapacity::new("near-small", "az-b", 64, 256, 2, 0.05).with_latency_ms(5));
        a.register_cluster(ClusterCapacity::new("near-big", "az-c", 64, 256, 8, 0.05).with_latency_ms(5));

        assert_eq!(a.place(None, &req()).unwrap().cluster_name, "near-big");
    }

    #[test]
    fn affinity_is_used_when_it_fits() {
        let mut a = ClusterAssigner::default();
        a.register_cluster(ClusterCapacity::new("cheap", "az-a", 64, 256, 4, 0.01));
        a.register_cluster(ClusterCapacity::new("local", "az-b", 64, 256, 4, 0.09));

        let d = a.place(Some("local"), &req()).unwrap();
        assert_eq!(d.cluster_name, "local");
        assert_eq!(d.reason, PlacementReason::Affinity);
    }

    #[test]
    fn advisory_affinity_falls_back() {
        let mut a = ClusterAssigner::new(AffinityPolicy::Advisory);
        a.register_cluster(ClusterCapacity::new("full", "az-a", 64, 256, 0, 0.01));
        a.register_cluster(ClusterCapacity::new("other", "az-b", 64, 256, 4, 0.09));

        let d = a.place(Some("full"), &req()).unwrap();
        assert_eq!(d.cluster_name, "other");
        assert_eq!(
            d.reason,
            PlacementReason::AffinityFallback {
                requested: "full".into()
            }
        );
    }

    #[test]
    fn strict_affinity_never_falls_back() {
        let mut a = ClusterAssigner::new(AffinityPolicy::Strict);
        a.register_cluster(ClusterCapacity::new("full", "az-a", 64, 256, 0, 0.01));
        a.register_cluster(ClusterCapacity::new("other", "az-b", 64, 256, 4, 0.09));

        assert!(!a.can_place(Some("full"), &req()));
        assert!(a.place(Some("full"), &req()).is_none());
        assert!(a.place(Some("missing"), &req()).is_none());
        assert!(a.place(None, &req()).is_some());
    }

    #[test]
    fn oversized_or_orphaned_work_can_never_be_placed() {
        let mut a = ClusterAssigner::new(AffinityPolicy::Strict);
        assert!(a.could_ever_place(None, &WorksetRequirements::new(10_000, 1)));

        a.register_cluster(ClusterCapacity::new("c1", "az-a", 64, 256, 1, 0.05));
        a.place(None, &req()).unwrap();
        assert!(!a.can_place(None, &req()));
        assert!(a.could_ever_place(None, &req()), "busy, not too small");
        assert!(a.could_ever_place(Some("c1"), &req()));

        assert!(!a.could_ever_place(None, &WorksetRequirements::new(10_000, 1)));
        assert!(!a.could_ever_place(Some("missing"), &req()));

        let advisory = {
            let mut a = ClusterAssigner::new(AffinityPolicy::Advisory);
            a.register_cluster(ClusterCapacity::new("c1", "az-a", 64, 256, 1, 0.05));
            a
        };
        assert!(advisory.could_ever_place(Some("missing"), &req()));
    }

    #[test]
    fn reregister_keeps_usage() {
        let mut a = ClusterAssigner::default();
        a.register_cluster(ClusterCapacity::new("c1", "az-a", 64, 256, 1, 0.05));
        a.place(None, &req()).unwrap();

        a.register_cluster(ClusterCapacity::new("c1", "az-a", 64, 256, 2, 0.05));
        let c = a.get("c1").unwrap();
        assert_eq!(c.active_worksets, 1);
        assert_eq!(c.max_concurrent_worksets, 2);
    }

    #[test]
    fn release_unknown_cluster_is_reported() {
        let mut a = ClusterAssigner::default();
        assert!(!a.release("ghost", 1, 1));
    }
}
