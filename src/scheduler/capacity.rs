use serde::{Deserialize, Serialize};

/// Resources a workset needs on the cluster that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorksetRequirements {
    pub vcpus: u32,
    pub memory_gb: u32,
}

impl Default for WorksetRequirements {
    fn default() -> Self {
        Self {
            vcpus: 8,
            memory_gb: 32,
        }
    }
}

impl WorksetRequirements {
    pub fn new(vcpus: u32, memory_gb: u32) -> Self {
        Self { vcpus, memory_gb }
    }
}

/// Process-local view of one compute cluster. Rebuilt from registration at
/// startup, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterCapacity {
    pub cluster_name: String,
    pub availability_zone: String,
    pub max_vcpus: u32,
    pub used_vcpus: u32,
    pub max_memory_gb: u32,
    pub used_memory_gb: u32,
    pub active_worksets: u32,
    pub max_concurrent_worksets: u32,
    pub cost_per_vcpu_hour: f64,
    /// Locality hint, lower is closer to the data.
    pub latency_ms: u32,
}

impl ClusterCapacity {
    pub fn new(
        cluster_name: impl Into<String>,
        availability_zone: impl Into<String>,
        max_vcpus: u32,
        max_memory_gb: u32,
        max_concurrent_worksets: u32,
        cost_per_vcpu_hour: f64,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            availability_zone: availability_zone.into(),
            max_vcpus,
            used_vcpus: 0,
            max_memory_gb,
            used_memory_gb: 0,
            active_worksets: 0,
            max_concurrent_worksets,
            cost_per_vcpu_hour,
            latency_ms: 0,
        }
    }

    pub fn with_latency_ms(mut self, latency_ms: u32) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn spare_slots(&self) -> u32 {
        self.max_concurrent_worksets
            .saturating_sub(self.active_worksets)
    }

    pub fn spare_vcpus(&self) -> u32 {
        self.max_vcpus.saturating_sub(self.used_vcpus)
    }

    pub fn spare_memory_gb(&self) -> u32 {
        self.max_memory_gb.saturating_sub(self.used_memory_gb)
    }

    pub fn fits(&self, req: &WorksetRequirements) -> bool {
        self.spare_slots() > 0
            && self.spare_vcpus() >= req.vcpus
            && self.spare_memory_gb() >= req.memory_gb
    }

    /// Whether `req` would fit on this cluster when it is idle.
    pub fn could_ever_fit(&self, req: &WorksetRequirements) -> bool {
        self.max_concurrent_worksets > 0
            && self.max_vcpus >= req.vcpus
            && self.max_memory_gb >= req.memory_gb
    }

    pub(crate) fn reserve(&mut self, req: &WorksetRequirements) {
        self.active_worksets += 1;
        self.used_vcpus += req.vcpus;
        self.used_memory_gb += req.memory_gb;
    }

    pub(crate) fn release(&mut self, vcpus: u32, memory_gb: u32) {
        self.active_worksets = self.active_worksets.saturating_sub(1);
        self.used_vcpus = self.used_vcpus.saturating_sub(vcpus);
        self.used_memory_gb = self.used_memory_gb.saturating_sub(memory_gb);
    }

    pub fn utilization(&self) -> ClusterUtilization {
        ClusterUtilization {
            cluster_name: self.cluster_name.clone(),
            availability_zone: self.availability_zone.clone(),
            active_worksets: self.active_worksets,
            max_concurrent_worksets: self.max_concurrent_worksets,
            vcpu_utilization: ratio(self.used_vcpus, self.max_vcpus),
            memory_utilization: ratio(self.used_memory_gb, self.max_memory_gb),
            cost_per_vcpu_hour: self.cost_per_vcpu_hour,
        }
    }
}

fn ratio(used: u32, max: u32) -> f64 {
    if max == 0 {
        0.0
    } else {
        f64::from(used) / f64::from(max)
    }
}

/// One row of `scheduler_stats()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterUtilization {
    pub cluster_name: String,
    pub availability_zone: String,
    pub active_worksets: u32,
    pub max_concurrent_worksets: u32,
    pub vcpu_utilization: f64,
    pub memory_utilization: f64,
    pub cost_per_vcpu_hour: f64,
}
