use std::net::SocketAddr;
use std::path::PathBuf;

use crate::region::ReadRoutingPolicy;
use crate::scheduler::{AffinityPolicy, ClusterCapacity, WorksetRequirements};

/// Retry limits and backoff shape.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay; the n-th retry waits `base * 2^n`
    pub backoff_base_secs: u64,
    /// Upper bound on any single retry delay
    pub backoff_max_secs: u64,
    /// Retries allowed when a workset does not specify its own limit
    pub default_max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_secs: 2,
            backoff_max_secs: 3600,
            default_max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Register new worksets directly as READY instead of REGISTERED.
    pub register_as_ready: bool,
    /// When set, every mutation is written through to this JSON file.
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of independently polling workers
    pub worker_count: usize,
    /// Global cap on worksets in flight across all workers of this process
    pub max_concurrent_worksets: usize,
    pub poll_interval_ms: u64,
    /// Upper bound of random delay added to each idle sleep
    pub poll_jitter_ms: u64,
    pub lock_ttl_seconds: u64,
    /// How long in-flight provisioner calls may keep running after shutdown
    pub shutdown_grace_ms: u64,
    /// Resources assumed for a workset that does not declare its own
    pub default_requirements: WorksetRequirements,
    /// Maximum stale locks reclaimed per poll
    pub stale_recovery_batch: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_concurrent_worksets: 4,
            poll_interval_ms: 5_000,
            poll_jitter_ms: 500,
            lock_ttl_seconds: 3_600,
            shutdown_grace_ms: 30_000,
            default_requirements: WorksetRequirements::default(),
            stale_recovery_batch: 16,
        }
    }
}

impl ProcessorConfig {
    /// Lock refresh period while a provisioner call is in flight.
    pub fn lock_refresh_interval(&self) -> std::time::Duration {
        let ttl_ms = self.lock_ttl_seconds.saturating_mul(1_000);
        std::time::Duration::from_millis((ttl_ms / 3).max(1))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub affinity_policy: AffinityPolicy,
}

/// Static description of one replicated region.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    pub region_id: String,
    pub is_primary: bool,
}

impl RegionConfig {
    pub fn new(region_id: impl Into<String>, is_primary: bool) -> Self {
        Self {
            region_id: region_id.into(),
            is_primary,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub regions: Vec<RegionConfig>,
    pub health_check_interval_ms: u64,
    /// How long the primary must stay unhealthy before writes fail over
    pub failover_grace_ms: u64,
    /// Consecutive failed probes before a region is marked unhealthy
    pub failure_threshold: u32,
    /// Probes slower than this count as failures
    pub max_healthy_latency_ms: u64,
    pub read_policy: ReadRoutingPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            health_check_interval_ms: 10_000,
            failover_grace_ms: 60_000,
            failure_threshold: 2,
            max_healthy_latency_ms: 2_000,
            read_policy: ReadRoutingPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_region(mut self, region_id: impl Into<String>, is_primary: bool) -> Self {
        self.regions.push(RegionConfig::new(region_id, is_primary));
        self
    }
}

/// Per-deployment settings for a coordinator node. Fixed after startup.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub processor: ProcessorConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    /// Multi-region routing; `None` runs against a single store.
    pub coordinator: Option<CoordinatorConfig>,
    /// Clusters known at startup
    pub clusters: Vec<ClusterCapacity>,
    /// Shell command run per workset by the command provisioner
    pub provisioner_command: Option<String>,
    pub dashboard_addr: Option<SocketAddr>,
}

impl NodeConfig {
    pub fn with_cluster(mut self, cluster: ClusterCapacity) -> Self {
        self.clusters.push(cluster);
        self
    }

    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = Some(coordinator);
        self
    }
}
