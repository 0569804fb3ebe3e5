//! Multi-region routing over replicated state stores.
//!
//! [`MultiRegionCoordinator`] implements [`StateStore`] itself: writes go to
//! the current primary region, reads follow a [`ReadRoutingPolicy`].
//! Replication between regions is the backing stores' job. A background loop
//! probes every region and promotes a new primary once the current one has
//! been unhealthy for longer than the failover grace period. There is no
//! automatic failback.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::error::{Result, UrsaError};
use crate::store::{
    FailureRecord, LockOutcome, NewWorkset, Page, Priority, QueueStats, RefreshOutcome,
    ReleaseOutcome, StateStore, Workset, WorksetState,
};

/// Health view of one region. Created from configuration, never removed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Region {
    pub region_id: String,
    pub is_primary: bool,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub unhealthy_since: Option<DateTime<Utc>>,
}

impl Region {
    fn new(region_id: String, is_primary: bool) -> Self {
        Self {
            region_id,
            is_primary,
            last_health_check_at: None,
            latency_ms: None,
            healthy: true,
            consecutive_failures: 0,
            unhealthy_since: None,
        }
    }

    /// Healthy, and checked recently enough to trust.
    fn is_fresh(&self, now: DateTime<Utc>, max_staleness: Duration) -> bool {
        if !self.healthy {
            return false;
        }
        let Some(checked) = self.last_health_check_at else {
            return false;
        };
        chrono::Duration::from_std(max_staleness)
            .map(|staleness| now.signed_duration_since(checked) <= staleness)
            .unwrap_or(true)
    }
}

/// Where reads go. Writes always go to the primary.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRoutingPolicy {
    pub preferred: Option<String>,
    /// Tried in order when the preferred region is unhealthy or stale
    pub fallback: Vec<String>,
    /// Oldest health check still trusted for a preferred or fallback region
    pub max_staleness: Duration,
}

impl Default for ReadRoutingPolicy {
    fn default() -> Self {
        Self {
            preferred: None,
            fallback: Vec::new(),
            max_staleness: Duration::from_secs(30),
        }
    }
}

impl ReadRoutingPolicy {
    pub fn prefer(region_id: impl Into<String>) -> Self {
        Self {
            preferred: Some(region_id.into()),
            ..Self::default()
        }
    }

    pub fn with_fallback(mut self, region_id: impl Into<String>) -> Self {
        self.fallback.push(region_id.into());
        self
    }

    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = max_staleness;
        self
    }
}

/// Reachability check for one region.
#[async_trait]
pub trait RegionProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
}

/// Probes a region by running a cheap query against its store.
pub struct StoreProbe {
    store: Arc<dyn StateStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RegionProbe for StoreProbe {
    async fn probe(&self) -> Result<()> {
        self.store.count_by_state().await.map(|_| ())
    }
}

struct RegionBackend {
    store: Arc<dyn StateStore>,
    probe: Arc<dyn RegionProbe>,
}

pub struct MultiRegionCoordinator {
    backends: BTreeMap<String, RegionBackend>,
    regions: RwLock<BTreeMap<String, Region>>,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
}

impl MultiRegionCoordinator {
    /// Builds a coordinator over one store per configured region. Exactly one
    /// region may be flagged primary; if none is, the first configured region
    /// is used.
    pub fn new(
        config: CoordinatorConfig,
        mut stores: BTreeMap<String, Arc<dyn StateStore>>,
    ) -> Result<Self> {
        if config.regions.is_empty() {
            return Err(UrsaError::InvalidArgument(
                "coordinator needs at least one region".to_string(),
            ));
        }
        let primaries = config.regions.iter().filter(|r| r.is_primary).count();
        if primaries > 1 {
            return Err(UrsaError::InvalidArgument(format!(
                "{primaries} regions flagged primary, expected one"
            )));
        }

        let mut backends = BTreeMap::new();
        let mut regions = BTreeMap::new();
        for (index, rc) in config.regions.iter().enumerate() {
            let store = stores.remove(&rc.region_id).ok_or_else(|| {
                UrsaError::InvalidArgument(format!("no store for region {}", rc.region_id))
            })?;
            let is_primary = rc.is_primary || (primaries == 0 && index == 0);
            backends.insert(
                rc.region_id.clone(),
                RegionBackend {
                    probe: Arc::new(StoreProbe::new(store.clone())),
                    store,
                },
            );
            regions.insert(rc.region_id.clone(), Region::new(rc.region_id.clone(), is_primary));
        }

        Ok(Self {
            backends,
            regions: RwLock::new(regions),
            config,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the default [`StoreProbe`] for `region_id`.
    pub fn with_probe(mut self, region_id: &str, probe: Arc<dyn RegionProbe>) -> Self {
        match self.backends.get_mut(region_id) {
            Some(backend) => backend.probe = probe,
            None => tracing::warn!(region = region_id, "Probe for unknown region ignored"),
        }
        self
    }

    /// Snapshot of every region, ordered by id.
    pub async fn regions(&self) -> Vec<Region> {
        self.regions.read().await.values().cloned().collect()
    }

    pub async fn primary_region(&self) -> Option<String> {
        self.regions
            .read()
            .await
            .values()
            .find(|r| r.is_primary)
            .map(|r| r.region_id.clone())
    }

    /// Probes every region once, applies health transitions and failover, and
    /// returns the resulting snapshot.
    pub async fn check_health_once(&self) -> Vec<Region> {
        let max_latency = Duration::from_millis(self.config.max_healthy_latency_ms);
        let mut results = Vec::with_capacity(self.backends.len());
        for (region_id, backend) in &self.backends {
            let started = tokio::time::Instant::now();
            let outcome = match tokio::time::timeout(max_latency, backend.probe.probe()).await {
                Ok(Ok(())) => {
                    let elapsed = started.elapsed();
                    if elapsed > max_latency {
                        Err(format!("probe took {}ms", elapsed.as_millis()))
                    } else {
                        Ok(elapsed)
                    }
                }
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("probe timed out after {}ms", max_latency.as_millis())),
            };
            results.push((region_id.clone(), outcome));
        }

        let now = self.clock.now();
        let mut regions = self.regions.write().await;
        for (region_id, outcome) in results {
            if let Some(region) = regions.get_mut(&region_id) {
                match outcome {
                    Ok(latency) => self.mark_success(region, latency, now),
                    Err(reason) => self.mark_failure(region, &reason, now),
                }
            }
        }
        self.maybe_failover(&mut regions, now);
        regions.values().cloned().collect()
    }

    /// Runs [`check_health_once`](Self::check_health_once) on a fixed
    /// interval until `shutdown` fires.
    pub async fn run_health_checks(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.health_check_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Region health checks stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.check_health_once().await;
                }
            }
        }
    }

    fn mark_success(&self, region: &mut Region, latency: Duration, now: DateTime<Utc>) {
        if !region.healthy {
            tracing::info!(
                region = %region.region_id,
                latency_ms = latency.as_millis() as u64,
                "Region healthy again"
            );
        }
        region.healthy = true;
        region.consecutive_failures = 0;
        region.unhealthy_since = None;
        region.latency_ms = Some(latency.as_millis() as u64);
        region.last_health_check_at = Some(now);
    }

    fn mark_failure(&self, region: &mut Region, reason: &str, now: DateTime<Utc>) {
        region.consecutive_failures = region.consecutive_failures.saturating_add(1);
        region.last_health_check_at = Some(now);
        if region.healthy && region.consecutive_failures >= self.config.failure_threshold.max(1) {
            region.healthy = false;
            region.unhealthy_since = Some(now);
            tracing::warn!(
                region = %region.region_id,
                failures = region.consecutive_failures,
                reason,
                "Region marked unhealthy"
            );
        } else {
            tracing::debug!(region = %region.region_id, reason, "Region probe failed");
        }
    }

    fn maybe_failover(&self, regions: &mut BTreeMap<String, Region>, now: DateTime<Utc>) {
        let Some(primary) = regions.values().find(|r| r.is_primary) else {
            return;
        };
        let Some(since) = primary.unhealthy_since.filter(|_| !primary.healthy) else {
            return;
        };
        let grace = chrono::Duration::milliseconds(
            i64::try_from(self.config.failover_grace_ms).unwrap_or(i64::MAX),
        );
        if now.signed_duration_since(since) < grace {
            return;
        }

        let old_primary = primary.region_id.clone();
        let candidate = regions
            .values()
            .filter(|r| r.healthy && !r.is_primary)
            .min_by(|a, b| {
                a.latency_ms
                    .unwrap_or(u64::MAX)
                    .cmp(&b.latency_ms.unwrap_or(u64::MAX))
                    .then_with(|| a.region_id.cmp(&b.region_id))
            })
            .map(|r| r.region_id.clone());

        let Some(new_primary) = candidate else {
            tracing::warn!(region = %old_primary, "Primary unhealthy but no healthy region to fail over to");
            return;
        };
        for region in regions.values_mut() {
            region.is_primary = region.region_id == new_primary;
        }
        tracing::error!(from = %old_primary, to = %new_primary, "Failing over primary region");
    }

    /// Counts a store-level failure from live traffic against the region's
    /// health, same as a failed probe.
    async fn note_unavailable(&self, region_id: &str, error: &UrsaError) {
        let now = self.clock.now();
        let mut regions = self.regions.write().await;
        if let Some(region) = regions.get_mut(region_id) {
            self.mark_failure(region, &error.to_string(), now);
        }
    }

    async fn primary(&self) -> Result<(String, Arc<dyn StateStore>)> {
        let region_id = self.primary_region().await.ok_or(UrsaError::NoHealthyRegion)?;
        let backend = self
            .backends
            .get(&region_id)
            .ok_or_else(|| UrsaError::RegionUnavailable(region_id.clone()))?;
        Ok((region_id, backend.store.clone()))
    }

    /// Region reads should go to right now.
    pub async fn read_region(&self) -> Option<String> {
        let now = self.clock.now();
        let policy = &self.config.read_policy;
        let regions = self.regions.read().await;
        let fresh = |id: &str| {
            regions
                .get(id)
                .is_some_and(|r| r.is_fresh(now, policy.max_staleness))
        };

        if let Some(preferred) = policy.preferred.as_ref().filter(|id| fresh(id.as_str())) {
            return Some(preferred.clone());
        }
        if let Some(fallback) = policy.fallback.iter().find(|id| fresh(id.as_str())) {
            return Some(fallback.clone());
        }
        if let Some(nearest) = regions
            .values()
            .filter(|r| r.healthy && r.latency_ms.is_some())
            .min_by(|a, b| {
                a.latency_ms
                    .cmp(&b.latency_ms)
                    .then_with(|| a.region_id.cmp(&b.region_id))
            })
        {
            return Some(nearest.region_id.clone());
        }
        regions
            .values()
            .find(|r| r.is_primary)
            .map(|r| r.region_id.clone())
    }

    async fn write<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn StateStore>) -> Fut + Send,
        Fut: std::future::Future<Output = Result<T>> + Send,
        T: Send,
    {
        let (region_id, store) = self.primary().await?;
        match op(store).await {
            Err(e) if e.is_unavailable() => {
                self.note_unavailable(&region_id, &e).await;
                Err(UrsaError::RegionUnavailable(format!("{region_id}: {e}")))
            }
            other => other,
        }
    }

    /// Runs `op` against the routed read region, retrying on the primary if
    /// that region's store is down.
    async fn read<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn StateStore>) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T>> + Send,
        T: Send,
    {
        let (primary_id, primary_store) = self.primary().await?;
        let region_id = self.read_region().await.unwrap_or_else(|| primary_id.clone());
        if region_id == primary_id {
            return self.write(op).await;
        }

        let Some(backend) = self.backends.get(&region_id) else {
            return op(primary_store).await;
        };
        match op(backend.store.clone()).await {
            Err(e) if e.is_unavailable() => {
                tracing::warn!(region = %region_id, error = %e, "Read failed, retrying on primary");
                self.note_unavailable(&region_id, &e).await;
                self.write(op).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl StateStore for MultiRegionCoordinator {
    async fn register(&self, new: NewWorkset) -> Result<Workset> {
        self.write(|store| async move { store.register(new).await })
            .await
    }

    async fn get(&self, workset_id: &str) -> Result<Workset> {
        self.read(|store| async move { store.get(workset_id).await })
            .await
    }

    async fn list_by_state(
        &self,
        state: WorksetState,
        priority: Option<Priority>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page> {
        self.read(|store| async move { store.list_by_state(state, priority, limit, cursor).await })
            .await
    }

    async fn list_by_customer(&self, customer_id: &str) -> Result<Vec<Workset>> {
        self.read(|store| async move { store.list_by_customer(customer_id).await })
            .await
    }

    async fn acquire_lock(
        &self,
        workset_id: &str,
        owner_id: &str,
        ttl_seconds: u64,
    ) -> Result<LockOutcome> {
        self.write(|store| async move { store.acquire_lock(workset_id, owner_id, ttl_seconds).await })
            .await
    }

    async fn refresh_lock(&self, workset_id: &str, owner_id: &str) -> Result<RefreshOutcome> {
        self.write(|store| async move { store.refresh_lock(workset_id, owner_id).await })
            .await
    }

    async fn release_lock(&self, workset_id: &str, owner_id: &str) -> Result<ReleaseOutcome> {
        self.write(|store| async move { store.release_lock(workset_id, owner_id).await })
            .await
    }

    async fn update_state(
        &self,
        workset_id: &str,
        new_state: WorksetState,
        reason: &str,
        actor: &str,
        expected_current_state: Option<WorksetState>,
    ) -> Result<Workset> {
        self.write(|store| async move {
            store
                .update_state(workset_id, new_state, reason, actor, expected_current_state)
                .await
        })
        .await
    }

    async fn record_failure(
        &self,
        workset_id: &str,
        failure: &FailureRecord,
        actor: &str,
    ) -> Result<bool> {
        self.write(|store| async move { store.record_failure(workset_id, failure, actor).await })
            .await
    }

    async fn get_retryable(&self, now: DateTime<Utc>) -> Result<Vec<Workset>> {
        self.read(|store| async move { store.get_retryable(now).await })
            .await
    }

    async fn reset_for_retry(&self, workset_id: &str) -> Result<Workset> {
        self.write(|store| async move { store.reset_for_retry(workset_id).await })
            .await
    }

    async fn get_stale_locked(&self, now: DateTime<Utc>) -> Result<Vec<Workset>> {
        self.read(|store| async move { store.get_stale_locked(now).await })
            .await
    }

    async fn count_by_state(&self) -> Result<QueueStats> {
        self.read(|store| async move { store.count_by_state().await })
            .await
    }
}
