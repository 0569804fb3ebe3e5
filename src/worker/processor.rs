use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::ProcessorConfig;
use crate::error::Result;
use crate::retry::{ErrorKind, ErrorSignal, RetryClassifier};
use crate::scheduler::{Decision, ScheduleOutcome, Scheduler};
use crate::store::{
    FailureRecord, LockOutcome, RefreshOutcome, ReleaseOutcome, StateStore, Workset,
    WorksetState,
};
use crate::worker::notify::{EventType, NotificationSink, WorksetEvent};
use crate::worker::provisioner::{ClusterProvisioner, ProvisionRequest, ProvisionResult};
use crate::worker::timer::jittered_poll_interval;

const STEP_SUBMIT: &str = "submit";
const STEP_PIPELINE: &str = "pipeline";

/// What a single [`ConcurrentProcessor::poll_once`] call did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Nothing READY and nothing due for requeue.
    Idle,
    /// `count` worksets were moved back to READY from RETRYING or from an
    /// expired lock. Nothing was dispatched in this cycle.
    Requeued { count: usize },
    /// Every candidate was locked or changed state under us.
    Contended,
    /// READY work exists but no cluster can take it right now.
    NoCapacity { workset_id: String },
    /// Every READY candidate needs more than any registered cluster offers,
    /// or a strict affinity to a cluster that is not registered. They stay
    /// READY and are passed over until a cluster that fits them appears.
    Unplaceable { workset_id: String },
    Completed { workset_id: String, cluster_name: String },
    Retrying { workset_id: String, retry_count: u32 },
    Failed { workset_id: String },
    /// Shutdown grace elapsed before the provisioner returned. The lock is
    /// left to expire so another instance can reclaim the workset.
    Abandoned { workset_id: String },
    /// Another owner took the lock while the provisioner was running, or
    /// before its result could be recorded. The result is discarded.
    LockLost { workset_id: String },
}

impl PollOutcome {
    /// Whether the worker should poll again immediately instead of sleeping.
    fn made_progress(&self) -> bool {
        !matches!(
            self,
            PollOutcome::Idle
                | PollOutcome::Contended
                | PollOutcome::NoCapacity { .. }
                | PollOutcome::Unplaceable { .. }
        )
    }
}

enum RunResult {
    Finished(ProvisionResult),
    Abandoned,
    LockLost,
}

/// Releases a capacity reservation when dropped, so every exit path after
/// placement gives the slot back.
struct Reservation<'a> {
    scheduler: &'a Scheduler,
    decision: Decision,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.scheduler.release_decision(&self.decision);
    }
}

/// Runs N polling workers against a shared store.
///
/// Workers coordinate only through the store's locks; there is no central
/// dispatcher. A semaphore caps how many worksets this process has in flight.
pub struct ConcurrentProcessor {
    instance_id: String,
    store: Arc<dyn StateStore>,
    scheduler: Arc<Scheduler>,
    provisioner: Arc<dyn ClusterProvisioner>,
    sink: Arc<dyn NotificationSink>,
    classifier: RetryClassifier,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
    slots: Arc<Semaphore>,
}

impl ConcurrentProcessor {
    pub fn new(
        store: Arc<dyn StateStore>,
        scheduler: Arc<Scheduler>,
        provisioner: Arc<dyn ClusterProvisioner>,
        sink: Arc<dyn NotificationSink>,
        config: ProcessorConfig,
    ) -> Self {
        let instance_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            instance_id,
            store,
            scheduler,
            provisioner,
            sink,
            classifier: RetryClassifier::new(),
            clock: Arc::new(SystemClock),
            slots: Arc::new(Semaphore::new(config.max_concurrent_worksets.max(1))),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Lock owner id used by worker `index`.
    pub fn owner_id(&self, index: usize) -> String {
        format!("{}-w{}", self.instance_id, index)
    }

    /// Worksets currently held by this process.
    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrent_worksets
            .max(1)
            .saturating_sub(self.slots.available_permits())
    }

    /// Runs all workers until `shutdown` fires and every worker has drained.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        for index in 0..self.config.worker_count.max(1) {
            let processor = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { processor.worker_loop(index, shutdown).await });
        }
        tracing::info!(
            instance_id = %self.instance_id,
            workers = self.config.worker_count.max(1),
            max_in_flight = self.config.max_concurrent_worksets.max(1),
            "Processor started"
        );

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!(instance_id = %self.instance_id, "Processor stopped");
    }

    async fn worker_loop(&self, index: usize, shutdown: CancellationToken) {
        let owner = self.owner_id(index);
        tracing::debug!(owner = %owner, "Worker started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let progressed = match self.poll_once(&owner, &shutdown).await {
                Ok(outcome) => {
                    tracing::trace!(owner = %owner, outcome = ?outcome, "Poll finished");
                    outcome.made_progress()
                }
                Err(e) => {
                    tracing::warn!(owner = %owner, error = %e, "Poll failed");
                    false
                }
            };
            drop(permit);

            if shutdown.is_cancelled() {
                break;
            }
            if !progressed {
                let delay =
                    jittered_poll_interval(self.config.poll_interval_ms, self.config.poll_jitter_ms);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        tracing::debug!(owner = %owner, "Worker stopped");
    }

    /// One poll cycle for `owner`. Due retries and expired locks go back to
    /// READY first; if nothing was requeued, claim the best READY workset,
    /// run it and record the result.
    pub async fn poll_once(&self, owner: &str, shutdown: &CancellationToken) -> Result<PollOutcome> {
        let requeued = self.requeue_due().await? + self.recover_stale(owner).await?;
        if requeued > 0 {
            // Re-poll so requeued work competes on priority with the backlog.
            return Ok(PollOutcome::Requeued { count: requeued });
        }

        // Look a little past the head so concurrent workers don't all fight
        // over the same workset.
        let lookahead = self.config.worker_count.max(1) + 1;
        let mut window = lookahead;
        let mut seen = 0;
        let mut tried = 0;
        let mut unplaceable: Option<String> = None;

        loop {
            let candidates = self.scheduler.queue().peek(window).await?;
            let exhausted = candidates.len() < window;

            for candidate in candidates.into_iter().skip(seen) {
                seen += 1;
                if !self.scheduler.could_ever_place(&candidate) {
                    tracing::debug!(
                        workset_id = %candidate.workset_id,
                        affinity = ?candidate.cluster_affinity,
                        "No registered cluster can hold workset, passing over"
                    );
                    unplaceable.get_or_insert(candidate.workset_id);
                    continue;
                }
                if !self.scheduler.can_place(&candidate) {
                    // Priority order is strict: don't let smaller work jump a
                    // head that fits once capacity frees up.
                    return Ok(PollOutcome::NoCapacity {
                        workset_id: candidate.workset_id,
                    });
                }
                if let Some(workset) = self.claim(&candidate.workset_id, owner).await? {
                    return self.dispatch(workset, owner, shutdown).await;
                }
                tried += 1;
                if tried >= lookahead {
                    return Ok(PollOutcome::Contended);
                }
            }

            if exhausted {
                break;
            }
            window = window.saturating_mul(2);
        }

        Ok(match unplaceable {
            _ if tried > 0 => PollOutcome::Contended,
            Some(workset_id) => PollOutcome::Unplaceable { workset_id },
            None => PollOutcome::Idle,
        })
    }

    /// Lock plus READY -> LOCKED. `None` if someone else got there first.
    async fn claim(&self, workset_id: &str, owner: &str) -> Result<Option<Workset>> {
        match self
            .store
            .acquire_lock(workset_id, owner, self.config.lock_ttl_seconds)
            .await?
        {
            LockOutcome::Acquired { .. } => {}
            LockOutcome::AlreadyLocked { owner: holder, .. } => {
                tracing::debug!(workset_id, holder = %holder, "Workset already locked, skipping");
                return Ok(None);
            }
            LockOutcome::NotLockable { state } => {
                tracing::debug!(workset_id, state = %state, "Workset left READY, skipping");
                return Ok(None);
            }
            LockOutcome::NotFound => return Ok(None),
        }

        match self
            .store
            .update_state(
                workset_id,
                WorksetState::Locked,
                "claimed by worker",
                owner,
                Some(WorksetState::Ready),
            )
            .await
        {
            Ok(workset) => Ok(Some(workset)),
            Err(e) => {
                self.release_quietly(workset_id, owner).await;
                if e.is_conflict() {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn dispatch(
        &self,
        workset: Workset,
        owner: &str,
        shutdown: &CancellationToken,
    ) -> Result<PollOutcome> {
        let workset_id = workset.workset_id.clone();
        let result = self.dispatch_claimed(workset, owner, shutdown).await;
        if result.is_err() {
            self.release_quietly(&workset_id, owner).await;
        }
        result
    }

    async fn dispatch_claimed(
        &self,
        workset: Workset,
        owner: &str,
        shutdown: &CancellationToken,
    ) -> Result<PollOutcome> {
        let workset_id = workset.workset_id.clone();

        let decision = match self.scheduler.schedule_workset(&workset, None) {
            ScheduleOutcome::Placed(decision) => decision,
            ScheduleOutcome::NoCapacity => {
                // Capacity vanished between the check and the claim.
                self.store
                    .update_state(
                        &workset_id,
                        WorksetState::Ready,
                        "no cluster capacity",
                        owner,
                        Some(WorksetState::Locked),
                    )
                    .await?;
                self.release_quietly(&workset_id, owner).await;
                return Ok(PollOutcome::NoCapacity { workset_id });
            }
        };
        let reservation = Reservation {
            scheduler: &self.scheduler,
            decision,
        };
        let cluster_name = reservation.decision.cluster_name.clone();

        let started = match self
            .store
            .update_state(
                &workset_id,
                WorksetState::InProgress,
                &format!("dispatched to {}: {}", cluster_name, reservation.decision.reason),
                owner,
                Some(WorksetState::Locked),
            )
            .await
        {
            Ok(workset) => workset,
            Err(e) if e.is_conflict() => {
                tracing::warn!(workset_id = %workset_id, error = %e, "Workset changed while locked");
                self.release_quietly(&workset_id, owner).await;
                return Ok(PollOutcome::Contended);
            }
            Err(e) => return Err(e),
        };
        tracing::info!(
            workset_id = %workset_id,
            cluster = %cluster_name,
            priority = %started.priority,
            attempt = started.retry_count + 1,
            "Workset started"
        );
        self.emit(WorksetEvent::from_workset(EventType::Started, &started).on_cluster(&cluster_name))
            .await;

        let request = ProvisionRequest {
            workset_id: workset_id.clone(),
            storage_location: started.storage_location.clone(),
            cluster_name: cluster_name.clone(),
            requirements: reservation.decision.requirements,
        };
        let run = self.run_provisioner(request, owner, shutdown).await;
        drop(reservation);

        match run {
            RunResult::Abandoned => {
                tracing::warn!(workset_id = %workset_id, "Shutdown grace elapsed, abandoning workset");
                Ok(PollOutcome::Abandoned { workset_id })
            }
            RunResult::LockLost => Ok(PollOutcome::LockLost { workset_id }),
            RunResult::Finished(ProvisionResult::Success) => {
                let done = match self
                    .store
                    .update_state(
                        &workset_id,
                        WorksetState::Completed,
                        &format!("completed on {cluster_name}"),
                        owner,
                        Some(WorksetState::InProgress),
                    )
                    .await
                {
                    Ok(done) => done,
                    Err(e) if e.is_conflict() => {
                        tracing::warn!(workset_id = %workset_id, error = %e, "Lock lost before completion was recorded");
                        return Ok(PollOutcome::LockLost { workset_id });
                    }
                    Err(e) => return Err(e),
                };
                self.release_quietly(&workset_id, owner).await;
                tracing::info!(workset_id = %workset_id, cluster = %cluster_name, "Workset completed");
                self.emit(WorksetEvent::from_workset(EventType::Completed, &done).on_cluster(&cluster_name))
                    .await;
                Ok(PollOutcome::Completed {
                    workset_id,
                    cluster_name,
                })
            }
            RunResult::Finished(ProvisionResult::Failure { error, failed_step }) => {
                self.handle_failure(&workset_id, &cluster_name, error, failed_step, owner)
                    .await
            }
        }
    }

    async fn handle_failure(
        &self,
        workset_id: &str,
        cluster_name: &str,
        error: ErrorSignal,
        failed_step: Option<String>,
        owner: &str,
    ) -> Result<PollOutcome> {
        let classification = self.classifier.classify(&error);
        let mut failure = FailureRecord::new(error.detail.clone(), classification.category);
        if let Some(step) = failed_step {
            failure = failure.at_step(step);
        }

        let will_retry = match self.store.record_failure(workset_id, &failure, owner).await {
            Ok(will_retry) => will_retry,
            Err(e) if e.is_conflict() => {
                tracing::warn!(workset_id, error = %e, "Lock lost before failure was recorded");
                return Ok(PollOutcome::LockLost {
                    workset_id: workset_id.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        self.release_quietly(workset_id, owner).await;
        let after = self.store.get(workset_id).await?;

        if will_retry {
            tracing::warn!(
                workset_id,
                category = %classification.category,
                retry_count = after.retry_count,
                max_retries = after.max_retries,
                retry_after = ?after.retry_after,
                error = %error,
                "Workset failed, retry scheduled"
            );
            self.emit(WorksetEvent::from_workset(EventType::Retrying, &after).on_cluster(cluster_name))
                .await;
            Ok(PollOutcome::Retrying {
                workset_id: workset_id.to_string(),
                retry_count: after.retry_count,
            })
        } else {
            tracing::error!(
                workset_id,
                category = %classification.category,
                retry_count = after.retry_count,
                error = %error,
                "Workset failed"
            );
            self.emit(WorksetEvent::from_workset(EventType::Failed, &after).on_cluster(cluster_name))
                .await;
            Ok(PollOutcome::Failed {
                workset_id: workset_id.to_string(),
            })
        }
    }

    /// Runs submit + wait on its own task so a panic or a hang cannot take
    /// the worker with it. Keeps the lock fresh while it runs.
    async fn run_provisioner(
        &self,
        request: ProvisionRequest,
        owner: &str,
        shutdown: &CancellationToken,
    ) -> RunResult {
        let workset_id = request.workset_id.clone();
        let provisioner = self.provisioner.clone();
        let mut task = tokio::spawn(async move {
            let handle = match provisioner.submit(&request).await {
                Ok(handle) => handle,
                Err(error) => {
                    return ProvisionResult::Failure {
                        error,
                        failed_step: Some(STEP_SUBMIT.to_string()),
                    }
                }
            };
            match provisioner.wait(&handle).await {
                ProvisionResult::Failure {
                    error,
                    failed_step: None,
                } => ProvisionResult::Failure {
                    error,
                    failed_step: Some(STEP_PIPELINE.to_string()),
                },
                other => other,
            }
        });

        let refresh_every = self.config.lock_refresh_interval();
        let mut refresh = tokio::time::interval_at(Instant::now() + refresh_every, refresh_every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let grace = tokio::time::sleep(Duration::from_secs(u32::MAX.into()));
        tokio::pin!(grace);
        let mut draining = false;

        loop {
            tokio::select! {
                joined = &mut task => {
                    return RunResult::Finished(match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => {
                            tracing::error!(workset_id = %workset_id, "Provisioner panicked");
                            ProvisionResult::Failure {
                                error: ErrorSignal::new(ErrorKind::Internal, "provisioner panicked"),
                                failed_step: Some(STEP_PIPELINE.to_string()),
                            }
                        }
                        Err(e) => ProvisionResult::failure(ErrorSignal::new(ErrorKind::Cancelled, e.to_string())),
                    });
                }
                _ = refresh.tick() => {
                    match self.store.refresh_lock(&workset_id, owner).await {
                        Ok(RefreshOutcome::Refreshed { expires_at }) => {
                            tracing::trace!(workset_id = %workset_id, %expires_at, "Lock refreshed");
                        }
                        Ok(other) => {
                            tracing::warn!(workset_id = %workset_id, outcome = ?other, "Lock lost while running");
                            task.abort();
                            return RunResult::LockLost;
                        }
                        Err(e) => {
                            tracing::warn!(workset_id = %workset_id, error = %e, "Lock refresh failed");
                        }
                    }
                }
                _ = shutdown.cancelled(), if !draining => {
                    draining = true;
                    let grace_period = Duration::from_millis(self.config.shutdown_grace_ms);
                    grace.as_mut().reset(Instant::now() + grace_period);
                    tracing::info!(
                        workset_id = %workset_id,
                        grace_ms = self.config.shutdown_grace_ms,
                        "Shutdown requested, waiting for in-flight workset"
                    );
                }
                _ = &mut grace, if draining => {
                    task.abort();
                    return RunResult::Abandoned;
                }
            }
        }
    }

    /// Moves RETRYING worksets whose delay has elapsed back to READY.
    async fn requeue_due(&self) -> Result<usize> {
        let due = self.store.get_retryable(self.clock.now()).await?;
        let mut count = 0;
        for workset in due {
            match self.store.reset_for_retry(&workset.workset_id).await {
                Ok(ws) => {
                    tracing::info!(
                        workset_id = %ws.workset_id,
                        retry_count = ws.retry_count,
                        "Workset requeued for retry"
                    );
                    count += 1;
                }
                // Another worker requeued it first.
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    /// Returns worksets whose holder died back to READY. Does not count as a
    /// retry attempt.
    async fn recover_stale(&self, owner: &str) -> Result<usize> {
        let stale = self.store.get_stale_locked(self.clock.now()).await?;
        let mut count = 0;
        for workset in stale.into_iter().take(self.config.stale_recovery_batch) {
            let workset_id = &workset.workset_id;
            let previous_owner = workset.lock_owner.clone().unwrap_or_default();
            if !self
                .store
                .acquire_lock(workset_id, owner, self.config.lock_ttl_seconds)
                .await?
                .is_acquired()
            {
                continue;
            }
            match self
                .store
                .update_state(
                    workset_id,
                    WorksetState::Ready,
                    &format!("lock held by {previous_owner} expired"),
                    owner,
                    Some(workset.state),
                )
                .await
            {
                Ok(_) => {
                    tracing::warn!(
                        workset_id = %workset_id,
                        previous_owner = %previous_owner,
                        from = %workset.state,
                        "Recovered workset from expired lock"
                    );
                    count += 1;
                }
                Err(e) if e.is_conflict() => self.release_quietly(workset_id, owner).await,
                Err(e) => {
                    self.release_quietly(workset_id, owner).await;
                    return Err(e);
                }
            }
        }
        Ok(count)
    }

    async fn release_quietly(&self, workset_id: &str, owner: &str) {
        match self.store.release_lock(workset_id, owner).await {
            Ok(ReleaseOutcome::Released) | Ok(ReleaseOutcome::NotLocked) => {}
            Ok(other) => {
                tracing::debug!(workset_id, outcome = ?other, "Lock not released");
            }
            Err(e) => {
                tracing::warn!(workset_id, error = %e, "Failed to release lock");
            }
        }
    }

    async fn emit(&self, event: WorksetEvent) {
        if let Err(e) = self.sink.notify(&event).await {
            tracing::warn!(
                workset_id = %event.workset_id,
                event = %event.event_type,
                error = %e,
                "Notification failed"
            );
        }
    }
}
