//! Test harness for workset coordinator integration tests.
//!
//! Provides a scripted provisioner, a simulated clock and a fully wired
//! store + scheduler + processor so tests can drive single poll cycles.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ursa_lite::clock::SimulatedClock;
use ursa_lite::config::{ProcessorConfig, RetryConfig, SchedulerConfig, StoreConfig};
use ursa_lite::retry::{ErrorKind, ErrorSignal};
use ursa_lite::scheduler::{ClusterCapacity, Scheduler, WorksetRequirements};
use ursa_lite::store::{InMemoryStateStore, NewWorkset, Priority, StateStore, Workset};
use ursa_lite::worker::{
    ChannelSink, ClusterProvisioner, ConcurrentProcessor, JobHandle, PollOutcome,
    ProvisionRequest, ProvisionResult, WorksetEvent,
};

/// What the scripted provisioner does for one attempt.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(ErrorSignal),
    RejectSubmit(ErrorSignal),
    Panic,
    /// Never returns; only shutdown or lock loss ends the attempt.
    Hang,
    /// Sleeps for the given duration, then succeeds.
    Slow(Duration),
}

/// Provisioner whose outcome per workset is scripted ahead of time.
/// Worksets without a script succeed.
#[derive(Default)]
pub struct ScriptedProvisioner {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    pending: Mutex<HashMap<String, Step>>,
    submitted: Mutex<Vec<ProvisionRequest>>,
}

impl ScriptedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, workset_id: &str, steps: impl IntoIterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(workset_id.to_string())
            .or_default()
            .extend(steps);
    }

    pub fn submitted(&self) -> Vec<ProvisionRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn attempts(&self, workset_id: &str) -> usize {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.workset_id == workset_id)
            .count()
    }

    fn next_step(&self, workset_id: &str) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(workset_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed)
    }
}

#[async_trait]
impl ClusterProvisioner for ScriptedProvisioner {
    async fn submit(&self, request: &ProvisionRequest) -> Result<JobHandle, ErrorSignal> {
        self.submitted.lock().unwrap().push(request.clone());
        let step = self.next_step(&request.workset_id);
        if let Step::RejectSubmit(signal) = step {
            return Err(signal);
        }
        let job_id = format!("job-{}-{}", request.workset_id, self.attempts(&request.workset_id));
        self.pending.lock().unwrap().insert(job_id.clone(), step);
        Ok(JobHandle {
            job_id,
            workset_id: request.workset_id.clone(),
        })
    }

    async fn wait(&self, handle: &JobHandle) -> ProvisionResult {
        let step = self
            .pending
            .lock()
            .unwrap()
            .remove(&handle.job_id)
            .unwrap_or(Step::Succeed);
        match step {
            Step::Succeed | Step::RejectSubmit(_) => ProvisionResult::Success,
            Step::Fail(signal) => ProvisionResult::failure(signal),
            Step::Panic => panic!("scripted provisioner panic"),
            Step::Hang => std::future::pending().await,
            Step::Slow(duration) => {
                tokio::time::sleep(duration).await;
                ProvisionResult::Success
            }
        }
    }
}

pub fn transient() -> ErrorSignal {
    ErrorSignal::new(ErrorKind::Timeout, "Spot instance reclaimed: request timed out")
}

pub fn permanent_data_error() -> ErrorSignal {
    ErrorSignal::new(ErrorKind::MalformedInput, "FASTQ header malformed at line 4")
}

/// Processor settings with short timings for tests.
pub fn test_processor_config() -> ProcessorConfig {
    ProcessorConfig {
        worker_count: 2,
        max_concurrent_worksets: 4,
        poll_interval_ms: 10,
        poll_jitter_ms: 0,
        lock_ttl_seconds: 60,
        shutdown_grace_ms: 50,
        default_requirements: WorksetRequirements::new(8, 32),
        stale_recovery_batch: 16,
    }
}

pub fn test_retry_config() -> RetryConfig {
    RetryConfig {
        backoff_base_secs: 2,
        backoff_max_secs: 60,
        default_max_retries: 3,
    }
}

/// A cluster that fits `slots` default-sized worksets.
pub fn cluster(name: &str, slots: u32, cost: f64) -> ClusterCapacity {
    ClusterCapacity::new(name, "us-east-1a", 8 * slots, 32 * slots, slots, cost)
}

/// Store, scheduler and processor wired over one simulated clock.
pub struct TestEnv {
    pub clock: Arc<SimulatedClock>,
    pub store: Arc<InMemoryStateStore>,
    pub scheduler: Arc<Scheduler>,
    pub provisioner: Arc<ScriptedProvisioner>,
    pub processor: Arc<ConcurrentProcessor>,
    pub events: mpsc::Receiver<WorksetEvent>,
}

impl TestEnv {
    pub fn new(clusters: Vec<ClusterCapacity>) -> Self {
        Self::with_config(test_processor_config(), test_retry_config(), clusters)
    }

    pub fn with_config(
        processor_config: ProcessorConfig,
        retry: RetryConfig,
        clusters: Vec<ClusterCapacity>,
    ) -> Self {
        let clock = Arc::new(SimulatedClock::default());
        let store = Arc::new(
            InMemoryStateStore::new(
                StoreConfig {
                    register_as_ready: true,
                    state_file: None,
                },
                &retry,
            )
            .with_clock(clock.clone()),
        );
        let dyn_store: Arc<dyn StateStore> = store.clone();
        let scheduler = Arc::new(Scheduler::new(
            dyn_store.clone(),
            &SchedulerConfig::default(),
            processor_config.default_requirements,
        ));
        for c in clusters {
            scheduler.register_cluster(c);
        }
        let provisioner = Arc::new(ScriptedProvisioner::new());
        let (sink, events) = ChannelSink::channel(256);
        let processor = Arc::new(
            ConcurrentProcessor::new(
                dyn_store,
                scheduler.clone(),
                provisioner.clone(),
                Arc::new(sink),
                processor_config,
            )
            .with_clock(clock.clone())
            .with_instance_id("test"),
        );

        Self {
            clock,
            store,
            scheduler,
            provisioner,
            processor,
            events,
        }
    }

    pub async fn register(&self, workset_id: &str, priority: Priority) -> Workset {
        self.store
            .register(NewWorkset::new(
                workset_id,
                format!("s3://ursa-test/{workset_id}"),
                priority,
            ))
            .await
            .unwrap()
    }

    pub async fn register_new(&self, new: NewWorkset) -> Workset {
        self.store.register(new).await.unwrap()
    }

    /// One poll cycle as worker 0, without shutdown.
    pub async fn poll(&self) -> PollOutcome {
        self.poll_as(0).await
    }

    pub async fn poll_as(&self, worker: usize) -> PollOutcome {
        self.processor
            .poll_once(&self.processor.owner_id(worker), &CancellationToken::new())
            .await
            .unwrap()
    }

    pub async fn get(&self, workset_id: &str) -> Workset {
        self.store.get(workset_id).await.unwrap()
    }

    pub fn drain_events(&mut self) -> Vec<WorksetEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Polls a condition until it returns true or the timeout expires.
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "Condition not met within timeout: {}", message);
}
