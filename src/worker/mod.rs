//! Workset execution.
//!
//! - [`ConcurrentProcessor`]: N polling workers that claim READY worksets,
//!   hand them to a provisioner and record the outcome
//! - [`ClusterProvisioner`]: the boundary to whatever actually runs the
//!   pipeline; [`CommandProvisioner`] runs a local shell command
//! - [`NotificationSink`]: best-effort lifecycle events
//!
//! # Execution Flow
//!
//! 1. Worker takes a concurrency slot and peeks at the READY queue
//! 2. Lock the workset, move it READY -> LOCKED
//! 3. Reserve cluster capacity, move LOCKED -> IN_PROGRESS, notify "started"
//! 4. `submit` + `wait` on a separate task, refreshing the lock meanwhile
//! 5. COMPLETED, or classify the error and let the store choose RETRYING/FAILED
//! 6. Release capacity and lock on every path

pub mod notify;
pub mod processor;
pub mod provisioner;
pub mod timer;

pub use notify::{ChannelSink, EventType, FanoutSink, NotificationSink, TracingSink, WorksetEvent};
pub use processor::{ConcurrentProcessor, PollOutcome};
pub use provisioner::{
    ClusterProvisioner, CommandProvisioner, JobHandle, ProvisionRequest, ProvisionResult,
};
