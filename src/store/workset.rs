use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::ErrorCategory;
use crate::scheduler::WorksetRequirements;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorksetState {
    Registered,
    Ready,
    Locked,
    InProgress,
    Retrying,
    Completed,
    Failed,
    Ignored,
}

impl WorksetState {
    pub const ALL: [WorksetState; 8] = [
        WorksetState::Registered,
        WorksetState::Ready,
        WorksetState::Locked,
        WorksetState::InProgress,
        WorksetState::Retrying,
        WorksetState::Completed,
        WorksetState::Failed,
        WorksetState::Ignored,
    ];

    /// States in which a lock may be held.
    pub fn is_lockable(self) -> bool {
        matches!(self, WorksetState::Locked | WorksetState::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorksetState::Completed | WorksetState::Failed | WorksetState::Ignored
        )
    }
}

impl fmt::Display for WorksetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorksetState::Registered => "REGISTERED",
            WorksetState::Ready => "READY",
            WorksetState::Locked => "LOCKED",
            WorksetState::InProgress => "IN_PROGRESS",
            WorksetState::Retrying => "RETRYING",
            WorksetState::Completed => "COMPLETED",
            WorksetState::Failed => "FAILED",
            WorksetState::Ignored => "IGNORED",
        };
        f.write_str(s)
    }
}

impl FromStr for WorksetState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorksetState::ALL
            .into_iter()
            .find(|state| state.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown workset state: {s}"))
    }
}

/// Scheduling priority. Ordered so that `Urgent > Normal > Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Urgent,
}

impl Priority {
    /// Highest priority first.
    pub const DESCENDING: [Priority; 3] = [Priority::Urgent, Priority::Normal, Priority::Low];
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Urgent => write!(f, "URGENT"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "URGENT" => Ok(Priority::Urgent),
            "NORMAL" => Ok(Priority::Normal),
            "LOW" => Ok(Priority::Low),
            _ => Err(format!("unknown priority: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityReason {
    DataLocality,
    Cost,
    Manual,
}

/// One entry of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    /// `None` for the entry written at registration.
    pub from_state: Option<WorksetState>,
    pub to_state: WorksetState,
    pub reason: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

/// Input to [`StateStore::register`](crate::store::StateStore::register).
#[derive(Debug, Clone)]
pub struct NewWorkset {
    pub workset_id: String,
    pub storage_location: String,
    pub priority: Priority,
    pub customer_id: Option<String>,
    pub cluster_affinity: Option<String>,
    pub affinity_reason: Option<AffinityReason>,
    /// Overrides the store's default retry limit.
    pub max_retries: Option<u32>,
    pub requirements: Option<WorksetRequirements>,
}

impl NewWorkset {
    pub fn new(
        workset_id: impl Into<String>,
        storage_location: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            workset_id: workset_id.into(),
            storage_location: storage_location.into(),
            priority,
            customer_id: None,
            cluster_affinity: None,
            affinity_reason: None,
            max_retries: None,
            requirements: None,
        }
    }

    pub fn with_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn with_affinity(mut self, cluster: impl Into<String>, reason: AffinityReason) -> Self {
        self.cluster_affinity = Some(cluster.into());
        self.affinity_reason = Some(reason);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_requirements(mut self, requirements: WorksetRequirements) -> Self {
        self.requirements = Some(requirements);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workset {
    pub workset_id: String,
    pub state: WorksetState,
    pub priority: Priority,
    pub storage_location: String,
    pub customer_id: Option<String>,
    pub cluster_affinity: Option<String>,
    pub affinity_reason: Option<AffinityReason>,
    pub requirements: Option<WorksetRequirements>,

    pub lock_owner: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub lock_ttl_seconds: Option<u64>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub error_category: Option<ErrorCategory>,
    pub error_details: Option<String>,
    pub failed_step: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state_history: Vec<StateTransition>,
}

impl Workset {
    pub(crate) fn from_registration(
        new: NewWorkset,
        initial_state: WorksetState,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            workset_id: new.workset_id,
            state: initial_state,
            priority: new.priority,
            storage_location: new.storage_location,
            customer_id: new.customer_id,
            cluster_affinity: new.cluster_affinity,
            affinity_reason: new.affinity_reason,
            requirements: new.requirements,
            lock_owner: None,
            lock_acquired_at: None,
            lock_ttl_seconds: None,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            retry_after: None,
            error_category: None,
            error_details: None,
            failed_step: None,
            created_at: now,
            updated_at: now,
            state_history: vec![StateTransition {
                from_state: None,
                to_state: initial_state,
                reason: "registered".to_string(),
                actor: "store".to_string(),
                timestamp: now,
            }],
        }
    }

    pub fn lock_expires_at(&self) -> Option<DateTime<Utc>> {
        let acquired = self.lock_acquired_at?;
        let ttl = self.lock_ttl_seconds?;
        Some(crate::store::memory::ttl_expiry(acquired, ttl))
    }

    /// True if a lock is held and its TTL has not yet elapsed.
    pub fn has_live_lock(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expires_at().is_some_and(|exp| exp > now)
    }

    /// True if a lock is recorded but its TTL has elapsed.
    pub fn has_stale_lock(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && !self.has_live_lock(now)
    }

    pub(crate) fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_acquired_at = None;
        self.lock_ttl_seconds = None;
    }

    /// Write a new state together with its history entry. Leaving the
    /// lockable states drops any lock.
    pub(crate) fn transition(
        &mut self,
        to: WorksetState,
        reason: impl Into<String>,
        actor: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.state_history.push(StateTransition {
            from_state: Some(self.state),
            to_state: to,
            reason: reason.into(),
            actor: actor.into(),
            timestamp: now,
        });
        self.state = to;
        self.updated_at = now;
        if !to.is_lockable() {
            self.clear_lock();
        }
    }

    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.state_history.last()
    }
}
