//! Durable workset storage.
//!
//! [`StateStore`] is the single source of truth for workset existence, state
//! and locking. Every mutating operation is a single atomic conditional write
//! against one workset, so workers in different processes coordinate through
//! the store alone.
//!
//! Locking and state are independent axes: `acquire_lock`, `refresh_lock` and
//! `release_lock` never change `state`. A READY workset may carry a lock for
//! the short window between `acquire_lock` and the READY -> LOCKED write.
//! Every state transition out of `{LOCKED, IN_PROGRESS}` drops the lock in the
//! same write, so no lock outlives the claim into RETRYING or a terminal
//! state.
//!
//! Stores never retry internally. Retry policy lives in the processor.

pub mod memory;
pub mod workset;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::error::{Result, UrsaError};
use crate::retry::ErrorCategory;

pub use memory::InMemoryStateStore;
pub use workset::{
    AffinityReason, NewWorkset, Priority, StateTransition, Workset, WorksetState,
};

/// Result of [`StateStore::acquire_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired { expires_at: DateTime<Utc> },
    /// Another owner holds an unexpired lock. Expected under contention.
    AlreadyLocked {
        owner: String,
        expires_at: DateTime<Utc>,
    },
    /// The workset is in a state that never carries a lock.
    NotLockable { state: WorksetState },
    NotFound,
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired { .. })
    }
}

/// Result of [`StateStore::release_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotOwner { owner: String },
    /// No lock is held, e.g. a terminal transition already dropped it.
    NotLocked,
    NotFound,
}

/// Result of [`StateStore::refresh_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { expires_at: DateTime<Utc> },
    NotOwner { owner: String },
    NotLocked,
    NotFound,
}

/// Failure details persisted by [`StateStore::record_failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub error_details: String,
    pub error_category: ErrorCategory,
    pub failed_step: Option<String>,
}

impl FailureRecord {
    pub fn new(error_details: impl Into<String>, error_category: ErrorCategory) -> Self {
        Self {
            error_details: error_details.into(),
            error_category,
            failed_step: None,
        }
    }

    pub fn at_step(mut self, step: impl Into<String>) -> Self {
        self.failed_step = Some(step.into());
        self
    }
}

/// Position in a `list_by_state` scan. Opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) workset_id: String,
}

impl Cursor {
    pub(crate) fn after(workset: &Workset) -> Self {
        Self {
            created_at: workset.created_at,
            workset_id: workset.workset_id.clone(),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}",
            self.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.workset_id
        )
    }
}

impl FromStr for Cursor {
    type Err = UrsaError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || UrsaError::InvalidArgument(format!("invalid cursor: {s}"));
        let (ts, id) = s.split_once('|').ok_or_else(invalid)?;
        let created_at = DateTime::parse_from_rfc3339(ts)
            .map_err(|_| invalid())?
            .with_timezone(&Utc);
        Ok(Self {
            created_at,
            workset_id: id.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Page {
    pub items: Vec<Workset>,
    /// Present when more items may follow.
    pub next_cursor: Option<String>,
}

/// Counts per state, as reported by `queue_stats()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub by_state: BTreeMap<WorksetState, usize>,
    pub total: usize,
}

impl QueueStats {
    pub fn count(&self, state: WorksetState) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }
}

/// Storage abstraction for worksets.
///
/// Implementations must provide point lookup by id, ordered scans by
/// `(state, priority, created_at)` and `(state, created_at)`, and an atomic
/// conditional write for every mutating method.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Creates a workset. Fails with `AlreadyExists`, leaving the existing
    /// record untouched, if the id is taken.
    async fn register(&self, new: NewWorkset) -> Result<Workset>;

    async fn get(&self, workset_id: &str) -> Result<Workset>;

    /// Worksets in `state`, oldest first. With `priority`, only that tier.
    async fn list_by_state(
        &self,
        state: WorksetState,
        priority: Option<Priority>,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page>;

    async fn list_by_customer(&self, customer_id: &str) -> Result<Vec<Workset>>;

    /// Takes the lock if none is held or the held lock has expired. Re-acquiring
    /// an unexpired lock under the same owner succeeds without changes.
    async fn acquire_lock(
        &self,
        workset_id: &str,
        owner_id: &str,
        ttl_seconds: u64,
    ) -> Result<LockOutcome>;

    /// Restarts the TTL of a lock held by `owner_id`.
    async fn refresh_lock(&self, workset_id: &str, owner_id: &str) -> Result<RefreshOutcome>;

    /// Drops the lock only if `owner_id` holds it.
    async fn release_lock(&self, workset_id: &str, owner_id: &str) -> Result<ReleaseOutcome>;

    /// Writes `new_state` and appends one history entry. With
    /// `expected_current_state`, fails with `Conflict` on mismatch; when the
    /// expected state is LOCKED or IN_PROGRESS, `actor` must also hold the
    /// lock or the write fails with `NotOwner`.
    async fn update_state(
        &self,
        workset_id: &str,
        new_state: WorksetState,
        reason: &str,
        actor: &str,
        expected_current_state: Option<WorksetState>,
    ) -> Result<Workset>;

    /// Records a failed attempt. Returns `true` when a retry was scheduled
    /// (state RETRYING), `false` when the workset is now FAILED.
    ///
    /// Only the lock holder of an IN_PROGRESS workset may record a failure:
    /// `Conflict` for any other state, `NotOwner` for any other actor.
    async fn record_failure(
        &self,
        workset_id: &str,
        failure: &FailureRecord,
        actor: &str,
    ) -> Result<bool>;

    /// RETRYING worksets whose `retry_after` has passed.
    async fn get_retryable(&self, now: DateTime<Utc>) -> Result<Vec<Workset>>;

    /// RETRYING -> READY, dropping any leftover lock.
    async fn reset_for_retry(&self, workset_id: &str) -> Result<Workset>;

    /// LOCKED or IN_PROGRESS worksets whose lock TTL has elapsed.
    async fn get_stale_locked(&self, now: DateTime<Utc>) -> Result<Vec<Workset>>;

    async fn count_by_state(&self) -> Result<QueueStats>;
}
