use thiserror::Error;

use crate::store::WorksetState;

#[derive(Error, Debug)]
pub enum UrsaError {
    #[error("Workset not found: {0}")]
    WorksetNotFound(String),

    #[error("Workset already exists: {0}")]
    AlreadyExists(String),

    #[error("State conflict on workset {workset_id}: expected {expected}, found {actual}")]
    Conflict {
        workset_id: String,
        expected: WorksetState,
        actual: WorksetState,
    },

    #[error("Workset {workset_id} is not locked by {actor} (owner: {owner:?})")]
    NotOwner {
        workset_id: String,
        owner: Option<String>,
        actor: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Region unavailable: {0}")]
    RegionUnavailable(String),

    #[error("No healthy region available")]
    NoHealthyRegion,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UrsaError {
    /// True for optimistic-concurrency mismatches and writes from a worker
    /// that no longer holds the lock. Callers resolve these by re-reading
    /// rather than treating them as a failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, UrsaError::Conflict { .. } | UrsaError::NotOwner { .. })
    }

    /// True when the backing store itself failed, as opposed to rejecting
    /// the request. Only these count against a region's health.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            UrsaError::RegionUnavailable(_)
                | UrsaError::NoHealthyRegion
                | UrsaError::Persistence(_)
                | UrsaError::Io(_)
                | UrsaError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_are_not_unavailability() {
        assert!(!UrsaError::WorksetNotFound("ws".into()).is_unavailable());
        assert!(!UrsaError::AlreadyExists("ws".into()).is_unavailable());
        assert!(UrsaError::Persistence("disk".into()).is_unavailable());
        assert!(UrsaError::RegionUnavailable("us-east-1".into()).is_unavailable());
    }
}

pub type Result<T> = std::result::Result<T, UrsaError>;
