//! Pool errors

use std::time::Duration;
use thiserror::Error;

use bt_core::{ErrorCategory, SessionError, WorkerId};

/// Errors from leasing sessions and selecting workers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The worker identifier is not configured
    #[error("Unknown worker: {0}")]
    NoWorker(WorkerId),

    /// No session became available before the deadline
    #[error("No capacity on worker {worker} within {waited:?}")]
    Capacity { worker: WorkerId, waited: Duration },

    /// No worker matched the predicate with a recent successful probe
    #[error("No healthy worker available")]
    NoHealthyWorker,

    /// The caller cancelled while waiting
    #[error("Acquire cancelled")]
    Cancelled,

    /// The pool has been shut down
    #[error("Worker pool is shut down")]
    Shutdown,

    /// Opening a new session failed
    #[error("Failed to open session on {worker}: {source}")]
    Open {
        worker: WorkerId,
        #[source]
        source: SessionError,
    },
}

impl PoolError {
    /// Taxonomy class of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            PoolError::NoWorker(_) => ErrorCategory::Config,
            PoolError::Capacity { .. } => ErrorCategory::Transient,
            PoolError::NoHealthyWorker | PoolError::Cancelled | PoolError::Shutdown => {
                ErrorCategory::Job
            }
            PoolError::Open { source, .. } if source.is_retryable() => ErrorCategory::Transient,
            PoolError::Open { source, .. } => source.category(),
        }
    }

    /// Whether waiting and trying again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::Capacity { .. } => true,
            PoolError::Open { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
