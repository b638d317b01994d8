//! bt-worker: Remote worker plumbing for booktran
//!
//! Everything the coordinator needs to drive translation workers over SSH:
//! the russh-backed session adapter, a capacity-bounded session pool with
//! health probing, and codebase reconciliation against each worker's
//! `.version` file.

pub mod pool;
pub mod reconcile;
pub mod ssh;

pub use pool::{
    HealthState, LeaseOutcome, PoolError, PoolSettings, SessionLease, TagFilter, WorkerPool,
    WorkerStats,
};
pub use reconcile::{ReconcileError, ReconcileOutcome, Reconciler};
pub use ssh::{SshConnector, SshSession, SshSettings};
