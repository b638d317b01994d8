//! Session leases

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use bt_core::config::WorkerDescriptor;
use bt_core::{CommandOutput, RemoteSession, SessionError, SessionState, WorkerId};

use super::{PoolInner, WorkerSlot};

/// How a lease ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The session is healthy and may be reused
    Ok,
    /// The session must be closed
    Broken,
}

/// Exclusive, temporary right to run commands on one session
///
/// Return it with [`SessionLease::release`]. A lease dropped without being
/// released is treated as broken.
pub struct SessionLease {
    session: Option<Box<dyn RemoteSession>>,
    slot: Arc<WorkerSlot>,
    pool: Arc<PoolInner>,
    acquired_at: Instant,
}

impl SessionLease {
    pub(crate) fn new(
        pool: Arc<PoolInner>,
        slot: Arc<WorkerSlot>,
        mut session: Box<dyn RemoteSession>,
        holder: &str,
    ) -> Self {
        let meta = session.meta_mut();
        meta.state = SessionState::InUse;
        meta.leaseholder = Some(holder.to_string());
        Self {
            session: Some(session),
            slot,
            pool,
            acquired_at: Instant::now(),
        }
    }

    /// Worker this lease belongs to
    pub fn worker_id(&self) -> &WorkerId {
        &self.slot.id
    }

    /// Descriptor of the leased worker
    pub fn descriptor(&self) -> &WorkerDescriptor {
        &self.slot.descriptor
    }

    /// Time since the lease was handed out
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// State of the underlying session
    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Closed, |s| s.state())
    }

    /// Run a command; pool shutdown aborts it with an execution error
    pub async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SessionError> {
        let shutdown = self.pool.shutdown.clone();
        let session = self.session.as_mut().ok_or(SessionError::Closed)?;
        let result = until_shutdown(&shutdown, session.execute(command, timeout, cancel)).await;
        self.settle(result)
    }

    /// Upload bytes to a remote path
    pub async fn upload(&mut self, data: Bytes, remote_path: &str, mode: u32) -> Result<(), SessionError> {
        let shutdown = self.pool.shutdown.clone();
        let session = self.session.as_mut().ok_or(SessionError::Closed)?;
        let result = until_shutdown(&shutdown, session.upload(data, remote_path, mode)).await;
        self.settle(result)
    }

    /// Download a remote file
    pub async fn download(&mut self, remote_path: &str) -> Result<Bytes, SessionError> {
        let shutdown = self.pool.shutdown.clone();
        let session = self.session.as_mut().ok_or(SessionError::Closed)?;
        let result = until_shutdown(&shutdown, session.download(remote_path)).await;
        self.settle(result)
    }

    /// Record the outcome of one operation on the session and the worker
    fn settle<T>(&mut self, result: Option<Result<T, SessionError>>) -> Result<T, SessionError> {
        match result {
            Some(Ok(value)) => {
                self.pool.touch(&self.slot);
                Ok(value)
            }
            Some(Err(e)) => Err(e),
            None => {
                if let Some(session) = self.session.as_mut() {
                    session.meta_mut().mark_broken();
                }
                Err(SessionError::Execution("worker pool shut down".to_string()))
            }
        }
    }

    /// Return the lease to the pool
    ///
    /// Broken sessions, and every session after shutdown, are closed
    /// instead of being kept idle.
    pub async fn release(mut self, outcome: LeaseOutcome) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let reusable = outcome == LeaseOutcome::Ok
            && session.state() == SessionState::InUse
            && !self.pool.shutdown.is_cancelled();

        if reusable {
            let meta = session.meta_mut();
            meta.state = SessionState::Idle;
            meta.leaseholder = None;
            meta.last_used = Instant::now();
            self.slot.give_back(Some(session));
        } else {
            tracing::debug!(worker = %self.slot.id, ?outcome, "Discarding session");
            session.close().await;
            self.slot.give_back(None);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        tracing::debug!(worker = %self.slot.id, "Lease dropped without release; discarding session");
        self.slot.give_back(None);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { session.close().await });
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("worker", &self.slot.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Run `operation` unless the pool shuts down first
async fn until_shutdown<T>(
    shutdown: &CancellationToken,
    operation: impl Future<Output = Result<T, SessionError>>,
) -> Option<Result<T, SessionError>> {
    tokio::select! {
        result = operation => Some(result),
        _ = shutdown.cancelled() => None,
    }
}
