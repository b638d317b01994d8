//! Codebase reconciliation
//!
//! Before a worker runs any translation for a job, its copy of the
//! coordinator's scripts must match the local snapshot. The protocol per
//! worker is:
//!
//! 1. Read `<remoteDir>/.version` (absent or unreadable reads as `<none>`).
//! 2. If it equals the local aggregate hash, stop.
//! 3. Otherwise upload every snapshot file, then write the aggregate hash
//!    into `.version`.
//! 4. Read `.version` again; a mismatch fails reconciliation.
//!
//! Reconciliation against one worker is serialized; different workers
//! proceed independently.

mod snapshot;

pub use snapshot::{CodebaseSnapshot, SnapshotCache, SnapshotEntry, EXECUTABLE_MODE, REGULAR_MODE};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use bt_core::config::{EngineConfig, SnapshotFile};
use bt_core::{ErrorCategory, Event, EventBus, EventSessionId, SessionError, WorkerId};
use bt_protocol::version::{file_contents, read_command, version_path};
use bt_protocol::{EventKind, ProtocolError, VersionStamp};

use crate::pool::SessionLease;

/// Reconciliation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A snapshot file could not be read on the coordinator
    #[error("Failed to read snapshot file {path:?}: {reason}")]
    LocalRead { path: PathBuf, reason: String },

    /// Upload or remote command failed
    #[error("Session error during reconciliation: {0}")]
    Session(#[from] SessionError),

    /// The version read command exited non-zero
    #[error("Reading remote version failed (exit {exit_code}): {stderr}")]
    RemoteRead { exit_code: u32, stderr: String },

    /// `.version` did not hold the local aggregate after syncing
    #[error("Version mismatch on {worker}: expected {expected}, found {found}")]
    Mismatch {
        worker: WorkerId,
        expected: String,
        found: String,
    },

    /// Malformed aggregate hash
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<ProtocolError> for ReconcileError {
    fn from(error: ProtocolError) -> Self {
        ReconcileError::Protocol(error.to_string())
    }
}

impl ReconcileError {
    /// Taxonomy class of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            ReconcileError::LocalRead { .. } | ReconcileError::Protocol(_) => ErrorCategory::Config,
            ReconcileError::Session(e) => e.category(),
            ReconcileError::RemoteRead { .. } | ReconcileError::Mismatch { .. } => {
                ErrorCategory::Worker
            }
        }
    }
}

/// Result of a successful reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The worker already held the current snapshot
    UpToDate,
    /// Files were uploaded and `.version` rewritten
    Synced { files: usize },
}

/// Brings workers in line with the local codebase snapshot
pub struct Reconciler {
    cache: SnapshotCache,
    /// One lock per worker; at most one reconciliation in flight per worker
    locks: DashMap<WorkerId, Arc<tokio::sync::Mutex<()>>>,
    command_timeout: Duration,
    bus: EventBus,
}

impl Reconciler {
    pub fn new(files: Vec<SnapshotFile>, command_timeout: Duration, bus: EventBus) -> Self {
        Self {
            cache: SnapshotCache::new(files),
            locks: DashMap::new(),
            command_timeout,
            bus,
        }
    }

    pub fn from_config(config: &EngineConfig, bus: EventBus) -> Self {
        Self::new(config.snapshot_files.clone(), config.command_timeout(), bus)
    }

    /// Whether any files are configured
    pub fn is_empty(&self) -> bool {
        self.cache.files().is_empty()
    }

    /// Current local snapshot
    pub async fn snapshot(&self) -> Result<Arc<CodebaseSnapshot>, ReconcileError> {
        self.cache.current().await
    }

    /// Reconcile the worker behind `lease`
    ///
    /// Publishes `reconcile_started` and `reconcile_completed` under
    /// `session_id`; a failure is reported on the completed event's
    /// `error` field.
    pub async fn reconcile(
        &self,
        lease: &mut SessionLease,
        session_id: &EventSessionId,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let worker = lease.worker_id().clone();
        let lock = self
            .locks
            .entry(worker.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _serialized = lock.lock().await;

        self.bus.publish(
            Event::new(EventKind::ReconcileStarted, session_id.clone())
                .with_step(worker.to_string())
                .with_message(format!("checking codebase on {}", worker)),
        );

        let result = self.run(lease, cancel).await;
        let completed = Event::new(EventKind::ReconcileCompleted, session_id.clone())
            .with_step(worker.to_string());
        match &result {
            Ok(ReconcileOutcome::UpToDate) => {
                tracing::debug!(worker = %worker, "Codebase up to date");
                self.bus.publish(completed.with_message("up to date"));
            }
            Ok(ReconcileOutcome::Synced { files }) => {
                tracing::info!(worker = %worker, files, "Codebase synced");
                self.bus
                    .publish(completed.with_message(format!("uploaded {} files", files)));
            }
            Err(e) => {
                tracing::warn!(worker = %worker, "Reconciliation failed: {}", e);
                self.bus.publish(
                    completed
                        .with_message("reconciliation failed")
                        .with_error(e.to_string()),
                );
            }
        }
        result
    }

    async fn run(
        &self,
        lease: &mut SessionLease,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let snapshot = self.snapshot().await?;
        let remote_dir = lease.descriptor().remote_dir.clone();

        let remote = self.read_version(lease, &remote_dir, cancel).await?;
        if remote.matches(snapshot.aggregate()) {
            return Ok(ReconcileOutcome::UpToDate);
        }
        tracing::info!(
            worker = %lease.worker_id(),
            "Remote version {} differs from {}; uploading {} files",
            remote,
            snapshot.aggregate(),
            snapshot.len()
        );

        for entry in snapshot.entries() {
            let path = remote_path(&remote_dir, &entry.rel_path);
            lease.upload(entry.content.clone(), &path, entry.mode).await?;
        }
        let version = file_contents(snapshot.aggregate()).map_err(ReconcileError::from)?;
        lease
            .upload(Bytes::from(version), &version_path(&remote_dir), REGULAR_MODE)
            .await?;

        let confirmed = self.read_version(lease, &remote_dir, cancel).await?;
        if !confirmed.matches(snapshot.aggregate()) {
            return Err(ReconcileError::Mismatch {
                worker: lease.worker_id().clone(),
                expected: snapshot.aggregate().to_string(),
                found: confirmed.to_string(),
            });
        }
        Ok(ReconcileOutcome::Synced {
            files: snapshot.len(),
        })
    }

    async fn read_version(
        &self,
        lease: &mut SessionLease,
        remote_dir: &str,
        cancel: &CancellationToken,
    ) -> Result<VersionStamp, ReconcileError> {
        let output = lease
            .execute(&read_command(remote_dir), self.command_timeout, cancel)
            .await?;
        if !output.success() {
            return Err(ReconcileError::RemoteRead {
                exit_code: output.exit_code,
                stderr: output.stderr_lossy().trim().to_string(),
            });
        }
        Ok(VersionStamp::parse(&output.stdout_lossy()))
    }
}

/// Join a relative path onto a worker directory
pub fn remote_path(remote_dir: &str, rel_path: &str) -> String {
    format!("{}/{}", remote_dir.trim_end_matches('/'), rel_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_path_join() {
        assert_eq!(remote_path("/srv/bt/", "bin/translate"), "/srv/bt/bin/translate");
        assert_eq!(remote_path("/srv/bt", "x"), "/srv/bt/x");
    }

    #[test]
    fn test_error_categories() {
        let mismatch = ReconcileError::Mismatch {
            worker: WorkerId::new("a"),
            expected: "x".into(),
            found: "stale".into(),
        };
        assert_eq!(mismatch.category(), ErrorCategory::Worker);
        assert_eq!(
            ReconcileError::Session(SessionError::Unreachable("x".into())).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            ReconcileError::from(ProtocolError::MalformedVersion("stale".into())).category(),
            ErrorCategory::Config
        );
    }
}
