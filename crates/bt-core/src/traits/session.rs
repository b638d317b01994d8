//! Remote session traits

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerDescriptor;
use crate::error::SessionError;
use crate::types::WorkerId;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Authenticated and not leased
    Idle,
    /// Leased to exactly one holder
    InUse,
    /// A command or transfer failed; never re-leased
    Broken,
    /// Connection closed
    Closed,
}

impl SessionState {
    /// Whether the session may be handed out again
    pub fn is_reusable(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::InUse)
    }
}

/// Result of one remote command
///
/// A non-zero exit code is not an error; callers decide what it means.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status reported by the remote side
    pub exit_code: u32,
    /// Captured stdout
    pub stdout: Bytes,
    /// Captured stderr, never interleaved with stdout
    pub stderr: Bytes,
}

impl CommandOutput {
    /// Exit code 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout as text, replacing invalid UTF-8
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr as text, replacing invalid UTF-8
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Bookkeeping shared by every session implementation
#[derive(Debug, Clone)]
pub struct SessionMeta {
    /// Worker this session is bound to
    pub worker_id: WorkerId,
    /// Current state
    pub state: SessionState,
    /// Last time the session was released or used
    pub last_used: Instant,
    /// Holder of the current lease
    pub leaseholder: Option<String>,
    /// Default per-command timeout
    pub command_timeout: Duration,
}

impl SessionMeta {
    /// Fresh metadata for a newly authenticated session
    pub fn new(worker_id: WorkerId, command_timeout: Duration) -> Self {
        Self {
            worker_id,
            state: SessionState::Idle,
            last_used: Instant::now(),
            leaseholder: None,
            command_timeout,
        }
    }

    /// Mark as broken unless already closed
    pub fn mark_broken(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Broken;
        }
    }

    /// Fail fast when the session can no longer run commands
    pub fn ensure_usable(&self) -> Result<(), SessionError> {
        if self.state.is_reusable() {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }
}

/// One authenticated channel to one worker host
///
/// Commands on a session are strictly serialized: every operation takes
/// `&mut self`. Any error from an operation leaves the session broken.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Session bookkeeping
    fn meta(&self) -> &SessionMeta;

    /// Mutable session bookkeeping
    fn meta_mut(&mut self) -> &mut SessionMeta;

    /// Current state
    fn state(&self) -> SessionState {
        self.meta().state
    }

    /// Worker this session is bound to
    fn worker_id(&self) -> &WorkerId {
        &self.meta().worker_id
    }

    /// Run a command and capture its output
    ///
    /// When `timeout` elapses or `cancel` fires, the remote process is
    /// signalled to terminate before this returns.
    async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SessionError>;

    /// Write bytes to a remote file, creating parent directories (0755)
    async fn upload(&mut self, data: Bytes, remote_path: &str, mode: u32)
        -> Result<(), SessionError>;

    /// Read a remote file
    async fn download(&mut self, remote_path: &str) -> Result<Bytes, SessionError>;

    /// Close the connection; idempotent
    async fn close(&mut self);

    /// Upload a local file
    async fn upload_file(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        mode: u32,
    ) -> Result<(), SessionError> {
        let data = tokio::fs::read(local_path).await.map_err(|e| {
            SessionError::Transfer(format!("failed to read {}: {}", local_path.display(), e))
        })?;
        self.upload(Bytes::from(data), remote_path, mode).await
    }

    /// Download a remote file into a local path
    async fn download_to(&mut self, remote_path: &str, local_path: &Path) -> Result<(), SessionError> {
        let data = self.download(remote_path).await?;
        tokio::fs::write(local_path, &data).await.map_err(|e| {
            SessionError::Transfer(format!("failed to write {}: {}", local_path.display(), e))
        })
    }
}

/// Opens sessions against worker hosts
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Open and authenticate a session, blocking until done or `timeout` elapses
    async fn open(
        &self,
        descriptor: &WorkerDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broken_is_not_reusable() {
        let mut meta = SessionMeta::new(WorkerId::new("w"), Duration::from_secs(1));
        assert!(meta.ensure_usable().is_ok());

        meta.mark_broken();
        assert_eq!(meta.state, SessionState::Broken);
        assert_eq!(meta.ensure_usable(), Err(SessionError::Closed));
    }

    #[test]
    fn test_closed_stays_closed() {
        let mut meta = SessionMeta::new(WorkerId::new("w"), Duration::from_secs(1));
        meta.state = SessionState::Closed;
        meta.mark_broken();
        assert_eq!(meta.state, SessionState::Closed);
    }

    #[test]
    fn test_command_output_helpers() {
        let output = CommandOutput {
            exit_code: 1,
            stdout: Bytes::from_static(b"ready\n"),
            stderr: Bytes::from_static(b"\xffoops"),
        };
        assert!(!output.success());
        assert_eq!(output.stdout_lossy(), "ready\n");
        assert!(output.stderr_lossy().ends_with("oops"));
    }
}
