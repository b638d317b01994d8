//! One authenticated SSH connection

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use tokio_util::sync::CancellationToken;

use bt_core::{CommandOutput, RemoteSession, SessionError, SessionMeta, SessionState};
use bt_protocol::shell_quote;

use super::connector::ClientHandler;

/// SSH extended data stream number for stderr
const STDERR_STREAM: u32 = 1;

/// Why a running command stopped early
enum Interrupt {
    Timeout(Duration),
    Cancelled,
}

/// Session over a russh client connection
///
/// Every command opens its own channel on the shared connection.
pub struct SshSession {
    meta: SessionMeta,
    handle: Option<Handle<ClientHandler>>,
    grace_cancel: Duration,
}

impl SshSession {
    pub(crate) fn new(meta: SessionMeta, handle: Handle<ClientHandler>, grace_cancel: Duration) -> Self {
        Self {
            meta,
            handle: Some(handle),
            grace_cancel,
        }
    }

    /// Run a command, optionally feeding `stdin`, and collect its output
    async fn run(
        &mut self,
        command: &str,
        stdin: Option<Bytes>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SessionError> {
        self.meta.ensure_usable()?;
        let handle = self.handle.as_ref().ok_or(SessionError::Closed)?;
        if handle.is_closed() {
            self.meta.mark_broken();
            return Err(SessionError::Execution("connection closed by peer".to_string()));
        }

        let result = run_on_channel(handle, command, stdin, timeout, cancel, self.grace_cancel).await;
        match result {
            Ok(output) => {
                self.meta.last_used = std::time::Instant::now();
                Ok(output)
            }
            Err(e) => {
                self.meta.mark_broken();
                Err(e)
            }
        }
    }
}

async fn run_on_channel(
    handle: &Handle<ClientHandler>,
    command: &str,
    stdin: Option<Bytes>,
    timeout: Duration,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<CommandOutput, SessionError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SessionError::Execution(format!("failed to open channel: {}", e)))?;

    channel
        .exec(true, command)
        .await
        .map_err(|e| SessionError::Execution(format!("failed to start command: {}", e)))?;

    if let Some(data) = stdin {
        channel
            .data(&data[..])
            .await
            .map_err(|e| SessionError::Transfer(format!("failed to stream data: {}", e)))?;
        channel
            .eof()
            .await
            .map_err(|e| SessionError::Transfer(format!("failed to close stdin: {}", e)))?;
    }

    let mut output = OutputCollector::default();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let interrupt = loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(msg) => output.absorb(msg),
                None => return output.finish(),
            },
            _ = &mut deadline => break Interrupt::Timeout(timeout),
            _ = cancel.cancelled() => break Interrupt::Cancelled,
        }
    };

    terminate(&mut channel, grace).await;
    match interrupt {
        Interrupt::Timeout(limit) => Err(SessionError::Timeout(format!(
            "command exceeded {:?}",
            limit
        ))),
        Interrupt::Cancelled => Err(SessionError::Cancelled),
    }
}

/// Signal the remote process and wait up to `grace` for its channel to close
async fn terminate(channel: &mut Channel<Msg>, grace: Duration) {
    if let Err(e) = channel.signal(Sig::TERM).await {
        tracing::debug!("Failed to signal remote process: {}", e);
    }

    let drained = tokio::time::timeout(grace, async {
        while channel.wait().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        tracing::warn!("Remote process did not exit within {:?}", grace);
    }
    let _ = channel.close().await;
}

/// Accumulates channel messages into a [`CommandOutput`]
#[derive(Default)]
struct OutputCollector {
    stdout: BytesMut,
    stderr: BytesMut,
    exit_code: Option<u32>,
    exit_signal: Option<String>,
}

impl OutputCollector {
    fn absorb(&mut self, msg: ChannelMsg) {
        match msg {
            ChannelMsg::Data { ref data } => self.stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext } if ext == STDERR_STREAM => {
                self.stderr.extend_from_slice(data)
            }
            ChannelMsg::ExitStatus { exit_status } => self.exit_code = Some(exit_status),
            ChannelMsg::ExitSignal { signal_name, .. } => {
                self.exit_signal = Some(format!("{:?}", signal_name))
            }
            _ => {}
        }
    }

    fn finish(self) -> Result<CommandOutput, SessionError> {
        let exit_code = match (self.exit_code, self.exit_signal) {
            (Some(code), _) => code,
            // conventional shell encoding of death-by-signal
            (None, Some(signal)) => {
                tracing::debug!("Remote process killed by signal {}", signal);
                128 + 15
            }
            (None, None) => {
                return Err(SessionError::Execution(
                    "channel closed without an exit status".to_string(),
                ))
            }
        };
        Ok(CommandOutput {
            exit_code,
            stdout: self.stdout.freeze(),
            stderr: self.stderr.freeze(),
        })
    }
}

/// Map a failed file command's stderr onto a transfer error
fn transfer_error(remote_path: &str, output: &CommandOutput) -> SessionError {
    let stderr = output.stderr_lossy();
    if stderr.contains("No such file") {
        SessionError::NotFound(remote_path.to_string())
    } else if stderr.contains("Permission denied") {
        SessionError::PermissionDenied(remote_path.to_string())
    } else {
        SessionError::Transfer(format!(
            "{} (exit {}): {}",
            remote_path,
            output.exit_code,
            stderr.trim()
        ))
    }
}

fn parent_dir(remote_path: &str) -> Option<&str> {
    match remote_path.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((parent, _)) => Some(parent),
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn meta(&self) -> &SessionMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SessionMeta {
        &mut self.meta
    }

    async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SessionError> {
        tracing::debug!(worker = %self.meta.worker_id, "exec: {}", command);
        self.run(command, None, timeout, cancel).await
    }

    async fn upload(&mut self, data: Bytes, remote_path: &str, mode: u32) -> Result<(), SessionError> {
        let path = shell_quote(remote_path);
        let mut command = String::from("umask 022 && ");
        if let Some(parent) = parent_dir(remote_path) {
            command.push_str(&format!("mkdir -p {} && ", shell_quote(parent)));
        }
        command.push_str(&format!("cat > {} && chmod {:o} {}", path, mode & 0o7777, path));

        let size = data.len();
        let timeout = self.meta.command_timeout;
        let output = self
            .run(&command, Some(data), timeout, &CancellationToken::new())
            .await?;
        if !output.success() {
            self.meta.mark_broken();
            return Err(transfer_error(remote_path, &output));
        }
        tracing::debug!(worker = %self.meta.worker_id, "Uploaded {} bytes to {}", size, remote_path);
        Ok(())
    }

    async fn download(&mut self, remote_path: &str) -> Result<Bytes, SessionError> {
        let command = format!("cat {}", shell_quote(remote_path));
        let timeout = self.meta.command_timeout;
        let output = self
            .run(&command, None, timeout, &CancellationToken::new())
            .await?;
        if !output.success() {
            self.meta.mark_broken();
            return Err(transfer_error(remote_path, &output));
        }
        Ok(output.stdout)
    }

    async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "closing", "en")
                .await
            {
                tracing::debug!(worker = %self.meta.worker_id, "Disconnect failed: {}", e);
            }
        }
        self.meta.state = SessionState::Closed;
    }
}
