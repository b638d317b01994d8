//! Outbound SSH connector

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh_keys::key::PublicKey;

use bt_core::config::{Credential, EngineConfig, WorkerDescriptor};
use bt_core::{RemoteSession, SessionConnector, SessionError, SessionMeta};

use super::session::SshSession;

/// Keepalive interval for idle pooled connections
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Transport settings shared by every session
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Default per-command timeout recorded on each session
    pub command_timeout: Duration,
    /// How long a signalled remote process may take to exit
    pub grace_cancel: Duration,
}

impl SshSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            command_timeout: config.command_timeout(),
            grace_cancel: config.grace_cancel(),
        }
    }
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(300),
            grace_cancel: Duration::from_secs(5),
        }
    }
}

/// Opens authenticated russh sessions against worker hosts
pub struct SshConnector {
    settings: SshSettings,
    config: Arc<Config>,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        let config = Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        };
        Self {
            settings,
            config: Arc::new(config),
        }
    }

    async fn connect(&self, descriptor: &WorkerDescriptor) -> Result<SshSession, SessionError> {
        let address = format!("{}:{}", descriptor.host, descriptor.port);
        // range checked by the caller
        let port = descriptor.port as u16;

        let handler = ClientHandler::new(descriptor.host_key_fingerprint.clone());
        tracing::debug!("Connecting to {}", address);
        let mut handle = client::connect(Arc::clone(&self.config), (descriptor.host.as_str(), port), handler)
            .await
            .map_err(|e| map_connect_error(&address, e))?;

        authenticate(&mut handle, descriptor).await?;
        tracing::debug!(worker = %descriptor.worker_id(), "Authenticated as '{}'", descriptor.user);

        let meta = SessionMeta::new(descriptor.worker_id(), self.settings.command_timeout);
        Ok(SshSession::new(meta, handle, self.settings.grace_cancel))
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn open(
        &self,
        descriptor: &WorkerDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, SessionError> {
        if !descriptor.port_is_valid() {
            return Err(SessionError::InvalidPort(descriptor.port));
        }
        if descriptor.credentials().is_empty() {
            return Err(SessionError::AuthConfig(format!(
                "worker {} has neither a password nor a private key",
                descriptor.worker_id()
            )));
        }

        match tokio::time::timeout(timeout, self.connect(descriptor)).await {
            Ok(Ok(session)) => Ok(Box::new(session)),
            Ok(Err(e)) => {
                tracing::warn!(worker = %descriptor.worker_id(), "Open failed: {}", e);
                Err(e)
            }
            Err(_) => Err(SessionError::Timeout(format!(
                "connecting to {}:{} took longer than {:?}",
                descriptor.host, descriptor.port, timeout
            ))),
        }
    }
}

/// Try each configured credential in order until one is accepted
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    descriptor: &WorkerDescriptor,
) -> Result<(), SessionError> {
    for credential in descriptor.credentials() {
        let accepted = match &credential {
            Credential::PrivateKey { path, passphrase } => {
                let key = russh_keys::load_secret_key(path, passphrase.as_ref().map(|p| p.expose()))
                    .map_err(|e| {
                        SessionError::AuthConfig(format!("failed to load key {}: {}", path.display(), e))
                    })?;
                handle
                    .authenticate_publickey(&descriptor.user, Arc::new(key))
                    .await
            }
            Credential::Password(password) => {
                handle
                    .authenticate_password(&descriptor.user, password.expose())
                    .await
            }
        }
        .map_err(|e| SessionError::AuthFailure(e.to_string()))?;

        if accepted {
            return Ok(());
        }
        tracing::debug!(worker = %descriptor.worker_id(), "Credential rejected, trying next");
    }

    Err(SessionError::AuthFailure(format!(
        "all credentials for user '{}' were rejected",
        descriptor.user
    )))
}

fn map_connect_error(address: &str, error: russh::Error) -> SessionError {
    match error {
        russh::Error::UnknownKey => {
            SessionError::AuthFailure(format!("host key of {} does not match the pinned fingerprint", address))
        }
        russh::Error::IO(e) if e.kind() == std::io::ErrorKind::TimedOut => {
            SessionError::Timeout(format!("{}: {}", address, e))
        }
        other => SessionError::Unreachable(format!("{}: {}", address, other)),
    }
}

/// Strip an optional `SHA256:` prefix from a fingerprint
fn normalize_fingerprint(fingerprint: &str) -> &str {
    let trimmed = fingerprint.trim();
    trimmed.strip_prefix("SHA256:").unwrap_or(trimmed)
}

/// SSH client handler
pub(crate) struct ClientHandler {
    /// Expected host key fingerprint, if pinned
    expected_host_key: Option<String>,
}

impl ClientHandler {
    fn new(expected_host_key: Option<String>) -> Self {
        Self { expected_host_key }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    /// Accept any key unless a fingerprint is pinned
    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Server host key: SHA256:{}", fingerprint);

        match &self.expected_host_key {
            Some(expected) if normalize_fingerprint(expected) != normalize_fingerprint(&fingerprint) => {
                tracing::warn!(
                    "Host key differs from configured: expected {}, got SHA256:{}",
                    expected,
                    fingerprint
                );
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> WorkerDescriptor {
        WorkerDescriptor::new("127.0.0.1", "u", "/srv").with_password("p")
    }

    #[tokio::test]
    async fn test_port_zero_rejected() {
        let connector = SshConnector::new(SshSettings::default());
        let result = connector
            .open(&descriptor().with_port(0), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(SessionError::InvalidPort(0))));
    }

    #[tokio::test]
    async fn test_port_above_range_rejected() {
        let connector = SshConnector::new(SshSettings::default());
        let result = connector
            .open(&descriptor().with_port(65536), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(SessionError::InvalidPort(65536))));
    }

    #[tokio::test]
    async fn test_missing_credentials_rejected() {
        let connector = SshConnector::new(SshSettings::default());
        let descriptor = WorkerDescriptor::new("127.0.0.1", "u", "/srv");
        let result = connector.open(&descriptor, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::AuthConfig(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_retryable() {
        // bind then drop a listener to find a port with nothing behind it
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = SshConnector::new(SshSettings::default());
        let result = connector
            .open(&descriptor().with_port(port as u32), Duration::from_secs(5))
            .await;
        let err = result.err().unwrap();
        assert!(err.is_retryable(), "unexpected error: {}", err);
    }

    #[test]
    fn test_fingerprint_normalization() {
        assert_eq!(normalize_fingerprint("SHA256:abc"), "abc");
        assert_eq!(normalize_fingerprint(" abc "), "abc");
    }
}
