//! Worker descriptor configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::types::WorkerId;

/// A string that never appears in logs or debug output
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the secret value
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// How a session authenticates against a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Password authentication
    Password(Secret),
    /// Private key file, with optional passphrase
    PrivateKey {
        path: PathBuf,
        passphrase: Option<Secret>,
    },
}

/// Identity and policy for one remote worker host
///
/// Immutable after load; shared read-only by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkerDescriptor {
    /// Identifier (defaults to `host:port`)
    #[serde(default)]
    pub id: Option<String>,

    /// Host name or address
    pub host: String,

    /// SSH port. Kept wider than `u16` so that out-of-range values reach
    /// validation instead of failing to parse.
    #[serde(default = "default_port")]
    pub port: u32,

    /// Login user
    pub user: String,

    /// Password credential
    #[serde(default)]
    pub password: Option<Secret>,

    /// Private key credential
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Passphrase for the private key
    #[serde(default)]
    pub private_key_passphrase: Option<Secret>,

    /// Working directory on the worker
    pub remote_dir: String,

    /// Maximum concurrent sessions
    #[serde(default = "default_capacity")]
    pub max_capacity: usize,

    /// Descriptive tags (e.g. "gpu")
    #[serde(default)]
    pub tags: Vec<String>,

    /// Expected SSH host key fingerprint; any key is accepted when absent
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

fn default_port() -> u32 {
    22
}

fn default_capacity() -> usize {
    1
}

impl WorkerDescriptor {
    /// Minimal descriptor with password authentication
    pub fn new(host: impl Into<String>, user: impl Into<String>, remote_dir: impl Into<String>) -> Self {
        Self {
            id: None,
            host: host.into(),
            port: default_port(),
            user: user.into(),
            password: None,
            private_key_path: None,
            private_key_passphrase: None,
            remote_dir: remote_dir.into(),
            max_capacity: default_capacity(),
            tags: vec![],
            host_key_fingerprint: None,
        }
    }

    /// Set an explicit identifier
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the password credential
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password));
        self
    }

    /// Set the capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.max_capacity = capacity;
        self
    }

    /// Add tags
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u32) -> Self {
        self.port = port;
        self
    }

    /// Identifier of this worker
    pub fn worker_id(&self) -> WorkerId {
        match &self.id {
            Some(id) => WorkerId::new(id.clone()),
            None => WorkerId::from_endpoint(&self.host, self.port),
        }
    }

    /// Check whether the worker carries a tag (case-insensitive)
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Whether the port is in [1, 65535]
    pub fn port_is_valid(&self) -> bool {
        (1..=u16::MAX as u32).contains(&self.port)
    }

    /// Credentials to try, in order: private key first, then password
    pub fn credentials(&self) -> Vec<Credential> {
        let mut credentials = Vec::new();
        if let Some(path) = &self.private_key_path {
            credentials.push(Credential::PrivateKey {
                path: path.clone(),
                passphrase: self.private_key_passphrase.clone(),
            });
        }
        if let Some(password) = &self.password {
            credentials.push(Credential::Password(password.clone()));
        }
        credentials
    }

    /// Validate this descriptor; `field` is its path in the config (e.g. `workers[0]`)
    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid(format!("{}.host", field), "must not be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::invalid(format!("{}.user", field), "must not be empty"));
        }
        if !self.port_is_valid() {
            return Err(ConfigError::InvalidPort {
                field: format!("{}.port", field),
                port: self.port,
            });
        }
        if self.credentials().is_empty() {
            return Err(ConfigError::MissingCredentials {
                field: field.to_string(),
            });
        }
        if self.remote_dir.trim().is_empty() {
            return Err(ConfigError::invalid(
                format!("{}.remoteDir", field),
                "must not be empty",
            ));
        }
        if self.max_capacity == 0 {
            return Err(ConfigError::invalid(
                format!("{}.maxCapacity", field),
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
