//! Core error types for booktran

use std::path::PathBuf;
use thiserror::Error;

/// Failure class used to decide retry policy and to report job failures
///
/// Mirrors the coordinator's error taxonomy: configuration problems are
/// fatal at startup, transient transport problems are retried, worker
/// attributable problems are retried on another worker, job-level problems
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad configuration (unknown worker, bad port, missing credentials)
    Config,
    /// Connection reset, command timeout, capacity exhaustion
    Transient,
    /// Non-zero remote exit, missing output file, reconcile mismatch
    Worker,
    /// Retries exhausted, no healthy worker, cancellation
    Job,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Worker => write!(f, "worker"),
            ErrorCategory::Job => write!(f, "job"),
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error (includes unknown keys)
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON parse error (includes unknown keys)
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unsupported config file extension
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(PathBuf),

    /// A field holds an invalid value
    #[error("Invalid config field `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    /// Port outside [1, 65535]
    #[error("Invalid port in `{field}`: {port}")]
    InvalidPort { field: String, port: u32 },

    /// Neither a password nor a private key was configured
    #[error("Missing credentials in `{field}`: a password or a private key is required")]
    MissingCredentials { field: String },

    /// Two workers share an identifier
    #[error("Duplicate worker id: {0}")]
    DuplicateWorker(String),

    /// A referenced worker does not exist
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Every configuration problem is fatal for the whole run
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Config
    }
}

/// Errors from a single SSH session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Server rejected the credentials
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// Credentials are missing or unusable (unreadable key file, ...)
    #[error("Authentication config error: {0}")]
    AuthConfig(String),

    /// Host could not be reached
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    /// Deadline elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Port outside [1, 65535]
    #[error("Invalid port: {0}")]
    InvalidPort(u32),

    /// Channel-level failure while running a command
    #[error("Execution error: {0}")]
    Execution(String),

    /// File transfer failed
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Remote file does not exist
    #[error("Remote file not found: {0}")]
    NotFound(String),

    /// Remote file is not accessible
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Session was already closed or broken
    #[error("Session closed")]
    Closed,
}

impl SessionError {
    /// Whether a caller may retry opening the session
    ///
    /// Only reachability problems and timeouts are retryable; credential and
    /// port problems will not fix themselves.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Unreachable(_) | SessionError::Timeout(_))
    }

    /// Whether this error comes from configuration rather than the network
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::AuthFailure(_) | SessionError::AuthConfig(_) | SessionError::InvalidPort(_)
        )
    }

    /// Taxonomy class of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::AuthFailure(_)
            | SessionError::AuthConfig(_)
            | SessionError::InvalidPort(_) => ErrorCategory::Config,
            SessionError::NotFound(_) | SessionError::PermissionDenied(_) => ErrorCategory::Worker,
            SessionError::Cancelled => ErrorCategory::Job,
            SessionError::Unreachable(_)
            | SessionError::Timeout(_)
            | SessionError::Execution(_)
            | SessionError::Transfer(_)
            | SessionError::Closed => ErrorCategory::Transient,
        }
    }
}
