//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire contracts
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown event type string
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Progress value outside of [0, 1]
    #[error("Progress out of range: {0}")]
    ProgressOutOfRange(f64),

    /// Version file content is not a hex-encoded SHA-256 digest
    #[error("Malformed version stamp: {0:?}")]
    MalformedVersion(String),

    /// A required command argument was empty
    #[error("Empty command argument: {0}")]
    EmptyArgument(&'static str),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
