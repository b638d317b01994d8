//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a worker host
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    /// Create a new worker ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the default ID for a host/port pair
    pub fn from_endpoint(host: &str, port: u32) -> Self {
        Self(format!("{}:{}", host, port))
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a translation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a fresh job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short form used in remote paths and log lines
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-supplied key that scopes events for subscription filtering
///
/// Independent of [`JobId`] so that a monitor can follow several jobs, or
/// one job across resubmission, under a single identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventSessionId(pub String);

impl EventSessionId {
    /// Session ID used for events not tied to any job (pool health)
    pub const SYSTEM: &'static str = "system";

    /// Create a new session ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The `system` session
    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventSessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EventSessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_from_endpoint() {
        let id = WorkerId::from_endpoint("gpu-1.lan", 2222);
        assert_eq!(id.as_str(), "gpu-1.lan:2222");
    }

    #[test]
    fn test_job_id_short_is_stable() {
        let id = JobId::new();
        assert_eq!(id.short().len(), 12);
        assert_eq!(id.short(), id.short());
        assert!(id.short().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_system_session() {
        assert_eq!(EventSessionId::system().as_str(), "system");
    }
}
