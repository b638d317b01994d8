//! Event wire format
//!
//! Events published on the coordinator's bus are serialized to JSON objects
//! for websocket monitors. The object shape is fixed:
//!
//! ```json
//! {
//!   "type": "job_progress",
//!   "session_id": "reader-42",
//!   "step": "segment-3",
//!   "message": "3 of 12 segments translated",
//!   "progress": 0.25,
//!   "current_item": "segment-3",
//!   "total_items": 12,
//!   "timestamp": 1760486400
//! }
//! ```
//!
//! Optional fields are omitted when absent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Kind of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A job began running
    JobStarted,
    /// Job progress changed
    JobProgress,
    /// One segment finished (successfully, or replaced by a placeholder)
    StepCompleted,
    /// Job completed
    JobCompleted,
    /// Job failed
    JobFailed,
    /// Job was cancelled
    JobCancelled,
    /// A worker was demoted to unhealthy
    WorkerDegraded,
    /// A worker became healthy again
    WorkerRecovered,
    /// Codebase reconciliation against a worker began
    ReconcileStarted,
    /// Codebase reconciliation against a worker finished
    ReconcileCompleted,
}

impl EventKind {
    /// Every event kind, in declaration order
    pub const ALL: [EventKind; 10] = [
        EventKind::JobStarted,
        EventKind::JobProgress,
        EventKind::StepCompleted,
        EventKind::JobCompleted,
        EventKind::JobFailed,
        EventKind::JobCancelled,
        EventKind::WorkerDegraded,
        EventKind::WorkerRecovered,
        EventKind::ReconcileStarted,
        EventKind::ReconcileCompleted,
    ];

    /// The `type` string used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobStarted => "job_started",
            EventKind::JobProgress => "job_progress",
            EventKind::StepCompleted => "step_completed",
            EventKind::JobCompleted => "job_completed",
            EventKind::JobFailed => "job_failed",
            EventKind::JobCancelled => "job_cancelled",
            EventKind::WorkerDegraded => "worker_degraded",
            EventKind::WorkerRecovered => "worker_recovered",
            EventKind::ReconcileStarted => "reconcile_started",
            EventKind::ReconcileCompleted => "reconcile_completed",
        }
    }

    /// Whether this kind ends a job
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::JobCompleted | EventKind::JobFailed | EventKind::JobCancelled
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownEventType(s.to_string()))
    }
}

/// JSON representation of one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Event kind
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Session identifier the event is scoped to
    pub session_id: String,

    /// Step name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Progress fraction in [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,

    /// Item currently being processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,

    /// Total number of items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u64>,

    /// Error payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Unix seconds
    pub timestamp: u64,
}

impl WireEvent {
    /// Serialize to a JSON string, rejecting out-of-range progress values
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        if let Some(progress) = self.progress {
            if !(0.0..=1.0).contains(&progress) {
                return Err(ProtocolError::ProgressOutOfRange(progress));
            }
        }
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON string
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let event: WireEvent = serde_json::from_str(json)?;
        if let Some(progress) = event.progress {
            if !(0.0..=1.0).contains(&progress) {
                return Err(ProtocolError::ProgressOutOfRange(progress));
            }
        }
        Ok(event)
    }
}
