//! Event records

use bt_protocol::{EventKind, WireEvent};

use crate::types::EventSessionId;

/// Immutable record published on the bus
///
/// `timestamp_ms` is assigned by the bus at publish time.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub session_id: EventSessionId,
    pub step: Option<String>,
    pub message: Option<String>,
    pub progress: Option<f64>,
    pub current_item: Option<String>,
    pub total_items: Option<u64>,
    pub error: Option<String>,
    pub timestamp_ms: u64,
}

impl Event {
    /// New event with no optional fields
    pub fn new(kind: EventKind, session_id: impl Into<EventSessionId>) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            step: None,
            message: None,
            progress: None,
            current_item: None,
            total_items: None,
            error: None,
            timestamp_ms: 0,
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the progress fraction, clamped to [0, 1]
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress.clamp(0.0, 1.0));
        self
    }

    pub fn with_items(mut self, current: impl Into<String>, total: u64) -> Self {
        self.current_item = Some(current.into());
        self.total_items = Some(total);
        self
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total_items = Some(total);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Wire representation (timestamp in Unix seconds)
    pub fn to_wire(&self) -> WireEvent {
        WireEvent {
            kind: self.kind,
            session_id: self.session_id.as_str().to_string(),
            step: self.step.clone(),
            message: self.message.clone(),
            progress: self.progress,
            current_item: self.current_item.clone(),
            total_items: self.total_items,
            error: self.error.clone(),
            timestamp: self.timestamp_ms / 1000,
        }
    }
}
