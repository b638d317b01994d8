//! Job and segment model

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use bt_core::{ErrorCategory, EventSessionId, JobId, WorkerId};

use crate::segment::Segment;

/// A translation request
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Plain-text document
    pub document: String,
    /// Source language
    pub from: String,
    /// Target language
    pub to: String,
    /// Model identifier passed to the worker program
    pub model: String,
    /// Session identifier events are published under
    pub session_id: EventSessionId,
    /// Worker tags required for this job; empty uses the configured default
    pub required_tags: Vec<String>,
    /// Overrides `strictSegmentFailure`
    pub strict: Option<bool>,
    /// Overrides `contextChars`
    pub context_chars: Option<u32>,
}

impl JobSpec {
    pub fn new(
        document: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            document: document.into(),
            from: from.into(),
            to: to.into(),
            model: model.into(),
            session_id: EventSessionId::system(),
            required_tags: Vec::new(),
            strict: None,
            context_chars: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<EventSessionId>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        self
    }

    pub fn with_context_chars(mut self, chars: u32) -> Self {
        self.context_chars = Some(chars);
        self
    }

    /// Reject specs the worker program could not run
    pub fn validate(&self) -> Result<(), JobError> {
        for (field, value) in [("from", &self.from), ("to", &self.to), ("model", &self.model)] {
            if value.trim().is_empty() {
                return Err(JobError::Invalid(format!("`{}` must not be empty", field)));
            }
        }
        Ok(())
    }
}

/// Lifecycle of a job
///
/// pending → running → {completed | failed | cancelled}. Terminal states
/// are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Whether moving to `next` goes forward
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => next != JobStatus::Pending,
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Lifecycle of one text segment
///
/// pending → running → {succeeded | failed | cancelled}; a cache hit goes
/// straight from pending to succeeded. Retries stay in running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SegmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SegmentState::Succeeded | SegmentState::Failed | SegmentState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: SegmentState) -> bool {
        match self {
            SegmentState::Pending => next != SegmentState::Pending,
            SegmentState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// States of a job's segments, indexed like the document
///
/// Gap segments have no state.
#[derive(Debug)]
pub(crate) struct SegmentStates {
    states: Vec<Option<SegmentState>>,
}

impl SegmentStates {
    pub(crate) fn new(segments: &[Segment]) -> Self {
        Self {
            states: segments
                .iter()
                .map(|s| s.is_translatable().then_some(SegmentState::Pending))
                .collect(),
        }
    }

    pub(crate) fn get(&self, index: usize) -> Option<SegmentState> {
        self.states.get(index).copied().flatten()
    }

    /// Move segment `index` to `next`
    ///
    /// # Panics
    ///
    /// If `index` is not a text segment or the move is not forward.
    pub(crate) fn advance(&mut self, index: usize, next: SegmentState) {
        let current = self.get(index);
        match current {
            Some(state) if state.can_transition_to(next) => self.states[index] = Some(next),
            _ => panic!(
                "segment {} cannot move from {:?} to {:?}",
                index, current, next
            ),
        }
    }

    pub(crate) fn count(&self, state: SegmentState) -> usize {
        self.states.iter().filter(|s| **s == Some(state)).count()
    }
}

/// Point-in-time copy of a job's state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    /// In [0, 1]; exactly 1 only once completed
    pub progress: f64,
    /// Text segments finished, placeholders included
    pub completed_segments: usize,
    /// Text segments in the document
    pub total_segments: usize,
    pub in_flight_segments: usize,
    /// Segments replaced by their source text (lenient mode)
    pub failed_segments: usize,
    pub last_error: Option<String>,
}

impl JobSnapshot {
    pub(crate) fn pending(job_id: JobId) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            progress: 0.0,
            completed_segments: 0,
            total_segments: 0,
            in_flight_segments: 0,
            failed_segments: 0,
            last_error: None,
        }
    }
}

/// How one text segment ended up in the output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentReport {
    /// Index among all segments of the document
    pub index: usize,
    pub state: SegmentState,
    /// Worker that produced the translation
    pub worker: Option<WorkerId>,
    /// Attempts consumed, capped by `maxAttempts`
    pub attempts: u32,
    /// Served from the result cache
    pub cached: bool,
    /// Wall time from first dispatch to result
    pub elapsed: Duration,
    /// Final error for a placeholder segment
    pub error: Option<String>,
}

/// Result of a completed job
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub job_id: JobId,
    /// Stitched document, UTF-8
    pub document: Bytes,
    /// Wall time of the whole job
    pub elapsed: Duration,
    /// Text segments in index order
    pub segments: Vec<SegmentReport>,
    /// Translated segments per worker
    pub per_worker: BTreeMap<WorkerId, usize>,
}

impl JobOutput {
    /// Stitched document as text
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.document).into_owned()
    }

    /// Segments replaced by a placeholder
    pub fn warnings(&self) -> impl Iterator<Item = &SegmentReport> {
        self.segments.iter().filter(|s| s.state == SegmentState::Failed)
    }
}

/// Why a job did not complete
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// The job spec is unusable
    #[error("Invalid job: {0}")]
    Invalid(String),

    /// Status or Cancel for an identifier this orchestrator never issued
    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    /// A segment exhausted its attempts in strict mode
    #[error("Segment {index} failed after {attempts} attempts: {reason}")]
    SegmentFailed {
        index: usize,
        attempts: u32,
        reason: String,
        cause: ErrorCategory,
    },

    /// No worker matched the job's tags with a fresh health probe
    #[error("No healthy worker available")]
    NoHealthyWorker,

    /// The job deadline passed
    #[error("Job exceeded its deadline of {0:?}")]
    Deadline(Duration),

    #[error("Job cancelled")]
    Cancelled,

    /// The worker pool or orchestrator shut down underneath the job
    #[error("Coordinator shut down")]
    Shutdown,
}

impl JobError {
    /// Taxonomy class of this failure
    pub fn category(&self) -> ErrorCategory {
        match self {
            JobError::Invalid(_) | JobError::UnknownJob(_) => ErrorCategory::Config,
            JobError::SegmentFailed { cause, .. } if *cause == ErrorCategory::Worker => {
                ErrorCategory::Worker
            }
            _ => ErrorCategory::Job,
        }
    }
}
