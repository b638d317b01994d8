//! bt-orchestrator: Distributed document translation over SSH workers
//!
//! The orchestrator splits a document into segments, dispatches them to
//! the worker pool with bounded concurrency and retries, stitches the
//! results back together in order, and publishes progress on the event
//! bus. A websocket adapter exposes the bus to external monitors.

pub mod backoff;
pub mod cache;
pub mod job;
pub mod orchestrator;
pub mod segment;
pub mod ws;

pub use cache::{CacheKey, CacheStats, ResultCache};
pub use job::{JobError, JobOutput, JobSnapshot, JobSpec, JobStatus, SegmentReport, SegmentState};
pub use orchestrator::{JobHandle, Orchestrator};
pub use segment::{split_document, Segment, SegmentKind};
