//! Job execution loop

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinSet;

use bt_core::{Event, WorkerId};
use bt_protocol::EventKind;

use super::attempt::{run_segment, SegmentOutcome, SegmentResult, SegmentWork};
use super::progress::Progress;
use super::JobContext;
use crate::cache::CacheKey;
use crate::job::{
    JobError, JobOutput, JobSnapshot, JobStatus, SegmentReport, SegmentState, SegmentStates,
};
use crate::segment::Segment;

pub(crate) struct JobRunner {
    ctx: Arc<JobContext>,
    status: watch::Sender<JobSnapshot>,
    segments: Vec<Segment>,
    states: SegmentStates,
    /// Output text per segment index
    translations: Vec<Option<String>>,
    reports: BTreeMap<usize, SegmentReport>,
    per_worker: BTreeMap<WorkerId, usize>,
    progress: Progress,
    total: usize,
    strict: bool,
    started: Instant,
}

impl JobRunner {
    pub(crate) fn new(
        ctx: Arc<JobContext>,
        status: watch::Sender<JobSnapshot>,
        segments: Vec<Segment>,
        strict: bool,
    ) -> Self {
        let total = segments.iter().filter(|s| s.is_translatable()).count();
        Self {
            ctx,
            status,
            translations: vec![None; segments.len()],
            states: SegmentStates::new(&segments),
            segments,
            reports: BTreeMap::new(),
            per_worker: BTreeMap::new(),
            progress: Progress::new(total),
            total,
            strict,
            started: Instant::now(),
        }
    }

    pub(crate) async fn run(mut self) -> Result<JobOutput, JobError> {
        self.publish(
            Event::new(EventKind::JobStarted, self.ctx.spec.session_id.clone())
                .with_message(format!("job {}", self.ctx.job_id))
                .with_total(self.total as u64)
                .with_progress(0.0),
        );

        let mut queue = self.serve_cached();
        let mut tasks: JoinSet<SegmentResult> = JoinSet::new();
        let max_in_flight = self.ctx.engine.config.max_in_flight_segments.max(1);

        loop {
            if self.ctx.cancel.is_cancelled() {
                return self.cancelled(tasks).await;
            }
            while tasks.len() < max_in_flight {
                let Some(work) = queue.pop_front() else { break };
                self.dispatch(&mut tasks, work);
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return self.cancelled(tasks).await,
                _ = deadline(self.ctx.deadline) => {
                    let timeout = self.ctx.timeout.unwrap_or_default();
                    return self.fail(JobError::Deadline(timeout), tasks).await;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(result)) => {
                        if let Err(e) = self.on_result(result) {
                            return self.fail(e, tasks).await;
                        }
                    }
                    Some(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Some(Err(_)) | None => {}
                },
            }
        }

        Ok(self.complete())
    }

    /// Resolve cache hits; the rest is returned for dispatch
    fn serve_cached(&mut self) -> VecDeque<SegmentWork> {
        let mut queue = VecDeque::new();
        let texts: Vec<(usize, String)> = self
            .segments
            .iter()
            .filter(|s| s.is_translatable())
            .map(|s| (s.index, s.text.clone()))
            .collect();

        for (index, text) in texts {
            if let Some(translated) = self.ctx.engine.cache.get(&self.cache_key(&text)) {
                tracing::debug!(segment = index, "Serving segment from cache");
                self.translations[index] = Some(translated);
                self.states.advance(index, SegmentState::Succeeded);
                self.reports.insert(
                    index,
                    SegmentReport {
                        index,
                        state: SegmentState::Succeeded,
                        worker: None,
                        attempts: 0,
                        cached: true,
                        elapsed: std::time::Duration::ZERO,
                        error: None,
                    },
                );
                let progress = self.progress.skip();
                self.step_completed(index, progress, None, Some("cache"));
            } else {
                queue.push_back(SegmentWork { index, text });
            }
        }
        queue
    }

    fn cache_key(&self, text: &str) -> CacheKey {
        let spec = &self.ctx.spec;
        CacheKey::new(text, &spec.from, &spec.to, &spec.model, self.ctx.context_chars)
    }

    fn dispatch(&mut self, tasks: &mut JoinSet<SegmentResult>, work: SegmentWork) {
        tracing::trace!(segment = work.index, "Segment running");
        self.states.advance(work.index, SegmentState::Running);
        // running from the first dispatch on
        self.transition(JobStatus::Running, |_| {});
        if let Some(progress) = self.progress.dispatched() {
            self.publish(
                Event::new(EventKind::JobProgress, self.ctx.spec.session_id.clone())
                    .with_progress(progress)
                    .with_total(self.total as u64),
            );
        }
        self.sync_snapshot();
        tasks.spawn(run_segment(Arc::clone(&self.ctx), work));
    }

    fn on_result(&mut self, result: SegmentResult) -> Result<(), JobError> {
        let SegmentResult {
            index,
            outcome,
            elapsed,
        } = result;

        match outcome {
            SegmentOutcome::Translated {
                text,
                worker,
                attempts,
            } => {
                self.states.advance(index, SegmentState::Succeeded);
                let source = &self.segments[index].text;
                self.ctx.engine.cache.insert(self.cache_key(source), text.clone());
                self.translations[index] = Some(text);
                *self.per_worker.entry(worker.clone()).or_insert(0) += 1;
                self.reports.insert(
                    index,
                    SegmentReport {
                        index,
                        state: SegmentState::Succeeded,
                        worker: Some(worker.clone()),
                        attempts,
                        cached: false,
                        elapsed,
                        error: None,
                    },
                );
                let progress = self.progress.finished(true);
                self.step_completed(index, progress, None, Some(worker.as_str()));
            }
            SegmentOutcome::Failed { error, attempts } if self.strict => {
                self.states.advance(index, SegmentState::Failed);
                self.progress.finished(false);
                return Err(JobError::SegmentFailed {
                    index,
                    attempts,
                    reason: error.to_string(),
                    cause: error.category(),
                });
            }
            SegmentOutcome::Failed { error, attempts } => {
                tracing::warn!(segment = index, attempts, "Keeping source text: {}", error);
                let reason = error.to_string();
                self.states.advance(index, SegmentState::Failed);
                self.translations[index] = Some(self.segments[index].text.clone());
                self.reports.insert(
                    index,
                    SegmentReport {
                        index,
                        state: SegmentState::Failed,
                        worker: None,
                        attempts,
                        cached: false,
                        elapsed,
                        error: Some(reason.clone()),
                    },
                );
                let progress = self.progress.finished(true);
                self.status.send_modify(|s| {
                    s.failed_segments += 1;
                    s.last_error = Some(reason.clone());
                });
                self.step_completed(index, progress, Some(reason), None);
            }
            SegmentOutcome::Cancelled { attempts } => {
                self.states.advance(index, SegmentState::Cancelled);
                self.progress.finished(false);
                self.reports.insert(
                    index,
                    SegmentReport {
                        index,
                        state: SegmentState::Cancelled,
                        worker: None,
                        attempts,
                        cached: false,
                        elapsed,
                        error: None,
                    },
                );
                self.sync_snapshot();
            }
            SegmentOutcome::Fatal(e) => {
                self.states.advance(index, SegmentState::Failed);
                self.progress.finished(false);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Publish `step_completed` and `job_progress` for a finished segment
    fn step_completed(&self, index: usize, progress: f64, error: Option<String>, by: Option<&str>) {
        self.sync_snapshot();
        let step = format!("segment-{}", index);
        let session = self.ctx.spec.session_id.clone();

        let mut event = Event::new(EventKind::StepCompleted, session.clone())
            .with_step(step.clone())
            .with_items(step, self.total as u64)
            .with_progress(progress);
        if let Some(by) = by {
            event = event.with_message(by);
        }
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.publish(event);

        self.publish(
            Event::new(EventKind::JobProgress, session)
                .with_progress(progress)
                .with_message(format!("{}/{}", self.progress.completed(), self.total))
                .with_total(self.total as u64),
        );
    }

    async fn fail(mut self, error: JobError, tasks: JoinSet<SegmentResult>) -> Result<JobOutput, JobError> {
        self.ctx.cancel.cancel();
        self.drain(tasks).await;

        let message = error.to_string();
        self.transition(JobStatus::Failed, |s| s.last_error = Some(message.clone()));
        self.publish(
            Event::new(EventKind::JobFailed, self.ctx.spec.session_id.clone())
                .with_message(error.category().to_string())
                .with_error(message)
                .with_progress(self.progress.value()),
        );
        Err(error)
    }

    async fn cancelled(mut self, tasks: JoinSet<SegmentResult>) -> Result<JobOutput, JobError> {
        let shutdown = self.ctx.engine.shutdown.is_cancelled();
        let reason = if shutdown { JobError::Shutdown } else { JobError::Cancelled };

        // completed segments stay completed; in-flight ones are abandoned
        self.transition(JobStatus::Cancelled, |s| s.in_flight_segments = 0);
        self.publish(
            Event::new(EventKind::JobCancelled, self.ctx.spec.session_id.clone())
                .with_message(reason.to_string())
                .with_progress(self.progress.value()),
        );
        self.drain(tasks).await;
        Err(reason)
    }

    /// Wait out the grace period for in-flight segments, then abort them
    async fn drain(&mut self, mut tasks: JoinSet<SegmentResult>) {
        if tasks.is_empty() {
            return;
        }
        let grace = self.ctx.engine.config.grace_cancel();
        let settled = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if settled.is_err() {
            tracing::warn!("Aborting {} segments still running after {:?}", tasks.len(), grace);
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    fn complete(mut self) -> JobOutput {
        let unfinished =
            self.states.count(SegmentState::Pending) + self.states.count(SegmentState::Running);
        assert_eq!(unfinished, 0, "job completed with {} unfinished segments", unfinished);

        let document: String = self
            .segments
            .iter()
            .map(|segment| match &self.translations[segment.index] {
                Some(text) if segment.is_translatable() => text.as_str(),
                _ => segment.text.as_str(),
            })
            .collect();

        let progress = self.progress.complete();
        self.transition(JobStatus::Completed, |s| s.in_flight_segments = 0);
        let elapsed = self.started.elapsed();
        self.publish(
            Event::new(EventKind::JobCompleted, self.ctx.spec.session_id.clone())
                .with_progress(progress)
                .with_total(self.total as u64)
                .with_message(format!("{} segments in {:?}", self.total, elapsed)),
        );

        JobOutput {
            job_id: self.ctx.job_id,
            document: Bytes::from(document),
            elapsed,
            segments: self.reports.into_values().collect(),
            per_worker: self.per_worker,
        }
    }

    fn sync_snapshot(&self) {
        let progress = self.progress.value();
        let completed = self.progress.completed();
        let in_flight = self.progress.in_flight();
        self.status.send_modify(|s| {
            s.progress = progress;
            s.completed_segments = completed;
            s.in_flight_segments = in_flight;
        });
    }

    /// Move the job to `next` if that goes forward
    fn transition(&self, next: JobStatus, update: impl FnOnce(&mut JobSnapshot)) {
        let progress = self.progress.value();
        let completed = self.progress.completed();
        self.status.send_if_modified(|s| {
            if !s.status.can_transition_to(next) {
                return false;
            }
            s.status = next;
            s.progress = progress;
            s.completed_segments = completed;
            update(s);
            true
        });
    }

    fn publish(&self, event: Event) {
        self.ctx.engine.bus.publish(event);
    }
}

async fn deadline(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
