//! Running one segment on the workers
//!
//! A segment is tried up to `maxAttempts` times. The first attempt goes to
//! the pool's pick, the second to the same worker, every later one to a
//! different healthy worker. A worker whose reconcile failed is dropped for
//! the rest of the job. Capacity waits and cancellation never consume an
//! attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use bt_core::{ErrorCategory, SessionError, SessionState, WorkerId};
use bt_protocol::{shell_quote, TranslateCommand};
use bt_worker::{LeaseOutcome, PoolError, ReconcileError, SessionLease};

use super::JobContext;
use crate::backoff::ExponentialBackoff;
use crate::job::JobError;

/// Mode of uploaded segment sources
const INPUT_MODE: u32 = 0o644;

/// Why one attempt failed
#[derive(Error, Debug, Clone)]
pub(crate) enum SegmentError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("translate exited with {code}: {stderr}")]
    Exit { code: u32, stderr: String },

    #[error("translation output missing: {0}")]
    MissingOutput(String),

    #[error("segment exceeded {0:?}")]
    Timeout(Duration),

    #[error("invalid translate command: {0}")]
    Command(String),
}

impl SegmentError {
    pub(crate) fn category(&self) -> ErrorCategory {
        match self {
            SegmentError::Pool(e) => e.category(),
            SegmentError::Session(e) => e.category(),
            SegmentError::Reconcile(e) => e.category(),
            SegmentError::Exit { .. } | SegmentError::MissingOutput(_) => ErrorCategory::Worker,
            SegmentError::Timeout(_) => ErrorCategory::Transient,
            SegmentError::Command(_) => ErrorCategory::Config,
        }
    }

    fn is_cancel(&self) -> bool {
        matches!(
            self,
            SegmentError::Pool(PoolError::Cancelled)
                | SegmentError::Session(SessionError::Cancelled)
                | SegmentError::Reconcile(ReconcileError::Session(SessionError::Cancelled))
        )
    }

    fn lease_outcome(&self) -> LeaseOutcome {
        match self {
            SegmentError::Session(_) | SegmentError::Timeout(_) => LeaseOutcome::Broken,
            _ => LeaseOutcome::Ok,
        }
    }
}

/// A text segment waiting for translation
#[derive(Debug, Clone)]
pub(crate) struct SegmentWork {
    /// Index among all segments of the document
    pub(crate) index: usize,
    pub(crate) text: String,
}

/// How a segment ended
#[derive(Debug)]
pub(crate) enum SegmentOutcome {
    Translated {
        text: String,
        worker: WorkerId,
        attempts: u32,
    },
    Failed {
        error: SegmentError,
        attempts: u32,
    },
    Cancelled {
        attempts: u32,
    },
    /// The whole job must stop
    Fatal(JobError),
}

#[derive(Debug)]
pub(crate) struct SegmentResult {
    pub(crate) index: usize,
    pub(crate) outcome: SegmentOutcome,
    pub(crate) elapsed: Duration,
}

/// Translate one segment, retrying per policy
pub(crate) async fn run_segment(ctx: Arc<JobContext>, work: SegmentWork) -> SegmentResult {
    let started = Instant::now();
    let index = work.index;
    let outcome = SegmentRunner { ctx, work }.run().await;
    SegmentResult {
        index,
        outcome,
        elapsed: started.elapsed(),
    }
}

struct SegmentRunner {
    ctx: Arc<JobContext>,
    work: SegmentWork,
}

impl SegmentRunner {
    async fn run(&self) -> SegmentOutcome {
        let config = &self.ctx.engine.config;
        let pool = &self.ctx.engine.pool;
        let cancel = &self.ctx.cancel;
        let max_attempts = config.max_attempts.max(1);
        let mut backoff = ExponentialBackoff::from_config(&config.backoff);

        let mut consumed = 0u32;
        let mut previous: Option<WorkerId> = None;
        let mut last_error: Option<SegmentError> = None;
        let mut switch_worker = false;

        loop {
            if cancel.is_cancelled() {
                return SegmentOutcome::Cancelled { attempts: consumed };
            }
            let attempt = consumed + 1;

            let target = match &previous {
                Some(worker) if attempt == 2 && !switch_worker => worker.clone(),
                _ => {
                    let excluded = self.ctx.excluded_workers();
                    let selected = tokio::select! {
                        result = pool.select_healthy_excluding(&self.ctx.filter, previous.as_ref(), &excluded) => result,
                        _ = cancel.cancelled() => return SegmentOutcome::Cancelled { attempts: consumed },
                    };
                    match (selected, &last_error) {
                        (Ok(worker), _) => worker,
                        (Err(PoolError::Shutdown), _) => return SegmentOutcome::Fatal(JobError::Shutdown),
                        // nowhere left to retry; the segment fails with its own error
                        (Err(_), Some(error)) => {
                            return SegmentOutcome::Failed {
                                error: error.clone(),
                                attempts: consumed,
                            }
                        }
                        (Err(_), None) => return SegmentOutcome::Fatal(JobError::NoHealthyWorker),
                    }
                }
            };

            tracing::debug!(segment = self.work.index, worker = %target, attempt, "Dispatching segment");
            match self.attempt(&target, attempt).await {
                Ok(text) => {
                    pool.report_success(&target);
                    return SegmentOutcome::Translated {
                        text,
                        worker: target,
                        attempts: attempt,
                    };
                }
                Err(e) if e.is_cancel() || cancel.is_cancelled() => {
                    return SegmentOutcome::Cancelled { attempts: consumed };
                }
                Err(SegmentError::Pool(PoolError::Shutdown)) => {
                    return SegmentOutcome::Fatal(JobError::Shutdown);
                }
                Err(SegmentError::Pool(PoolError::Capacity { worker, waited })) => {
                    tracing::debug!(segment = self.work.index, worker = %worker, "No capacity after {:?}; selecting again", waited);
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    consumed = attempt;
                    if e.category() == ErrorCategory::Worker {
                        pool.report_failure(&target, &e.to_string());
                    }
                    switch_worker = e.category() == ErrorCategory::Config
                        || matches!(e, SegmentError::Reconcile(_));
                    tracing::warn!(
                        segment = self.work.index,
                        worker = %target,
                        attempt,
                        "Segment attempt failed: {}",
                        e
                    );
                    previous = Some(target);

                    if consumed >= max_attempts {
                        return SegmentOutcome::Failed {
                            error: e,
                            attempts: consumed,
                        };
                    }
                    last_error = Some(e);
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return SegmentOutcome::Cancelled { attempts: consumed },
                    }
                }
            }
        }
    }

    /// One attempt on one worker: lease, reconcile, translate, release
    async fn attempt(&self, worker: &WorkerId, attempt: u32) -> Result<String, SegmentError> {
        let engine = &self.ctx.engine;
        let Some(timeout) = self.ctx.acquire_timeout() else {
            return Err(SegmentError::Pool(PoolError::Cancelled));
        };
        let holder = format!("{}/seg-{}", self.ctx.job_id.short(), self.work.index);
        let mut lease = engine
            .pool
            .acquire(worker, &holder, timeout, &self.ctx.cancel)
            .await?;

        let result = self.on_lease(&mut lease, attempt).await;
        let outcome = match &result {
            Ok(_) => LeaseOutcome::Ok,
            Err(e) => e.lease_outcome(),
        };
        lease.release(outcome).await;
        result
    }

    async fn on_lease(&self, lease: &mut SessionLease, attempt: u32) -> Result<String, SegmentError> {
        self.ctx.ensure_reconciled(lease).await?;

        let config = &self.ctx.engine.config;
        let segment_timeout = config.segment_timeout();
        let attempt_cancel = self.ctx.cancel.child_token();

        let run = self.translate(lease, attempt, &attempt_cancel);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(segment_timeout) => {
                attempt_cancel.cancel();
                // give the remote process its grace period to exit
                if tokio::time::timeout(config.grace_cancel(), &mut run).await.is_err() {
                    tracing::warn!(segment = self.work.index, "Remote command ignored cancellation");
                }
                Err(SegmentError::Timeout(segment_timeout))
            }
        }
    }

    async fn translate(
        &self,
        lease: &mut SessionLease,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<String, SegmentError> {
        let remote_dir = lease.descriptor().remote_dir.clone();
        let job_dir = format!(
            "{}/jobs/{}",
            remote_dir.trim_end_matches('/'),
            self.ctx.job_id.short()
        );
        let input = format!("{}/seg-{}-a{}.in", job_dir, self.work.index, attempt);
        let output = format!("{}/seg-{}-a{}.out", job_dir, self.work.index, attempt);

        lease
            .upload(Bytes::from(self.work.text.clone()), &input, INPUT_MODE)
            .await?;

        let command = TranslateCommand {
            executable: self.ctx.engine.config.remote_executable.clone(),
            input: input.clone(),
            output: output.clone(),
            from: self.ctx.spec.from.clone(),
            to: self.ctx.spec.to.clone(),
            model: self.ctx.spec.model.clone(),
            context: self.ctx.context_chars,
        }
        .to_shell(&remote_dir)
        .map_err(|e| SegmentError::Command(e.to_string()))?;

        let result = self.execute(lease, &command, &output, cancel).await;
        self.cleanup(lease, &input, &output).await;
        result
    }

    async fn execute(
        &self,
        lease: &mut SessionLease,
        command: &str,
        output_path: &str,
        cancel: &CancellationToken,
    ) -> Result<String, SegmentError> {
        let output = lease
            .execute(command, self.ctx.engine.config.command_timeout(), cancel)
            .await?;
        if !output.success() {
            return Err(SegmentError::Exit {
                code: output.exit_code,
                stderr: output.stderr_lossy().trim().to_string(),
            });
        }
        if !output.stdout.is_empty() {
            tracing::trace!(segment = self.work.index, "translate: {}", output.stdout_lossy().trim());
        }

        match lease.download(output_path).await {
            Ok(data) => Ok(String::from_utf8_lossy(&data).trim_end().to_string()),
            Err(SessionError::NotFound(path)) => Err(SegmentError::MissingOutput(path)),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the segment's remote files; failures are only logged
    async fn cleanup(&self, lease: &mut SessionLease, input: &str, output: &str) {
        if lease.state() != SessionState::InUse {
            return;
        }
        let command = format!("rm -f {} {}", shell_quote(input), shell_quote(output));
        let timeout = self.ctx.engine.config.command_timeout();
        match lease.execute(&command, timeout, &CancellationToken::new()).await {
            Ok(result) if result.success() => {}
            Ok(result) => tracing::warn!(
                segment = self.work.index,
                "Cleanup exited with {}: {}",
                result.exit_code,
                result.stderr_lossy().trim()
            ),
            Err(e) => tracing::warn!(segment = self.work.index, "Cleanup failed: {}", e),
        }
    }
}
