//! Job orchestration
//!
//! The [`Orchestrator`] owns the worker pool, the reconciler, the result
//! cache and the event bus. Each submitted job runs on its own task; its
//! state is observable through a watch channel and its result through the
//! returned [`JobHandle`].

mod attempt;
mod progress;
mod runner;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, watch, OnceCell};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use bt_core::config::EngineConfig;
use bt_core::{ConfigError, EventBus, JobId, SessionConnector, SessionError, WorkerId};
use bt_worker::{ReconcileError, Reconciler, SessionLease, TagFilter, WorkerPool};

use crate::cache::{CacheStats, ResultCache};
use crate::job::{JobError, JobOutput, JobSnapshot, JobSpec};
use crate::segment::split_document;

use runner::JobRunner;

/// Shared components behind every job
pub(crate) struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) pool: WorkerPool,
    pub(crate) reconciler: Reconciler,
    pub(crate) bus: EventBus,
    pub(crate) cache: ResultCache,
    jobs: DashMap<JobId, JobEntry>,
    shutdown: CancellationToken,
}

struct JobEntry {
    status: watch::Receiver<JobSnapshot>,
    cancel: CancellationToken,
}

/// Per-job settings resolved at submission
pub(crate) struct JobContext {
    pub(crate) engine: Arc<Engine>,
    pub(crate) job_id: JobId,
    /// Spec without its document
    pub(crate) spec: JobSpec,
    pub(crate) filter: TagFilter,
    pub(crate) context_chars: Option<u32>,
    pub(crate) cancel: CancellationToken,
    pub(crate) timeout: Option<Duration>,
    pub(crate) deadline: Option<Instant>,
    /// Per-worker reconcile state for this job
    reconciled: DashMap<WorkerId, Arc<OnceCell<()>>>,
    /// Workers whose reconcile failed; not used again by this job
    excluded: DashMap<WorkerId, ReconcileError>,
}

impl JobContext {
    /// How long one acquire may wait; `None` once the deadline has passed
    pub(crate) fn acquire_timeout(&self) -> Option<Duration> {
        let segment_timeout = self.engine.config.segment_timeout();
        match self.deadline {
            None => Some(segment_timeout),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                (!remaining.is_zero()).then(|| remaining.min(segment_timeout))
            }
        }
    }

    /// Workers this job must not select
    pub(crate) fn excluded_workers(&self) -> Vec<WorkerId> {
        self.excluded.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Reconcile the lease's worker once per job
    ///
    /// Concurrent segments on the same worker wait for the first one. A
    /// failed reconcile excludes the worker for the rest of the job and
    /// every later call for it returns the same error.
    pub(crate) async fn ensure_reconciled(&self, lease: &mut SessionLease) -> Result<(), ReconcileError> {
        let reconciler = &self.engine.reconciler;
        if reconciler.is_empty() {
            return Ok(());
        }
        let worker = lease.worker_id().clone();
        let once = Arc::clone(self.reconciled.entry(worker.clone()).or_default().value());
        once.get_or_try_init(|| async move {
            if let Some(error) = self.excluded.get(&worker) {
                return Err(error.value().clone());
            }
            let result = reconciler
                .reconcile(lease, &self.spec.session_id, &self.cancel)
                .await;
            match result {
                Ok(_) => Ok(()),
                Err(error @ ReconcileError::Session(SessionError::Cancelled)) => Err(error),
                Err(error) => {
                    tracing::warn!(worker = %worker, "Excluding worker from job: {}", error);
                    self.excluded.insert(worker, error.clone());
                    Err(error)
                }
            }
        })
        .await?;
        Ok(())
    }
}

/// Distributes translation jobs over the worker pool
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Engine>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, pool: WorkerPool, reconciler: Reconciler, bus: EventBus) -> Self {
        let cache = ResultCache::from_config(&config.result_cache);
        Self {
            inner: Arc::new(Engine {
                config,
                pool,
                reconciler,
                bus,
                cache,
                jobs: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Validate `config` and build the pool and reconciler from it
    pub fn from_config(
        config: EngineConfig,
        connector: Arc<dyn SessionConnector>,
        bus: EventBus,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = WorkerPool::from_config(&config, connector, bus.clone())?;
        let reconciler = Reconciler::from_config(&config, bus.clone());
        Ok(Self::new(config, pool, reconciler, bus))
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Start a job
    ///
    /// Returns immediately; the job runs on its own task. Must be called
    /// from within a Tokio runtime.
    pub fn submit(&self, mut spec: JobSpec) -> Result<JobHandle, JobError> {
        let engine = &self.inner;
        if engine.shutdown.is_cancelled() {
            return Err(JobError::Shutdown);
        }
        spec.validate()?;

        let job_id = JobId::new();
        let document = std::mem::take(&mut spec.document);
        let segments = split_document(&document, engine.config.max_segment_chars);

        let mut initial = JobSnapshot::pending(job_id);
        initial.total_segments = segments.iter().filter(|s| s.is_translatable()).count();
        let (status_tx, status_rx) = watch::channel(initial);
        let cancel = engine.shutdown.child_token();

        let tags = if spec.required_tags.is_empty() {
            engine.config.required_tags.clone()
        } else {
            spec.required_tags.clone()
        };
        let strict = spec.strict.unwrap_or(engine.config.strict_segment_failure);
        let context_chars = spec.context_chars.or(engine.config.context_chars);
        let timeout = engine.config.job_timeout();

        tracing::info!(
            job = %job_id,
            session = %spec.session_id.as_str(),
            "Submitting job: {} segments, {} -> {}",
            segments.len(),
            spec.from,
            spec.to
        );

        let ctx = Arc::new(JobContext {
            engine: Arc::clone(engine),
            job_id,
            spec,
            filter: TagFilter::all_of(tags),
            context_chars,
            cancel: cancel.clone(),
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            reconciled: DashMap::new(),
            excluded: DashMap::new(),
        });

        engine.jobs.insert(
            job_id,
            JobEntry {
                status: status_rx.clone(),
                cancel,
            },
        );

        let (result_tx, result_rx) = oneshot::channel();
        let runner = JobRunner::new(ctx, status_tx, segments, strict);
        let span = tracing::info_span!("job", id = %job_id.short());
        tokio::spawn(
            async move {
                let result = runner.run().await;
                match &result {
                    Ok(output) => tracing::info!("Job completed in {:?}", output.elapsed),
                    Err(e) => tracing::warn!("Job ended: {}", e),
                }
                let _ = result_tx.send(result);
            }
            .instrument(span),
        );

        Ok(JobHandle {
            job_id,
            status: status_rx,
            result: result_rx,
        })
    }

    /// Current state of a job
    pub fn status(&self, job_id: &JobId) -> Result<JobSnapshot, JobError> {
        self.inner
            .jobs
            .get(job_id)
            .map(|entry| entry.status.borrow().clone())
            .ok_or(JobError::UnknownJob(*job_id))
    }

    /// Request cancellation; a no-op for a job that already ended
    pub fn cancel(&self, job_id: &JobId) -> Result<(), JobError> {
        let entry = self
            .inner
            .jobs
            .get(job_id)
            .ok_or(JobError::UnknownJob(*job_id))?;
        if entry.status.borrow().status.is_terminal() {
            return Ok(());
        }
        tracing::info!(job = %job_id, "Cancelling job");
        entry.cancel.cancel();
        Ok(())
    }

    /// Snapshots of every known job
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.inner
            .jobs
            .iter()
            .map(|entry| entry.status.borrow().clone())
            .collect()
    }

    /// Drop a finished job from the registry
    ///
    /// Returns `false` while the job is still running.
    pub fn forget(&self, job_id: &JobId) -> Result<bool, JobError> {
        let terminal = self.status(job_id)?.status.is_terminal();
        if terminal {
            self.inner.jobs.remove(job_id);
        }
        Ok(terminal)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancel every job, wait for them to settle, then shut the pool down
    pub async fn shutdown(&self) {
        let engine = &self.inner;
        if engine.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Shutting down orchestrator");
        engine.shutdown.cancel();

        let waits: Vec<_> = engine
            .jobs
            .iter()
            .map(|entry| {
                let mut status = entry.status.clone();
                async move {
                    let _ = status.wait_for(|s| s.status.is_terminal()).await;
                }
            })
            .collect();
        let settle = engine.config.grace_cancel() + Duration::from_secs(1);
        if tokio::time::timeout(settle, futures::future::join_all(waits))
            .await
            .is_err()
        {
            tracing::warn!("Jobs still running after {:?}", settle);
        }

        engine.pool.shutdown().await;
    }
}

/// Handle to a submitted job
pub struct JobHandle {
    job_id: JobId,
    status: watch::Receiver<JobSnapshot>,
    result: oneshot::Receiver<Result<JobOutput, JobError>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.job_id
    }

    /// Current state
    pub fn status(&self) -> JobSnapshot {
        self.status.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch(&self) -> watch::Receiver<JobSnapshot> {
        self.status.clone()
    }

    /// Wait for the job to end
    pub async fn wait(self) -> Result<JobOutput, JobError> {
        match self.result.await {
            Ok(result) => result,
            // runner task went away without reporting
            Err(_) => Err(JobError::Shutdown),
        }
    }
}
