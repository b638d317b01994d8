//! Worker pool
//!
//! Keeps reusable sessions per worker, enforces each worker's capacity,
//! and selects healthy workers for the orchestrator.
//!
//! # Capacity
//!
//! A worker's `leased` count includes sessions being opened on behalf of an
//! acquirer, so at no instant does it exceed `maxCapacity`. Health probes
//! never take a lease.
//!
//! # Shutdown
//!
//! After [`WorkerPool::shutdown`] every acquire fails with
//! [`PoolError::Shutdown`]; commands running on outstanding leases observe
//! an execution error and their sessions are closed on release.

mod error;
mod health;
mod lease;

pub use error::PoolError;
pub use health::HealthState;
pub use lease::{LeaseOutcome, SessionLease};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use bt_core::config::{EngineConfig, WorkerDescriptor};
use bt_core::{ConfigError, EventBus, RemoteSession, SessionConnector, SessionState, WorkerId};

/// Timing knobs for the pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Session open timeout
    pub connection_timeout: Duration,
    /// Timeout for health probe commands
    pub probe_timeout: Duration,
    /// Idle sessions older than this are closed instead of reused
    pub idle_timeout: Duration,
    /// A worker is fresh if it succeeded within this window
    pub health_window: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            connection_timeout: config.connection_timeout(),
            probe_timeout: config.connection_timeout().min(config.command_timeout()),
            idle_timeout: config.idle_timeout(),
            health_window: config.health_window(),
        }
    }
}

/// Tag predicate for worker selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    required: Vec<String>,
}

impl TagFilter {
    /// Matches every worker
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches workers carrying every listed tag (case-insensitive)
    pub fn all_of<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, descriptor: &WorkerDescriptor) -> bool {
        self.required.iter().all(|tag| descriptor.has_tag(tag))
    }
}

/// Snapshot of one worker's pool state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker_id: WorkerId,
    pub capacity: usize,
    pub in_flight: usize,
    pub idle: usize,
    pub health: HealthState,
    /// Time since the last probe, if any ran
    pub last_probe_age: Option<Duration>,
    pub consecutive_failures: u32,
}

type BoxedSession = Box<dyn RemoteSession>;

/// Mutable per-worker state, guarded by the slot lock
pub(crate) struct SlotState {
    idle: Vec<BoxedSession>,
    leased: usize,
    health: HealthState,
    last_success: Option<Instant>,
    last_probe: Option<Instant>,
    consecutive_failures: u32,
}

/// What an acquirer may do next
enum Reservation {
    /// Reuse this idle session
    Idle(BoxedSession),
    /// A lease slot was reserved; open a new session
    Open,
    /// At capacity; wait for a release
    Full,
}

/// One worker's sessions and health
pub(crate) struct WorkerSlot {
    pub(crate) id: WorkerId,
    pub(crate) descriptor: WorkerDescriptor,
    state: Mutex<SlotState>,
    /// Signalled whenever a lease is returned
    available: Notify,
}

impl WorkerSlot {
    fn new(descriptor: WorkerDescriptor) -> Self {
        Self {
            id: descriptor.worker_id(),
            descriptor,
            state: Mutex::new(SlotState {
                idle: Vec::new(),
                leased: 0,
                health: HealthState::Unknown,
                last_success: None,
                last_probe: None,
                consecutive_failures: 0,
            }),
            available: Notify::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an idle session or reserve a lease slot; expired idle sessions
    /// are handed back for closing
    fn reserve(&self, idle_timeout: Duration) -> (Reservation, Vec<BoxedSession>) {
        let mut state = self.lock();
        let (fresh, expired): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
            .into_iter()
            .partition(|s| {
                s.state() == SessionState::Idle && s.meta().last_used.elapsed() < idle_timeout
            });
        state.idle = fresh;

        let reservation = if let Some(session) = state.idle.pop() {
            state.leased += 1;
            Reservation::Idle(session)
        } else if state.leased < self.descriptor.max_capacity {
            state.leased += 1;
            Reservation::Open
        } else {
            Reservation::Full
        };
        debug_assert!(state.leased <= self.descriptor.max_capacity);
        (reservation, expired)
    }

    /// Give back a lease slot, keeping the session if it is still usable
    pub(crate) fn give_back(&self, session: Option<BoxedSession>) {
        {
            let mut state = self.lock();
            assert!(
                state.leased > 0,
                "lease accounting underflow on worker {}",
                self.id
            );
            state.leased -= 1;
            if let Some(session) = session {
                state.idle.push(session);
            }
        }
        self.available.notify_waiters();
    }

    /// Whether the worker is healthy and succeeded within `window`
    fn is_fresh(&self, state: &SlotState, now: Instant, window: Duration) -> bool {
        state.health == HealthState::Healthy
            && state
                .last_success
                .map_or(false, |t| now.saturating_duration_since(t) < window)
    }
}

pub(crate) struct PoolInner {
    pub(crate) connector: Arc<dyn SessionConnector>,
    pub(crate) slots: HashMap<WorkerId, Arc<WorkerSlot>>,
    /// Configuration order, walked by the round-robin cursor
    pub(crate) order: Vec<WorkerId>,
    cursor: Mutex<usize>,
    /// Serializes probe rounds
    pub(crate) probe_round: tokio::sync::Mutex<()>,
    pub(crate) settings: PoolSettings,
    pub(crate) shutdown: CancellationToken,
    pub(crate) bus: EventBus,
}

impl PoolInner {
    fn slot(&self, worker_id: &WorkerId) -> Result<Arc<WorkerSlot>, PoolError> {
        self.slots
            .get(worker_id)
            .cloned()
            .ok_or_else(|| PoolError::NoWorker(worker_id.clone()))
    }

    pub(crate) fn ordered_slots(&self) -> impl Iterator<Item = &Arc<WorkerSlot>> {
        self.order.iter().filter_map(|id| self.slots.get(id))
    }
}

/// Keyed collection of sessions with bounded concurrency per worker
#[derive(Clone)]
pub struct WorkerPool {
    pub(crate) inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Build a pool over the configured workers
    pub fn new(
        workers: &[WorkerDescriptor],
        settings: PoolSettings,
        connector: Arc<dyn SessionConnector>,
        bus: EventBus,
    ) -> Result<Self, ConfigError> {
        let mut slots = HashMap::new();
        let mut order = Vec::new();
        for descriptor in workers {
            let id = descriptor.worker_id();
            if slots
                .insert(id.clone(), Arc::new(WorkerSlot::new(descriptor.clone())))
                .is_some()
            {
                return Err(ConfigError::DuplicateWorker(id.to_string()));
            }
            order.push(id);
        }

        tracing::info!("Worker pool created with {} workers", order.len());
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                slots,
                order,
                cursor: Mutex::new(0),
                probe_round: tokio::sync::Mutex::new(()),
                settings,
                shutdown: CancellationToken::new(),
                bus,
            }),
        })
    }

    /// Build a pool from an engine configuration
    pub fn from_config(
        config: &EngineConfig,
        connector: Arc<dyn SessionConnector>,
        bus: EventBus,
    ) -> Result<Self, ConfigError> {
        Self::new(&config.workers, PoolSettings::from_config(config), connector, bus)
    }

    /// Configured worker identifiers, in configuration order
    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.inner.order
    }

    /// Descriptor of a worker
    pub fn descriptor(&self, worker_id: &WorkerId) -> Option<&WorkerDescriptor> {
        self.inner.slots.get(worker_id).map(|slot| &slot.descriptor)
    }

    /// Lease a session on a worker
    ///
    /// Reuses an idle session when one exists, opens a new one while under
    /// capacity, and otherwise waits for a release until `timeout` elapses.
    pub async fn acquire(
        &self,
        worker_id: &WorkerId,
        holder: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SessionLease, PoolError> {
        let slot = self.inner.slot(worker_id)?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(PoolError::Shutdown);
            }
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }

            // register interest before inspecting state so a release in
            // between is not missed
            let notified = slot.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (reservation, expired) = slot.reserve(self.inner.settings.idle_timeout);
            if !expired.is_empty() {
                tracing::debug!(worker = %slot.id, "Closing {} expired idle sessions", expired.len());
                close_all(expired).await;
            }

            match reservation {
                Reservation::Idle(session) => {
                    tracing::trace!(worker = %slot.id, holder, "Reusing idle session");
                    return Ok(SessionLease::new(
                        Arc::clone(&self.inner),
                        Arc::clone(&slot),
                        session,
                        holder,
                    ));
                }
                Reservation::Open => return self.open_reserved(Arc::clone(&slot), holder, cancel).await,
                Reservation::Full => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            return Err(PoolError::Capacity {
                                worker: slot.id.clone(),
                                waited: timeout,
                            });
                        }
                        _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                        _ = self.inner.shutdown.cancelled() => return Err(PoolError::Shutdown),
                    }
                }
            }
        }
    }

    async fn open_reserved(
        &self,
        slot: Arc<WorkerSlot>,
        holder: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionLease, PoolError> {
        let connector = Arc::clone(&self.inner.connector);
        let opened = tokio::select! {
            result = connector.open(&slot.descriptor, self.inner.settings.connection_timeout) => Some(result),
            _ = cancel.cancelled() => None,
            _ = self.inner.shutdown.cancelled() => None,
        };

        match opened {
            Some(Ok(session)) => {
                tracing::debug!(worker = %slot.id, holder, "Opened new session");
                Ok(SessionLease::new(Arc::clone(&self.inner), slot, session, holder))
            }
            Some(Err(source)) => {
                slot.give_back(None);
                self.inner.mark_unhealthy(&slot, &source.to_string());
                Err(PoolError::Open {
                    worker: slot.id.clone(),
                    source,
                })
            }
            None => {
                slot.give_back(None);
                if self.inner.shutdown.is_cancelled() {
                    Err(PoolError::Shutdown)
                } else {
                    Err(PoolError::Cancelled)
                }
            }
        }
    }

    /// Pick a healthy worker matching `filter`
    ///
    /// Candidates are healthy workers with a successful probe or execution
    /// within the health window. Fewest in-flight leases wins; ties go to
    /// the round-robin cursor. `avoid` is skipped unless it is the only
    /// candidate. When no worker is fresh, one probe round runs inline.
    pub async fn select_healthy(
        &self,
        filter: &TagFilter,
        avoid: Option<&WorkerId>,
    ) -> Result<WorkerId, PoolError> {
        self.select_healthy_excluding(filter, avoid, &[]).await
    }

    /// [`select_healthy`](Self::select_healthy) that never returns a worker
    /// in `exclude`, even as the last candidate
    pub async fn select_healthy_excluding(
        &self,
        filter: &TagFilter,
        avoid: Option<&WorkerId>,
        exclude: &[WorkerId],
    ) -> Result<WorkerId, PoolError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PoolError::Shutdown);
        }
        if let Some(id) = self.pick(filter, avoid, exclude) {
            return Ok(id);
        }

        {
            let _round = self.inner.probe_round.lock().await;
            // another caller may have just probed
            if let Some(id) = self.pick(filter, avoid, exclude) {
                return Ok(id);
            }
            tracing::debug!("No fresh worker; probing inline");
            self.inner.probe_matching(filter).await;
        }

        self.pick(filter, avoid, exclude).ok_or(PoolError::NoHealthyWorker)
    }

    fn pick(&self, filter: &TagFilter, avoid: Option<&WorkerId>, exclude: &[WorkerId]) -> Option<WorkerId> {
        let inner = &self.inner;
        let count = inner.order.len();
        if count == 0 {
            return None;
        }

        let now = Instant::now();
        let mut cursor = inner.cursor.lock().unwrap_or_else(PoisonError::into_inner);

        // (avoided, in-flight, round-robin distance, index)
        let mut best: Option<(bool, usize, usize, usize)> = None;
        for distance in 0..count {
            let index = (*cursor + distance) % count;
            let Some(slot) = inner.slots.get(&inner.order[index]) else {
                continue;
            };
            if !filter.matches(&slot.descriptor) || exclude.contains(&slot.id) {
                continue;
            }
            let state = slot.lock();
            if !slot.is_fresh(&state, now, inner.settings.health_window) {
                continue;
            }
            let key = (Some(&slot.id) == avoid, state.leased, distance, index);
            if best.map_or(true, |b| (key.0, key.1, key.2) < (b.0, b.1, b.2)) {
                best = Some(key);
            }
        }

        let (_, _, _, index) = best?;
        *cursor = (index + 1) % count;
        Some(inner.order[index].clone())
    }

    /// In-flight leases on a worker
    pub fn in_flight(&self, worker_id: &WorkerId) -> usize {
        self.inner
            .slots
            .get(worker_id)
            .map_or(0, |slot| slot.lock().leased)
    }

    /// Per-worker statistics, in configuration order
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.inner
            .ordered_slots()
            .map(|slot| {
                let state = slot.lock();
                WorkerStats {
                    worker_id: slot.id.clone(),
                    capacity: slot.descriptor.max_capacity,
                    in_flight: state.leased,
                    idle: state.idle.len(),
                    health: state.health,
                    last_probe_age: state.last_probe.map(|t| t.elapsed()),
                    consecutive_failures: state.consecutive_failures,
                }
            })
            .collect()
    }

    /// Whether shutdown has begun
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Token cancelled when the pool shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Close every session; no acquire succeeds afterwards
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let mut closed = 0;
        for slot in self.inner.ordered_slots() {
            let idle = std::mem::take(&mut slot.lock().idle);
            closed += idle.len();
            close_all(idle).await;
            slot.available.notify_waiters();
        }
        tracing::info!("Worker pool shut down ({} idle sessions closed)", closed);
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.inner.order)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

pub(crate) async fn close_all(sessions: Vec<BoxedSession>) {
    for mut session in sessions {
        session.close().await;
    }
}
