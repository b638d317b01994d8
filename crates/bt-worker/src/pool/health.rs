//! Worker health probing
//!
//! A probe runs `echo ready` on a session that is not leased: an idle one
//! when available, otherwise a freshly opened one as long as the worker is
//! below capacity. Saturated workers are skipped; their in-flight leases
//! keep them fresh.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use bt_core::{Event, EventSessionId, SessionState, WorkerId};
use bt_protocol::EventKind;

use super::{close_all, PoolInner, TagFilter, WorkerPool, WorkerSlot};

/// Command run by health probes
pub const PROBE_COMMAND: &str = "echo ready";

/// Health of a worker as seen by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthState {
    /// Never probed
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "unknown"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

impl PoolInner {
    /// Promote a worker; publishes `worker_recovered` when it was unhealthy
    pub(crate) fn mark_healthy(&self, slot: &WorkerSlot) {
        let previous = {
            let mut state = slot.lock();
            let previous = state.health;
            state.health = HealthState::Healthy;
            state.last_success = Some(Instant::now());
            state.consecutive_failures = 0;
            previous
        };

        if previous == HealthState::Unhealthy {
            tracing::info!(worker = %slot.id, "Worker recovered");
            self.bus.publish(
                Event::new(EventKind::WorkerRecovered, EventSessionId::system())
                    .with_step(slot.id.to_string())
                    .with_message(format!("worker {} is healthy again", slot.id)),
            );
        }
    }

    /// Demote a worker; publishes `worker_degraded` on the transition
    pub(crate) fn mark_unhealthy(&self, slot: &WorkerSlot, reason: &str) {
        let (previous, failures) = {
            let mut state = slot.lock();
            let previous = state.health;
            state.health = HealthState::Unhealthy;
            state.consecutive_failures += 1;
            (previous, state.consecutive_failures)
        };

        if previous != HealthState::Unhealthy {
            tracing::warn!(worker = %slot.id, failures, "Worker degraded: {}", reason);
            self.bus.publish(
                Event::new(EventKind::WorkerDegraded, EventSessionId::system())
                    .with_step(slot.id.to_string())
                    .with_message(format!("worker {} is unhealthy", slot.id))
                    .with_error(reason),
            );
        } else {
            tracing::debug!(worker = %slot.id, failures, "Worker still unhealthy: {}", reason);
        }
    }

    /// Refresh freshness of a healthy worker after a successful command
    pub(crate) fn touch(&self, slot: &WorkerSlot) {
        let mut state = slot.lock();
        if state.health == HealthState::Healthy {
            state.last_success = Some(Instant::now());
        }
    }

    /// Probe one worker; returns `None` when the probe was skipped
    pub(crate) async fn probe(&self, slot: &WorkerSlot) -> Option<bool> {
        let borrowed = {
            let mut state = slot.lock();
            state.last_probe = Some(Instant::now());
            match state.idle.pop() {
                Some(session) => Some(session),
                None if state.leased < slot.descriptor.max_capacity => None,
                None => {
                    tracing::trace!(worker = %slot.id, "Saturated; skipping probe");
                    return None;
                }
            }
        };

        let mut session = match borrowed {
            Some(session) => session,
            None => match self
                .connector
                .open(&slot.descriptor, self.settings.connection_timeout)
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    self.mark_unhealthy(slot, &e.to_string());
                    return Some(false);
                }
            },
        };

        let result = session
            .execute(PROBE_COMMAND, self.settings.probe_timeout, &self.shutdown)
            .await;

        let healthy = match &result {
            Ok(output) if output.success() && output.stdout_lossy().trim() == "ready" => true,
            Ok(output) => {
                self.mark_unhealthy(
                    slot,
                    &format!("probe exited with {}: {}", output.exit_code, output.stderr_lossy().trim()),
                );
                false
            }
            Err(e) => {
                self.mark_unhealthy(slot, &format!("probe failed: {}", e));
                false
            }
        };
        if healthy {
            self.mark_healthy(slot);
        }

        if session.state() == SessionState::Idle && !self.shutdown.is_cancelled() {
            session.meta_mut().last_used = Instant::now();
            slot.lock().idle.push(session);
        } else {
            close_all(vec![session]).await;
        }
        Some(healthy)
    }

    /// Probe every matching worker concurrently
    pub(crate) async fn probe_matching(self: &Arc<Self>, filter: &TagFilter) {
        let mut probes = JoinSet::new();
        for slot in self.ordered_slots() {
            if !filter.matches(&slot.descriptor) {
                continue;
            }
            let inner = Arc::clone(self);
            let slot = Arc::clone(slot);
            probes.spawn(async move { inner.probe(&slot).await });
        }
        while let Some(result) = probes.join_next().await {
            if let Err(e) = result {
                tracing::error!("Health probe task failed: {}", e);
            }
        }
    }
}

impl WorkerPool {
    /// Run one probe round over every worker
    pub async fn probe_all(&self) {
        let _round = self.inner.probe_round.lock().await;
        self.inner.probe_matching(&TagFilter::any()).await;
    }

    /// Probe a single worker now; `None` if it was saturated
    pub async fn probe_worker(&self, worker_id: &WorkerId) -> Option<bool> {
        let slot = self.inner.slots.get(worker_id)?;
        self.inner.probe(slot).await
    }

    /// Record a worker-attributable failure (non-zero exit, missing output, ...)
    pub fn report_failure(&self, worker_id: &WorkerId, reason: &str) {
        if let Some(slot) = self.inner.slots.get(worker_id) {
            self.inner.mark_unhealthy(slot, reason);
        }
    }

    /// Record a fully successful unit of work on a worker
    pub fn report_success(&self, worker_id: &WorkerId) {
        if let Some(slot) = self.inner.slots.get(worker_id) {
            self.inner.mark_healthy(slot);
        }
    }

    /// Current health of a worker
    pub fn health(&self, worker_id: &WorkerId) -> Option<HealthState> {
        self.inner.slots.get(worker_id).map(|slot| slot.lock().health)
    }

    /// Spawn the periodic probe loop; it stops on pool shutdown or `cancel`
    pub fn spawn_health_monitor(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!("Starting health monitor (interval: {:?})", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.probe_all().await,
                    _ = cancel.cancelled() => break,
                    _ = pool.inner.shutdown.cancelled() => break,
                }
            }
            tracing::info!("Health monitor shutting down");
        })
    }
}
