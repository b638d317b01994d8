//! Job progress accounting

use std::time::{Duration, Instant};

/// Minimum spacing of progress events triggered by dispatches
pub(crate) const IN_FLIGHT_EVENT_INTERVAL: Duration = Duration::from_millis(500);

/// Highest progress a job reports before it is completed
const RUNNING_CEILING: f64 = 0.999;

/// Progress = (completed + 0.5 × in-flight) / total, never decreasing
#[derive(Debug)]
pub(crate) struct Progress {
    total: usize,
    completed: usize,
    in_flight: usize,
    value: f64,
    last_in_flight_event: Option<Instant>,
}

impl Progress {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            in_flight: 0,
            value: 0.0,
            last_in_flight_event: None,
        }
    }

    pub(crate) fn value(&self) -> f64 {
        self.value
    }

    pub(crate) fn completed(&self) -> usize {
        self.completed
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// A segment finished without dispatch (cache hit)
    pub(crate) fn skip(&mut self) -> f64 {
        self.completed += 1;
        self.recompute()
    }

    /// A segment was dispatched; returns the progress when an event is due
    pub(crate) fn dispatched(&mut self) -> Option<f64> {
        self.in_flight += 1;
        let value = self.recompute();
        let now = Instant::now();
        let due = self
            .last_in_flight_event
            .map_or(true, |last| now.duration_since(last) >= IN_FLIGHT_EVENT_INTERVAL);
        if due {
            self.last_in_flight_event = Some(now);
            Some(value)
        } else {
            None
        }
    }

    /// An in-flight segment returned; `done` counts it as completed
    pub(crate) fn finished(&mut self, done: bool) -> f64 {
        self.in_flight = self.in_flight.saturating_sub(1);
        if done {
            self.completed += 1;
        }
        self.recompute()
    }

    /// The job completed
    pub(crate) fn complete(&mut self) -> f64 {
        self.in_flight = 0;
        self.completed = self.total;
        self.value = 1.0;
        self.value
    }

    fn recompute(&mut self) -> f64 {
        if self.total > 0 {
            let raw = (self.completed as f64 + 0.5 * self.in_flight as f64) / self.total as f64;
            self.value = self.value.max(raw.min(RUNNING_CEILING));
        }
        self.value
    }
}
