//! Time utilities for booktran
//!
//! Wall-clock readings can jump backwards; event timestamps must not. The
//! [`MonotonicClock`] anchors a single wall-clock reading to an [`Instant`]
//! and derives every later timestamp from the monotonic clock.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is set before the Unix epoch.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Unix-millisecond clock that never goes backwards within a process
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
    origin_unix_millis: u64,
}

impl MonotonicClock {
    /// Anchor a new clock at the current wall-clock time
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_unix_millis: current_time_millis(),
        }
    }

    /// Current Unix time in milliseconds, monotonic
    pub fn now_millis(&self) -> u64 {
        self.origin_unix_millis + self.origin.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
