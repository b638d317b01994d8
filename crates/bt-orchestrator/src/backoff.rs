//! Exponential backoff between segment attempts

use std::time::Duration;

use rand::Rng;

use bt_core::config::BackoffConfig;

/// Exponential backoff with symmetric jitter
pub struct ExponentialBackoff {
    /// Delay before jitter for the next call
    current: Duration,
    /// Maximum delay
    max: Duration,
    multiplier: f64,
    /// Jitter fraction (0.2 = ±20%)
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.base(), config.cap(), config.factor, config.jitter_pct / 100.0)
    }

    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            current: initial.min(max),
            max,
            multiplier,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        self.current = self.scaled(self.current, self.multiplier);

        if self.jitter == 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        self.scaled(delay, 1.0 + spread)
    }

    /// `delay * factor`, saturating at the maximum
    fn scaled(&self, delay: Duration, factor: f64) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .map_or(self.max, |scaled| scaled.min(self.max))
    }
}
