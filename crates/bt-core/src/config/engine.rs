//! Engine configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use super::WorkerDescriptor;
use crate::error::ConfigError;
use crate::types::WorkerId;

/// Configuration bag for the coordinator's distributed execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker hosts
    pub workers: Vec<WorkerDescriptor>,

    /// Upper bound on segment size, in characters
    pub max_segment_chars: usize,

    /// Segments dispatched concurrently within one job
    pub max_in_flight_segments: usize,

    /// Attempts per segment, including the first
    pub max_attempts: u32,

    /// Retry backoff
    pub backoff: BackoffConfig,

    /// Session open timeout
    pub connection_timeout_ms: u64,

    /// Per-command timeout
    pub command_timeout_ms: u64,

    /// Per-segment timeout (covers upload, command and download)
    pub segment_timeout_ms: u64,

    /// How long a cancelled remote command may take to exit
    pub grace_cancel_seconds: u64,

    /// Interval between health probe rounds
    pub health_probe_interval_ms: u64,

    /// Fail the whole job when one segment exhausts its retries
    pub strict_segment_failure: bool,

    /// Files that must be present and identical on every worker
    pub snapshot_files: Vec<SnapshotFile>,

    /// Worker-side translation program, relative to the worker's remote dir
    pub remote_executable: String,

    /// Forwarded as `--context <chars>` when set
    pub context_chars: Option<u32>,

    /// Overall job deadline
    pub job_timeout_ms: Option<u64>,

    /// A worker counts as healthy if probed successfully within this window
    pub health_window_ms: u64,

    /// Idle sessions older than this are closed instead of reused
    pub idle_timeout_ms: u64,

    /// Translation result cache
    pub result_cache: ResultCacheConfig,

    /// Default per-subscriber event buffer
    pub subscriber_buffer: usize,

    /// Tags a worker must carry to receive segments by default
    pub required_tags: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: vec![],
            max_segment_chars: 2000,
            max_in_flight_segments: 4,
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            connection_timeout_ms: 10_000,
            command_timeout_ms: 300_000,
            segment_timeout_ms: 360_000,
            grace_cancel_seconds: 5,
            health_probe_interval_ms: 10_000,
            strict_segment_failure: true,
            snapshot_files: vec![],
            remote_executable: "bin/translate".to_string(),
            context_chars: None,
            job_timeout_ms: None,
            health_window_ms: 30_000,
            idle_timeout_ms: 300_000,
            result_cache: ResultCacheConfig::default(),
            subscriber_buffer: 256,
            required_tags: vec![],
        }
    }
}

impl EngineConfig {
    /// Check every value range; the error names the offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.is_empty() {
            return Err(ConfigError::invalid("workers", "at least one worker is required"));
        }

        let mut seen = HashSet::new();
        for (i, worker) in self.workers.iter().enumerate() {
            worker.validate(&format!("workers[{}]", i))?;
            if !seen.insert(worker.worker_id()) {
                return Err(ConfigError::DuplicateWorker(worker.worker_id().to_string()));
            }
        }

        if self.max_segment_chars == 0 {
            return Err(ConfigError::invalid("maxSegmentChars", "must be greater than 0"));
        }
        if self.max_in_flight_segments == 0 {
            return Err(ConfigError::invalid("maxInFlightSegments", "must be greater than 0"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("maxAttempts", "must be at least 1"));
        }
        self.backoff.validate()?;

        let timeouts = [
            ("connectionTimeoutMs", self.connection_timeout_ms),
            ("commandTimeoutMs", self.command_timeout_ms),
            ("segmentTimeoutMs", self.segment_timeout_ms),
            ("healthProbeIntervalMs", self.health_probe_interval_ms),
            ("healthWindowMs", self.health_window_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than 0"));
            }
        }
        if self.segment_timeout_ms < self.command_timeout_ms {
            return Err(ConfigError::invalid(
                "segmentTimeoutMs",
                "must be at least commandTimeoutMs",
            ));
        }
        if self.remote_executable.trim().is_empty() {
            return Err(ConfigError::invalid("remoteExecutable", "must not be empty"));
        }
        if self.subscriber_buffer == 0 {
            return Err(ConfigError::invalid("subscriberBuffer", "must be greater than 0"));
        }

        let mut remote_paths = HashSet::new();
        for (i, file) in self.snapshot_files.iter().enumerate() {
            file.validate(&format!("snapshotFiles[{}]", i))?;
            if !remote_paths.insert(file.remote_rel_path.as_str()) {
                return Err(ConfigError::invalid(
                    format!("snapshotFiles[{}].remoteRelPath", i),
                    "duplicate remote path",
                ));
            }
        }

        Ok(())
    }

    /// Look up a worker by identifier
    pub fn worker(&self, id: &WorkerId) -> Result<&WorkerDescriptor, ConfigError> {
        self.workers
            .iter()
            .find(|w| &w.worker_id() == id)
            .ok_or_else(|| ConfigError::UnknownWorker(id.to_string()))
    }

    /// Session open timeout
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Per-command timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Per-segment timeout
    pub fn segment_timeout(&self) -> Duration {
        Duration::from_millis(self.segment_timeout_ms)
    }

    /// Cancellation grace period
    pub fn grace_cancel(&self) -> Duration {
        Duration::from_secs(self.grace_cancel_seconds)
    }

    /// Interval between health probe rounds
    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_millis(self.health_probe_interval_ms)
    }

    /// Health freshness window
    pub fn health_window(&self) -> Duration {
        Duration::from_millis(self.health_window_ms)
    }

    /// Idle session expiry
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Overall job deadline, if any
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }
}

/// Exponential backoff configuration for segment retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct BackoffConfig {
    /// First retry delay
    pub base_ms: u64,

    /// Multiplier for each retry
    pub factor: f64,

    /// Maximum delay
    pub cap_ms: u64,

    /// Jitter, as a percentage of the delay (applied ±)
    pub jitter_pct: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2.0,
            cap_ms: 30_000,
            jitter_pct: 20.0,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err(ConfigError::invalid("backoff.factor", "must be a finite value >= 1"));
        }
        if self.cap_ms < self.base_ms {
            return Err(ConfigError::invalid("backoff.capMs", "must be at least baseMs"));
        }
        if !(0.0..=100.0).contains(&self.jitter_pct) {
            return Err(ConfigError::invalid("backoff.jitterPct", "must be within [0, 100]"));
        }
        Ok(())
    }

    /// First retry delay
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    /// Maximum delay
    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }
}

/// One file of the codebase snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SnapshotFile {
    /// Path on the coordinator
    pub local_path: PathBuf,

    /// Path relative to the worker's remote dir
    pub remote_rel_path: String,

    /// Mark executable on the worker
    #[serde(default)]
    pub executable: bool,
}

impl SnapshotFile {
    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        let rel = self.remote_rel_path.as_str();
        if rel.is_empty() || rel.starts_with('/') {
            return Err(ConfigError::invalid(
                format!("{}.remoteRelPath", field),
                "must be a non-empty relative path",
            ));
        }
        if rel.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(ConfigError::invalid(
                format!("{}.remoteRelPath", field),
                "must not contain empty or `..` components",
            ));
        }
        if rel == bt_protocol::VERSION_FILE {
            return Err(ConfigError::invalid(
                format!("{}.remoteRelPath", field),
                "is reserved for the version file",
            ));
        }
        Ok(())
    }
}

/// Translation result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ResultCacheConfig {
    /// Maximum cached segments; 0 disables the cache
    pub max_entries: usize,

    /// Entry lifetime
    pub ttl_ms: u64,
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            ttl_ms: 3_600_000,
        }
    }
}

impl ResultCacheConfig {
    /// Entry lifetime
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig {
            workers: vec![WorkerDescriptor::new("gpu-1", "u", "/srv").with_password("p")],
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        config().validate().unwrap();
    }

    #[test]
    fn test_defaults_match_documented_backoff() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.base(), Duration::from_secs(1));
        assert_eq!(backoff.cap(), Duration::from_secs(30));
        assert_eq!(backoff.factor, 2.0);
        assert_eq!(backoff.jitter_pct, 20.0);
    }

    #[test]
    fn test_no_workers_rejected() {
        let err = EngineConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut c = config();
        c.max_segment_chars = 0;
        assert!(c.validate().unwrap_err().to_string().contains("maxSegmentChars"));

        let mut c = config();
        c.max_in_flight_segments = 0;
        assert!(c.validate().unwrap_err().to_string().contains("maxInFlightSegments"));

        let mut c = config();
        c.max_attempts = 0;
        assert!(c.validate().unwrap_err().to_string().contains("maxAttempts"));
    }

    #[test]
    fn test_segment_timeout_covers_command_timeout() {
        let mut c = config();
        c.command_timeout_ms = 10_000;
        c.segment_timeout_ms = 5_000;
        assert!(c.validate().unwrap_err().to_string().contains("segmentTimeoutMs"));
    }

    #[test]
    fn test_duplicate_worker_rejected() {
        let mut c = config();
        c.workers.push(c.workers[0].clone());
        assert!(matches!(c.validate(), Err(ConfigError::DuplicateWorker(_))));
    }

    #[test]
    fn test_unknown_worker_lookup() {
        let c = config();
        assert!(c.worker(&WorkerId::new("gpu-1:22")).is_ok());
        assert!(matches!(
            c.worker(&WorkerId::new("nope")),
            Err(ConfigError::UnknownWorker(_))
        ));
    }

    #[test]
    fn test_snapshot_paths_checked() {
        let mut c = config();
        c.snapshot_files = vec![SnapshotFile {
            local_path: PathBuf::from("translate.sh"),
            remote_rel_path: "../escape.sh".to_string(),
            executable: true,
        }];
        assert!(c.validate().unwrap_err().to_string().contains("snapshotFiles[0]"));

        c.snapshot_files[0].remote_rel_path = ".version".to_string();
        assert!(c.validate().is_err());

        c.snapshot_files[0].remote_rel_path = "bin/translate".to_string();
        c.validate().unwrap();
    }

    #[test]
    fn test_backoff_range_checked() {
        let mut c = config();
        c.backoff.jitter_pct = 150.0;
        assert!(c.validate().unwrap_err().to_string().contains("backoff.jitterPct"));
    }
}
