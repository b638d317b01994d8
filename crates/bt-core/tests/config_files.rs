//! Loading complete configuration files from disk

use std::io::Write;
use std::time::Duration;

use bt_core::config::{load_config, Credential};
use bt_core::{ConfigError, WorkerId};

fn write(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

const FULL_JSON: &str = r#"{
  "workers": [
    {
      "id": "gpu-1",
      "host": "10.0.0.5",
      "port": 2222,
      "user": "translator",
      "privateKeyPath": "/home/booktran/.ssh/id_ed25519",
      "remoteDir": "/srv/booktran",
      "maxCapacity": 4,
      "tags": ["gpu", "a100"],
      "hostKeyFingerprint": "SHA256:abc"
    },
    {
      "host": "10.0.0.6",
      "user": "translator",
      "password": "hunter2",
      "remoteDir": "/srv/booktran"
    }
  ],
  "maxSegmentChars": 1500,
  "maxInFlightSegments": 6,
  "maxAttempts": 4,
  "backoff": { "baseMs": 500, "factor": 1.5, "capMs": 8000, "jitterPct": 10 },
  "connectionTimeoutMs": 3000,
  "commandTimeoutMs": 60000,
  "segmentTimeoutMs": 120000,
  "graceCancelSeconds": 2,
  "healthProbeIntervalMs": 15000,
  "strictSegmentFailure": false,
  "remoteExecutable": "/opt/booktran/translate",
  "contextChars": 400,
  "jobTimeoutMs": 3600000,
  "healthWindowMs": 45000,
  "idleTimeoutMs": 120000,
  "resultCache": { "maxEntries": 0 },
  "subscriberBuffer": 512,
  "requiredTags": ["gpu"]
}"#;

#[test]
fn test_full_json_config() {
    let file = write(".json", FULL_JSON);
    let config = load_config(file.path()).unwrap();

    assert_eq!(config.workers.len(), 2);
    let first = &config.workers[0];
    assert_eq!(first.worker_id(), WorkerId::new("gpu-1"));
    assert_eq!(first.max_capacity, 4);
    assert!(first.has_tag("GPU"));
    assert!(matches!(
        first.credentials().as_slice(),
        [Credential::PrivateKey { passphrase: None, .. }]
    ));
    // identifier defaults to host:port
    assert_eq!(config.workers[1].worker_id(), WorkerId::new("10.0.0.6:22"));

    assert_eq!(config.max_attempts, 4);
    assert_eq!(config.backoff.base(), Duration::from_millis(500));
    assert_eq!(config.grace_cancel(), Duration::from_secs(2));
    assert_eq!(config.job_timeout(), Some(Duration::from_secs(3600)));
    assert_eq!(config.health_window(), Duration::from_secs(45));
    assert_eq!(config.context_chars, Some(400));
    assert!(!config.strict_segment_failure);
    assert_eq!(config.result_cache.max_entries, 0);
    assert_eq!(config.result_cache.ttl_ms, 3_600_000);
    assert_eq!(config.required_tags, vec!["gpu".to_string()]);
}

#[test]
fn test_invalid_port_names_the_field() {
    let file = write(
        ".toml",
        r#"
[[workers]]
host = "a"
user = "u"
password = "p"
remoteDir = "/srv"

[[workers]]
host = "b"
port = 65536
user = "u"
password = "p"
remoteDir = "/srv"
"#,
    );
    let error = load_config(file.path()).unwrap_err();
    assert!(matches!(error, ConfigError::InvalidPort { port: 65536, .. }));
    assert!(error.to_string().contains("workers[1].port"), "{}", error);
    assert_eq!(error.category(), bt_core::ErrorCategory::Config);
}

#[test]
fn test_misspelled_nested_key_is_rejected() {
    let file = write(
        ".toml",
        r#"
[[workers]]
host = "a"
user = "u"
password = "p"
remoteDir = "/srv"

[backoff]
baseMillis = 10
"#,
    );
    let error = load_config(file.path()).unwrap_err();
    assert!(matches!(error, ConfigError::Toml(_)));
    assert!(error.to_string().contains("baseMillis"), "{}", error);
}
