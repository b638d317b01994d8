//! Configuration and document fixtures

use bt_core::config::{BackoffConfig, EngineConfig, WorkerDescriptor};

/// Password-authenticated worker rooted at `/srv/<name>`
pub fn worker(name: &str, capacity: usize) -> WorkerDescriptor {
    WorkerDescriptor::new(name, "translator", format!("/srv/{}", name))
        .with_id(name)
        .with_password("secret")
        .with_capacity(capacity)
}

/// Engine configuration with short timeouts and millisecond backoff
pub fn engine_config(workers: Vec<WorkerDescriptor>) -> EngineConfig {
    EngineConfig {
        workers,
        max_segment_chars: 100,
        max_in_flight_segments: 4,
        backoff: BackoffConfig {
            base_ms: 5,
            factor: 2.0,
            cap_ms: 20,
            jitter_pct: 20.0,
        },
        connection_timeout_ms: 1_000,
        command_timeout_ms: 5_000,
        segment_timeout_ms: 10_000,
        grace_cancel_seconds: 1,
        health_probe_interval_ms: 60_000,
        ..EngineConfig::default()
    }
}

/// `paragraphs` paragraphs of exactly `len` characters, joined by blank lines
///
/// Each paragraph is distinct so that cached results never collide.
pub fn document(paragraphs: usize, len: usize) -> String {
    (0..paragraphs)
        .map(|i| paragraph(i, len))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn paragraph(index: usize, len: usize) -> String {
    let mut text = format!("P{} ", index);
    let words = ["lorem", "ipsum", "dolor", "sit", "amet"];
    let mut w = 0;
    while text.chars().count() < len {
        text.push_str(words[w % words.len()]);
        text.push(' ');
        w += 1;
    }
    let mut text: String = text.chars().take(len).collect();
    // a paragraph never ends in whitespace
    if text.ends_with(' ') {
        text.pop();
        text.push('.');
    }
    text
}
