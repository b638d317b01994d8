//! bt-test-utils: Test doubles for booktran
//!
//! Provides an in-memory worker cluster implementing the
//! [`bt_core::RemoteSession`] contract, plus configuration and document
//! fixtures shared by the test suites of the other crates.

pub mod fake;
pub mod fixtures;

pub use fake::{reverse, FakeConnector, FakeHost, FakeSession, Gauge};
pub use fixtures::{document, engine_config, worker};
