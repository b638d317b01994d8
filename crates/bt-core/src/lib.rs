//! bt-core: Core abstractions and configuration for booktran
//!
//! This crate provides the shared domain types, configuration structures,
//! error taxonomy, the remote-session traits implemented by the SSH layer,
//! and the event bus used by every other component.

pub mod config;
pub mod error;
pub mod events;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{ConfigError, ErrorCategory, SessionError};
pub use events::{Event, EventBus, SessionFilter, Subscription};
pub use traits::{CommandOutput, RemoteSession, SessionConnector, SessionMeta, SessionState};
pub use types::{EventSessionId, JobId, WorkerId};
