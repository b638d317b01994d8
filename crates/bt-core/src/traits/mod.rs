//! Core trait definitions

mod session;

pub use session::{CommandOutput, RemoteSession, SessionConnector, SessionMeta, SessionState};
