//! SSH transport
//!
//! [`SshConnector`] opens russh client connections to worker hosts and
//! authenticates them; [`SshSession`] runs one command at a time on its own
//! channel, keeping stdout and stderr apart.

mod connector;
mod session;

pub use connector::{SshConnector, SshSettings};
pub use session::SshSession;
