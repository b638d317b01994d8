//! bt-protocol: Wire contracts for booktran
//!
//! This crate defines everything that crosses a process boundary between the
//! coordinator and the outside world: the JSON event format consumed by
//! websocket monitors, the command line of the worker-side translation
//! program, and the `.version` file used for codebase reconciliation.
//!
//! It performs no I/O.

pub mod command;
pub mod error;
pub mod event;
pub mod version;

pub use command::{shell_quote, shell_split, TranslateCommand};
pub use error::ProtocolError;
pub use event::{EventKind, WireEvent};
pub use version::{VersionStamp, NONE_SENTINEL, VERSION_FILE};
