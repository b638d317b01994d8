//! Session-scoped event bus
//!
//! Producers (orchestrator, pool health probes, reconciler) publish
//! [`Event`]s; consumers hold a [`Subscription`] filtered on a session
//! identifier or on every session. Publishing never blocks: each
//! subscription owns a bounded mailbox that drops its oldest entry when
//! full and counts the drop.
//!
//! The bus knows nothing about JSON or websockets; [`Event::to_wire`]
//! converts to the wire representation for adapters.

mod bus;
mod event;

pub use bus::{EventBus, SessionFilter, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
pub use event::Event;
