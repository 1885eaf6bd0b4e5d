//! Rookwatch event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`SyncEvent`]: everything observers of the job set are told about.
//! - [`Notice`]: user-facing failure messages carried by [`SyncEvent::Notice`].

pub mod bus;

pub use bus::{Envelope, EventBus, Notice, Severity, SyncEvent, DEFAULT_CAPACITY};
