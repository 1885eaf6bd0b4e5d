//! HTTP and server-sent-event client for the player-analysis backend.
//!
//! Provides typed REST wrappers, the push-channel subscription, retry and
//! backoff policies, and the translation of every backend payload variant
//! into the canonical [`rookwatch_core::JobSnapshot`].

pub mod api;
pub mod backend;
pub mod error;
pub mod payload;
pub mod retry;
pub mod stream;

pub use api::{ClientConfig, PlayerApi};
pub use backend::{JobBackend, SubmitAck};
pub use error::{ApiError, FailureKind};
pub use retry::{ReconnectConfig, RetryPolicy};
pub use stream::{EventHandle, StreamEvent};
