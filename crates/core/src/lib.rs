//! Shared domain types for the player-analysis job tracker.
//!
//! Pure data and pure functions only: no I/O, no async. Every other crate
//! in the workspace depends on this one.

pub mod error;
pub mod job;
pub mod types;
pub mod update;

pub use error::CoreError;
pub use job::{clamp_progress, derive_state, DerivedState, JobRecord, JobState};
pub use types::{JobKey, Timestamp};
pub use update::{JobSnapshot, JobUpdate, UpdateKind, UpdateSource};
