//! Client-side synchronization engine for player-analysis jobs.
//!
//! Three channels feed one job set:
//!
//! - user actions through [`JobTracker`],
//! - periodic polling by [`PollScheduler`] for jobs without a live stream,
//! - server push through [`StreamSubscriber`].
//!
//! All of them hand a [`rookwatch_core::JobUpdate`] to
//! [`Reconciler::apply`], the only writer of the job set.

pub mod config;
pub mod poller;
pub mod reconcile;
pub mod subscriber;
pub mod tracker;

pub use config::{ConfigError, SyncConfig};
pub use poller::PollScheduler;
pub use reconcile::{MergeOutcome, Reconciler};
pub use subscriber::StreamSubscriber;
pub use tracker::{JobTracker, TrackerError};
