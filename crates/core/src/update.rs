//! The single update message every channel feeds into reconciliation.
//!
//! Manual fetches, poll responses, stream events and user commands all
//! arrive as a [`JobUpdate`]; only its [`UpdateSource`] tells them apart.

use serde::Serialize;

use crate::error::CoreError;
use crate::job::JobState;
use crate::types::{JobKey, Timestamp};

/// Which channel produced an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    /// The user's own submission and its acknowledgement.
    Submission,
    /// A full listing fetch (startup or manual retry).
    Listing,
    /// A background poll response.
    Poll,
    /// A push-channel event.
    Stream,
    /// An acknowledged stop/delete command.
    Command,
}

impl UpdateSource {
    /// Background channels may deliver updates issued before a delete
    /// settled; those must never resurrect the job.
    pub fn is_background(self) -> bool {
        matches!(self, Self::Poll | Self::Stream)
    }
}

/// Partial, already-canonicalized view of a job as reported by the backend.
///
/// `None` means "not reported"; it never means "clear the field".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub key: JobKey,
    pub state: Option<JobState>,
    pub progress: Option<f64>,
    pub games_total: Option<u32>,
    pub games_done: Option<u32>,
    pub requested_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub error: Option<String>,
    pub task_id: Option<String>,
    pub risk_score: Option<f64>,
    /// Raw payload, attached only when shape validation failed.
    pub raw: Option<serde_json::Value>,
}

impl JobSnapshot {
    /// An empty snapshot for `key`; enrich with the `with_*` builders.
    pub fn new(key: JobKey) -> Self {
        Self {
            key,
            state: None,
            progress: None,
            games_total: None,
            games_done: None,
            requested_at: None,
            finished_at: None,
            error: None,
            task_id: None,
            risk_score: None,
            raw: None,
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_games(mut self, done: Option<u32>, total: Option<u32>) -> Self {
        self.games_done = done;
        self.games_total = total;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Check the documented value ranges.
    ///
    /// Out-of-range values are still clamped on merge; this only reports
    /// that the backend broke its contract.
    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some(progress) = self.progress {
            if !(0.0..=100.0).contains(&progress) {
                return Err(CoreError::Validation(format!(
                    "progress {progress} outside 0..=100"
                )));
            }
        }
        if let (Some(done), Some(total)) = (self.games_done, self.games_total) {
            if done > total {
                return Err(CoreError::Validation(format!(
                    "games_done {done} exceeds games_total {total}"
                )));
            }
        }
        if let (Some(requested), Some(finished)) = (self.requested_at, self.finished_at) {
            if finished < requested {
                return Err(CoreError::Validation(
                    "finished_at precedes requested_at".into(),
                ));
            }
        }
        Ok(())
    }
}

/// What happened to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateKind {
    /// Backend-reported fields.
    Snapshot(JobSnapshot),
    /// The backend no longer knows the job.
    NotFound,
    /// A new submission was accepted locally (optimistic insert). Replaces
    /// a terminal record; refreshes an active one.
    Submitted { requested_at: Timestamp },
    /// The user's stop command was acknowledged.
    Stopped,
    /// The user's delete command was acknowledged.
    Removed,
}

/// One message for the reconciliation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub key: JobKey,
    pub source: UpdateSource,
    pub kind: UpdateKind,
}

impl JobUpdate {
    pub fn snapshot(source: UpdateSource, snapshot: JobSnapshot) -> Self {
        Self {
            key: snapshot.key.clone(),
            source,
            kind: UpdateKind::Snapshot(snapshot),
        }
    }

    pub fn not_found(source: UpdateSource, key: JobKey) -> Self {
        Self {
            key,
            source,
            kind: UpdateKind::NotFound,
        }
    }

    pub fn submitted(key: JobKey, requested_at: Timestamp) -> Self {
        Self {
            key,
            source: UpdateSource::Submission,
            kind: UpdateKind::Submitted { requested_at },
        }
    }

    pub fn stopped(key: JobKey) -> Self {
        Self {
            key,
            source: UpdateSource::Command,
            kind: UpdateKind::Stopped,
        }
    }

    pub fn removed(key: JobKey) -> Self {
        Self {
            key,
            source: UpdateSource::Command,
            kind: UpdateKind::Removed,
        }
    }
}
