//! Canonical job record and lifecycle states (pure data, no side effects).
//!
//! Every backend vocabulary is mapped onto [`JobState`] by
//! [`derive_state`]; nothing outside this module interprets raw status
//! strings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{JobKey, Timestamp};

/// Prefix of `last_error` when the backend reports a status outside the
/// mapping table.
pub const UNKNOWN_STATUS_PREFIX: &str = "unknown status: ";

/// `last_error` recorded when a poll finds the job gone from the server.
pub const VANISHED_JOB_ERROR: &str = "job no longer exists on server";

/// `last_error` recorded when the backend reports failure without a message.
pub const GENERIC_FAILURE_ERROR: &str = "analysis failed";

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle state of one analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Ready,
    Failed,
    Stopped,
}

impl JobState {
    /// `Ready`, `Failed` and `Stopped` never progress on their own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Stopped)
    }

    /// States the poll scheduler and stream subscriber keep watching.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Clamp a progress value into `0.0..=100.0`. `NaN` becomes `0.0`.
pub fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Result of mapping a raw backend status onto a canonical state.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedState {
    pub state: JobState,
    /// Set when the raw status could not be mapped.
    pub error: Option<String>,
}

/// Map a backend status string onto a [`JobState`].
///
/// Both backend vocabularies (`pending|ready|error` and
/// `pending|in_progress|completed|failed`) are accepted simultaneously.
/// A `pending` job that already reports progress is treated as running.
/// Unknown values fail closed to [`JobState::Failed`] so contract drift
/// is visible instead of masked.
pub fn derive_state(raw_status: &str, progress: Option<f64>) -> DerivedState {
    let normalized = raw_status.trim().to_ascii_lowercase();
    let state = match normalized.as_str() {
        "pending" | "queued" => {
            if progress.is_some_and(|p| clamp_progress(p) > 0.0) {
                JobState::Running
            } else {
                JobState::Queued
            }
        }
        "in_progress" | "running" | "processing" => JobState::Running,
        "ready" | "completed" | "complete" | "done" => JobState::Ready,
        "error" | "failed" => JobState::Failed,
        "stopped" | "cancelled" | "canceled" => JobState::Stopped,
        _ => {
            return DerivedState {
                state: JobState::Failed,
                error: Some(format!("{UNKNOWN_STATUS_PREFIX}{raw_status}")),
            };
        }
    };
    DerivedState { state, error: None }
}

// ---------------------------------------------------------------------------
// JobRecord
// ---------------------------------------------------------------------------

/// Canonical local view of one tracked analysis job.
///
/// Records are only ever written by the reconciliation engine; everything
/// else receives clones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub key: JobKey,
    pub state: JobState,
    /// Always within `0.0..=100.0`.
    pub progress_percent: f64,
    pub games_total: Option<u32>,
    /// Never exceeds `games_total` when both are known.
    pub games_done: Option<u32>,
    pub requested_at: Timestamp,
    /// Present iff `state` is terminal.
    pub finished_at: Option<Timestamp>,
    /// Present only in [`JobState::Failed`].
    pub last_error: Option<String>,
    /// Backend task identifier from the submission acknowledgement.
    pub task_id: Option<String>,
    /// Cheat-risk score reported once analysis has completed.
    pub risk_score: Option<f64>,
    /// Raw JSON of the last accepted payload when it failed validation.
    pub raw_payload: Option<serde_json::Value>,
    /// Incremented on every accepted change.
    pub version: u64,
}

impl JobRecord {
    /// A freshly submitted job, before the backend has acknowledged it.
    pub fn queued(key: JobKey, requested_at: Timestamp) -> Self {
        Self {
            key,
            state: JobState::Queued,
            progress_percent: 0.0,
            games_total: None,
            games_done: None,
            requested_at,
            finished_at: None,
            last_error: None,
            task_id: None,
            risk_score: None,
            raw_payload: None,
            version: 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Compare everything except `version`.
    pub fn same_content(&self, other: &Self) -> bool {
        self.key == other.key
            && self.state == other.state
            && self.progress_percent == other.progress_percent
            && self.games_total == other.games_total
            && self.games_done == other.games_done
            && self.requested_at == other.requested_at
            && self.finished_at == other.finished_at
            && self.last_error == other.last_error
            && self.task_id == other.task_id
            && self.risk_score == other.risk_score
            && self.raw_payload == other.raw_payload
    }

    /// Re-establish the per-record invariants after a write.
    pub fn enforce_invariants(&mut self, now: Timestamp) {
        self.progress_percent = clamp_progress(self.progress_percent);

        if let (Some(total), Some(done)) = (self.games_total, self.games_done) {
            if done > total {
                self.games_done = Some(total);
            }
        }

        if self.state.is_terminal() {
            self.finished_at.get_or_insert(now);
        } else {
            self.finished_at = None;
        }

        if self.state == JobState::Failed {
            if self.last_error.is_none() {
                self.last_error = Some(GENERIC_FAILURE_ERROR.to_string());
            }
        } else {
            self.last_error = None;
        }

        if self.state == JobState::Ready {
            self.progress_percent = 100.0;
        }
    }
}
