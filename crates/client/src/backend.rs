//! The seam between the sync engine and the analysis backend.
//!
//! [`JobBackend`] is implemented over HTTP by
//! [`PlayerApi`](crate::api::PlayerApi); the engine only ever sees this
//! trait, so tests can substitute an in-memory backend.

use async_trait::async_trait;
use rookwatch_core::{JobKey, JobSnapshot, Timestamp};

use crate::error::ApiError;
use crate::stream::EventHandle;

/// Acknowledgement of an accepted submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitAck {
    /// When the backend accepted the request (local clock).
    pub accepted_at: Timestamp,
    /// Server-assigned task identifier, if the backend returned one.
    pub task_id: Option<String>,
}

/// Typed operations against the analysis backend.
///
/// Implementations classify every failure (see [`ApiError::kind`]) and
/// apply their own timeout and retry policy; callers never retry.
#[async_trait]
pub trait JobBackend: Send + Sync + 'static {
    /// Fetch every job the backend knows about.
    async fn list_jobs(&self) -> Result<Vec<JobSnapshot>, ApiError>;

    /// Fetch one job. A 404 surfaces as [`FailureKind::NotFound`](crate::FailureKind::NotFound).
    async fn get_job(&self, key: &JobKey) -> Result<JobSnapshot, ApiError>;

    /// Enqueue an analysis. Succeeds when the job already exists.
    async fn submit_job(&self, key: &JobKey) -> Result<SubmitAck, ApiError>;

    /// Stop a running analysis. An already-absent job counts as stopped.
    async fn stop_job(&self, key: &JobKey) -> Result<(), ApiError>;

    /// Delete a job. An already-absent job counts as deleted.
    async fn delete_job(&self, key: &JobKey) -> Result<(), ApiError>;

    /// Open the push channel for one job.
    async fn subscribe(&self, key: &JobKey) -> Result<EventHandle, ApiError>;
}
