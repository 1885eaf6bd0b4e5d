//! REST client for the player-analysis backend.
//!
//! Wraps the backend HTTP API (listing, detail, submission, stop, delete,
//! metrics and the SSE push channel) using [`reqwest`]. Every call carries
//! its own timeout and goes through [`with_retry`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::ACCEPT;
use rookwatch_core::{JobKey, JobSnapshot};

use crate::backend::{JobBackend, SubmitAck};
use crate::error::ApiError;
use crate::payload::{snapshot_from_value, snapshots_from_listing, SubmitResponse};
use crate::retry::{with_retry, RetryPolicy};
use crate::stream::EventHandle;

/// Default timeout for listing and single-job reads.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for submit, stop and delete.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_STREAM: &str = "text/event-stream";

/// Connection settings for one backend.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP URL, e.g. `http://host:8000`.
    pub base_url: String,
    pub read_timeout: Duration,
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    /// Settings with the default timeouts and retry policy.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// HTTP client for the analysis backend.
pub struct PlayerApi {
    client: reqwest::Client,
    config: ClientConfig,
}

impl PlayerApi {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for sharing a connection pool).
    pub fn with_client(client: reqwest::Client, config: ClientConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Retrieve the completed analysis detail for a player.
    ///
    /// Sends `GET /metrics/player/{username}`. The body is passed through
    /// untouched; only the presentation layer interprets it.
    pub async fn fetch_metrics(&self, key: &JobKey) -> Result<serde_json::Value, ApiError> {
        with_retry(&self.config.retry, "fetch_metrics", || async move {
            let response = self
                .client
                .get(self.url(&format!("/metrics/player/{key}")))
                .header(ACCEPT, "application/json")
                .timeout(self.config.read_timeout)
                .send()
                .await?;
            Self::parse_response(response).await
        })
        .await
    }

    // ---- private helpers ----

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn player_url(&self, key: &JobKey) -> String {
        self.url(&format!("/players/{key}"))
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or an [`ApiError::Status`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert success for a one-shot command, treating 404 as success
    /// so concurrent deletes converge.
    async fn check_command(response: reqwest::Response) -> Result<(), ApiError> {
        match Self::ensure_success(response).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!(error = %e, "Job already absent on backend");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl JobBackend for PlayerApi {
    /// Sends `GET /players`.
    async fn list_jobs(&self) -> Result<Vec<JobSnapshot>, ApiError> {
        with_retry(&self.config.retry, "list_jobs", || async move {
            let response = self
                .client
                .get(self.url("/players"))
                .header(ACCEPT, "application/json")
                .timeout(self.config.read_timeout)
                .send()
                .await?;
            let value: serde_json::Value = Self::parse_response(response).await?;
            snapshots_from_listing(value)
        })
        .await
    }

    /// Sends `GET /players/{username}`.
    async fn get_job(&self, key: &JobKey) -> Result<JobSnapshot, ApiError> {
        with_retry(&self.config.retry, "get_job", || async move {
            let response = self
                .client
                .get(self.player_url(key))
                .header(ACCEPT, "application/json")
                .timeout(self.config.read_timeout)
                .send()
                .await?;
            let value: serde_json::Value = Self::parse_response(response).await?;
            snapshot_from_value(value, Some(key))
        })
        .await
    }

    /// Sends `POST /players/{username}`.
    ///
    /// A `409 Conflict` means the job already exists server-side, which
    /// is acknowledged like a fresh submission.
    async fn submit_job(&self, key: &JobKey) -> Result<SubmitAck, ApiError> {
        with_retry(&self.config.retry, "submit_job", || async move {
            let response = self
                .client
                .post(self.player_url(key))
                .header(ACCEPT, "application/json")
                .timeout(self.config.command_timeout)
                .send()
                .await?;

            if response.status() == reqwest::StatusCode::CONFLICT {
                tracing::debug!(username = %key, "Analysis already exists on backend");
                return Ok(SubmitAck {
                    accepted_at: Utc::now(),
                    task_id: None,
                });
            }

            let response = Self::ensure_success(response).await?;
            let body = response.text().await?;
            let task_id = if body.trim().is_empty() {
                None
            } else {
                match serde_json::from_str::<SubmitResponse>(&body) {
                    Ok(parsed) => parsed.task_id,
                    Err(e) => {
                        tracing::warn!(error = %e, raw = %body, "Unexpected submit acknowledgement");
                        None
                    }
                }
            };

            Ok(SubmitAck {
                accepted_at: Utc::now(),
                task_id,
            })
        })
        .await
    }

    /// Sends `PUT /players/{username}` with `{"action": "stop"}`.
    async fn stop_job(&self, key: &JobKey) -> Result<(), ApiError> {
        with_retry(&self.config.retry, "stop_job", || async move {
            let response = self
                .client
                .put(self.player_url(key))
                .json(&serde_json::json!({ "action": "stop" }))
                .timeout(self.config.command_timeout)
                .send()
                .await?;
            Self::check_command(response).await
        })
        .await
    }

    /// Sends `DELETE /players/{username}`.
    async fn delete_job(&self, key: &JobKey) -> Result<(), ApiError> {
        with_retry(&self.config.retry, "delete_job", || async move {
            let response = self
                .client
                .delete(self.player_url(key))
                .timeout(self.config.command_timeout)
                .send()
                .await?;
            Self::check_command(response).await
        })
        .await
    }

    /// Sends `GET /stream/{username}` and keeps the body open.
    ///
    /// Only the wait for response headers is bounded by the read timeout;
    /// the stream itself lives until the handle is closed.
    async fn subscribe(&self, key: &JobKey) -> Result<EventHandle, ApiError> {
        with_retry(&self.config.retry, "subscribe", || async move {
            let request = self
                .client
                .get(self.url(&format!("/stream/{key}")))
                .header(ACCEPT, EVENT_STREAM)
                .send();

            let response = tokio::time::timeout(self.config.read_timeout, request)
                .await
                .map_err(|_| ApiError::Stream("timed out waiting for event stream".into()))??;
            let response = Self::ensure_success(response).await?;
            Ok(EventHandle::from_response(response))
        })
        .await
    }
}
