//! Failure taxonomy for the backend client.
//!
//! Every failure is classified into a [`FailureKind`] before it leaves
//! this crate. Callers branch on the classification, never on raw HTTP
//! status codes.

/// Classified outcome of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeout, network failure or 5xx. Retried with backoff.
    Transient,
    /// 4xx other than a tolerated 404. Never retried.
    Permanent,
    /// 404 on a read: the job is gone server-side.
    NotFound,
    /// The payload did not match the documented shape.
    ValidationMismatch,
}

/// Errors from the backend REST and event-stream layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Backend API error ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The response body could not be interpreted at all.
    #[error("Payload failed validation: {reason}")]
    Validation {
        reason: String,
        /// The payload as received.
        raw: serde_json::Value,
    },

    /// The event stream broke mid-flight.
    #[error("Event stream error: {0}")]
    Stream(String),
}

impl ApiError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Request(e) if e.is_decode() => FailureKind::ValidationMismatch,
            Self::Request(e) if e.is_builder() => FailureKind::Permanent,
            Self::Request(_) => FailureKind::Transient,
            Self::Status { status, .. } => classify_status(*status),
            Self::Validation { .. } => FailureKind::ValidationMismatch,
            Self::Stream(_) => FailureKind::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == FailureKind::NotFound
    }

    /// Human-readable message for a user-facing notice.
    ///
    /// Prefers the backend's own `error`/`detail` field when the body is
    /// JSON, falling back to the status line.
    pub fn user_message(&self) -> String {
        match self {
            Self::Request(e) if e.is_timeout() => {
                "Request timed out - backend may be slow or unavailable".to_string()
            }
            Self::Request(e) if e.is_connect() => {
                "Network error - unable to connect to the analysis backend".to_string()
            }
            Self::Status { status, body } => backend_message(body)
                .unwrap_or_else(|| format!("Backend returned HTTP {status}")),
            other => other.to_string(),
        }
    }
}

/// Map an HTTP status onto the failure taxonomy.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        404 => FailureKind::NotFound,
        408 | 425 | 429 => FailureKind::Transient,
        500..=599 => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}

fn backend_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["error", "detail", "details", "message"]
        .iter()
        .find_map(|field| value.get(*field).and_then(|v| v.as_str()))
        .map(str::to_string)
}
