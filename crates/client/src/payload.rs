//! Backend JSON shapes and their translation into [`JobSnapshot`]s.
//!
//! The backend has shipped several schema revisions with different field
//! names and nullability. All of them are accepted here (via serde
//! aliases) and nothing but the canonical [`JobSnapshot`] leaves this
//! module. A payload that fails validation is logged and still translated
//! best-effort, with the raw JSON attached, so the job never silently
//! disappears from view.

use chrono::{NaiveDateTime, Utc};
use rookwatch_core::{derive_state, JobKey, JobSnapshot, Timestamp};
use serde::Deserialize;

use crate::error::ApiError;

/// One player entry as returned by `GET /players` or `GET /players/{username}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PlayerPayload {
    #[serde(default)]
    pub username: Option<String>,
    pub status: String,
    #[serde(default, alias = "analysis_progress")]
    pub progress: Option<f64>,
    #[serde(default, alias = "games_total")]
    pub total_games: Option<i64>,
    #[serde(default, alias = "games_analyzed", alias = "games_count")]
    pub done_games: Option<i64>,
    #[serde(default, alias = "requested_at")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub risk_score: Option<f64>,
}

/// Response returned by `POST /players/{username}` after queuing an analysis.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned task identifier.
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Parse an ISO-8601 timestamp, accepting offset-less values as UTC.
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn non_negative(value: Option<i64>, field: &str) -> Result<Option<u32>, String> {
    match value {
        None => Ok(None),
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| format!("{field} {v} is not a non-negative integer")),
    }
}

fn parse_optional_timestamp(raw: Option<&str>, field: &str) -> Result<Option<Timestamp>, String> {
    match raw {
        None => Ok(None),
        Some(text) => parse_timestamp(text)
            .map(Some)
            .ok_or_else(|| format!("{field} {text:?} is not a timestamp")),
    }
}

impl PlayerPayload {
    /// Strict translation; any contract violation is reported as `Err`.
    pub fn into_snapshot(self, expected: Option<&JobKey>) -> Result<JobSnapshot, String> {
        let key = resolve_key(self.username.as_deref(), expected)?;
        let derived = derive_state(&self.status, self.progress);

        let mut snapshot = JobSnapshot::new(key).with_state(derived.state);
        snapshot.progress = self.progress;
        snapshot.games_total = non_negative(self.total_games, "total_games")?;
        snapshot.games_done = non_negative(self.done_games, "done_games")?;
        snapshot.requested_at = parse_optional_timestamp(self.created_at.as_deref(), "created_at")?;
        snapshot.finished_at = parse_optional_timestamp(self.finished_at.as_deref(), "finished_at")?;
        snapshot.error = derived.error.or(self.error);
        snapshot.risk_score = self.risk_score;

        snapshot.validate().map_err(|e| e.to_string())?;
        Ok(snapshot)
    }
}

fn resolve_key(username: Option<&str>, expected: Option<&JobKey>) -> Result<JobKey, String> {
    match (expected, username) {
        (Some(expected), _) => Ok(expected.clone()),
        (None, Some(name)) => JobKey::parse(name).map_err(|e| e.to_string()),
        (None, None) => Err("payload carries no username".to_string()),
    }
}

/// Translate one player payload.
///
/// `expected` is the key the request was made for; when present it wins
/// over whatever username the payload carries.
pub fn snapshot_from_value(
    value: serde_json::Value,
    expected: Option<&JobKey>,
) -> Result<JobSnapshot, ApiError> {
    let strict = serde_json::from_value::<PlayerPayload>(value.clone())
        .map_err(|e| e.to_string())
        .and_then(|payload| payload.into_snapshot(expected));

    match strict {
        Ok(snapshot) => Ok(snapshot),
        Err(reason) => {
            tracing::warn!(reason = %reason, raw = %value, "Player payload failed validation");
            best_effort_snapshot(&value, expected).ok_or(ApiError::Validation { reason, raw: value })
        }
    }
}

/// Lenient field-by-field extraction, used only after strict parsing failed.
fn best_effort_snapshot(value: &serde_json::Value, expected: Option<&JobKey>) -> Option<JobSnapshot> {
    let username = value.get("username").and_then(|v| v.as_str());
    let key = resolve_key(username, expected).ok()?;

    let progress = first_f64(value, &["progress", "analysis_progress"]);
    let mut snapshot = JobSnapshot::new(key);
    if let Some(status) = first_str(value, &["status", "state"]) {
        let derived = derive_state(status, progress);
        snapshot.state = Some(derived.state);
        snapshot.error = derived.error;
    }
    snapshot.progress = progress;
    snapshot.games_total = first_u32(value, &["total_games", "games_total"]);
    snapshot.games_done = first_u32(value, &["done_games", "games_analyzed", "games_count"]);
    snapshot.requested_at = first_str(value, &["created_at", "requested_at"]).and_then(parse_timestamp);
    snapshot.finished_at = first_str(value, &["finished_at"]).and_then(parse_timestamp);
    if snapshot.error.is_none() {
        snapshot.error = first_str(value, &["error"]).map(str::to_string);
    }
    snapshot.risk_score = first_f64(value, &["risk_score"]);
    Some(snapshot.with_raw(value.clone()))
}

fn first_f64(value: &serde_json::Value, fields: &[&str]) -> Option<f64> {
    fields.iter().find_map(|f| value.get(*f)?.as_f64())
}

fn first_u32(value: &serde_json::Value, fields: &[&str]) -> Option<u32> {
    fields
        .iter()
        .find_map(|f| value.get(*f)?.as_u64())
        .and_then(|v| u32::try_from(v).ok())
}

fn first_str<'a>(value: &'a serde_json::Value, fields: &[&str]) -> Option<&'a str> {
    fields.iter().find_map(|f| value.get(*f)?.as_str())
}

/// Translate a `GET /players` body.
///
/// A body that is not an array is a validation failure; individual
/// entries that carry no usable username are logged and skipped.
pub fn snapshots_from_listing(value: serde_json::Value) -> Result<Vec<JobSnapshot>, ApiError> {
    let serde_json::Value::Array(items) = value else {
        return Err(ApiError::Validation {
            reason: "expected an array of players".into(),
            raw: value,
        });
    };

    let mut snapshots = Vec::with_capacity(items.len());
    for item in items {
        match snapshot_from_value(item, None) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => tracing::warn!(error = %e, "Skipping unusable player entry"),
        }
    }
    Ok(snapshots)
}
