//! Server-sent event channel: wire types, framing and the subscription handle.
//!
//! The backend pushes one JSON message per SSE event with the shape
//! `{"type": "<kind>", "data": {...}, "timestamp": ...}`. [`SseDecoder`]
//! splits the byte stream into event payloads, [`parse_event`] turns each
//! into a typed [`StreamEvent`], and [`EventHandle`] owns the resulting
//! stream until [`EventHandle::close`] is called or it is dropped.

use std::collections::VecDeque;
use std::pin::Pin;

use chrono::{TimeZone, Utc};
use futures::{Stream, StreamExt};
use rookwatch_core::{derive_state, CoreError, JobKey, JobSnapshot, JobState, Timestamp};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::payload::parse_timestamp;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One push-channel message.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEvent {
    /// Event kind, e.g. `progress`, `completed`, `error`.
    #[serde(rename = "type")]
    pub kind: String,
    pub data: StreamEventData,
    /// Server timestamp; RFC 3339 string or Unix time (seconds or millis).
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

/// Partial job update carried by a [`StreamEvent`].
#[derive(Debug, Clone, Deserialize)]
pub struct StreamEventData {
    pub username: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, alias = "done_games")]
    pub games_analyzed: Option<u32>,
}

/// Unix times above this are taken to be milliseconds.
const MILLIS_THRESHOLD: f64 = 1e12;

impl StreamEvent {
    /// Server timestamp, if present and readable.
    pub fn server_time(&self) -> Option<Timestamp> {
        match self.timestamp.as_ref()? {
            serde_json::Value::String(text) => parse_timestamp(text),
            serde_json::Value::Number(n) => {
                let raw = n.as_f64()?;
                let millis = if raw >= MILLIS_THRESHOLD { raw } else { raw * 1000.0 };
                Utc.timestamp_millis_opt(millis as i64).single()
            }
            _ => None,
        }
    }

    /// Canonical partial update for the job this event concerns.
    ///
    /// An explicit `status` wins; otherwise the event kind implies the
    /// state, and a bare `error` implies failure.
    pub fn into_snapshot(self) -> Result<JobSnapshot, CoreError> {
        let key = JobKey::parse(&self.data.username)?;
        let data = self.data;

        let (state, status_error) = match data.status.as_deref() {
            Some(status) => {
                let derived = derive_state(status, data.progress);
                (Some(derived.state), derived.error)
            }
            None => (state_for_kind(&self.kind), None),
        };
        let state = match (state, &data.error) {
            (None, Some(_)) => Some(JobState::Failed),
            (state, _) => state,
        };

        let mut snapshot = JobSnapshot::new(key);
        snapshot.state = state;
        snapshot.progress = data.progress;
        snapshot.games_done = data.games_analyzed;
        snapshot.error = status_error.or(data.error);
        Ok(snapshot)
    }
}

fn state_for_kind(kind: &str) -> Option<JobState> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "started" | "progress" => Some(JobState::Running),
        "completed" | "complete" => Some(JobState::Ready),
        "error" | "failed" => Some(JobState::Failed),
        "stopped" | "cancelled" => Some(JobState::Stopped),
        _ => None,
    }
}

/// Parse one SSE `data` payload into a typed event.
pub fn parse_event(text: &str) -> Result<StreamEvent, serde_json::Error> {
    serde_json::from_str(text)
}

// ---------------------------------------------------------------------------
// SSE framing
// ---------------------------------------------------------------------------

/// Incremental `text/event-stream` decoder.
///
/// Feed it raw chunks in arrival order; it yields the joined `data` field
/// of every completed event. Comments and the `event`/`id`/`retry` fields
/// are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut completed = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            let line = String::from_utf8_lossy(&raw);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    completed.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (&*line, ""),
            };
            if field == "data" {
                self.data_lines.push(value.to_string());
            }
        }

        completed
    }
}

// ---------------------------------------------------------------------------
// EventHandle
// ---------------------------------------------------------------------------

/// Boxed stream of decoded push events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ApiError>> + Send>>;

/// An open push subscription for one job.
///
/// Dropping the handle closes the underlying connection; [`close`](Self::close)
/// does so explicitly and can also be triggered from another task through
/// the token returned by [`closer`](Self::closer).
pub struct EventHandle {
    events: EventStream,
    cancel: CancellationToken,
}

impl EventHandle {
    pub fn new<S>(events: S) -> Self
    where
        S: Stream<Item = Result<StreamEvent, ApiError>> + Send + 'static,
    {
        Self {
            events: Box::pin(events),
            cancel: CancellationToken::new(),
        }
    }

    /// Wrap an SSE response body.
    pub fn from_response(response: reqwest::Response) -> Self {
        Self::new(sse_events(response))
    }

    /// Next event, or `None` once the stream ended or the handle was closed.
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, ApiError>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.events.next() => item,
        }
    }

    /// Close the subscription and release the connection.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.events = Box::pin(futures::stream::empty());
    }

    /// Token that closes this handle when cancelled.
    pub fn closer(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn decode_data(data: &str) -> Result<StreamEvent, ApiError> {
    parse_event(data).map_err(|e| ApiError::Validation {
        reason: e.to_string(),
        raw: serde_json::from_str(data).unwrap_or_else(|_| serde_json::Value::String(data.into())),
    })
}

/// Turn an SSE response body into a stream of decoded events.
fn sse_events(response: reqwest::Response) -> impl Stream<Item = Result<StreamEvent, ApiError>> + Send {
    let body = Box::pin(response.bytes_stream());
    let state = (body, SseDecoder::default(), VecDeque::new());

    futures::stream::unfold(state, |(mut body, mut decoder, mut pending)| async move {
        loop {
            if let Some(item) = pending.pop_front() {
                return Some((item, (body, decoder, pending)));
            }
            match body.next().await {
                Some(Ok(chunk)) => {
                    pending.extend(decoder.push(&chunk).iter().map(|data| decode_data(data)));
                }
                Some(Err(e)) => {
                    return Some((Err(ApiError::Stream(e.to_string())), (body, decoder, pending)));
                }
                None => return None,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_splits_events_on_blank_line() {
        let mut decoder = SseDecoder::default();
        let out = decoder.push(b"data: {\"a\":1}\n\ndata: {\"a\":2}\n\n");
        assert_eq!(out, vec![r#"{"a":1}"#, r#"{"a":2}"#]);
    }

    #[test]
    fn decoder_handles_chunks_split_mid_line() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"user").is_empty());
        assert!(decoder.push(b"name\":\"x\"}\r\n").is_empty());
        let out = decoder.push(b"\r\n");
        assert_eq!(out, vec![r#"{"username":"x"}"#]);
    }

    #[test]
    fn decoder_joins_multiline_data_and_skips_comments() {
        let mut decoder = SseDecoder::default();
        let out = decoder.push(b": keep-alive\nevent: update\ndata: first\ndata: second\nid: 7\n\n");
        assert_eq!(out, vec!["first\nsecond"]);
    }

    #[test]
    fn parse_progress_event() {
        let event = parse_event(
            r#"{"type":"progress","data":{"username":"Alice","progress":80,"games_analyzed":40},"timestamp":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert!(event.server_time().is_some());

        let snapshot = event.into_snapshot().unwrap();
        assert_eq!(snapshot.key.as_str(), "alice");
        assert_eq!(snapshot.state, Some(JobState::Running));
        assert_eq!(snapshot.progress, Some(80.0));
        assert_eq!(snapshot.games_done, Some(40));
    }

    #[test]
    fn explicit_status_wins_over_kind() {
        let event =
            parse_event(r#"{"type":"progress","data":{"username":"a","status":"completed"}}"#).unwrap();
        assert_eq!(event.into_snapshot().unwrap().state, Some(JobState::Ready));
    }

    #[test]
    fn bare_error_implies_failure() {
        let event =
            parse_event(r#"{"type":"update","data":{"username":"a","error":"engine crashed"}}"#).unwrap();
        let snapshot = event.into_snapshot().unwrap();
        assert_eq!(snapshot.state, Some(JobState::Failed));
        assert_eq!(snapshot.error.as_deref(), Some("engine crashed"));
    }

    #[test]
    fn numeric_timestamps_accept_seconds_and_millis() {
        let secs = parse_event(r#"{"type":"progress","data":{"username":"a"},"timestamp":1714557600}"#)
            .unwrap()
            .server_time()
            .unwrap();
        let millis =
            parse_event(r#"{"type":"progress","data":{"username":"a"},"timestamp":1714557600000}"#)
                .unwrap()
                .server_time()
                .unwrap();
        assert_eq!(secs, millis);
    }

    #[test]
    fn malformed_event_is_rejected() {
        assert!(parse_event(r#"{"type":"progress","data":{}}"#).is_err());
        assert!(parse_event("not json").is_err());
    }

    #[tokio::test]
    async fn handle_yields_events_then_none() {
        let event = parse_event(r#"{"type":"progress","data":{"username":"a","progress":5}}"#).unwrap();
        let mut handle = EventHandle::new(futures::stream::iter(vec![Ok(event)]));

        assert!(handle.next_event().await.is_some());
        assert!(handle.next_event().await.is_none());
    }

    #[tokio::test]
    async fn closed_handle_yields_nothing() {
        let mut handle = EventHandle::new(futures::stream::pending());
        let closer = handle.closer();
        closer.cancel();

        assert!(handle.is_closed());
        assert!(handle.next_event().await.is_none());

        handle.close();
        assert!(handle.next_event().await.is_none());
    }
}
