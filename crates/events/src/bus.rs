//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the hub through which observers (the dashboard, tests)
//! learn about every accepted job change, connectivity flip and user
//! notice. It is designed to be shared via `Arc<EventBus>`.

use chrono::{DateTime, Utc};
use rookwatch_core::{JobKey, JobRecord};
use serde::Serialize;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Notice
// ---------------------------------------------------------------------------

/// How prominently a notice should be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A user-facing message about a failed or degraded operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    /// The job the notice concerns, if any.
    pub key: Option<JobKey>,
    pub severity: Severity,
    pub message: String,
    /// Whether repeating the action may succeed.
    pub retryable: bool,
}

impl Notice {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            key: None,
            severity: Severity::Error,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(message)
        }
    }

    pub fn for_job(mut self, key: JobKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

// ---------------------------------------------------------------------------
// SyncEvent
// ---------------------------------------------------------------------------

/// Something observers of the job set need to know about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A record was inserted or changed; carries the new version.
    JobUpserted { record: JobRecord },
    /// A record was removed by an acknowledged delete.
    JobRemoved { key: JobKey },
    /// The push channel for a job connected or dropped.
    StreamConnectivity { key: JobKey, connected: bool },
    /// The background poll loop started or stopped.
    PollingChanged { active: bool },
    /// Background refresh requests went from idle to busy or back.
    Updating { active: bool },
    Notice(Notice),
}

impl SyncEvent {
    /// Dot-separated event name, e.g. `"job.upserted"`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobUpserted { .. } => "job.upserted",
            Self::JobRemoved { .. } => "job.removed",
            Self::StreamConnectivity { .. } => "stream.connectivity",
            Self::PollingChanged { .. } => "poll.changed",
            Self::Updating { .. } => "poll.updating",
            Self::Notice(_) => "notice",
        }
    }

    /// The job this event concerns, if it concerns exactly one.
    pub fn key(&self) -> Option<&JobKey> {
        match self {
            Self::JobUpserted { record } => Some(&record.key),
            Self::JobRemoved { key } | Self::StreamConnectivity { key, .. } => Some(key),
            Self::Notice(notice) => notice.key.as_ref(),
            Self::PollingChanged { .. } | Self::Updating { .. } => None,
        }
    }
}

/// A published event with the time it was published.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub event: SyncEvent,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`SyncEvent`].
///
/// # Usage
///
/// ```rust
/// use rookwatch_events::bus::{EventBus, SyncEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(SyncEvent::PollingChanged { active: true });
/// ```
pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: SyncEvent) {
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(Envelope {
            event,
            timestamp: Utc::now(),
        });
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
