#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc;
use rookwatch_client::stream::parse_event;
use rookwatch_client::{ApiError, EventHandle, JobBackend, StreamEvent, SubmitAck};
use rookwatch_core::{JobKey, JobSnapshot, JobState};
use rookwatch_events::{Envelope, SyncEvent};
use rookwatch_sync::{JobTracker, SyncConfig};
use tokio::sync::broadcast;

type EventSender = mpsc::UnboundedSender<Result<StreamEvent, ApiError>>;

/// In-memory stand-in for the analysis backend.
///
/// Jobs live in a map the test mutates directly; polls answer from it
/// (optionally after a delay), and every open stream is a channel the test
/// pushes events into.
#[derive(Default)]
pub struct FakeBackend {
    jobs: Mutex<HashMap<JobKey, JobSnapshot>>,
    streams: Mutex<HashMap<JobKey, EventSender>>,
    get_delay: Mutex<Option<Duration>>,
    submit_delay: Mutex<Option<Duration>>,
    list_error: Mutex<Option<u16>>,
    get_error: Mutex<Option<u16>>,
    submit_error: Mutex<Option<(u16, String)>>,
    streams_available: Mutex<bool>,
    get_calls: Mutex<HashMap<JobKey, usize>>,
    subscribe_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let backend = Self::default();
        *backend.streams_available.lock().unwrap() = true;
        Arc::new(backend)
    }

    pub fn set_job(&self, snapshot: JobSnapshot) {
        self.jobs.lock().unwrap().insert(snapshot.key.clone(), snapshot);
    }

    pub fn set_running(&self, name: &str, progress: f64) {
        self.set_job(
            JobSnapshot::new(key(name))
                .with_state(JobState::Running)
                .with_progress(progress),
        );
    }

    pub fn set_state(&self, name: &str, state: JobState) {
        self.set_job(JobSnapshot::new(key(name)).with_state(state));
    }

    pub fn forget(&self, name: &str) {
        self.jobs.lock().unwrap().remove(&key(name));
    }

    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }

    /// Delay submission acknowledgements; the job only exists server-side
    /// once the acknowledgement is sent.
    pub fn set_submit_delay(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_list(&self, status: Option<u16>) {
        *self.list_error.lock().unwrap() = status;
    }

    pub fn fail_get(&self, status: Option<u16>) {
        *self.get_error.lock().unwrap() = status;
    }

    pub fn fail_submit(&self, status: u16, body: &str) {
        *self.submit_error.lock().unwrap() = Some((status, body.to_string()));
    }

    pub fn set_streams_available(&self, available: bool) {
        *self.streams_available.lock().unwrap() = available;
    }

    pub fn get_calls(&self, name: &str) -> usize {
        self.get_calls.lock().unwrap().get(&key(name)).copied().unwrap_or(0)
    }

    pub fn total_get_calls(&self) -> usize {
        self.get_calls.lock().unwrap().values().sum()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Push one raw SSE payload into the open stream for `name`.
    pub fn push(&self, name: &str, json: &str) {
        let event = parse_event(json).expect("test event must parse");
        let streams = self.streams.lock().unwrap();
        let sender = streams.get(&key(name)).expect("stream must be open");
        sender.unbounded_send(Ok(event)).expect("stream receiver alive");
    }

    /// Close the open stream for `name` as if the connection dropped.
    pub fn drop_stream(&self, name: &str) {
        self.streams.lock().unwrap().remove(&key(name));
    }
}

#[async_trait]
impl JobBackend for FakeBackend {
    async fn list_jobs(&self) -> Result<Vec<JobSnapshot>, ApiError> {
        if let Some(status) = *self.list_error.lock().unwrap() {
            return Err(status_error(status, ""));
        }
        Ok(self.jobs.lock().unwrap().values().cloned().collect())
    }

    async fn get_job(&self, key: &JobKey) -> Result<JobSnapshot, ApiError> {
        *self.get_calls.lock().unwrap().entry(key.clone()).or_default() += 1;
        if let Some(status) = *self.get_error.lock().unwrap() {
            return Err(status_error(status, r#"{"detail":"backend unavailable"}"#));
        }
        let answer = self.jobs.lock().unwrap().get(key).cloned();
        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        answer.ok_or_else(|| status_error(404, r#"{"error":"Player not found"}"#))
    }

    async fn submit_job(&self, key: &JobKey) -> Result<SubmitAck, ApiError> {
        let delay = *self.submit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((status, body)) = self.submit_error.lock().unwrap().clone() {
            return Err(status_error(status, &body));
        }
        let mut jobs = self.jobs.lock().unwrap();
        jobs.entry(key.clone())
            .or_insert_with(|| JobSnapshot::new(key.clone()).with_state(JobState::Queued));
        Ok(SubmitAck {
            accepted_at: Utc::now(),
            task_id: Some(format!("task-{key}")),
        })
    }

    async fn stop_job(&self, key: &JobKey) -> Result<(), ApiError> {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(key) {
            job.state = Some(JobState::Stopped);
        }
        Ok(())
    }

    async fn delete_job(&self, key: &JobKey) -> Result<(), ApiError> {
        self.jobs.lock().unwrap().remove(key);
        Ok(())
    }

    async fn subscribe(&self, key: &JobKey) -> Result<EventHandle, ApiError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if !*self.streams_available.lock().unwrap() {
            return Err(ApiError::Stream("connection refused".into()));
        }
        let (sender, receiver) = mpsc::unbounded();
        self.streams.lock().unwrap().insert(key.clone(), sender);
        Ok(EventHandle::new(receiver))
    }
}

pub fn key(name: &str) -> JobKey {
    JobKey::parse(name).unwrap()
}

pub fn status_error(status: u16, body: &str) -> ApiError {
    ApiError::Status {
        status,
        body: body.to_string(),
    }
}

/// Default engine configuration, optionally without push streams.
pub fn config(stream_enabled: bool) -> SyncConfig {
    SyncConfig {
        stream_enabled,
        ..SyncConfig::default()
    }
}

pub fn start(backend: &Arc<FakeBackend>, stream_enabled: bool) -> Arc<JobTracker> {
    JobTracker::start(backend.clone(), &config(stream_enabled))
}

/// Let spawned tasks run until everything is idle again.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Drain every event published so far.
pub fn drain(rx: &mut broadcast::Receiver<Envelope>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.event);
    }
    events
}
