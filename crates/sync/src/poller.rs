//! Background polling for jobs that have no live push channel.
//!
//! A supervisor task watches the job set. Whenever some job is `Queued`
//! or `Running` without a connected stream it runs exactly one poll loop;
//! when that set empties the loop is cancelled and its outstanding
//! requests are aborted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rookwatch_client::{ApiError, FailureKind, JobBackend};
use rookwatch_core::{JobKey, JobUpdate, UpdateSource};
use rookwatch_events::{EventBus, Notice, SyncEvent};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::reconcile::Reconciler;
use crate::subscriber::StreamSubscriber;

/// Drives periodic `get_job` calls for every job that needs them.
///
/// Dropping the scheduler cancels the supervisor, the poll loop and every
/// in-flight request.
pub struct PollScheduler {
    shared: Arc<PollShared>,
    cancel: CancellationToken,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    _drop_guard: DropGuard,
}

struct PollShared {
    backend: Arc<dyn JobBackend>,
    reconciler: Arc<Reconciler>,
    subscriber: Arc<StreamSubscriber>,
    events: Arc<EventBus>,
    interval: Duration,
    /// Poll loops currently running; never exceeds one.
    active_loops: AtomicUsize,
    /// Keys with a request outstanding.
    in_flight: Mutex<HashSet<JobKey>>,
    /// Keys whose permanent poll failure has already been surfaced.
    reported: Mutex<HashSet<JobKey>>,
}

impl PollScheduler {
    /// Spawn the supervisor. Polling itself starts only once some job needs it.
    pub fn start(
        backend: Arc<dyn JobBackend>,
        reconciler: Arc<Reconciler>,
        subscriber: Arc<StreamSubscriber>,
        events: Arc<EventBus>,
        interval: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let shared = Arc::new(PollShared {
            backend,
            reconciler,
            subscriber,
            events,
            interval,
            active_loops: AtomicUsize::new(0),
            in_flight: Mutex::new(HashSet::new()),
            reported: Mutex::new(HashSet::new()),
        });
        let cancel = parent.child_token();

        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), cancel.clone()));

        Self {
            shared,
            _drop_guard: cancel.clone().drop_guard(),
            cancel,
            supervisor: tokio::sync::Mutex::new(Some(supervisor)),
        }
    }

    /// Whether a poll loop is running.
    pub fn is_polling(&self) -> bool {
        self.active_loops() > 0
    }

    pub fn active_loops(&self) -> usize {
        self.shared.active_loops.load(Ordering::SeqCst)
    }

    /// Number of poll requests outstanding.
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.in_flight).len()
    }

    /// Jobs the next tick would poll.
    pub async fn pollable_keys(&self) -> Vec<JobKey> {
        self.shared.pollable_keys().await
    }

    /// Stop polling and wait until no request is outstanding.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Poll supervisor failed");
            }
        }
    }
}

impl PollShared {
    async fn pollable_keys(&self) -> Vec<JobKey> {
        let connected = self.subscriber.connected_keys().await;
        self.reconciler
            .pollable_keys()
            .await
            .into_iter()
            .filter(|key| !connected.contains(key))
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Start or stop the poll loop as the pollable set fills and empties.
async fn supervise(shared: Arc<PollShared>, cancel: CancellationToken) {
    let mut changes = shared.reconciler.changes();
    let mut running: Option<RunningLoop> = None;

    loop {
        let wanted = !shared.pollable_keys().await.is_empty();

        match (wanted, running.is_some()) {
            (true, false) => {
                let loop_cancel = cancel.child_token();
                let handle = tokio::spawn(poll_loop(Arc::clone(&shared), loop_cancel.clone()));
                running = Some(RunningLoop {
                    cancel: loop_cancel,
                    handle,
                });
                tracing::info!(
                    interval_ms = shared.interval.as_millis() as u64,
                    "Polling started",
                );
                shared.events.publish(SyncEvent::PollingChanged { active: true });
            }
            (false, true) => {
                if let Some(stopped) = running.take() {
                    stop_loop(stopped).await;
                }
                tracing::info!("Polling stopped, no job needs it");
                shared.events.publish(SyncEvent::PollingChanged { active: false });
            }
            _ => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(stopped) = running.take() {
        stop_loop(stopped).await;
        shared.events.publish(SyncEvent::PollingChanged { active: false });
    }
    tracing::debug!("Poll supervisor exited");
}

async fn stop_loop(running: RunningLoop) {
    running.cancel.cancel();
    if let Err(e) = running.handle.await {
        tracing::error!(error = %e, "Poll loop failed");
    }
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

async fn poll_loop(shared: Arc<PollShared>, cancel: CancellationToken) {
    shared.active_loops.fetch_add(1, Ordering::SeqCst);

    let mut ticker = tokio::time::interval_at(Instant::now() + shared.interval, shared.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut requests = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(joined) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Poll request panicked");
                    }
                }
            }
            _ = ticker.tick() => poll_pass(&shared, &mut requests).await,
        }
    }

    // Nothing may reach the job set once the loop is gone.
    requests.abort_all();
    while requests.join_next().await.is_some() {}

    shared.active_loops.fetch_sub(1, Ordering::SeqCst);
}

/// Issue one request per pollable key that has none outstanding.
async fn poll_pass(shared: &Arc<PollShared>, requests: &mut JoinSet<()>) {
    for key in shared.pollable_keys().await {
        let Some(claim) = InFlight::claim(shared, &key) else {
            tracing::trace!(username = %key, "Previous poll still outstanding, skipping");
            continue;
        };
        let shared = Arc::clone(shared);
        requests.spawn(async move {
            let _claim = claim;
            poll_one(&shared, key).await;
        });
    }
}

async fn poll_one(shared: &PollShared, key: JobKey) {
    match shared.backend.get_job(&key).await {
        Ok(snapshot) => {
            lock(&shared.reported).remove(&key);
            shared
                .reconciler
                .apply(JobUpdate::snapshot(UpdateSource::Poll, snapshot))
                .await;
        }
        Err(e) => handle_poll_error(shared, key, e).await,
    }
}

async fn handle_poll_error(shared: &PollShared, key: JobKey, error: ApiError) {
    match error.kind() {
        FailureKind::NotFound => {
            tracing::info!(username = %key, "Polled job no longer exists on backend");
            shared
                .reconciler
                .apply(JobUpdate::not_found(UpdateSource::Poll, key))
                .await;
        }
        FailureKind::Transient => {
            tracing::debug!(username = %key, error = %error, "Background poll failed, retrying next tick");
        }
        FailureKind::Permanent | FailureKind::ValidationMismatch => {
            tracing::error!(username = %key, error = %error, "Background poll rejected");
            if lock(&shared.reported).insert(key.clone()) {
                shared.events.publish(SyncEvent::Notice(
                    Notice::error(error.user_message()).for_job(key),
                ));
            }
        }
    }
}

/// Marks a key as having a poll outstanding until dropped.
///
/// Dropping happens on completion, abort and panic alike, so a key can
/// never stay stuck in the in-flight set.
struct InFlight {
    shared: Arc<PollShared>,
    key: JobKey,
}

impl InFlight {
    fn claim(shared: &Arc<PollShared>, key: &JobKey) -> Option<Self> {
        let was_idle = {
            let mut in_flight = lock(&shared.in_flight);
            let was_idle = in_flight.is_empty();
            if !in_flight.insert(key.clone()) {
                return None;
            }
            was_idle
        };
        if was_idle {
            shared.events.publish(SyncEvent::Updating { active: true });
        }
        Some(Self {
            shared: Arc::clone(shared),
            key: key.clone(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let now_idle = {
            let mut in_flight = lock(&self.shared.in_flight);
            in_flight.remove(&self.key);
            in_flight.is_empty()
        };
        if now_idle {
            self.shared.events.publish(SyncEvent::Updating { active: false });
        }
    }
}
