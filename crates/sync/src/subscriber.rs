//! Push-channel subscriptions, one per active job.
//!
//! [`StreamSubscriber`] keeps one long-lived task per subscribed job:
//! open the stream -> apply events -> on loss, back off and reopen. The
//! task ends when the job turns terminal, is removed, or the subscription
//! is cancelled. While a job's stream is down it is absent from
//! [`connected_keys`](StreamSubscriber::connected_keys), which is what
//! hands it back to the poll scheduler.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rookwatch_client::retry::next_delay;
use rookwatch_client::{EventHandle, FailureKind, JobBackend, ReconnectConfig};
use rookwatch_core::{JobKey, JobUpdate, Timestamp, UpdateSource};
use rookwatch_events::{EventBus, SyncEvent};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::reconcile::{MergeOutcome, Reconciler};

/// How long shutdown waits for each subscription task to exit.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Manages push subscriptions for active jobs.
pub struct StreamSubscriber {
    ctx: Arc<StreamContext>,
    /// Live subscription tasks indexed by job key.
    subscriptions: RwLock<HashMap<JobKey, Subscription>>,
    next_generation: AtomicU64,
    /// Parent of every subscription token; cancelled on shutdown.
    cancel: CancellationToken,
}

/// State shared with every subscription task.
struct StreamContext {
    backend: Arc<dyn JobBackend>,
    reconciler: Arc<Reconciler>,
    events: Arc<EventBus>,
    reconnect: ReconnectConfig,
    /// Keys with an open stream, tagged with the generation that opened it.
    connected: RwLock<HashMap<JobKey, u64>>,
}

struct Subscription {
    task_handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

/// Why an open stream stopped being read.
enum StreamEnd {
    Cancelled,
    /// The job no longer needs watching.
    Settled,
    Dropped,
}

impl StreamSubscriber {
    pub fn new(
        backend: Arc<dyn JobBackend>,
        reconciler: Arc<Reconciler>,
        events: Arc<EventBus>,
        reconnect: ReconnectConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(StreamContext {
                backend,
                reconciler,
                events,
                reconnect,
                connected: RwLock::new(HashMap::new()),
            }),
            subscriptions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            cancel: parent.child_token(),
        }
    }

    /// Watch `key` over the push channel.
    ///
    /// Replaces any existing subscription for the key. Returns `false`
    /// (and subscribes nothing) when the job is unknown or already terminal.
    pub async fn subscribe(&self, key: JobKey) -> bool {
        if self.cancel.is_cancelled() || !self.ctx.reconciler.is_active(&key).await {
            return false;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        let ctx = Arc::clone(&self.ctx);
        let task_key = key.clone();
        let task_cancel = cancel.clone();

        let mut subs = self.subscriptions.write().await;
        if let Some(previous) = subs.remove(&key) {
            tracing::debug!(username = %key, "Replacing existing subscription");
            previous.cancel.cancel();
        }

        let task_handle = tokio::spawn(async move {
            tracing::debug!(username = %task_key, generation, "Subscription task started");
            run_subscription(&ctx, &task_key, generation, &task_cancel).await;
            tracing::debug!(username = %task_key, generation, "Subscription task exited");
        });
        subs.insert(key, Subscription { task_handle, cancel });
        true
    }

    /// Close the subscription for `key`, if any.
    pub async fn unsubscribe(&self, key: &JobKey) {
        if let Some(sub) = self.subscriptions.write().await.remove(key) {
            sub.cancel.cancel();
        }
    }

    pub async fn is_subscribed(&self, key: &JobKey) -> bool {
        self.subscriptions
            .read()
            .await
            .get(key)
            .is_some_and(|sub| !sub.task_handle.is_finished())
    }

    pub async fn is_connected(&self, key: &JobKey) -> bool {
        self.ctx.connected.read().await.contains_key(key)
    }

    /// Keys whose stream is currently open.
    pub async fn connected_keys(&self) -> HashSet<JobKey> {
        self.ctx.connected.read().await.keys().cloned().collect()
    }

    /// Number of subscription tasks still running.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .await
            .values()
            .filter(|sub| !sub.task_handle.is_finished())
            .count()
    }

    /// Close every subscription and wait for the tasks to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let mut subs = self.subscriptions.write().await;
        for (key, sub) in subs.drain() {
            sub.cancel.cancel();
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, sub.task_handle)
                .await
                .is_err()
            {
                tracing::warn!(username = %key, "Subscription task did not exit in time");
            }
        }
    }
}

impl StreamContext {
    /// Record a connectivity flip and let observers (and the poller) know.
    async fn set_connected(&self, key: &JobKey, generation: u64, connected: bool) {
        let changed = {
            let mut map = self.connected.write().await;
            if connected {
                map.insert(key.clone(), generation) != Some(generation)
            } else if map.get(key) == Some(&generation) {
                map.remove(key);
                true
            } else {
                false
            }
        };

        if changed {
            tracing::info!(username = %key, connected, "Event stream connectivity changed");
            self.events.publish(SyncEvent::StreamConnectivity {
                key: key.clone(),
                connected,
            });
            self.reconciler.signal_change();
        }
    }
}

/// Connect -> read events -> reconnect, until cancelled or the job settles.
async fn run_subscription(
    ctx: &StreamContext,
    key: &JobKey,
    generation: u64,
    cancel: &CancellationToken,
) {
    let mut delay = ctx.reconnect.initial_delay;
    let mut newest: Option<Timestamp> = None;

    loop {
        if !ctx.reconciler.is_active(key).await {
            break;
        }

        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            result = ctx.backend.subscribe(key) => result,
        };

        match opened {
            Ok(mut handle) => {
                ctx.set_connected(key, generation, true).await;
                delay = ctx.reconnect.initial_delay;

                let end = read_events(ctx, key, &mut handle, &mut newest, cancel).await;
                handle.close();
                ctx.set_connected(key, generation, false).await;

                match end {
                    StreamEnd::Cancelled | StreamEnd::Settled => break,
                    StreamEnd::Dropped => {
                        tracing::info!(username = %key, "Event stream dropped, polling until it reconnects");
                    }
                }
            }
            Err(e) if e.kind() == FailureKind::Permanent => {
                tracing::warn!(username = %key, error = %e, "Event stream rejected by backend");
            }
            Err(e) => {
                tracing::debug!(username = %key, error = %e, "Event stream unavailable");
            }
        }

        if !ctx.reconciler.is_active(key).await {
            break;
        }

        tracing::debug!(
            username = %key,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting event stream after delay",
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = next_delay(delay, &ctx.reconnect);
    }

    ctx.set_connected(key, generation, false).await;
}

/// Apply events from one open stream until it ends.
async fn read_events(
    ctx: &StreamContext,
    key: &JobKey,
    handle: &mut EventHandle,
    newest: &mut Option<Timestamp>,
    cancel: &CancellationToken,
) -> StreamEnd {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            item = handle.next_event() => item,
        };

        let event = match item {
            None => return StreamEnd::Dropped,
            Some(Ok(event)) => event,
            Some(Err(e)) if e.kind() == FailureKind::ValidationMismatch => {
                tracing::warn!(username = %key, error = %e, "Ignoring malformed stream event");
                continue;
            }
            Some(Err(e)) => {
                tracing::debug!(username = %key, error = %e, "Event stream broke");
                return StreamEnd::Dropped;
            }
        };

        let server_time = event.server_time();
        if let (Some(at), Some(seen)) = (server_time, *newest) {
            if at < seen {
                tracing::debug!(username = %key, "Dropping out-of-order stream event");
                continue;
            }
        }

        let snapshot = match event.into_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(username = %key, error = %e, "Stream event has an unusable username");
                continue;
            }
        };
        if snapshot.key != *key {
            tracing::warn!(username = %key, other = %snapshot.key, "Stream event for another job");
            continue;
        }

        if server_time.is_some() {
            *newest = server_time;
        }

        let outcome = ctx
            .reconciler
            .apply(JobUpdate::snapshot(UpdateSource::Stream, snapshot))
            .await;
        if outcome == MergeOutcome::Discarded || !ctx.reconciler.is_active(key).await {
            return StreamEnd::Settled;
        }
    }
}
