//! User-facing entry point: submit, stop, delete and observe jobs.
//!
//! [`JobTracker`] owns the job set, the poll scheduler and the stream
//! subscriber, and ties their lifetime to one cancellation token.
//! Created once via [`JobTracker::start`]; the returned `Arc` can be
//! cloned into whatever drives the user interface.

use std::sync::Arc;

use chrono::Utc;
use rookwatch_client::{ApiError, JobBackend};
use rookwatch_core::{CoreError, JobKey, JobRecord, JobSnapshot, JobState, JobUpdate, UpdateSource};
use rookwatch_events::{Envelope, EventBus, Notice, SyncEvent};
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::SyncConfig;
use crate::poller::PollScheduler;
use crate::reconcile::Reconciler;
use crate::subscriber::StreamSubscriber;

/// Errors returned to callers of [`JobTracker`].
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("invalid username: {0}")]
    InvalidKey(#[from] CoreError),

    #[error("no job tracked for {0}")]
    UnknownJob(JobKey),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Keeps the local job set in sync with the analysis backend.
pub struct JobTracker {
    backend: Arc<dyn JobBackend>,
    reconciler: Arc<Reconciler>,
    subscriber: Arc<StreamSubscriber>,
    poller: PollScheduler,
    events: Arc<EventBus>,
    stream_enabled: bool,
    /// Master cancellation token, cancelled during shutdown or drop.
    cancel: CancellationToken,
    _drop_guard: DropGuard,
}

impl JobTracker {
    /// Wire up the engine and start the poll supervisor.
    ///
    /// Nothing is fetched yet; call [`load`](Self::load) to pull the
    /// backend's current job list.
    pub fn start(backend: Arc<dyn JobBackend>, config: &SyncConfig) -> Arc<Self> {
        let events = Arc::new(EventBus::default());
        let cancel = CancellationToken::new();
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&events)));

        let subscriber = Arc::new(StreamSubscriber::new(
            Arc::clone(&backend),
            Arc::clone(&reconciler),
            Arc::clone(&events),
            config.reconnect.clone(),
            &cancel,
        ));
        let poller = PollScheduler::start(
            Arc::clone(&backend),
            Arc::clone(&reconciler),
            Arc::clone(&subscriber),
            Arc::clone(&events),
            config.poll_interval,
            &cancel,
        );

        tracing::info!(
            base_url = %config.client.base_url,
            stream_enabled = config.stream_enabled,
            "Job tracker started",
        );

        Arc::new(Self {
            backend,
            reconciler,
            subscriber,
            poller,
            events,
            stream_enabled: config.stream_enabled,
            _drop_guard: cancel.clone().drop_guard(),
            cancel,
        })
    }

    /// Subscribe to every change of the job set, connectivity flips and
    /// user notices.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }

    /// Fetch the full job list and merge it in.
    ///
    /// Used at startup and as the manual retry after a failed load.
    /// Returns the number of jobs the backend reported.
    pub async fn load(&self) -> Result<usize, TrackerError> {
        let snapshots = match self.backend.list_jobs().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load job list");
                let notice = Notice::error(format!("Could not load analyses: {}", e.user_message()));
                self.events.publish(SyncEvent::Notice(if e.is_transient() {
                    notice.retryable()
                } else {
                    notice
                }));
                return Err(e.into());
            }
        };

        let count = snapshots.len();
        for snapshot in snapshots {
            self.reconciler
                .apply(JobUpdate::snapshot(UpdateSource::Listing, snapshot))
                .await;
        }
        tracing::info!(count, "Job list loaded");

        if self.stream_enabled {
            for key in self.reconciler.active_keys().await {
                if !self.subscriber.is_subscribed(&key).await {
                    self.subscriber.subscribe(key).await;
                }
            }
        }
        Ok(count)
    }

    /// Request a new analysis for `username`.
    ///
    /// The job appears as `Queued` immediately and is not polled until the
    /// backend acknowledges it. If the backend refuses a new submission the
    /// record turns `Failed` with the reason; resubmitting a job that is
    /// still active leaves it untouched. Either way a notice is published.
    pub async fn submit(&self, username: &str) -> Result<JobRecord, TrackerError> {
        let key = JobKey::parse(username)?;
        let pending = self.reconciler.begin_submission(key.clone());
        let created = self
            .reconciler
            .apply(JobUpdate::submitted(key.clone(), Utc::now()))
            .await
            .changed();
        if !created {
            drop(pending);
        }

        match self.backend.submit_job(&key).await {
            Ok(ack) => {
                tracing::info!(username = %key, task_id = ?ack.task_id, "Analysis submitted");
                let mut snapshot = JobSnapshot::new(key.clone());
                snapshot.task_id = ack.task_id;
                self.reconciler
                    .apply(JobUpdate::snapshot(UpdateSource::Submission, snapshot))
                    .await;
                if self.stream_enabled {
                    self.subscriber.subscribe(key.clone()).await;
                }
                self.reconciler
                    .get(&key)
                    .await
                    .ok_or(TrackerError::UnknownJob(key))
            }
            Err(e) => {
                tracing::error!(username = %key, error = %e, "Analysis submission failed");
                let message = e.user_message();
                let notice = Notice::error(format!("Could not analyze {key}: {message}"))
                    .for_job(key.clone());
                self.events.publish(SyncEvent::Notice(if e.is_transient() {
                    notice.retryable()
                } else {
                    notice
                }));

                if created {
                    let failed = JobSnapshot::new(key)
                        .with_state(JobState::Failed)
                        .with_error(message);
                    self.reconciler
                        .apply(JobUpdate::snapshot(UpdateSource::Submission, failed))
                        .await;
                }
                Err(e.into())
            }
        }
    }

    /// Stop a running analysis. Stopping a finished job changes nothing.
    pub async fn stop(&self, username: &str) -> Result<JobRecord, TrackerError> {
        let key = JobKey::parse(username)?;
        let Some(current) = self.reconciler.get(&key).await else {
            return Err(TrackerError::UnknownJob(key));
        };
        if current.is_terminal() {
            return Ok(current);
        }

        if let Err(e) = self.backend.stop_job(&key).await {
            self.command_failed("stop", &key, &e);
            return Err(e.into());
        }

        tracing::info!(username = %key, "Analysis stopped");
        self.subscriber.unsubscribe(&key).await;
        self.reconciler.apply(JobUpdate::stopped(key.clone())).await;
        self.reconciler
            .get(&key)
            .await
            .ok_or(TrackerError::UnknownJob(key))
    }

    /// Delete a job on the backend and drop it locally.
    pub async fn delete(&self, username: &str) -> Result<(), TrackerError> {
        let key = JobKey::parse(username)?;

        if let Err(e) = self.backend.delete_job(&key).await {
            self.command_failed("delete", &key, &e);
            return Err(e.into());
        }

        tracing::info!(username = %key, "Analysis deleted");
        self.subscriber.unsubscribe(&key).await;
        self.reconciler.apply(JobUpdate::removed(key)).await;
        Ok(())
    }

    /// Open the push channel for an active job.
    pub async fn watch(&self, username: &str) -> Result<bool, TrackerError> {
        let key = JobKey::parse(username)?;
        Ok(self.subscriber.subscribe(key).await)
    }

    pub async fn unwatch(&self, username: &str) -> Result<(), TrackerError> {
        let key = JobKey::parse(username)?;
        self.subscriber.unsubscribe(&key).await;
        Ok(())
    }

    /// Every tracked job, newest request first.
    pub async fn records(&self) -> Vec<JobRecord> {
        self.reconciler.snapshot().await
    }

    pub async fn get(&self, username: &str) -> Result<Option<JobRecord>, TrackerError> {
        let key = JobKey::parse(username)?;
        Ok(self.reconciler.get(&key).await)
    }

    pub async fn is_connected(&self, username: &str) -> Result<bool, TrackerError> {
        let key = JobKey::parse(username)?;
        Ok(self.subscriber.is_connected(&key).await)
    }

    pub fn poller(&self) -> &PollScheduler {
        &self.poller
    }

    pub fn subscriber(&self) -> &StreamSubscriber {
        &self.subscriber
    }

    /// Cancel every timer, request and subscription, and wait for them.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down job tracker");
        self.cancel.cancel();
        self.poller.shutdown().await;
        self.subscriber.shutdown().await;
        tracing::info!("Job tracker shut down complete");
    }

    // ---- private helpers ----

    fn command_failed(&self, action: &'static str, key: &JobKey, error: &ApiError) {
        tracing::error!(username = %key, action, error = %error, "Job command failed");
        let notice = Notice::error(format!("Could not {action} {key}: {}", error.user_message()))
            .for_job(key.clone());
        self.events.publish(SyncEvent::Notice(if error.is_transient() {
            notice.retryable()
        } else {
            notice
        }));
    }
}
