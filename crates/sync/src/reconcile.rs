//! The job set and the single merge path into it.
//!
//! Every channel (submission, listing, poll, stream, user command) hands
//! its [`JobUpdate`] to [`Reconciler::apply`]. The write lock over the
//! job set serializes merges; nothing awaits while it is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{TimeDelta, Utc};
use rookwatch_core::job::VANISHED_JOB_ERROR;
use rookwatch_core::{
    clamp_progress, JobKey, JobRecord, JobSnapshot, JobState, JobUpdate, Timestamp, UpdateKind,
};
use rookwatch_events::{EventBus, SyncEvent};
use tokio::sync::{watch, RwLock};

/// What [`Reconciler::apply`] did with an update.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Inserted(JobRecord),
    Updated(JobRecord),
    Removed,
    /// The update carried nothing new.
    Unchanged,
    /// The update arrived for a deleted job and was dropped.
    Discarded,
}

impl MergeOutcome {
    /// Whether the job set changed.
    pub fn changed(&self) -> bool {
        matches!(self, Self::Inserted(_) | Self::Updated(_) | Self::Removed)
    }

    pub fn record(&self) -> Option<&JobRecord> {
        match self {
            Self::Inserted(record) | Self::Updated(record) => Some(record),
            _ => None,
        }
    }
}

/// How long a deleted key keeps rejecting background updates. Longer
/// than any poll can stay outstanding (timeouts plus retries).
const TOMBSTONE_TTL: TimeDelta = TimeDelta::minutes(2);

#[derive(Default)]
struct JobSet {
    records: HashMap<JobKey, JobRecord>,
    /// Keys removed by an acknowledged delete, with the removal time.
    /// Background updates for these are late arrivals and must not
    /// resurrect the job; entries expire after [`TOMBSTONE_TTL`].
    tombstones: HashMap<JobKey, Timestamp>,
}

/// Owner of the job set.
pub struct Reconciler {
    jobs: RwLock<JobSet>,
    events: Arc<EventBus>,
    /// Bumped on every change that can affect which jobs need polling.
    revision: watch::Sender<u64>,
    /// Keys whose submission the backend has not acknowledged yet, with
    /// the number of submissions still outstanding for each.
    awaiting_ack: Mutex<HashMap<JobKey, usize>>,
}

impl Reconciler {
    pub fn new(events: Arc<EventBus>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            jobs: RwLock::new(JobSet::default()),
            events,
            revision,
            awaiting_ack: Mutex::new(HashMap::new()),
        }
    }

    /// Mark `key` as submitted but not yet acknowledged.
    ///
    /// Until the returned guard is dropped the job is left out of
    /// [`pollable_keys`](Self::pollable_keys) and background `NotFound`
    /// answers for it are ignored: the backend may not know the job yet.
    pub fn begin_submission(&self, key: JobKey) -> SubmissionGuard<'_> {
        *lock(&self.awaiting_ack).entry(key.clone()).or_default() += 1;
        SubmissionGuard {
            reconciler: self,
            key,
        }
    }

    pub fn is_awaiting_ack(&self, key: &JobKey) -> bool {
        lock(&self.awaiting_ack).contains_key(key)
    }

    /// Merge one update into the job set.
    pub async fn apply(&self, update: JobUpdate) -> MergeOutcome {
        let now = Utc::now();
        let key = update.key.clone();
        let awaiting_ack = self.is_awaiting_ack(&key);
        let outcome = {
            let mut jobs = self.jobs.write().await;
            merge_into(&mut jobs, update, awaiting_ack, now)
        };

        match &outcome {
            MergeOutcome::Inserted(record) | MergeOutcome::Updated(record) => {
                tracing::debug!(
                    username = %record.key,
                    state = %record.state,
                    progress = record.progress_percent,
                    version = record.version,
                    "Job record changed",
                );
                self.events.publish(SyncEvent::JobUpserted {
                    record: record.clone(),
                });
            }
            MergeOutcome::Removed => {
                tracing::info!(username = %key, "Job removed");
                self.events.publish(SyncEvent::JobRemoved { key });
            }
            MergeOutcome::Unchanged | MergeOutcome::Discarded => {}
        }
        if outcome.changed() {
            self.signal_change();
        }
        outcome
    }

    /// Wake everything watching [`changes`](Self::changes).
    pub fn signal_change(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    /// Receiver that observes every change to the job set.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub async fn get(&self, key: &JobKey) -> Option<JobRecord> {
        self.jobs.read().await.records.get(key).cloned()
    }

    /// Every record, newest request first.
    pub async fn snapshot(&self) -> Vec<JobRecord> {
        let mut records: Vec<_> = self.jobs.read().await.records.values().cloned().collect();
        records.sort_by(|a, b| {
            b.requested_at
                .cmp(&a.requested_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        records
    }

    /// Keys of every job still in `Queued` or `Running`.
    pub async fn active_keys(&self) -> Vec<JobKey> {
        let jobs = self.jobs.read().await;
        let mut keys: Vec<_> = jobs
            .records
            .values()
            .filter(|r| r.state.is_active())
            .map(|r| r.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Active keys the backend is known to have accepted.
    pub async fn pollable_keys(&self) -> Vec<JobKey> {
        let mut keys = self.active_keys().await;
        let awaiting = lock(&self.awaiting_ack);
        keys.retain(|key| !awaiting.contains_key(key));
        keys
    }

    pub async fn is_active(&self, key: &JobKey) -> bool {
        self.jobs
            .read()
            .await
            .records
            .get(key)
            .is_some_and(|r| r.state.is_active())
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Clears the awaiting-acknowledgement mark on drop, whichever way the
/// submission ended, and wakes the poll supervisor.
pub struct SubmissionGuard<'a> {
    reconciler: &'a Reconciler,
    key: JobKey,
}

impl Drop for SubmissionGuard<'_> {
    fn drop(&mut self) {
        {
            let mut awaiting = lock(&self.reconciler.awaiting_ack);
            if let Some(count) = awaiting.get_mut(&self.key) {
                *count -= 1;
                if *count == 0 {
                    awaiting.remove(&self.key);
                }
            }
        }
        self.reconciler.signal_change();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Merge rules
// ---------------------------------------------------------------------------

fn merge_into(
    jobs: &mut JobSet,
    update: JobUpdate,
    awaiting_ack: bool,
    now: Timestamp,
) -> MergeOutcome {
    let JobUpdate { key, source, kind } = update;

    jobs.tombstones
        .retain(|_, removed_at| now.signed_duration_since(*removed_at) < TOMBSTONE_TTL);
    if jobs.tombstones.contains_key(&key) {
        if source.is_background() {
            tracing::debug!(username = %key, ?source, "Dropping update for deleted job");
            return MergeOutcome::Discarded;
        }
        if !matches!(kind, UpdateKind::Removed) {
            jobs.tombstones.remove(&key);
        }
    }

    match kind {
        UpdateKind::Removed => {
            jobs.tombstones.insert(key.clone(), now);
            match jobs.records.remove(&key) {
                Some(_) => MergeOutcome::Removed,
                None => MergeOutcome::Unchanged,
            }
        }
        UpdateKind::Submitted { requested_at } => {
            let existing_active = jobs.records.get(&key).map(|r| r.state.is_active());
            if existing_active == Some(true) {
                return MergeOutcome::Unchanged;
            }
            let record = JobRecord::queued(key.clone(), requested_at);
            jobs.records.insert(key, record.clone());
            match existing_active {
                Some(_) => MergeOutcome::Updated(record),
                None => MergeOutcome::Inserted(record),
            }
        }
        UpdateKind::NotFound => {
            let Some(existing) = jobs.records.get_mut(&key) else {
                return MergeOutcome::Unchanged;
            };
            if awaiting_ack && source.is_background() {
                tracing::debug!(username = %key, "Job not yet known to backend, ignoring 404");
                return MergeOutcome::Unchanged;
            }
            if existing.is_terminal() {
                return MergeOutcome::Unchanged;
            }
            let mut next = existing.clone();
            next.state = JobState::Failed;
            next.last_error = Some(VANISHED_JOB_ERROR.to_string());
            commit(existing, next, now)
        }
        UpdateKind::Stopped => {
            let Some(existing) = jobs.records.get_mut(&key) else {
                return MergeOutcome::Unchanged;
            };
            if existing.is_terminal() {
                return MergeOutcome::Unchanged;
            }
            let mut next = existing.clone();
            next.state = JobState::Stopped;
            commit(existing, next, now)
        }
        UpdateKind::Snapshot(snapshot) => match jobs.records.get_mut(&key) {
            Some(existing) => {
                let next = merge_snapshot(existing, &snapshot);
                commit(existing, next, now)
            }
            None => {
                let record = record_from_snapshot(snapshot, now);
                jobs.records.insert(key, record.clone());
                MergeOutcome::Inserted(record)
            }
        },
    }
}

/// Normalize `next`, and if it differs from `existing` store it with a
/// bumped version.
fn commit(existing: &mut JobRecord, mut next: JobRecord, now: Timestamp) -> MergeOutcome {
    next.enforce_invariants(now);
    if next.same_content(existing) {
        return MergeOutcome::Unchanged;
    }
    next.version = existing.version + 1;
    *existing = next.clone();
    MergeOutcome::Updated(next)
}

/// Field-by-field last-writer-wins, with two exceptions: progress never
/// rewinds within one state, and a terminal record keeps its state.
///
/// A snapshot that reports less progress (or fewer analyzed games) than
/// already known, without a state change, is stale; none of its progress
/// fields are taken.
fn merge_snapshot(existing: &JobRecord, snapshot: &JobSnapshot) -> JobRecord {
    let mut next = existing.clone();
    let sticky = existing.is_terminal();
    let progress = snapshot.progress.map(clamp_progress);

    let state = match snapshot.state {
        Some(state) if !sticky => state,
        None if existing.state == JobState::Queued && progress.is_some_and(|p| p > 0.0) => {
            JobState::Running
        }
        _ => existing.state,
    };

    let stale = state == existing.state
        && (progress.is_some_and(|p| p < existing.progress_percent)
            || matches!(
                (snapshot.games_done, existing.games_done),
                (Some(incoming), Some(current)) if incoming < current
            ));

    if !stale {
        if let Some(progress) = progress {
            next.progress_percent = progress;
        }
        if snapshot.games_total.is_some() {
            next.games_total = snapshot.games_total;
        }
        if snapshot.games_done.is_some() {
            next.games_done = snapshot.games_done;
        }
    }
    next.state = state;
    if !sticky {
        if let Some(error) = &snapshot.error {
            next.last_error = Some(error.clone());
        }
        if state.is_terminal() {
            next.finished_at = snapshot
                .finished_at
                .map(|finished| finished.max(existing.requested_at));
        }
    }
    if snapshot.task_id.is_some() {
        next.task_id = snapshot.task_id.clone();
    }
    if snapshot.risk_score.is_some() {
        next.risk_score = snapshot.risk_score;
    }
    next.raw_payload = snapshot.raw.clone();
    next
}

fn record_from_snapshot(snapshot: JobSnapshot, now: Timestamp) -> JobRecord {
    let progress = snapshot.progress.map(clamp_progress).unwrap_or(0.0);
    let state = snapshot.state.unwrap_or(if progress > 0.0 {
        JobState::Running
    } else {
        JobState::Queued
    });
    let requested_at = snapshot.requested_at.unwrap_or(now);

    let mut record = JobRecord::queued(snapshot.key, requested_at);
    record.state = state;
    record.progress_percent = progress;
    record.games_total = snapshot.games_total;
    record.games_done = snapshot.games_done;
    record.finished_at = snapshot
        .finished_at
        .filter(|_| state.is_terminal())
        .map(|finished| finished.max(requested_at));
    record.last_error = snapshot.error;
    record.task_id = snapshot.task_id;
    record.risk_score = snapshot.risk_score;
    record.raw_payload = snapshot.raw;
    record.enforce_invariants(now);
    record
}
