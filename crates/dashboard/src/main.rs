//! `rookwatch-dashboard` -- headless player-analysis dashboard.
//!
//! Loads the backend's job list, submits the given usernames, and logs
//! every job change until interrupted. When an analysis completes its
//! metrics detail is fetched and summarized.
//!
//! # Environment variables
//!
//! | Variable              | Required | Default | Description                          |
//! |-----------------------|----------|---------|--------------------------------------|
//! | `ROOKWATCH_USERNAMES` | no       | --      | Comma-separated usernames to submit  |
//!
//! Usernames may also be passed as arguments. Engine settings
//! (`ROOKWATCH_API_URL`, poll interval, timeouts, ...) are documented on
//! `SyncConfig::from_env`.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use rookwatch_client::PlayerApi;
use rookwatch_core::{JobKey, JobRecord, JobState};
use rookwatch_events::{Envelope, Severity, SyncEvent};
use rookwatch_sync::{JobTracker, SyncConfig};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "rookwatch_dashboard=info,rookwatch_sync=info,rookwatch_client=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SyncConfig::from_env().context("Invalid configuration")?;
    let usernames = requested_usernames(
        std::env::args().skip(1),
        std::env::var("ROOKWATCH_USERNAMES").ok().as_deref(),
    );
    tracing::info!(
        base_url = %config.client.base_url,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        stream_enabled = config.stream_enabled,
        usernames = usernames.len(),
        "Starting rookwatch-dashboard",
    );

    let api = Arc::new(PlayerApi::new(config.client.clone()));
    let tracker = JobTracker::start(api.clone(), &config);
    let reporter = tokio::spawn(report_events(tracker.subscribe_events(), Arc::clone(&api)));

    if let Err(e) = tracker.load().await {
        tracing::warn!(error = %e, "Starting without the backend job list");
    }
    for record in tracker.records().await {
        log_record(&record);
    }

    for username in &usernames {
        if let Err(e) = tracker.submit(username).await {
            tracing::warn!(username = %username, error = %e, "Submission not accepted");
        }
    }

    shutdown_signal().await;

    tracker.shutdown().await;
    reporter.abort();
    tracing::info!("Dashboard stopped");
    Ok(())
}

/// Usernames from the command line, falling back to the environment.
fn requested_usernames(args: impl Iterator<Item = String>, env: Option<&str>) -> Vec<String> {
    let from_args: Vec<String> = args
        .map(|arg| arg.trim().to_string())
        .filter(|arg| !arg.is_empty())
        .collect();
    if !from_args.is_empty() {
        return from_args;
    }
    env.unwrap_or_default()
        .split(',')
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Log every engine event; fetch metrics once per completed analysis.
async fn report_events(mut events: broadcast::Receiver<Envelope>, api: Arc<PlayerApi>) {
    let mut summarized: HashSet<JobKey> = HashSet::new();

    loop {
        let envelope = match events.recv().await {
            Ok(envelope) => envelope,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Dashboard fell behind, events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match envelope.event {
            SyncEvent::JobUpserted { record } => {
                log_record(&record);
                if record.state != JobState::Ready {
                    summarized.remove(&record.key);
                } else if summarized.insert(record.key.clone()) {
                    summarize_metrics(&api, &record.key).await;
                }
            }
            SyncEvent::JobRemoved { key } => {
                summarized.remove(&key);
                tracing::info!(username = %key, "Job removed");
            }
            SyncEvent::StreamConnectivity { key, connected } => {
                tracing::info!(username = %key, connected, "Live updates");
            }
            SyncEvent::PollingChanged { active } => {
                tracing::debug!(active, "Background polling");
            }
            SyncEvent::Updating { active } => {
                tracing::trace!(active, "Refreshing");
            }
            SyncEvent::Notice(notice) => {
                let username = notice.key.as_ref().map(JobKey::as_str).unwrap_or("-");
                match notice.severity {
                    Severity::Error => tracing::error!(
                        username,
                        retryable = notice.retryable,
                        "{}",
                        notice.message,
                    ),
                    Severity::Warning | Severity::Info => tracing::warn!(
                        username,
                        retryable = notice.retryable,
                        "{}",
                        notice.message,
                    ),
                }
            }
        }
    }
}

fn log_record(record: &JobRecord) {
    tracing::info!(
        username = %record.key,
        state = %record.state,
        progress = record.progress_percent,
        games = ?record.games_done.zip(record.games_total),
        risk_score = ?record.risk_score,
        error = ?record.last_error,
        "Job",
    );
}

async fn summarize_metrics(api: &PlayerApi, key: &JobKey) {
    match api.fetch_metrics(key).await {
        Ok(metrics) => {
            let fields = metrics.as_object().map_or(0, |obj| obj.len());
            let risk = metrics.get("risk_score").and_then(serde_json::Value::as_f64);
            tracing::info!(username = %key, fields, risk_score = ?risk, "Analysis metrics available");
        }
        Err(e) => {
            tracing::warn!(username = %key, error = %e.user_message(), "Could not fetch analysis metrics");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
