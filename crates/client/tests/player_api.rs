//! Integration tests for `PlayerApi` against an in-process fake backend.

mod common;

use assert_matches::assert_matches;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use rookwatch_client::{ApiError, FailureKind, JobBackend};
use rookwatch_core::{JobKey, JobState};
use serde_json::{json, Value};

use common::{api_for, Hits};

fn key(name: &str) -> JobKey {
    JobKey::parse(name).unwrap()
}

// ---------------------------------------------------------------------------
// Test: listing translates every schema revision
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_jobs_translates_entries() {
    let app = Router::new().route(
        "/players",
        get(|| async {
            Json(json!([
                {"username": "alice", "status": "in_progress", "progress": 40.0},
                {"username": "Bob", "status": "completed", "risk_score": 0.1},
                {"status": "pending"}
            ]))
        }),
    );
    let api = api_for(app).await;

    let snapshots = api.list_jobs().await.unwrap();

    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].key, key("alice"));
    assert_eq!(snapshots[0].state, Some(JobState::Running));
    assert_eq!(snapshots[1].key, key("bob"));
    assert_eq!(snapshots[1].state, Some(JobState::Ready));
}

// ---------------------------------------------------------------------------
// Test: detail uses the requested key even when the body omits it
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_job_uses_requested_key() {
    let app = Router::new().route(
        "/players/{username}",
        get(|| async {
            Json(json!({
                "status": "pending",
                "analysis_progress": 12.5,
                "games_total": 40,
                "games_analyzed": 5
            }))
        }),
    );
    let api = api_for(app).await;

    let snapshot = api.get_job(&key("alice")).await.unwrap();

    assert_eq!(snapshot.key, key("alice"));
    assert_eq!(snapshot.state, Some(JobState::Running));
    assert_eq!(snapshot.games_done, Some(5));
}

// ---------------------------------------------------------------------------
// Test: 404 is classified NotFound and not retried
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_job_not_found_is_not_retried() {
    let hits = Hits::default();
    let app = Router::new()
        .route(
            "/players/{username}",
            get(|State(hits): State<Hits>| async move {
                hits.bump();
                (StatusCode::NOT_FOUND, Json(json!({"error": "Player not found"})))
            }),
        )
        .with_state(hits.clone());
    let api = api_for(app).await;

    let err = api.get_job(&key("bob")).await.unwrap_err();

    assert_eq!(err.kind(), FailureKind::NotFound);
    assert_eq!(hits.get(), 1);
}

// ---------------------------------------------------------------------------
// Test: 5xx is retried and can recover
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failure_is_retried_until_success() {
    let hits = Hits::default();
    let app = Router::new()
        .route(
            "/players",
            get(|State(hits): State<Hits>| async move {
                if hits.bump() < 3 {
                    StatusCode::SERVICE_UNAVAILABLE.into_response()
                } else {
                    Json(json!([])).into_response()
                }
            }),
        )
        .with_state(hits.clone());
    let api = api_for(app).await;

    let snapshots = api.list_jobs().await.unwrap();

    assert!(snapshots.is_empty());
    assert_eq!(hits.get(), 3);
}

#[tokio::test]
async fn transient_failure_exhausts_attempts() {
    let hits = Hits::default();
    let app = Router::new()
        .route(
            "/players",
            get(|State(hits): State<Hits>| async move {
                hits.bump();
                StatusCode::BAD_GATEWAY
            }),
        )
        .with_state(hits.clone());
    let api = api_for(app).await;

    let err = api.list_jobs().await.unwrap_err();

    assert_matches!(err, ApiError::Status { status: 502, .. });
    assert_eq!(hits.get(), 3);
}

// ---------------------------------------------------------------------------
// Test: submission acknowledgement variants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_returns_task_id() {
    let app = Router::new().route(
        "/players/{username}",
        post(|Path(username): Path<String>| async move {
            (
                StatusCode::ACCEPTED,
                Json(json!({"message": format!("queued {username}"), "task_id": "t-1"})),
            )
        }),
    );
    let api = api_for(app).await;

    let ack = api.submit_job(&key("alice")).await.unwrap();

    assert_eq!(ack.task_id.as_deref(), Some("t-1"));
}

#[tokio::test]
async fn submit_conflict_counts_as_accepted() {
    let app = Router::new().route(
        "/players/{username}",
        post(|| async { (StatusCode::CONFLICT, Json(json!({"error": "exists"}))) }),
    );
    let api = api_for(app).await;

    let ack = api.submit_job(&key("alice")).await.unwrap();

    assert!(ack.task_id.is_none());
}

#[tokio::test]
async fn submit_tolerates_empty_body() {
    let app = Router::new().route("/players/{username}", post(|| async { StatusCode::OK }));
    let api = api_for(app).await;

    assert!(api.submit_job(&key("alice")).await.is_ok());
}

#[tokio::test]
async fn submit_rejection_is_permanent_with_backend_message() {
    let hits = Hits::default();
    let app = Router::new()
        .route(
            "/players/{username}",
            post(|State(hits): State<Hits>| async move {
                hits.bump();
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "Username is required"})),
                )
            }),
        )
        .with_state(hits.clone());
    let api = api_for(app).await;

    let err = api.submit_job(&key("alice")).await.unwrap_err();

    assert_eq!(err.kind(), FailureKind::Permanent);
    assert_eq!(err.user_message(), "Username is required");
    assert_eq!(hits.get(), 1);
}

// ---------------------------------------------------------------------------
// Test: stop and delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_sends_stop_action() {
    let app = Router::new().route(
        "/players/{username}",
        axum::routing::put(|Json(body): Json<Value>| async move {
            if body == json!({"action": "stop"}) {
                StatusCode::OK
            } else {
                StatusCode::BAD_REQUEST
            }
        }),
    );
    let api = api_for(app).await;

    assert!(api.stop_job(&key("alice")).await.is_ok());
}

#[tokio::test]
async fn delete_of_absent_job_succeeds() {
    let app = Router::new().route(
        "/players/{username}",
        axum::routing::delete(|| async { StatusCode::NOT_FOUND }),
    );
    let api = api_for(app).await;

    assert!(api.delete_job(&key("ghost")).await.is_ok());
}

// ---------------------------------------------------------------------------
// Test: malformed listing body is a validation mismatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn non_array_listing_is_validation_mismatch() {
    let app = Router::new().route("/players", get(|| async { Json(json!({"players": []})) }));
    let api = api_for(app).await;

    let err = api.list_jobs().await.unwrap_err();

    assert_eq!(err.kind(), FailureKind::ValidationMismatch);
}

// ---------------------------------------------------------------------------
// Test: metrics pass through untouched
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_metrics_returns_raw_body() {
    let app = Router::new().route(
        "/metrics/player/{username}",
        get(|Path(username): Path<String>| async move {
            Json(json!({"username": username, "acpl": 21.4}))
        }),
    );
    let api = api_for(app).await;

    let metrics = api.fetch_metrics(&key("alice")).await.unwrap();

    assert_eq!(metrics, json!({"username": "alice", "acpl": 21.4}));
}

// ---------------------------------------------------------------------------
// Test: event stream delivers decoded events then ends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribe_decodes_server_sent_events() {
    let app = Router::new().route(
        "/stream/{username}",
        get(|| async {
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                concat!(
                    ": connected\n\n",
                    "data: {\"type\":\"progress\",\"data\":{\"username\":\"alice\",\"progress\":50}}\n\n",
                    "data: {\"type\":\"completed\",\"data\":{\"username\":\"alice\",\"progress\":100}}\n\n",
                ),
            )
        }),
    );
    let api = api_for(app).await;

    let mut handle = api.subscribe(&key("alice")).await.unwrap();

    let first = handle.next_event().await.unwrap().unwrap();
    assert_eq!(first.kind, "progress");
    let second = handle.next_event().await.unwrap().unwrap();
    assert_eq!(second.into_snapshot().unwrap().state, Some(JobState::Ready));
    assert!(handle.next_event().await.is_none());
}

#[tokio::test]
async fn subscribe_rejected_by_backend_is_an_error() {
    let app = Router::new().route(
        "/stream/{username}",
        get(|| async { StatusCode::FORBIDDEN }),
    );
    let api = api_for(app).await;

    let Err(err) = api.subscribe(&key("alice")).await else {
        panic!("subscription should have been rejected");
    };

    assert_matches!(err, ApiError::Status { status: 403, .. });
}
