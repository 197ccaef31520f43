//! Relay HTTP API.
//!
//! | Method/Path | Response |
//! |---|---|
//! | GET `/api/status` | `{summary, config, queue, lastConflict}` |
//! | GET `/api/blocks/full` | `{blocks: [...]}` |
//! | POST `/api/letters` | `{block}` on success, `{error}` otherwise |
//! | POST `/api/report` | report info record |
//! | POST `/api/sync` | sync result record |
//!
//! Letter submission maps the error taxonomy onto HTTP: 400 for missing
//! fields, 503 for retryable pre-write failures (clients may safely
//! resubmit), 500 otherwise.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use courier_chain::RelayMetrics;
use serde::Deserialize;
use serde_json::json;

use crate::node::RelayNode;
use crate::RelayError;

/// Build the relay router.
pub fn router(node: Arc<RelayNode>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/blocks/full", get(full_blocks))
        .route("/api/letters", post(submit_letter))
        .route("/api/report", post(trigger_report))
        .route("/api/sync", post(trigger_sync))
        .with_state(node)
}

async fn status(State(node): State<Arc<RelayNode>>) -> Response {
    let summary = node.state.ledger.lock().await.manifest();
    let config = node.state.config.read().await.clone();
    let queue = node.pipeline.status();
    let last_conflict = node
        .state
        .last_conflict
        .lock()
        .expect("conflict lock poisoned")
        .clone();
    Json(json!({
        "summary": summary,
        "config": config,
        "queue": queue,
        "lastConflict": last_conflict,
    }))
    .into_response()
}

async fn full_blocks(State(node): State<Arc<RelayNode>>) -> Response {
    let blocks = node.state.ledger.lock().await.blocks().to_vec();
    Json(json!({ "blocks": blocks })).into_response()
}

/// Letter submission body.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LetterRequest {
    payload: Option<String>,
    owner_fingerprint: Option<String>,
    #[serde(default)]
    relay_metrics: Option<RelayMetrics>,
}

async fn submit_letter(
    State(node): State<Arc<RelayNode>>,
    Json(request): Json<LetterRequest>,
) -> Response {
    let payload = match request.payload.filter(|p| !p.is_empty()) {
        Some(p) => p,
        None => return error_response(&RelayError::InvalidInput("payload is required".into())),
    };
    let owner_fingerprint = match request.owner_fingerprint.filter(|f| !f.is_empty()) {
        Some(f) => f,
        None => {
            return error_response(&RelayError::InvalidInput(
                "ownerFingerprint is required".into(),
            ))
        }
    };

    let receiver = match node.pipeline.enqueue(
        payload,
        owner_fingerprint,
        request.relay_metrics.unwrap_or_default(),
    ) {
        Ok(rx) => rx,
        Err(error) => return error_response(&error),
    };

    match receiver.await {
        Ok(Ok(block)) => Json(json!({ "block": block })).into_response(),
        Ok(Err(error)) => error_response(&error),
        // The worker dropped the waiter without answering; treat as transient.
        Err(_) => error_response(&RelayError::TransientIo(
            "write worker unavailable".to_string(),
        )),
    }
}

async fn trigger_report(State(node): State<Arc<RelayNode>>) -> Response {
    Json(node.reporter.report("external").await).into_response()
}

async fn trigger_sync(State(node): State<Arc<RelayNode>>) -> Response {
    Json(node.sync.sync("external").await).into_response()
}

fn error_response(error: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}
