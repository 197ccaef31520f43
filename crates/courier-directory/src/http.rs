//! Directory HTTP API.
//!
//! | Method/Path | Response |
//! |---|---|
//! | GET `/api/relays` | `{relays: [...with reputation], manifest}` |
//! | GET `/api/relays/best` | best relay or `{onion: null, available: false}` |
//! | POST `/api/relays` | `{relay, genesisHash}` |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use courier_chain::ChainManifest;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::broadcast::broadcast_sync;
use crate::record::{HeartbeatPayload, RelayRecord};
use crate::registry::Registry;
use crate::selector::select_best_relay;
use crate::DirectoryError;

/// Shared state for the directory router.
#[derive(Clone)]
pub struct DirectoryApp {
    /// The relay registry.
    pub registry: Arc<Registry>,
    /// Outbound client used for broadcast nudges.
    pub http: reqwest::Client,
}

/// Build the directory router.
pub fn router(app: DirectoryApp) -> Router {
    Router::new()
        .route("/api/relays", get(list_relays).post(submit_heartbeat))
        .route("/api/relays/best", get(best_relay))
        .with_state(app)
}

/// A relay record decorated with its reputation for API consumers.
#[derive(Serialize)]
struct RelayWithReputation {
    #[serde(flatten)]
    record: RelayRecord,
    reputation: u32,
}

impl From<RelayRecord> for RelayWithReputation {
    fn from(record: RelayRecord) -> Self {
        let reputation = record.reputation();
        Self { record, reputation }
    }
}

#[derive(Serialize)]
struct RelayListResponse {
    relays: Vec<RelayWithReputation>,
    manifest: Option<ChainManifest>,
}

async fn list_relays(State(app): State<DirectoryApp>) -> Json<RelayListResponse> {
    let (relays, manifest) = app.registry.snapshot().await;
    Json(RelayListResponse {
        relays: relays.into_iter().map(RelayWithReputation::from).collect(),
        manifest,
    })
}

async fn best_relay(State(app): State<DirectoryApp>) -> Response {
    let (relays, canonical) = app.registry.snapshot().await;
    match select_best_relay(&relays, canonical.as_ref()) {
        Some(best) => Json(RelayWithReputation::from(best.clone())).into_response(),
        None => Json(json!({ "onion": null, "available": false })).into_response(),
    }
}

async fn submit_heartbeat(
    State(app): State<DirectoryApp>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<HeartbeatPayload>,
) -> Response {
    let (client_ip, forwarded_for) = client_address(&headers, addr);
    let onion = payload.onion.clone();

    match app.registry.upsert(payload, client_ip, forwarded_for).await {
        Ok(response) => {
            info!(
                onion,
                height = response.relay.chain_length(),
                "Heartbeat accepted"
            );
            // Nudge the other relays to pull; failures are their problem.
            let (relays, _) = app.registry.snapshot().await;
            broadcast_sync(&app.http, &relays, &onion);
            Json(response).into_response()
        }
        Err(error) => error_response(error),
    }
}

fn error_response(error: DirectoryError) -> Response {
    let status = match &error {
        DirectoryError::InvalidHeartbeat(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

/// Derive the observed client address: the first forwarded-for entry when one
/// is present, otherwise the socket peer.
fn client_address(headers: &HeaderMap, addr: SocketAddr) -> (Option<String>, Option<String>) {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let client_ip = forwarded
        .as_deref()
        .and_then(|chain| chain.split(',').next())
        .map(|first| first.trim().to_string())
        .filter(|first| !first.is_empty())
        .unwrap_or_else(|| addr.ip().to_string());
    (Some(client_ip), forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_address_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.5, 10.0.0.1".parse().unwrap());
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let (ip, forwarded) = client_address(&headers, addr);
        assert_eq!(ip.as_deref(), Some("203.0.113.5"));
        assert_eq!(forwarded.as_deref(), Some("203.0.113.5, 10.0.0.1"));
    }

    #[test]
    fn test_client_address_falls_back_to_socket_peer() {
        let headers = HeaderMap::new();
        let addr: SocketAddr = "192.0.2.4:9999".parse().unwrap();
        let (ip, forwarded) = client_address(&headers, addr);
        assert_eq!(ip.as_deref(), Some("192.0.2.4"));
        assert!(forwarded.is_none());
    }
}
