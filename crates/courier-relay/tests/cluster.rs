//! Cluster integration tests: a real directory, real relays and a real
//! client wired over HTTP on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

use courier_chain::{Block, RelayMetrics};
use courier_client::CourierClient;
use courier_crypto::LetterKeypair;
use courier_directory::{DirectoryApp, HeartbeatResponse, Registry, RelayRecord, SyncStatus};
use courier_relay::RelayNode;

/// Serve a router on an ephemeral port.
async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// Spin up a real directory on an ephemeral port.
async fn spawn_directory(data_dir: &std::path::Path) -> String {
    let registry = Arc::new(Registry::open(&data_dir.join("directory")).unwrap());
    let app = DirectoryApp {
        registry,
        http: reqwest::Client::new(),
    };
    let addr = serve(courier_directory::router(app)).await;
    format!("http://{}", addr)
}

/// Spin up a relay node and its HTTP API, pointed at `directory_url`.
async fn spawn_relay(data_dir: &std::path::Path, directory_url: &str) -> (Arc<RelayNode>, String) {
    let node = RelayNode::init(data_dir).unwrap();
    let addr = serve(courier_relay::http::router(Arc::clone(&node))).await;
    let url = format!("http://{}", addr);
    {
        let mut config = node.state.config.write().await;
        config.directory_url = Some(directory_url.to_string());
        config.public_url = Some(url.clone());
        config.save(&node.state.config_path).unwrap();
    }
    node.start().await;
    (node, url)
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_first_letter_on_fresh_relay() {
    let directory_dir = TempDir::new().unwrap();
    let relay_dir = TempDir::new().unwrap();
    let directory_url = spawn_directory(directory_dir.path()).await;
    let (node, relay_url) = spawn_relay(relay_dir.path(), &directory_url).await;

    // Single relay in the network: the pre-write sync hits the bootstrap
    // bypass and the write proceeds.
    let recipient = LetterKeypair::generate();
    let client = CourierClient::with_relay(&relay_url).unwrap();
    let block = client
        .send_letter(b"first letter", recipient.public_key())
        .await
        .unwrap();

    assert_eq!(block.index, 1);
    assert_eq!(block.letters.len(), 1);
    assert_eq!(block.letters[0].owner_fingerprint, recipient.fingerprint());
    {
        let ledger = node.state.ledger.lock().await;
        assert_eq!(ledger.len(), 2);
        assert_eq!(
            block.previous_hash.as_deref(),
            Some(ledger.blocks()[0].hash.as_str())
        );
    }

    // The recipient finds and decrypts the letter from the ledger.
    let letters = client.fetch_letters(&recipient).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].plaintext, b"first letter");
    assert_eq!(letters[0].block_index, 1);

    node.shutdown();
}

#[tokio::test]
async fn test_client_resolves_relay_through_directory() {
    let directory_dir = TempDir::new().unwrap();
    let relay_dir = TempDir::new().unwrap();
    let directory_url = spawn_directory(directory_dir.path()).await;
    let (node, _relay_url) = spawn_relay(relay_dir.path(), &directory_url).await;

    let recipient = LetterKeypair::generate();
    let client = CourierClient::new(&directory_url).unwrap();
    let block = client
        .send_letter(b"via directory", recipient.public_key())
        .await
        .unwrap();
    assert_eq!(block.index, 1);

    node.shutdown();
}

#[tokio::test]
async fn test_missing_fields_are_rejected_with_400() {
    let directory_dir = TempDir::new().unwrap();
    let relay_dir = TempDir::new().unwrap();
    let directory_url = spawn_directory(directory_dir.path()).await;
    let (node, relay_url) = spawn_relay(relay_dir.path(), &directory_url).await;

    let http = reqwest::Client::new();
    let response = http
        .post(format!("{}/api/letters", relay_url))
        .json(&json!({ "payload": "ENV" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = http
        .post(format!("{}/api/letters", relay_url))
        .json(&json!({ "ownerFingerprint": "FP" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    node.shutdown();
}

#[tokio::test]
async fn test_directory_tracks_canonical_and_flags_stale_relays() {
    let directory_dir = TempDir::new().unwrap();
    let relay_dir = TempDir::new().unwrap();
    let directory_url = spawn_directory(directory_dir.path()).await;
    let (node, relay_url) = spawn_relay(relay_dir.path(), &directory_url).await;

    // Commit a letter so the relay's next report carries a longer chain.
    let recipient = LetterKeypair::generate();
    let client = CourierClient::with_relay(&relay_url).unwrap();
    client
        .send_letter(b"grow the chain", recipient.public_key())
        .await
        .unwrap();
    // The post-write report is fire-and-forget; nudge explicitly.
    let http = reqwest::Client::new();
    http.post(format!("{}/api/report", relay_url))
        .send()
        .await
        .unwrap();

    let listing: serde_json::Value = http
        .get(format!("{}/api/relays", directory_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["manifest"]["length"], 2);
    assert_eq!(listing["relays"].as_array().unwrap().len(), 1);

    let best: serde_json::Value = http
        .get(format!("{}/api/relays/best", directory_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(best["onion"], node.state.identity.fingerprint.as_str());

    node.shutdown();
}

#[tokio::test]
async fn test_fork_resolution_replays_orphaned_letters() {
    // Local relay with one committed letter; a peer (faked) carries a longer
    // fork built on the same genesis. After sync the local chain must match
    // the peer and the orphaned letter must re-commit on top.
    let relay_dir = TempDir::new().unwrap();
    let node = RelayNode::init(relay_dir.path()).unwrap();

    let (genesis, orphan_payload) = {
        let mut ledger = node.state.ledger.lock().await;
        let block = ledger
            .append_letter_block("ENV_X".into(), "FP_X".into(), RelayMetrics::new())
            .unwrap();
        (ledger.blocks()[0].clone(), block.letters[0].payload.clone())
    };

    // Remote fork: same genesis, two different letter blocks.
    let now = Utc::now();
    let remote_b1 = Block::next(
        &genesis,
        vec![courier_chain::LetterEntry {
            owner_fingerprint: "FP_Y".into(),
            payload: "ENV_Y".into(),
        }],
        RelayMetrics::new(),
        "Letter for FP_Y".into(),
        now,
    );
    let remote_b2 = Block::next(
        &remote_b1,
        vec![courier_chain::LetterEntry {
            owner_fingerprint: "FP_Z".into(),
            payload: "ENV_Z".into(),
        }],
        RelayMetrics::new(),
        "Letter for FP_Z".into(),
        now,
    );
    let remote_chain = vec![genesis.clone(), remote_b1, remote_b2.clone()];

    // Fake peer serving the fork.
    let peer_chain = remote_chain.clone();
    let peer_router = Router::new().route(
        "/api/blocks/full",
        get(move || {
            let blocks = peer_chain.clone();
            async move { Json(json!({ "blocks": blocks })) }
        }),
    );
    let peer_addr = serve(peer_router).await;

    // Fake directory pointing at the peer.
    let peer_record = RelayRecord {
        id: "peer-relay".into(),
        onion: "peer-relay".into(),
        public_url: Some(format!("http://{}", peer_addr)),
        public_access_url: None,
        nickname: None,
        fingerprint: "peer-fp".into(),
        created_at: now.to_rfc3339(),
        last_seen: now.to_rfc3339(),
        last_seen_ip: None,
        connection_meta: Default::default(),
        chain_summary: None,
        latency_ms: Some(10),
        reachability: Some(1.0),
        gfw_blocked: Some(false),
        metrics_sampled_at: None,
        metrics_source: None,
        sync_status: SyncStatus::default(),
    };
    let ack = HeartbeatResponse {
        relay: peer_record.clone(),
        genesis_hash: None,
    };
    let directory_router = Router::new().route(
        "/api/relays",
        get(move || {
            let record = peer_record.clone();
            async move { Json(json!({ "relays": [record], "manifest": null })) }
        })
        .post(move |_body: Json<serde_json::Value>| {
            let ack = ack.clone();
            async move { Json(ack) }
        }),
    );
    let directory_addr = serve(directory_router).await;

    {
        let mut config = node.state.config.write().await;
        config.directory_url = Some(format!("http://{}", directory_addr));
        config.save(&node.state.config_path).unwrap();
    }
    node.start().await;

    let summary = node.sync.sync("test").await;
    match &summary {
        courier_relay::SyncSummary::Updated {
            replayed_letters, ..
        } => assert_eq!(*replayed_letters, 1),
        other => panic!("expected fork resolution, got {:?}", other),
    }

    // A snapshot of the losing fork exists.
    let conflict = node
        .state
        .last_conflict
        .lock()
        .unwrap()
        .clone()
        .expect("conflict recorded");
    assert_eq!(conflict.diverge_at, 1);
    assert_eq!(conflict.local_height, 2);
    assert_eq!(conflict.remote_height, 3);
    let backup = conflict.backup_path.expect("snapshot path");
    assert!(std::path::Path::new(&backup).exists());

    // The orphaned letter re-commits onto the new chain with a fresh block.
    let node_check = Arc::clone(&node);
    wait_for("orphan replay", move || {
        node_check
            .state
            .ledger
            .try_lock()
            .map(|l| l.len() == 4)
            .unwrap_or(false)
    })
    .await;

    let ledger = node.state.ledger.lock().await;
    let replayed = ledger.blocks().last().unwrap();
    assert_eq!(replayed.index, 3);
    assert_eq!(replayed.previous_hash.as_deref(), Some(remote_b2.hash.as_str()));
    assert_eq!(replayed.letters[0].owner_fingerprint, "FP_X");
    assert_eq!(replayed.letters[0].payload, orphan_payload);
    // The fork's letters survived the replacement too.
    assert_eq!(ledger.blocks()[1].letters[0].owner_fingerprint, "FP_Y");
    assert_eq!(ledger.blocks()[2].letters[0].owner_fingerprint, "FP_Z");

    drop(ledger);
    node.shutdown();
}

#[tokio::test]
async fn test_two_relays_converge_through_the_directory() {
    let directory_dir = TempDir::new().unwrap();
    let relay_a_dir = TempDir::new().unwrap();
    let relay_b_dir = TempDir::new().unwrap();

    let directory_url = spawn_directory(directory_dir.path()).await;
    let (node_a, relay_a_url) = spawn_relay(relay_a_dir.path(), &directory_url).await;
    let (node_b, _relay_b_url) = spawn_relay(relay_b_dir.path(), &directory_url).await;

    // B reported after A; the directory mandates A's canonical genesis and B
    // switches to it, then pulls A's chain.
    let genesis_a = node_a.state.ledger.lock().await.genesis_hash().unwrap().to_string();

    let recipient = LetterKeypair::generate();
    let client = CourierClient::with_relay(&relay_a_url).unwrap();
    client
        .send_letter(b"converge", recipient.public_key())
        .await
        .unwrap();

    // Nudge B to sync now rather than waiting for its timer.
    let http = reqwest::Client::new();
    let node_b_check = Arc::clone(&node_b);
    let genesis_a_check = genesis_a.clone();
    for _ in 0..100 {
        let _ = http
            .post(format!("{}/api/report", _relay_b_url))
            .send()
            .await;
        let _ = http.post(format!("{}/api/sync", _relay_b_url)).send().await;
        let done = {
            let ledger = node_b_check.state.ledger.lock().await;
            ledger.genesis_hash() == Some(genesis_a_check.as_str()) && ledger.len() == 2
        };
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let ledger_b = node_b.state.ledger.lock().await;
    assert_eq!(ledger_b.genesis_hash(), Some(genesis_a.as_str()));
    assert_eq!(ledger_b.len(), 2);
    drop(ledger_b);

    node_a.shutdown();
    node_b.shutdown();
}
