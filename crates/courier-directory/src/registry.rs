//! The relay registry.
//!
//! The directory's table of known relays, keyed by onion address, plus the
//! canonical manifest: the longest chain manifest observed across all
//! reporting relays. The canonical manifest only ever grows.
//!
//! All mutations funnel through a single writer (the lock in [`Registry`])
//! and every mutation persists the full state document to
//! `directory-state.json` with write-to-temp-then-rename, so readers always
//! observe either the pre- or post-state of an upsert.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::Utc;
use courier_chain::{manifest_divergence, ChainManifest};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::record::{
    timestamp, ConnectionMeta, HeartbeatPayload, HeartbeatResponse, RelayRecord, SyncStatus,
};
use crate::{DirectoryError, Result};

/// File name of the persisted registry document.
const STATE_FILE: &str = "directory-state.json";

/// Metrics source tag for self-reported values.
const SOURCE_SELF_REPORT: &str = "selfReport";

/// Metrics source tag for directory probes.
const SOURCE_PROBE: &str = "directoryProbe";

/// Persisted registry document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryState {
    relays: Vec<RelayRecord>,
    canonical_manifest: Option<ChainManifest>,
}

/// Metrics recorded by a reachability probe.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProbeMetrics {
    /// Round-trip time of a successful probe.
    pub latency_ms: Option<u64>,
    /// 1.0 on success, 0.0 otherwise.
    pub reachability: f64,
    /// Whether the failure pattern looks like firewall interference.
    pub gfw_blocked: bool,
}

/// Directory-side registry of known relays.
#[derive(Debug)]
pub struct Registry {
    state_path: PathBuf,
    state: RwLock<DirectoryState>,
}

impl Registry {
    /// Open the registry under `directory_root`, loading persisted state if
    /// present.
    pub fn open(directory_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory_root)?;
        let state_path = directory_root.join(STATE_FILE);
        let state = if state_path.exists() {
            let raw = std::fs::read_to_string(&state_path)?;
            if raw.trim().is_empty() {
                DirectoryState::default()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            DirectoryState::default()
        };
        Ok(Self {
            state_path,
            state: RwLock::new(state),
        })
    }

    /// Process a heartbeat: merge or create the relay record, refresh the
    /// canonical manifest and re-evaluate sync statuses.
    pub async fn upsert(
        &self,
        payload: HeartbeatPayload,
        client_ip: Option<String>,
        forwarded_for: Option<String>,
    ) -> Result<HeartbeatResponse> {
        if payload.onion.trim().is_empty() {
            return Err(DirectoryError::InvalidHeartbeat(
                "onion must not be empty".to_string(),
            ));
        }

        let now = timestamp(Utc::now());
        let mut state = self.state.write().await;

        let reported_url = payload.public_url.clone();
        let resolved_url = resolve_public_url(reported_url.as_deref(), client_ip.as_deref());

        let index = match state.relays.iter().position(|r| r.onion == payload.onion) {
            Some(index) => index,
            None => {
                let fingerprint = payload
                    .fingerprint
                    .clone()
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(synthesize_fingerprint);
                info!(onion = %payload.onion, "New relay registered");
                state.relays.push(RelayRecord {
                    id: payload.onion.clone(),
                    onion: payload.onion.clone(),
                    public_url: None,
                    public_access_url: None,
                    nickname: None,
                    fingerprint,
                    created_at: now.clone(),
                    last_seen: now.clone(),
                    last_seen_ip: None,
                    connection_meta: ConnectionMeta::default(),
                    chain_summary: None,
                    latency_ms: None,
                    reachability: None,
                    gfw_blocked: None,
                    metrics_sampled_at: None,
                    metrics_source: None,
                    sync_status: SyncStatus::default(),
                });
                state.relays.len() - 1
            }
        };
        let record = &mut state.relays[index];

        record.last_seen = now.clone();
        record.last_seen_ip = client_ip.clone();
        if let Some(url) = resolved_url.clone().or(reported_url.clone()) {
            record.public_url = Some(url);
        }
        if let Some(access) = payload.public_access_url.clone() {
            record.public_access_url = Some(access);
        }
        if let Some(nickname) = payload.nickname.clone() {
            record.nickname = Some(nickname);
        }
        if let Some(fingerprint) = payload.fingerprint.clone().filter(|f| !f.is_empty()) {
            record.fingerprint = fingerprint;
        }
        record.connection_meta = ConnectionMeta {
            reported_url,
            resolved_url,
            client_ip,
            forwarded_for,
        };
        if let Some(manifest) = payload.chain_summary.clone() {
            record.chain_summary = Some(manifest);
        }
        if payload.latency_ms.is_some()
            || payload.reachability.is_some()
            || payload.gfw_blocked.is_some()
        {
            if let Some(latency) = payload.latency_ms {
                record.latency_ms = Some(latency);
            }
            if let Some(reachability) = payload.reachability {
                record.reachability = Some(reachability);
            }
            if let Some(gfw) = payload.gfw_blocked {
                record.gfw_blocked = Some(gfw);
            }
            record.metrics_sampled_at = Some(now.clone());
            record.metrics_source = Some(SOURCE_SELF_REPORT.to_string());
        }
        let reporter_onion = record.onion.clone();

        // Canonical manifest only ever grows.
        if let Some(reported) = payload.chain_summary {
            let canonical_len = state
                .canonical_manifest
                .as_ref()
                .map(|m| m.length)
                .unwrap_or(0);
            if reported.length > canonical_len {
                info!(
                    from = canonical_len,
                    to = reported.length,
                    "Canonical manifest advanced"
                );
                state.canonical_manifest = Some(reported);
            }
        }

        // Re-evaluate every relay against the (possibly new) canonical.
        let canonical = state.canonical_manifest.clone();
        for relay in &mut state.relays {
            relay.sync_status = evaluate_sync_status(relay.chain_summary.as_ref(), canonical.as_ref(), &now);
        }

        let response = HeartbeatResponse {
            relay: state
                .relays
                .iter()
                .find(|r| r.onion == reporter_onion)
                .expect("reporter record exists")
                .clone(),
            genesis_hash: state
                .canonical_manifest
                .as_ref()
                .and_then(|m| m.hashes.first().cloned()),
        };

        self.persist(&state)?;
        Ok(response)
    }

    /// Record the outcome of a reachability probe.
    pub async fn record_probe(&self, onion: &str, metrics: ProbeMetrics) -> Result<()> {
        let now = timestamp(Utc::now());
        let mut state = self.state.write().await;
        if let Some(record) = state.relays.iter_mut().find(|r| r.onion == onion) {
            record.latency_ms = metrics.latency_ms;
            record.reachability = Some(metrics.reachability);
            record.gfw_blocked = Some(metrics.gfw_blocked);
            record.metrics_sampled_at = Some(now.clone());
            record.metrics_source = Some(SOURCE_PROBE.to_string());
            record.last_seen = now;
            self.persist(&state)?;
        } else {
            debug!(onion, "Probe result for unknown relay dropped");
        }
        Ok(())
    }

    /// Snapshot the relay table and canonical manifest.
    pub async fn snapshot(&self) -> (Vec<RelayRecord>, Option<ChainManifest>) {
        let state = self.state.read().await;
        (state.relays.clone(), state.canonical_manifest.clone())
    }

    /// The current canonical manifest.
    pub async fn canonical_manifest(&self) -> Option<ChainManifest> {
        self.state.read().await.canonical_manifest.clone()
    }

    fn persist(&self, state: &DirectoryState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }
}

/// Compare a relay's manifest against the canonical one.
fn evaluate_sync_status(
    relay: Option<&ChainManifest>,
    canonical: Option<&ChainManifest>,
    now: &str,
) -> SyncStatus {
    let canonical = match canonical {
        Some(c) => c,
        None => return SyncStatus::default(),
    };
    let relay = match relay {
        Some(r) => r,
        None => {
            return SyncStatus {
                needs_sync: true,
                missing_count: Some(canonical.length),
                checked_at: Some(now.to_string()),
                ..SyncStatus::default()
            }
        }
    };

    if let Some(diverge_at) = manifest_divergence(&relay.hashes, &canonical.hashes) {
        return SyncStatus {
            needs_repair: true,
            diverge_at: Some(diverge_at as u64),
            checked_at: Some(now.to_string()),
            ..SyncStatus::default()
        };
    }
    if relay.length < canonical.length {
        return SyncStatus {
            needs_sync: true,
            missing_count: Some(canonical.length - relay.length),
            checked_at: Some(now.to_string()),
            ..SyncStatus::default()
        };
    }
    SyncStatus {
        checked_at: Some(now.to_string()),
        ..SyncStatus::default()
    }
}

/// Substitute a loopback host in a reported URL with the observed client
/// address. Returns `None` when no substitution applies.
fn resolve_public_url(reported: Option<&str>, client_ip: Option<&str>) -> Option<String> {
    let reported = reported?;
    let client_ip = client_ip?;

    let client_is_loopback = client_ip
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(true);
    if client_is_loopback {
        return None;
    }

    let mut parsed = Url::parse(reported).ok()?;
    let host = parsed.host_str()?;
    let host_is_loopback = host == "localhost"
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback() || ip.is_unspecified())
            .unwrap_or(false);
    if !host_is_loopback {
        return None;
    }

    parsed.set_host(Some(client_ip)).ok()?;
    Some(parsed.to_string())
}

/// Random stable identity for a relay that reported without one.
fn synthesize_fingerprint() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_chain::Block;
    use tempfile::TempDir;

    fn manifest_of_length(len: usize) -> ChainManifest {
        let now = Utc::now();
        let mut blocks = vec![Block::genesis(now)];
        for _ in 1..len {
            let prev = blocks.last().unwrap();
            blocks.push(Block::next(
                prev,
                vec![],
                Default::default(),
                "empty".into(),
                now,
            ));
        }
        ChainManifest::from_blocks(&blocks)
    }

    fn heartbeat(onion: &str, manifest: Option<ChainManifest>) -> HeartbeatPayload {
        HeartbeatPayload {
            onion: onion.into(),
            public_url: Some(format!("http://{}:8080", onion)),
            chain_summary: manifest,
            ..HeartbeatPayload::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_record_with_synthesized_fingerprint() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        let response = registry
            .upsert(heartbeat("relay-1", None), None, None)
            .await
            .unwrap();
        assert_eq!(response.relay.id, "relay-1");
        assert_eq!(response.relay.onion, "relay-1");
        assert!(!response.relay.fingerprint.is_empty());
        assert!(response.genesis_hash.is_none());
    }

    #[tokio::test]
    async fn test_upsert_rejects_empty_onion() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        let err = registry
            .upsert(heartbeat("", None), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidHeartbeat(_)));
    }

    #[tokio::test]
    async fn test_upsert_twice_changes_only_last_seen() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        let payload = HeartbeatPayload {
            fingerprint: Some("stable-fp".into()),
            nickname: Some("kiosk".into()),
            ..heartbeat("relay-1", Some(manifest_of_length(2)))
        };
        let first = registry
            .upsert(payload.clone(), Some("203.0.113.9".into()), None)
            .await
            .unwrap()
            .relay;
        let second = registry
            .upsert(payload, Some("203.0.113.9".into()), None)
            .await
            .unwrap()
            .relay;

        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(first.nickname, second.nickname);
        assert_eq!(first.chain_summary, second.chain_summary);
        assert_eq!(first.sync_status.needs_sync, second.sync_status.needs_sync);
        assert_eq!(first.sync_status.needs_repair, second.sync_status.needs_repair);
        assert!(second.last_seen >= first.last_seen);
    }

    #[tokio::test]
    async fn test_canonical_manifest_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        registry
            .upsert(heartbeat("relay-1", Some(manifest_of_length(3))), None, None)
            .await
            .unwrap();
        assert_eq!(registry.canonical_manifest().await.unwrap().length, 3);

        registry
            .upsert(heartbeat("relay-2", Some(manifest_of_length(5))), None, None)
            .await
            .unwrap();
        assert_eq!(registry.canonical_manifest().await.unwrap().length, 5);

        // A shorter report never shrinks the canonical manifest.
        registry
            .upsert(heartbeat("relay-3", Some(manifest_of_length(2))), None, None)
            .await
            .unwrap();
        assert_eq!(registry.canonical_manifest().await.unwrap().length, 5);
    }

    #[tokio::test]
    async fn test_shorter_relay_flagged_needs_sync_with_missing_count() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        registry
            .upsert(heartbeat("relay-1", Some(manifest_of_length(3))), None, None)
            .await
            .unwrap();
        registry
            .upsert(heartbeat("relay-2", Some(manifest_of_length(5))), None, None)
            .await
            .unwrap();

        let (relays, canonical) = registry.snapshot().await;
        assert_eq!(canonical.unwrap().length, 5);
        let r1 = relays.iter().find(|r| r.onion == "relay-1").unwrap();
        assert!(r1.sync_status.needs_sync);
        assert_eq!(r1.sync_status.missing_count, Some(2));
        assert!(!r1.sync_status.needs_repair);
        let r2 = relays.iter().find(|r| r.onion == "relay-2").unwrap();
        assert!(!r2.sync_status.needs_sync);
    }

    #[tokio::test]
    async fn test_divergent_relay_flagged_needs_repair() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        // Two chains sharing no history diverge at the genesis.
        registry
            .upsert(heartbeat("relay-1", Some(manifest_of_length(2))), None, None)
            .await
            .unwrap();
        registry
            .upsert(heartbeat("relay-2", Some(manifest_of_length(4))), None, None)
            .await
            .unwrap();

        let (relays, _) = registry.snapshot().await;
        let r1 = relays.iter().find(|r| r.onion == "relay-1").unwrap();
        assert!(r1.sync_status.needs_repair);
        assert_eq!(r1.sync_status.diverge_at, Some(0));
    }

    #[tokio::test]
    async fn test_loopback_url_resolved_to_client_address() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        let payload = HeartbeatPayload {
            public_url: Some("http://127.0.0.1:9090".into()),
            ..heartbeat("relay-1", None)
        };
        let relay = registry
            .upsert(payload, Some("203.0.113.7".into()), None)
            .await
            .unwrap()
            .relay;

        assert_eq!(relay.public_url.as_deref(), Some("http://203.0.113.7:9090/"));
        assert_eq!(
            relay.connection_meta.reported_url.as_deref(),
            Some("http://127.0.0.1:9090")
        );
        assert_eq!(
            relay.connection_meta.resolved_url.as_deref(),
            Some("http://203.0.113.7:9090/")
        );
    }

    #[tokio::test]
    async fn test_loopback_client_does_not_rewrite_url() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        let payload = HeartbeatPayload {
            public_url: Some("http://127.0.0.1:9090".into()),
            ..heartbeat("relay-1", None)
        };
        let relay = registry
            .upsert(payload, Some("127.0.0.1".into()), None)
            .await
            .unwrap()
            .relay;
        assert_eq!(relay.public_url.as_deref(), Some("http://127.0.0.1:9090"));
        assert!(relay.connection_meta.resolved_url.is_none());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let registry = Registry::open(dir.path()).unwrap();
            registry
                .upsert(heartbeat("relay-1", Some(manifest_of_length(3))), None, None)
                .await
                .unwrap();
        }
        let reopened = Registry::open(dir.path()).unwrap();
        let (relays, canonical) = reopened.snapshot().await;
        assert_eq!(relays.len(), 1);
        assert_eq!(canonical.unwrap().length, 3);
    }

    #[tokio::test]
    async fn test_record_probe_updates_metrics() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        registry
            .upsert(heartbeat("relay-1", None), None, None)
            .await
            .unwrap();

        registry
            .record_probe(
                "relay-1",
                ProbeMetrics {
                    latency_ms: Some(42),
                    reachability: 1.0,
                    gfw_blocked: false,
                },
            )
            .await
            .unwrap();

        let (relays, _) = registry.snapshot().await;
        let r = &relays[0];
        assert_eq!(r.latency_ms, Some(42));
        assert_eq!(r.reachability, Some(1.0));
        assert_eq!(r.gfw_blocked, Some(false));
        assert_eq!(r.metrics_source.as_deref(), Some("directoryProbe"));
    }
}
