//! Relay records and heartbeat payloads.
//!
//! These are the wire and persistence shapes shared between the directory
//! and the relays that report to it.

use chrono::{DateTime, Utc};
use courier_chain::ChainManifest;
use serde::{Deserialize, Serialize};

/// Observed connection details for a relay's last report.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMeta {
    /// The `publicUrl` exactly as the relay reported it.
    pub reported_url: Option<String>,
    /// The URL after loopback substitution, if any.
    pub resolved_url: Option<String>,
    /// Client address the report arrived from.
    pub client_ip: Option<String>,
    /// Forwarded-for chain, when behind a proxy.
    pub forwarded_for: Option<String>,
}

/// How far a relay's chain is from the canonical manifest.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Relay is behind the canonical chain.
    pub needs_sync: bool,
    /// Relay diverges from the canonical chain within the shared prefix.
    pub needs_repair: bool,
    /// Blocks missing relative to canonical, when behind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_count: Option<u64>,
    /// First divergent index, when diverging.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diverge_at: Option<u64>,
    /// When the comparison was last made.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<String>,
}

/// Directory-side record of a known relay.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayRecord {
    /// Stable identifier, the relay's onion address.
    pub id: String,
    /// Onion address.
    pub onion: String,
    /// URL the relay runs on.
    pub public_url: Option<String>,
    /// URL external callers should use, when different.
    pub public_access_url: Option<String>,
    /// Operator-chosen display name.
    pub nickname: Option<String>,
    /// Stable per-relay identity, assigned on first appearance.
    pub fingerprint: String,
    /// When the relay first appeared.
    pub created_at: String,
    /// When the relay last reported or was probed.
    pub last_seen: String,
    /// Client address of the last report.
    pub last_seen_ip: Option<String>,
    /// Observed connection details.
    #[serde(default)]
    pub connection_meta: ConnectionMeta,
    /// Last reported chain manifest.
    pub chain_summary: Option<ChainManifest>,
    /// Last probe latency in milliseconds.
    pub latency_ms: Option<u64>,
    /// Reachability in `[0.0, 1.0]`.
    pub reachability: Option<f64>,
    /// Whether the relay appears blocked by an interfering firewall.
    pub gfw_blocked: Option<bool>,
    /// When the metrics were last sampled.
    pub metrics_sampled_at: Option<String>,
    /// Where the metrics came from (probe or self-report).
    pub metrics_source: Option<String>,
    /// Chain alignment relative to the canonical manifest.
    #[serde(default)]
    pub sync_status: SyncStatus,
}

impl RelayRecord {
    /// The URL peers should call: the access URL when set, else the public URL.
    pub fn reachable_url(&self) -> Option<&str> {
        self.public_access_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or(self.public_url.as_deref())
    }

    /// Reputation exposed by the directory API: `round(reachability * 100)`.
    pub fn reputation(&self) -> u32 {
        match self.reachability {
            Some(r) => (r * 100.0).round() as u32,
            None => 0,
        }
    }

    /// Length of the relay's last reported chain, 0 when unknown.
    pub fn chain_length(&self) -> u64 {
        self.chain_summary.as_ref().map(|m| m.length).unwrap_or(0)
    }
}

/// Heartbeat body POSTed by a relay to `/api/relays`.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    /// Onion address, the registry key.
    pub onion: String,
    /// URL the relay runs on.
    pub public_url: Option<String>,
    /// URL external callers should use.
    pub public_access_url: Option<String>,
    /// Operator-chosen display name.
    pub nickname: Option<String>,
    /// The relay's stable identity, when it has one.
    pub fingerprint: Option<String>,
    /// Self-reported latency.
    pub latency_ms: Option<u64>,
    /// Self-reported reachability.
    pub reachability: Option<f64>,
    /// Self-reported blockage flag.
    pub gfw_blocked: Option<bool>,
    /// Manifest of the relay's active chain.
    pub chain_summary: Option<ChainManifest>,
}

/// Response to a heartbeat: the stored record plus the canonical genesis.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    /// The relay record after the upsert.
    pub relay: RelayRecord,
    /// Genesis hash of the canonical manifest, when one exists.
    pub genesis_hash: Option<String>,
}

/// Format a timestamp the way records store them.
pub(crate) fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339()
}
