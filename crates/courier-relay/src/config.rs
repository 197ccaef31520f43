//! Relay configuration.
//!
//! Persisted at `<relayRoot>/config.json`. Interval overrides come from the
//! environment (`RELAY_REPORT_INTERVAL_MS`, `RELAY_SYNC_INTERVAL_MS`); a
//! missing or invalid value falls back to its documented default.
//!
//! ## Public access URL alignment
//!
//! A relay carries both a `publicUrl` (what it runs on) and an optional
//! `publicAccessUrl` (what external callers should use). Whenever the config
//! is loaded or updated, a non-empty access URL forces `publicUrl` to match,
//! so every report and every peer sees the externally reachable address.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{RelayError, Result};

/// Default heartbeat report interval.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(120);

/// Default chain sync interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Self-reported metrics a relay includes in heartbeats.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsConfig {
    /// Self-reported latency in milliseconds.
    pub latency_ms: Option<u64>,
    /// Self-reported reachability in `[0.0, 1.0]`.
    pub reachability: Option<f64>,
    /// Self-reported blockage flag.
    pub gfw_blocked: Option<bool>,
}

/// Relay configuration document.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// Base URL of the directory authority.
    pub directory_url: Option<String>,
    /// Onion address, the relay's stable identifier.
    pub onion: String,
    /// URL the relay runs on.
    pub public_url: Option<String>,
    /// URL external callers should use, when different.
    pub public_access_url: Option<String>,
    /// Operator-chosen display name.
    pub nickname: Option<String>,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval: Option<u64>,
    /// Self-reported metrics.
    pub metrics: MetricsConfig,
    /// Genesis hash of the active chain.
    pub active_genesis_hash: Option<String>,
}

impl RelayConfig {
    /// Load the config from `path`, or start from defaults when absent.
    /// Access-URL alignment is applied before returning.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| RelayError::TransientIo(e.to_string()))?;
            if raw.trim().is_empty() {
                Self::default()
            } else {
                serde_json::from_str(&raw)
                    .map_err(|e| RelayError::InvalidInput(format!("config.json: {}", e)))?
            }
        } else {
            Self::default()
        };
        config.align_access_url();
        Ok(config)
    }

    /// Persist the config at `path` with write-to-temp-then-rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RelayError::TransientIo(e.to_string()))?;
        }
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| RelayError::TransientIo(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| RelayError::TransientIo(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| RelayError::TransientIo(e.to_string()))?;
        Ok(())
    }

    /// Force `publicUrl` to the access URL when one is set.
    pub fn align_access_url(&mut self) {
        if let Some(access) = self.public_access_url.as_deref() {
            if !access.is_empty() {
                self.public_url = Some(access.to_string());
            }
        }
    }

    /// The URL to report to peers: access URL when set, else public URL.
    pub fn reachable_url(&self) -> Option<&str> {
        self.public_access_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or(self.public_url.as_deref())
    }

    /// Effective report interval: environment override, then config, then
    /// the 120-second default.
    pub fn report_interval(&self) -> Duration {
        duration_from_env_ms("RELAY_REPORT_INTERVAL_MS").unwrap_or_else(|| {
            self.heartbeat_interval
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REPORT_INTERVAL)
        })
    }

    /// Effective sync interval: environment override or the 60-second default.
    pub fn sync_interval(&self) -> Duration {
        duration_from_env_ms("RELAY_SYNC_INTERVAL_MS").unwrap_or(DEFAULT_SYNC_INTERVAL)
    }
}

/// Parse a millisecond duration from the environment; `None` when the
/// variable is missing or invalid.
fn duration_from_env_ms(var: &str) -> Option<Duration> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            warn!(var, value = %raw, "Ignoring invalid interval override");
            None
        }
    }
}
