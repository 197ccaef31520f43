//! Reachability probing.
//!
//! A background poller walks every relay with a public URL, issues a GET to
//! `<url>/api/status` with a bounded timeout and records latency,
//! reachability and an interfering-firewall heuristic:
//!
//! - 2xx: `latencyMs = elapsed`, `reachability = 1`, `gfwBlocked = false`
//! - other status: `reachability = 0`, `gfwBlocked` only on 403
//! - network error: `reachability = 0`, `gfwBlocked` when the error class is
//!   one of connect-refused / reset / unreachable / timeout
//!
//! Probes for distinct relays run concurrently; their metric writes
//! serialize through the registry's writer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::registry::{ProbeMetrics, Registry};

/// Default probe interval: 3 minutes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(180);

/// Default per-probe timeout: 8 seconds.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Read a millisecond duration from the environment, falling back to
/// `default` when the variable is missing or not a positive integer.
pub fn duration_from_env_ms(var: &str, default: Duration) -> Duration {
    match std::env::var(var) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => Duration::from_millis(ms),
            _ => {
                warn!(var, value = %raw, "Ignoring invalid duration override");
                default
            }
        },
        Err(_) => default,
    }
}

/// Probe one relay's status endpoint and classify the outcome.
pub async fn probe_relay(client: &reqwest::Client, url: &str, timeout: Duration) -> ProbeMetrics {
    let endpoint = format!("{}/api/status", url.trim_end_matches('/'));
    let started = Instant::now();
    match client.get(&endpoint).timeout(timeout).send().await {
        Ok(response) if response.status().is_success() => ProbeMetrics {
            latency_ms: Some(started.elapsed().as_millis() as u64),
            reachability: 1.0,
            gfw_blocked: false,
        },
        Ok(response) => ProbeMetrics {
            latency_ms: None,
            reachability: 0.0,
            gfw_blocked: response.status() == StatusCode::FORBIDDEN,
        },
        Err(error) => ProbeMetrics {
            latency_ms: None,
            reachability: 0.0,
            gfw_blocked: is_interference_error(&error),
        },
    }
}

/// Whether a transport error looks like firewall interference rather than a
/// plain outage: refused / reset / unreachable connects and timeouts.
fn is_interference_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

/// Background reachability poller.
pub struct Prober {
    registry: Arc<Registry>,
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
}

impl Prober {
    /// Create a poller over `registry` with explicit intervals.
    pub fn new(
        registry: Arc<Registry>,
        client: reqwest::Client,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            client,
            interval,
            timeout,
        }
    }

    /// Create a poller with intervals from the environment
    /// (`DIRECTORY_METRICS_INTERVAL_MS`, `DIRECTORY_METRICS_TIMEOUT_MS`).
    pub fn from_env(registry: Arc<Registry>, client: reqwest::Client) -> Self {
        Self::new(
            registry,
            client,
            duration_from_env_ms("DIRECTORY_METRICS_INTERVAL_MS", DEFAULT_PROBE_INTERVAL),
            duration_from_env_ms("DIRECTORY_METRICS_TIMEOUT_MS", DEFAULT_PROBE_TIMEOUT),
        )
    }

    /// Run until `shutdown` flips to `true`. One iteration probes every relay
    /// with a public URL concurrently, then records results through the
    /// registry writer.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all().await,
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        debug!("Reachability poller stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Probe every relay with a public URL once.
    pub async fn probe_all(&self) {
        let (relays, _) = self.registry.snapshot().await;
        let mut probes = JoinSet::new();
        for relay in relays {
            let Some(url) = relay.reachable_url().map(str::to_string) else {
                continue;
            };
            let client = self.client.clone();
            let timeout = self.timeout;
            let onion = relay.onion.clone();
            probes.spawn(async move {
                let metrics = probe_relay(&client, &url, timeout).await;
                (onion, metrics)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((onion, metrics)) => {
                    debug!(
                        onion,
                        reachability = metrics.reachability,
                        latency_ms = ?metrics.latency_ms,
                        gfw_blocked = metrics.gfw_blocked,
                        "Probe finished"
                    );
                    if let Err(error) = self.registry.record_probe(&onion, metrics).await {
                        warn!(onion, error = %error, "Failed to record probe result");
                    }
                }
                Err(error) => warn!(error = %error, "Probe task panicked"),
            }
        }
    }
}
