//! Heartbeat reporting to the directory.
//!
//! Reports are single-flight: a caller arriving while one is in progress
//! joins that result. On failure the consecutive-failure counter grows and a
//! one-shot retry fires after `min(30s, 2s * failures)`; at most one retry
//! timer is outstanding. An externally triggered report does not clear a
//! pending retry timer; the single-flight join makes the overlap harmless.
//!
//! On a successful report the directory may answer with a canonical genesis
//! different from the local one; the relay then switches its active chain to
//! that genesis and records the switch in the report info. The pending queue
//! is left alone; queued letters commit onto the new chain on the next
//! drain.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_directory::{HeartbeatPayload, HeartbeatResponse};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::node::RelayState;
use crate::single_flight::SingleFlight;

/// Ceiling for the report retry backoff.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Backoff step per consecutive failure.
const RETRY_BACKOFF_STEP: Duration = Duration::from_secs(2);

/// Outcome of one report attempt.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportInfo {
    /// Whether the directory acknowledged the report.
    pub delivered: bool,
    /// What prompted the report.
    pub trigger: String,
    /// Directory endpoint the report went to.
    pub endpoint: Option<String>,
    /// Chain height included in the report.
    pub height: u64,
    /// Genesis the relay switched to, when the directory mandated one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genesis_switched_to: Option<String>,
    /// Failure description, when not delivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Scheduled retry backoff, when not delivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    /// Consecutive failures so far.
    pub consecutive_failures: u32,
    /// When the attempt finished.
    pub at: String,
}

/// Single-flight heartbeat reporter.
pub struct Reporter {
    state: Arc<RelayState>,
    flight: SingleFlight<ReportInfo>,
    failures: AtomicU32,
    retry_pending: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

impl Reporter {
    /// Create the reporter over shared relay state.
    pub fn new(state: Arc<RelayState>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            state,
            flight: SingleFlight::new(),
            failures: AtomicU32::new(0),
            retry_pending: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Report to the directory, or join the report already in flight.
    pub async fn report(self: &Arc<Self>, trigger: &str) -> ReportInfo {
        let reporter = Arc::clone(self);
        let trigger = trigger.to_string();
        let info = self
            .flight
            .run(move || async move { reporter.report_once(trigger).await })
            .await;
        *self
            .state
            .last_report
            .lock()
            .expect("report lock poisoned") = Some(info.clone());
        info
    }

    async fn report_once(self: Arc<Self>, trigger: String) -> ReportInfo {
        let config = self.state.config.read().await.clone();
        let manifest = self.state.ledger.lock().await.manifest();
        let height = manifest.length;

        let Some(directory_url) = config.directory_url.clone().filter(|u| !u.is_empty()) else {
            return ReportInfo {
                delivered: false,
                trigger,
                endpoint: None,
                height,
                genesis_switched_to: None,
                error: Some("No directory configured".to_string()),
                backoff_ms: None,
                consecutive_failures: self.failures.load(Ordering::SeqCst),
                at: Utc::now().to_rfc3339(),
            };
        };
        let endpoint = format!("{}/api/relays", directory_url.trim_end_matches('/'));

        let payload = HeartbeatPayload {
            onion: config.onion.clone(),
            public_url: config.reachable_url().map(str::to_string),
            public_access_url: config.public_access_url.clone(),
            nickname: config.nickname.clone(),
            fingerprint: Some(self.state.identity.fingerprint.clone()),
            latency_ms: config.metrics.latency_ms,
            reachability: config.metrics.reachability,
            gfw_blocked: config.metrics.gfw_blocked,
            chain_summary: Some(manifest),
        };

        let result = self.state.http.post(&endpoint).json(&payload).send().await;
        match result {
            Ok(response) if response.status().is_success() => {
                match response.json::<HeartbeatResponse>().await {
                    Ok(ack) => {
                        self.failures.store(0, Ordering::SeqCst);
                        let switched = self.apply_genesis(&ack).await;
                        info!(trigger = %trigger, height, "Report delivered");
                        ReportInfo {
                            delivered: true,
                            trigger,
                            endpoint: Some(endpoint),
                            height,
                            genesis_switched_to: switched,
                            error: None,
                            backoff_ms: None,
                            consecutive_failures: 0,
                            at: Utc::now().to_rfc3339(),
                        }
                    }
                    Err(error) => {
                        self.failed(trigger, endpoint, height, format!("Malformed ack: {}", error))
                    }
                }
            }
            Ok(response) => {
                let status = response.status();
                self.failed(trigger, endpoint, height, format!("Directory answered {}", status))
            }
            Err(error) => self.failed(trigger, endpoint, height, error.to_string()),
        }
    }

    /// Switch the active chain when the directory mandates a different
    /// genesis. Returns the genesis switched to, if any.
    async fn apply_genesis(&self, ack: &HeartbeatResponse) -> Option<String> {
        let mandated = ack.genesis_hash.as_deref()?;
        let mut ledger = self.state.ledger.lock().await;
        if ledger.genesis_hash() == Some(mandated) {
            return None;
        }
        if let Err(error) = ledger.switch_genesis(mandated) {
            warn!(genesis = mandated, error = %error, "Failed to switch to mandated genesis");
            return None;
        }
        drop(ledger);

        let mut config = self.state.config.write().await;
        config.active_genesis_hash = Some(mandated.to_string());
        if let Err(error) = config.save(&self.state.config_path) {
            warn!(error = %error, "Failed to persist active genesis");
        }
        info!(genesis = mandated, "Switched active chain per directory");
        Some(mandated.to_string())
    }

    fn failed(
        self: Arc<Self>,
        trigger: String,
        endpoint: String,
        height: u64,
        error: String,
    ) -> ReportInfo {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        let backoff = (RETRY_BACKOFF_STEP * failures).min(MAX_RETRY_BACKOFF);
        warn!(failures, error = %error, "Report failed, scheduling retry");
        self.clone().schedule_retry(backoff);
        ReportInfo {
            delivered: false,
            trigger,
            endpoint: Some(endpoint),
            height,
            genesis_switched_to: None,
            error: Some(error),
            backoff_ms: Some(backoff.as_millis() as u64),
            consecutive_failures: failures,
            at: Utc::now().to_rfc3339(),
        }
    }

    /// Arm the one-shot retry timer; at most one is outstanding.
    fn schedule_retry(self: Arc<Self>, backoff: Duration) {
        if self.retry_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {
                    self.retry_pending.store(false, Ordering::SeqCst);
                    let _ = self.report("retryTimer").await;
                }
                _ = shutdown.changed() => {
                    self.retry_pending.store(false, Ordering::SeqCst);
                }
            }
        });
    }
}
