//! Relay node assembly.
//!
//! Wires the ledger, write pipeline, sync engine and reporter together and
//! runs the background loops: the queue worker, the report timer and the
//! sync timer. A startup report fires once before the timers begin. All
//! loops stop when the shutdown signal flips; in-flight writes finish their
//! append, the queue stays persisted and resumes on restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use courier_chain::Ledger;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::identity::RelayIdentity;
use crate::queue::{PendingEntry, WritePipeline};
use crate::report::{ReportInfo, Reporter};
use crate::sync::{ConflictRecord, SyncEngine};
use crate::{RelayError, Result};

/// Timeout for outbound HTTP calls made by the relay.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared by every relay subsystem.
pub struct RelayState {
    /// `<dataDir>/relay`.
    pub relay_root: PathBuf,
    /// Path of the persisted config.
    pub config_path: PathBuf,
    /// Relay configuration; mutable for genesis switches and config updates.
    pub config: RwLock<RelayConfig>,
    /// Stable relay identity.
    pub identity: RelayIdentity,
    /// The active chain. The ledger is the only writer of the chain file.
    pub ledger: Mutex<Ledger>,
    /// Outbound HTTP client.
    pub http: reqwest::Client,
    /// Diagnostic breadcrumb of the last fork resolution.
    pub last_conflict: std::sync::Mutex<Option<ConflictRecord>>,
    /// Outcome of the last report attempt.
    pub last_report: std::sync::Mutex<Option<ReportInfo>>,
}

/// A fully wired relay node.
pub struct RelayNode {
    /// Shared state.
    pub state: Arc<RelayState>,
    /// The letter write pipeline.
    pub pipeline: Arc<WritePipeline>,
    /// The chain sync engine.
    pub sync: Arc<SyncEngine>,
    /// The heartbeat reporter.
    pub reporter: Arc<Reporter>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RelayNode {
    /// Initialize a relay under `data_dir`.
    ///
    /// Loads (or creates) the identity and config, applies access-URL
    /// alignment, opens the ledger on the configured active genesis (writing
    /// a fresh genesis on first start) and persists the resulting genesis
    /// back into the config.
    pub fn init(data_dir: &Path) -> Result<Arc<Self>> {
        let relay_root = data_dir.join("relay");
        std::fs::create_dir_all(&relay_root).map_err(|e| RelayError::TransientIo(e.to_string()))?;

        let identity = RelayIdentity::load_or_create(&relay_root.join("identity.json"))?;
        let config_path = relay_root.join("config.json");
        let mut config = RelayConfig::load(&config_path)?;
        if config.onion.is_empty() {
            // A relay without an onion still needs a stable registry key.
            config.onion = identity.fingerprint.clone();
        }

        let ledger = Ledger::open(&relay_root, config.active_genesis_hash.as_deref())?;
        let genesis = ledger.genesis_hash().map(str::to_string);
        if genesis.is_some() && config.active_genesis_hash != genesis {
            config.active_genesis_hash = genesis;
        }
        config.save(&config_path)?;

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| RelayError::TransientIo(e.to_string()))?;

        let state = Arc::new(RelayState {
            relay_root: relay_root.clone(),
            config_path,
            config: RwLock::new(config),
            identity,
            ledger: Mutex::new(ledger),
            http,
            last_conflict: std::sync::Mutex::new(None),
            last_report: std::sync::Mutex::new(None),
        });

        let pipeline = Arc::new(WritePipeline::open(relay_root.join("pending-letters.json"))?);
        let sync = Arc::new(SyncEngine::new(Arc::clone(&state), Arc::clone(&pipeline)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reporter = Arc::new(Reporter::new(Arc::clone(&state), shutdown_rx.clone()));

        info!(
            fingerprint = %state.identity.fingerprint,
            root = %relay_root.display(),
            "Relay initialized"
        );
        Ok(Arc::new(Self {
            state,
            pipeline,
            sync,
            reporter,
            shutdown_tx,
            shutdown_rx,
        }))
    }

    /// A receiver of the shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Flip the shutdown signal; background loops stop at their next
    /// suspension point.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Start the background loops: queue worker (supervised), startup
    /// report, report timer and sync timer.
    pub async fn start(self: &Arc<Self>) {
        self.spawn_queue_worker();

        // Startup report fires once before the timers begin.
        let _ = self.reporter.report("startup").await;

        let (report_interval, sync_interval) = {
            let config = self.state.config.read().await;
            (config.report_interval(), config.sync_interval())
        };

        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + report_interval;
            let mut ticker = tokio::time::interval_at(start, report_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { let _ = node.reporter.report("timer").await; }
                    _ = shutdown.changed() => return,
                }
            }
        });

        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + sync_interval;
            let mut ticker = tokio::time::interval_at(start, sync_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = node.sync.sync("timer").await;
                        tracing::debug!(outcome = ?summary, "Periodic sync finished");
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    /// Spawn the single queue worker under a supervisor: if the worker dies
    /// unexpectedly it is restarted after the default retry delay.
    fn spawn_queue_worker(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                let pipeline = Arc::clone(&node.pipeline);
                let commit_node = Arc::clone(&node);
                let worker = tokio::spawn(pipeline.run(
                    move |entry| commit_letter(Arc::clone(&commit_node), entry),
                    node.shutdown_rx.clone(),
                ));
                match worker.await {
                    Ok(()) => return,
                    Err(error) => {
                        warn!(error = %error, "Queue worker died, restarting");
                        tokio::select! {
                            _ = tokio::time::sleep(crate::queue::DEFAULT_RETRY_DELAY) => {}
                            _ = shutdown.changed() => return,
                        }
                    }
                }
            }
        });
    }
}

/// Commit one queued letter: pre-write sync, append against the post-sync
/// tail, then a fire-and-forget report.
async fn commit_letter(
    node: Arc<RelayNode>,
    entry: PendingEntry,
) -> Result<courier_chain::Block> {
    // Pre-write sync; the bootstrap bypass is the only acceptable skip.
    let summary = node.sync.sync("preWrite").await;
    if let Some(error) = summary.blocking_error() {
        return Err(error);
    }

    // The sync may have changed the tail; the append builds on whatever the
    // tail is now.
    let block = {
        let mut ledger = node.state.ledger.lock().await;
        ledger.append_letter_block(
            entry.letter_payload,
            entry.owner_fingerprint,
            entry.relay_metrics,
        )?
    };

    // Report failure is logged inside the reporter, never fatal here.
    let reporter = Arc::clone(&node.reporter);
    tokio::spawn(async move {
        let _ = reporter.report("postWrite").await;
    });

    Ok(block)
}
