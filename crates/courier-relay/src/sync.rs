//! Chain synchronization and fork resolution.
//!
//! Brings the local chain into alignment with an authoritative peer chain:
//!
//! 1. Ask the directory for the relay list and pick the best peer
//!    (excluding this relay).
//! 2. Fetch the peer's full block list.
//! 3. Walk both chains in lock-step to find the divergence point.
//! 4. Clean extension: replace. Fork with a remote at least as long past the
//!    divergence: snapshot the losing local fork, harvest its letters into
//!    the write queue, force-replace, record the conflict and trigger a
//!    drain so the orphans re-commit onto the new chain.
//!
//! ## Pre-write sync
//!
//! The write pipeline calls [`SyncEngine::sync`] before every append. Only
//! one sync runs at a time across the relay; concurrent callers join the
//! in-flight result. The distinguished reason
//! [`NO_ALTERNATE_RELAY_REASON`] is the single bootstrap bypass: a relay
//! alone in the network may write without having reconciled first.

use std::sync::Arc;

use chrono::Utc;
use courier_chain::{divergence_point, Block, ChainManifest};
use courier_directory::{select_best_relay, RelayRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::node::RelayState;
use crate::queue::{PendingEntry, WritePipeline};
use crate::single_flight::SingleFlight;
use crate::RelayError;

/// Skip reason when no directory is configured. Treated as retryable by the
/// write pipeline: never write without a chance of reconciling first.
pub const NO_DIRECTORY_REASON: &str = "No directory configured";

/// Skip reason when the directory knows no other relay. The single bootstrap
/// bypass: the write pipeline treats exactly this reason as success.
pub const NO_ALTERNATE_RELAY_REASON: &str = "No alternate relay available";

/// Outcome of one sync pass.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncSummary {
    /// The local chain was replaced.
    Updated {
        /// What happened.
        message: String,
        /// Letters harvested from a losing fork and requeued.
        replayed_letters: u64,
    },
    /// Local chain already matches or exceeds the peer.
    UpToDate {
        /// What happened.
        message: String,
    },
    /// The sync could not run; `reason` says why.
    Skipped {
        /// Why the sync was skipped.
        reason: String,
    },
    /// Transport or storage failure mid-sync.
    Failed {
        /// The failure.
        error: String,
    },
}

impl SyncSummary {
    /// How the write pipeline should treat this outcome before an append:
    /// `None` means proceed, `Some(error)` means fail the entry retryably.
    pub fn blocking_error(&self) -> Option<RelayError> {
        match self {
            SyncSummary::Updated { .. } | SyncSummary::UpToDate { .. } => None,
            SyncSummary::Skipped { reason } if reason == NO_ALTERNATE_RELAY_REASON => None,
            SyncSummary::Skipped { reason } => Some(RelayError::SyncBlocked(reason.clone())),
            SyncSummary::Failed { error } => Some(RelayError::TransientIo(error.clone())),
        }
    }
}

/// Diagnostic breadcrumb of the last fork resolution.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// When the fork was resolved.
    pub resolved_at: String,
    /// First divergent block index.
    pub diverge_at: u64,
    /// Local chain height before replacement.
    pub local_height: u64,
    /// Remote chain height.
    pub remote_height: u64,
    /// Where the losing fork was snapshotted, if the snapshot succeeded.
    pub backup_path: Option<String>,
    /// Letters requeued for replay.
    pub replayed_letters: u64,
}

/// Shape of the directory's relay listing.
#[derive(Deserialize)]
struct RelayListResponse {
    relays: Vec<RelayRecord>,
    manifest: Option<ChainManifest>,
}

/// Shape of a peer's full block dump.
#[derive(Deserialize)]
struct BlocksResponse {
    blocks: Vec<Block>,
}

/// The chain sync engine. Single-flight: at most one sync runs at a time.
pub struct SyncEngine {
    state: Arc<RelayState>,
    pipeline: Arc<WritePipeline>,
    flight: SingleFlight<SyncSummary>,
}

impl SyncEngine {
    /// Create the engine over shared relay state and the write pipeline.
    pub fn new(state: Arc<RelayState>, pipeline: Arc<WritePipeline>) -> Self {
        Self {
            state,
            pipeline,
            flight: SingleFlight::new(),
        }
    }

    /// Run one sync, or join the sync already in flight.
    pub async fn sync(self: &Arc<Self>, trigger: &str) -> SyncSummary {
        let engine = Arc::clone(self);
        let trigger = trigger.to_string();
        self.flight
            .run(move || async move { engine.sync_once(&trigger).await })
            .await
    }

    async fn sync_once(&self, trigger: &str) -> SyncSummary {
        let peer_url = match self.choose_peer().await {
            Ok(url) => url,
            Err(summary) => {
                debug!(trigger, outcome = ?summary, "Sync did not run");
                return summary;
            }
        };

        let remote = match self.fetch_blocks(&peer_url).await {
            Ok(blocks) => blocks,
            Err(summary) => return summary,
        };
        if remote.is_empty() {
            // A latent peer has nothing to reconcile against: zero blocks is
            // never longer than the local chain.
            return SyncSummary::UpToDate {
                message: format!("Peer {} has an empty chain", peer_url),
            };
        }

        let mut ledger = self.state.ledger.lock().await;
        let local_len = ledger.len();

        match divergence_point(ledger.blocks(), &remote) {
            None if remote.len() > local_len => match ledger.sync_from_remote(&remote, false) {
                Ok(outcome) => {
                    info!(trigger, peer = %peer_url, message = %outcome.message, "Chain extended");
                    SyncSummary::Updated {
                        message: outcome.message,
                        replayed_letters: 0,
                    }
                }
                Err(error) => SyncSummary::Failed {
                    error: error.to_string(),
                },
            },
            None => SyncSummary::UpToDate {
                message: format!(
                    "Local chain ({} blocks) is current with peer ({} blocks)",
                    local_len,
                    remote.len()
                ),
            },
            Some(diverge_at) if remote.len() >= local_len => {
                // Local is the losing fork.
                let summary = self.resolve_fork(&mut ledger, &remote, diverge_at);
                drop(ledger);
                // Replayed letters re-commit onto the new chain.
                self.pipeline.trigger();
                summary
            }
            Some(diverge_at) => {
                info!(
                    trigger,
                    diverge_at,
                    local = local_len,
                    remote = remote.len(),
                    "Remote fork is shorter, keeping local chain"
                );
                SyncSummary::UpToDate {
                    message: format!(
                        "Remote fork diverges at {} but is shorter, keeping local chain",
                        diverge_at
                    ),
                }
            }
        }
    }

    /// Replace the losing local fork with `remote`, preserving its letters.
    fn resolve_fork(
        &self,
        ledger: &mut courier_chain::Ledger,
        remote: &[Block],
        diverge_at: usize,
    ) -> SyncSummary {
        let local_height = ledger.len() as u64;
        let remote_height = remote.len() as u64;

        // 1. Snapshot the losing fork. Failure is logged, not fatal.
        let backup_path = match ledger.snapshot_conflict() {
            Ok(path) => Some(path.to_string_lossy().into_owned()),
            Err(error) => {
                warn!(error = %error, "Failed to snapshot losing fork");
                None
            }
        };

        // 2. Harvest orphaned letters into the write queue. If this fails the
        // local chain stays in place so no letter is lost.
        let orphans: Vec<PendingEntry> = ledger.blocks()[diverge_at..]
            .iter()
            .flat_map(|block| {
                block
                    .letters
                    .iter()
                    .map(|letter| PendingEntry::replayed(block.index, letter))
            })
            .collect();
        let replayed_letters = orphans.len() as u64;
        if let Err(error) = self.pipeline.enqueue_replayed(orphans) {
            warn!(error = %error, "Failed to requeue orphaned letters, aborting fork resolution");
            return SyncSummary::Failed {
                error: error.to_string(),
            };
        }

        // 3. Replace the local chain.
        if let Err(error) = ledger.sync_from_remote(remote, true) {
            warn!(error = %error, "Failed to replace losing fork");
            return SyncSummary::Failed {
                error: error.to_string(),
            };
        }

        // 4. Record the conflict diagnostic.
        let record = ConflictRecord {
            resolved_at: Utc::now().to_rfc3339(),
            diverge_at: diverge_at as u64,
            local_height,
            remote_height,
            backup_path,
            replayed_letters,
        };
        info!(
            diverge_at,
            local_height, remote_height, replayed_letters, "Resolved fork, local chain replaced"
        );
        *self
            .state
            .last_conflict
            .lock()
            .expect("conflict lock poisoned") = Some(record);

        SyncSummary::Updated {
            message: format!(
                "Fork at {} resolved, chain replaced ({} -> {} blocks)",
                diverge_at, local_height, remote_height
            ),
            replayed_letters,
        }
    }

    /// Pick a sync peer through the directory and the relay selector.
    async fn choose_peer(&self) -> std::result::Result<String, SyncSummary> {
        let (directory_url, self_onion) = {
            let config = self.state.config.read().await;
            (config.directory_url.clone(), config.onion.clone())
        };
        let directory_url = directory_url.filter(|u| !u.is_empty()).ok_or_else(|| {
            SyncSummary::Skipped {
                reason: NO_DIRECTORY_REASON.to_string(),
            }
        })?;

        let endpoint = format!("{}/api/relays", directory_url.trim_end_matches('/'));
        let response = self
            .state
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| SyncSummary::Failed {
                error: format!("Directory unreachable: {}", e),
            })?;
        let listing: RelayListResponse =
            response.json().await.map_err(|_| SyncSummary::Skipped {
                reason: "Directory response malformed".to_string(),
            })?;

        let candidates: Vec<RelayRecord> = listing
            .relays
            .into_iter()
            .filter(|r| r.onion != self_onion && r.reachable_url().is_some())
            .collect();

        match select_best_relay(&candidates, listing.manifest.as_ref()) {
            Some(best) => Ok(best
                .reachable_url()
                .expect("candidates were filtered for a URL")
                .to_string()),
            None => Err(SyncSummary::Skipped {
                reason: NO_ALTERNATE_RELAY_REASON.to_string(),
            }),
        }
    }

    /// Fetch a peer's full block list.
    async fn fetch_blocks(&self, peer_url: &str) -> std::result::Result<Vec<Block>, SyncSummary> {
        let endpoint = format!("{}/api/blocks/full", peer_url.trim_end_matches('/'));
        let response = self
            .state
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| SyncSummary::Failed {
                error: format!("Peer unreachable: {}", e),
            })?;
        let body: BlocksResponse = response.json().await.map_err(|_| SyncSummary::Skipped {
            reason: format!("Peer {} returned malformed blocks", peer_url),
        })?;
        Ok(body.blocks)
    }
}
