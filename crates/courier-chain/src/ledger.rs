//! File-backed ledger for one active chain.
//!
//! ## On-disk layout
//!
//! ```text
//! <relayRoot>/
//! ├── chains/
//! │   ├── <genesisHash>/
//! │   │   ├── blocks.json                  active or retained chain
//! │   │   └── conflicts/
//! │   │       └── blocks-<epochMs>.json    snapshots of losing forks
//! │   └── <otherGenesisHash>/…
//! └── blocks.json                          legacy single-file layout, migrated
//! ```
//!
//! A ledger root holds one subdirectory per genesis hash; which one is active
//! is tracked by the relay config, not here. On first initialization the
//! genesis hash is not yet known, so the chain is written into a
//! `bootstrap-<epochMs>` directory which is renamed to the real genesis hash
//! once computed. The rename is a single `fs::rename`, atomic against
//! concurrent readers.
//!
//! All chain writes go through write-to-temp-then-rename, so a crash leaves
//! the previous valid chain file in place.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{validate_chain, Block, LetterEntry, RelayMetrics};
use crate::manifest::ChainManifest;
use crate::{ChainError, Result};

/// Chain file name inside a genesis directory.
const BLOCKS_FILE: &str = "blocks.json";

/// Subdirectory for losing-fork snapshots.
const CONFLICTS_DIR: &str = "conflicts";

/// Prefix of the temporary directory used before the genesis hash is known.
const BOOTSTRAP_PREFIX: &str = "bootstrap-";

/// Wire and disk shape of a chain file.
#[derive(Serialize, Deserialize)]
struct ChainFile {
    blocks: Vec<Block>,
}

/// Outcome of [`Ledger::sync_from_remote`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    /// Whether the local chain was replaced.
    pub updated: bool,
    /// Human-readable description of what happened.
    pub message: String,
}

/// Durable, hash-verified append-only storage for one active chain.
#[derive(Debug)]
pub struct Ledger {
    /// `<relayRoot>/chains`, holding one directory per genesis hash.
    chains_root: PathBuf,
    /// Directory of the active chain.
    active_dir: PathBuf,
    /// The active chain, kept in memory and persisted on every mutation.
    blocks: Vec<Block>,
}

impl Ledger {
    /// Open the ledger under `relay_root`, creating a fresh chain if needed.
    ///
    /// With `active_genesis = Some(hash)` the chain in that genesis directory
    /// is loaded; a missing or empty directory yields a *latent* ledger with
    /// zero blocks that fills on the first successful sync. With `None`, a
    /// fresh genesis is written (post-condition: `len() >= 1`).
    ///
    /// A legacy `<relayRoot>/blocks.json` is migrated into the directory of
    /// its genesis hash before anything else.
    pub fn open(relay_root: &Path, active_genesis: Option<&str>) -> Result<Self> {
        let chains_root = relay_root.join("chains");
        std::fs::create_dir_all(&chains_root)?;

        migrate_legacy_chain(relay_root, &chains_root)?;

        match active_genesis {
            Some(genesis) => {
                let active_dir = chains_root.join(genesis);
                let blocks = load_chain_file(&active_dir.join(BLOCKS_FILE))?;
                if blocks.is_empty() {
                    info!(genesis, "Active chain not on disk yet, awaiting sync");
                    std::fs::create_dir_all(&active_dir)?;
                } else {
                    validate_chain(&blocks)?;
                }
                Ok(Self {
                    chains_root,
                    active_dir,
                    blocks,
                })
            }
            None => Self::bootstrap(chains_root),
        }
    }

    /// Write a fresh genesis into a bootstrap directory, then rename the
    /// directory to the computed genesis hash.
    fn bootstrap(chains_root: PathBuf) -> Result<Self> {
        let bootstrap_dir =
            chains_root.join(format!("{}{}", BOOTSTRAP_PREFIX, Utc::now().timestamp_millis()));
        std::fs::create_dir_all(&bootstrap_dir)?;

        let genesis = Block::genesis(Utc::now());
        let genesis_hash = genesis.hash.clone();
        let blocks = vec![genesis];
        write_chain_file(&bootstrap_dir.join(BLOCKS_FILE), &blocks)?;

        let final_dir = chains_root.join(&genesis_hash);
        if final_dir.exists() {
            // A chain with this genesis already exists; keep it and discard
            // the bootstrap copy.
            std::fs::remove_dir_all(&bootstrap_dir)?;
            let existing = load_chain_file(&final_dir.join(BLOCKS_FILE))?;
            validate_chain(&existing)?;
            return Ok(Self {
                chains_root,
                active_dir: final_dir,
                blocks: existing,
            });
        }
        std::fs::rename(&bootstrap_dir, &final_dir)?;
        info!(genesis = %genesis_hash, "Initialized fresh chain");

        Ok(Self {
            chains_root,
            active_dir: final_dir,
            blocks,
        })
    }

    /// The full block sequence.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Number of blocks in the active chain.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the active chain is latent (zero blocks, awaiting sync).
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Hash of the genesis block, if the chain has one.
    pub fn genesis_hash(&self) -> Option<&str> {
        self.blocks.first().map(|b| b.hash.as_str())
    }

    /// The current tail block.
    pub fn tip(&self) -> Result<&Block> {
        self.blocks.last().ok_or(ChainError::EmptyChain)
    }

    /// Directory of the active chain.
    pub fn active_dir(&self) -> &Path {
        &self.active_dir
    }

    /// Derive the manifest of the active chain.
    pub fn manifest(&self) -> ChainManifest {
        ChainManifest::from_blocks(&self.blocks)
    }

    /// Append one block carrying a single letter, chosen against the current
    /// tail, and persist atomically.
    pub fn append_letter_block(
        &mut self,
        payload: String,
        owner_fingerprint: String,
        relay_metrics: RelayMetrics,
    ) -> Result<Block> {
        let tip = self.tip()?;
        let short = &owner_fingerprint[..owner_fingerprint.len().min(8)];
        let summary = format!("Letter for {}", short);
        let block = Block::next(
            tip,
            vec![LetterEntry {
                owner_fingerprint,
                payload,
            }],
            relay_metrics,
            summary,
            Utc::now(),
        );

        self.blocks.push(block.clone());
        if let Err(e) = self.persist() {
            self.blocks.pop();
            return Err(e);
        }
        debug!(index = block.index, hash = %block.hash, "Appended letter block");
        Ok(block)
    }

    /// Replace the local chain with `remote` if it validates and is strictly
    /// longer (or `force` is set).
    ///
    /// An empty remote is never an error, just a no-op.
    pub fn sync_from_remote(&mut self, remote: &[Block], force: bool) -> Result<SyncOutcome> {
        if remote.is_empty() {
            return Ok(SyncOutcome {
                updated: false,
                message: "Remote chain is empty".to_string(),
            });
        }
        validate_chain(remote)?;

        if !force && remote.len() <= self.blocks.len() {
            return Ok(SyncOutcome {
                updated: false,
                message: format!(
                    "Remote chain ({} blocks) is not longer than local ({} blocks)",
                    remote.len(),
                    self.blocks.len()
                ),
            });
        }

        let previous_len = self.blocks.len();
        let replaced = std::mem::replace(&mut self.blocks, remote.to_vec());
        if let Err(e) = self.persist() {
            self.blocks = replaced;
            return Err(e);
        }
        info!(
            from = previous_len,
            to = self.blocks.len(),
            forced = force,
            "Replaced local chain"
        );
        Ok(SyncOutcome {
            updated: true,
            message: format!(
                "Replaced local chain ({} -> {} blocks)",
                previous_len,
                self.blocks.len()
            ),
        })
    }

    /// Snapshot the current blocks into the conflicts directory.
    ///
    /// Returns the snapshot path. Used before a fork resolution replaces the
    /// local chain so the losing fork is retained for inspection.
    pub fn snapshot_conflict(&self) -> Result<PathBuf> {
        let conflicts = self.active_dir.join(CONFLICTS_DIR);
        std::fs::create_dir_all(&conflicts)?;
        let path = conflicts.join(format!("blocks-{}.json", Utc::now().timestamp_millis()));
        let file = ChainFile {
            blocks: self.blocks.clone(),
        };
        std::fs::write(&path, serde_json::to_vec_pretty(&file)?)?;
        info!(path = %path.display(), "Snapshotted losing fork");
        Ok(path)
    }

    /// Stream all (block, letter) pairs whose owner matches `fingerprint`.
    pub fn find_letters_by_fingerprint<'a>(
        &'a self,
        fingerprint: &'a str,
    ) -> impl Iterator<Item = (&'a Block, &'a LetterEntry)> {
        self.blocks.iter().flat_map(move |block| {
            block
                .letters
                .iter()
                .filter(move |entry| entry.owner_fingerprint == fingerprint)
                .map(move |entry| (block, entry))
        })
    }

    /// Switch the active chain to another genesis directory.
    ///
    /// Reuses the directory when it holds a chain; otherwise creates it and
    /// leaves the ledger latent until the next sync. The previous chain stays
    /// on disk under its own genesis directory.
    pub fn switch_genesis(&mut self, genesis: &str) -> Result<()> {
        if self.genesis_hash() == Some(genesis) {
            return Ok(());
        }
        let new_dir = self.chains_root.join(genesis);
        let blocks = load_chain_file(&new_dir.join(BLOCKS_FILE))?;
        if blocks.is_empty() {
            std::fs::create_dir_all(&new_dir)?;
            warn!(genesis, "Switched to a chain with no local blocks, awaiting sync");
        } else {
            validate_chain(&blocks)?;
            info!(genesis, length = blocks.len(), "Switched active chain");
        }
        self.active_dir = new_dir;
        self.blocks = blocks;
        Ok(())
    }

    /// Persist the active chain with write-to-temp-then-rename.
    fn persist(&self) -> Result<()> {
        std::fs::create_dir_all(&self.active_dir)?;
        let file = ChainFile {
            blocks: self.blocks.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        let tmp = self.active_dir.join(format!("{}.tmp", BLOCKS_FILE));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, self.active_dir.join(BLOCKS_FILE))?;
        Ok(())
    }
}

/// Load a chain file, treating a missing or empty file as an empty chain.
fn load_chain_file(path: &Path) -> Result<Vec<Block>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: ChainFile = serde_json::from_str(&raw)
        .map_err(|e| ChainError::CorruptChainFile(format!("{}: {}", path.display(), e)))?;
    Ok(file.blocks)
}

/// Atomically write a chain file.
fn write_chain_file(path: &Path, blocks: &[Block]) -> Result<()> {
    let file = ChainFile {
        blocks: blocks.to_vec(),
    };
    let json = serde_json::to_vec_pretty(&file)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Move a legacy `<relayRoot>/blocks.json` under its genesis directory.
fn migrate_legacy_chain(relay_root: &Path, chains_root: &Path) -> Result<()> {
    let legacy = relay_root.join(BLOCKS_FILE);
    if !legacy.exists() {
        return Ok(());
    }
    let blocks = load_chain_file(&legacy)?;
    if blocks.is_empty() {
        std::fs::remove_file(&legacy)?;
        return Ok(());
    }
    validate_chain(&blocks)?;
    let genesis_hash = blocks[0].hash.clone();
    let target_dir = chains_root.join(&genesis_hash);
    std::fs::create_dir_all(&target_dir)?;
    let target = target_dir.join(BLOCKS_FILE);
    if !target.exists() {
        write_chain_file(&target, &blocks)?;
    }
    std::fs::remove_file(&legacy)?;
    info!(genesis = %genesis_hash, "Migrated legacy chain file");
    Ok(())
}
