//! Block structure and letter entries for the courier ledger.
//!
//! A [`Block`] is one unit of the append-only chain. Each block carries an
//! ordered list of [`LetterEntry`] values (usually exactly one), a snapshot of
//! relay metrics at append time, and a self-hash over the canonical JSON
//! serialization of every other field.
//!
//! ## Hashing
//!
//! `hash` is the BLAKE3 hex digest of the block serialized to JSON with the
//! `hash` field removed. Struct field order is fixed, and `relayMetrics` is a
//! `BTreeMap`, so the serialization is byte-for-byte deterministic.
//!
//! ## Genesis Block
//!
//! The first block of any chain has index 0, a null `previousHash` and no
//! letters. A chain is identified by its genesis block's hash.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use courier_crypto::digest_hex;
use serde::{Deserialize, Serialize};

use crate::{ChainError, Result};

/// Opaque relay observations attached to a block at append time.
pub type RelayMetrics = BTreeMap<String, serde_json::Value>;

/// One encrypted envelope plus its owner fingerprint.
///
/// The ledger never inspects `payload`; only the holder of the key matching
/// `owner_fingerprint` can open it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LetterEntry {
    /// Hex digest of the recipient's public key, used only for lookup.
    pub owner_fingerprint: String,
    /// Opaque encrypted envelope, stored verbatim.
    pub payload: String,
}

/// One unit of the ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Monotonic block index, 0 for genesis.
    pub index: u64,
    /// ISO-8601 UTC creation time.
    pub timestamp: String,
    /// Hash of the previous block, `None` for genesis.
    pub previous_hash: Option<String>,
    /// Ordered letter entries, may be empty.
    pub letters: Vec<LetterEntry>,
    /// Relay observations at append time.
    #[serde(default)]
    pub relay_metrics: RelayMetrics,
    /// Human-readable short description.
    pub summary: String,
    /// Self-hash over the canonical serialization of all other fields.
    pub hash: String,
}

/// The hashable content of a block: every field except `hash`.
///
/// Field order here is the canonical serialization order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BlockContent<'a> {
    index: u64,
    timestamp: &'a str,
    previous_hash: &'a Option<String>,
    letters: &'a [LetterEntry],
    relay_metrics: &'a RelayMetrics,
    summary: &'a str,
}

impl Block {
    /// Create the genesis block of a new chain.
    pub fn genesis(now: DateTime<Utc>) -> Self {
        let mut block = Self {
            index: 0,
            timestamp: now.to_rfc3339(),
            previous_hash: None,
            letters: Vec::new(),
            relay_metrics: RelayMetrics::new(),
            summary: "Genesis block".to_string(),
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Build the successor of `prev` carrying the given letters.
    pub fn next(
        prev: &Block,
        letters: Vec<LetterEntry>,
        relay_metrics: RelayMetrics,
        summary: String,
        now: DateTime<Utc>,
    ) -> Self {
        let mut block = Self {
            index: prev.index + 1,
            timestamp: now.to_rfc3339(),
            previous_hash: Some(prev.hash.clone()),
            letters,
            relay_metrics,
            summary,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Compute the hash of this block's content, ignoring the stored `hash`.
    pub fn compute_hash(&self) -> String {
        let content = BlockContent {
            index: self.index,
            timestamp: &self.timestamp,
            previous_hash: &self.previous_hash,
            letters: &self.letters,
            relay_metrics: &self.relay_metrics,
            summary: &self.summary,
        };
        let json = serde_json::to_vec(&content).expect("block content serialization cannot fail");
        digest_hex(&json)
    }

    /// Check that the stored hash matches the recomputed hash.
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Check if this is a genesis block.
    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous_hash.is_none()
    }
}

/// Validate a full chain, reporting the first failure with its index.
///
/// Checks, in order:
/// - the chain is non-empty
/// - block 0 has genesis shape (index 0, null previous hash)
/// - every block's stored hash matches its recomputed hash
/// - from index 1 on, `previousHash` links to the prior block's hash and
///   indices increase by exactly one
pub fn validate_chain(blocks: &[Block]) -> Result<()> {
    if blocks.is_empty() {
        return Err(ChainError::EmptyChain);
    }

    let genesis = &blocks[0];
    if genesis.index != 0 || genesis.previous_hash.is_some() {
        return Err(ChainError::InvalidBlock {
            index: genesis.index,
            reason: "first block is not a genesis block".to_string(),
        });
    }

    for (i, block) in blocks.iter().enumerate() {
        if !block.verify_hash() {
            return Err(ChainError::InvalidBlock {
                index: i as u64,
                reason: format!(
                    "stored hash {} does not match recomputed content hash",
                    block.hash
                ),
            });
        }

        if i == 0 {
            continue;
        }
        let prev = &blocks[i - 1];
        if block.index != prev.index + 1 {
            return Err(ChainError::InvalidBlock {
                index: i as u64,
                reason: format!("index {} does not follow {}", block.index, prev.index),
            });
        }
        match &block.previous_hash {
            Some(prev_hash) if *prev_hash == prev.hash => {}
            Some(prev_hash) => {
                return Err(ChainError::InvalidBlock {
                    index: i as u64,
                    reason: format!(
                        "previousHash {} does not match prior block hash {}",
                        prev_hash, prev.hash
                    ),
                });
            }
            None => {
                return Err(ChainError::InvalidBlock {
                    index: i as u64,
                    reason: "non-genesis block has null previousHash".to_string(),
                });
            }
        }
    }

    Ok(())
}
