//! Chain manifests and divergence detection.
//!
//! A [`ChainManifest`] is the summary a node exports to its peers: the chain
//! length, the ordered list of every block hash, the latest hash and a
//! checksum over the list. Two manifests with identical `hashes` represent
//! the same chain history.

use serde::{Deserialize, Serialize};

use courier_crypto::digest_hex_many;

use crate::block::Block;

/// Summary of a chain exported to peers and the directory.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChainManifest {
    /// Number of blocks in the chain.
    pub length: u64,
    /// Ordered list of every block's hash.
    pub hashes: Vec<String>,
    /// Hash of the last block, empty for an empty chain.
    pub latest_hash: Option<String>,
    /// BLAKE3 checksum over the hash list.
    pub checksum: String,
}

impl ChainManifest {
    /// Derive the manifest of a block sequence.
    pub fn from_blocks(blocks: &[Block]) -> Self {
        let hashes: Vec<String> = blocks.iter().map(|b| b.hash.clone()).collect();
        let checksum = {
            let parts: Vec<&[u8]> = hashes.iter().map(|h| h.as_bytes()).collect();
            digest_hex_many(&parts)
        };
        Self {
            length: hashes.len() as u64,
            latest_hash: hashes.last().cloned(),
            hashes,
            checksum,
        }
    }

    /// Whether this manifest describes the same history as `other`.
    pub fn same_history(&self, other: &ChainManifest) -> bool {
        self.hashes == other.hashes
    }
}

/// Find the first index where two block lists disagree.
///
/// Walks both lists in lock-step up to the shorter length and returns the
/// first index whose hashes differ, or `None` if one list is a prefix of the
/// other.
pub fn divergence_point(local: &[Block], remote: &[Block]) -> Option<usize> {
    let shared = local.len().min(remote.len());
    (0..shared).find(|&i| local[i].hash != remote[i].hash)
}

/// Find the first index where two hash lists disagree.
///
/// Manifest-level variant of [`divergence_point`] used by the directory,
/// which only sees manifests.
pub fn manifest_divergence(local: &[String], remote: &[String]) -> Option<usize> {
    let shared = local.len().min(remote.len());
    (0..shared).find(|&i| local[i] != remote[i])
}
