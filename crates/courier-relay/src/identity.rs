//! Relay identity persistence.
//!
//! Each relay carries a stable fingerprint assigned on first start and kept
//! at `<relayRoot>/identity.json`.

use std::path::Path;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{RelayError, Result};

/// A relay's stable identity.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayIdentity {
    /// Random hex fingerprint, stable for the relay's lifetime.
    pub fingerprint: String,
    /// When the identity was first created.
    pub created_at: String,
}

impl RelayIdentity {
    /// Load the identity at `path`, creating and persisting a fresh one on
    /// first start.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| RelayError::TransientIo(e.to_string()))?;
            let identity: RelayIdentity = serde_json::from_str(&raw)
                .map_err(|e| RelayError::InvalidInput(format!("identity.json: {}", e)))?;
            return Ok(identity);
        }

        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        let identity = RelayIdentity {
            fingerprint: hex::encode(bytes),
            created_at: Utc::now().to_rfc3339(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RelayError::TransientIo(e.to_string()))?;
        }
        let json = serde_json::to_vec_pretty(&identity)
            .map_err(|e| RelayError::TransientIo(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| RelayError::TransientIo(e.to_string()))?;
        info!(fingerprint = %identity.fingerprint, "Created relay identity");
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_is_stable_across_restarts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");
        let first = RelayIdentity::load_or_create(&path).unwrap();
        let second = RelayIdentity::load_or_create(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.fingerprint.len(), 32);
    }

    #[test]
    fn test_distinct_relays_get_distinct_fingerprints() {
        let dir = TempDir::new().unwrap();
        let a = RelayIdentity::load_or_create(&dir.path().join("a.json")).unwrap();
        let b = RelayIdentity::load_or_create(&dir.path().join("b.json")).unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
    }
}
