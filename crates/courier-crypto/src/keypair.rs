//! Letter keypairs and recipient fingerprints.
//!
//! A client owns one X25519 keypair. The public key's BLAKE3 digest is the
//! **fingerprint** used as the recipient selector inside letter entries; the
//! ledger only ever sees the fingerprint, never the key itself.
//!
//! ## Security Notes
//!
//! - Secret keys are zeroized on drop
//! - Keys are generated from OS randomness
//! - The on-disk key file holds the secret in hex; treat it like a password

use std::path::Path;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hash::digest_hex;
use crate::{CryptoError, Result};

/// Size of an X25519 key in bytes.
pub const KEY_SIZE: usize = 32;

/// A recipient's public key, shareable freely.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientPublicKey {
    bytes: [u8; KEY_SIZE],
}

impl RecipientPublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHexFormat(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Get the key as bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Render the key as hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// The fingerprint of this key: its BLAKE3 digest in hex.
    ///
    /// This is the lookup selector stored inside letter entries.
    pub fn fingerprint(&self) -> String {
        digest_hex(&self.bytes)
    }
}

impl std::fmt::Debug for RecipientPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RecipientPublicKey({:02x}{:02x}..)",
            self.bytes[0], self.bytes[1]
        )
    }
}

impl From<&RecipientPublicKey> for PublicKey {
    fn from(key: &RecipientPublicKey) -> Self {
        PublicKey::from(key.bytes)
    }
}

/// A client's long-term letter keypair.
///
/// The secret half is zeroized on drop.
pub struct LetterKeypair {
    secret: SecretKeyBytes,
    public: RecipientPublicKey,
}

/// Secret key bytes with zeroize-on-drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SecretKeyBytes([u8; KEY_SIZE]);

/// On-disk representation of a keypair.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKeypair {
    public_key: String,
    secret_key: String,
    created_at: String,
}

impl LetterKeypair {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: SecretKeyBytes(secret.to_bytes()),
            public: RecipientPublicKey { bytes: public.to_bytes() },
        }
    }

    /// Reconstruct a keypair from secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        let secret = StaticSecret::from(arr);
        let public = PublicKey::from(&secret);
        Ok(Self {
            secret: SecretKeyBytes(arr),
            public: RecipientPublicKey { bytes: public.to_bytes() },
        })
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> &RecipientPublicKey {
        &self.public
    }

    /// The fingerprint of the public key.
    pub fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }

    /// Compute the X25519 shared secret with an ephemeral public key.
    pub(crate) fn diffie_hellman(&self, ephemeral: &PublicKey) -> [u8; KEY_SIZE] {
        let secret = StaticSecret::from(self.secret.0);
        secret.diffie_hellman(ephemeral).to_bytes()
    }

    /// Persist the keypair as JSON at `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stored = StoredKeypair {
            public_key: self.public.to_hex(),
            secret_key: hex::encode(self.secret.0),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let json = serde_json::to_string_pretty(&stored)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a keypair previously written by [`LetterKeypair::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let stored: StoredKeypair = serde_json::from_str(&json)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
        let mut bytes = hex::decode(&stored.secret_key)
            .map_err(|e| CryptoError::InvalidHexFormat(e.to_string()))?;
        let keypair = Self::from_secret_bytes(&bytes);
        bytes.zeroize();
        keypair
    }
}

impl std::fmt::Debug for LetterKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LetterKeypair")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
