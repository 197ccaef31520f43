//! Sealed letter envelopes.
//!
//! A letter payload is sealed to exactly one recipient:
//!
//! 1. Generate a fresh ephemeral X25519 keypair.
//! 2. Diffie-Hellman with the recipient's public key.
//! 3. Derive an XChaCha20-Poly1305 key from the shared secret with BLAKE3.
//! 4. Encrypt under a random 24-byte nonce.
//!
//! The envelope travels as an opaque JSON string
//! `{"ephemeralPublicKey": …, "nonce": …, "ciphertext": …}` with base64
//! fields. Relays and the ledger store it verbatim and never look inside.
//!
//! ## Security Notes
//!
//! - A fresh ephemeral key and nonce are used for every letter
//! - The derived key is zeroized after use
//! - NEVER reuse a nonce with the same key

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

use crate::keypair::{LetterKeypair, RecipientPublicKey, KEY_SIZE};
use crate::{CryptoError, Result};

/// Size of the XChaCha20 nonce in bytes.
pub const NONCE_SIZE: usize = 24;

/// Key derivation context binding the DH output to this envelope format.
const ENVELOPE_KEY_CONTEXT: &str = "courier letter envelope v1";

/// A sealed letter envelope.
///
/// Produced by [`Envelope::seal`], opened by [`Envelope::open`] with the
/// recipient's keypair.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Ephemeral X25519 public key, base64.
    pub ephemeral_public_key: String,
    /// XChaCha20 nonce, base64.
    pub nonce: String,
    /// Ciphertext with Poly1305 tag, base64.
    pub ciphertext: String,
}

impl Envelope {
    /// Seal `plaintext` to the holder of `recipient`'s secret key.
    pub fn seal(plaintext: &[u8], recipient: &RecipientPublicKey) -> Result<Self> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);

        let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient));
        let mut key = blake3::derive_key(ENVELOPE_KEY_CONTEXT, shared.as_bytes());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = XChaCha20Poly1305::new((&key).into());
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        key.zeroize();

        Ok(Self {
            ephemeral_public_key: BASE64.encode(ephemeral_public.as_bytes()),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    /// Open the envelope with the recipient's keypair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] if the envelope was sealed to a
    /// different key or the ciphertext was tampered with.
    pub fn open(&self, keypair: &LetterKeypair) -> Result<Vec<u8>> {
        let ephemeral_bytes = BASE64
            .decode(&self.ephemeral_public_key)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
        if ephemeral_bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: ephemeral_bytes.len(),
            });
        }
        let mut ephemeral_arr = [0u8; KEY_SIZE];
        ephemeral_arr.copy_from_slice(&ephemeral_bytes);
        let ephemeral_public = PublicKey::from(ephemeral_arr);

        let nonce_bytes = BASE64
            .decode(&self.nonce)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: nonce_bytes.len(),
            });
        }

        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;

        let mut shared = keypair.diffie_hellman(&ephemeral_public);
        let mut key = blake3::derive_key(ENVELOPE_KEY_CONTEXT, &shared);
        shared.zeroize();

        let cipher = XChaCha20Poly1305::new((&key).into());
        let plaintext = cipher
            .decrypt(XNonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| CryptoError::Decryption);
        key.zeroize();

        plaintext
    }

    /// Encode as the opaque JSON string carried on the wire and in blocks.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization should not fail")
    }

    /// Parse an envelope from its opaque string form.
    pub fn parse(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let kp = LetterKeypair::generate();
        let envelope = Envelope::seal(b"meet me at dawn", kp.public_key()).unwrap();
        let opened = envelope.open(&kp).unwrap();
        assert_eq!(opened, b"meet me at dawn");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let alice = LetterKeypair::generate();
        let mallory = LetterKeypair::generate();
        let envelope = Envelope::seal(b"for alice only", alice.public_key()).unwrap();
        assert!(matches!(
            envelope.open(&mallory).unwrap_err(),
            CryptoError::Decryption
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let kp = LetterKeypair::generate();
        let mut envelope = Envelope::seal(b"original", kp.public_key()).unwrap();
        let mut raw = BASE64.decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0xff;
        envelope.ciphertext = BASE64.encode(raw);
        assert!(matches!(
            envelope.open(&kp).unwrap_err(),
            CryptoError::Decryption
        ));
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let kp = LetterKeypair::generate();
        let envelope = Envelope::seal(b"payload", kp.public_key()).unwrap();
        let encoded = envelope.encode();
        assert!(encoded.contains("ephemeralPublicKey"));

        let parsed = Envelope::parse(&encoded).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.open(&kp).unwrap(), b"payload");
    }

    #[test]
    fn test_distinct_seals_use_distinct_nonces() {
        let kp = LetterKeypair::generate();
        let a = Envelope::seal(b"same plaintext", kp.public_key()).unwrap();
        let b = Envelope::seal(b"same plaintext", kp.public_key()).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Envelope::parse("not json").is_err());
    }
}
