//! # courier-crypto
//!
//! Cryptographic primitives for the courier overlay network.
//!
//! This crate provides:
//!
//! - **Hashing**: BLAKE3 digests rendered as hex for block hashes,
//!   manifest checksums and key fingerprints
//! - **Keypairs**: X25519 letter keypairs with fingerprint derivation
//!   and on-disk persistence
//! - **Envelopes**: single-recipient sealed boxes
//!   (ephemeral X25519 + XChaCha20-Poly1305)
//!
//! The rest of the system treats envelopes as opaque strings: a relay stores
//! what a client sealed, and only the holder of the matching secret key can
//! open it.
//!
//! ## Security
//!
//! All secret key material implements `Zeroize` for cleanup on drop.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod error;
pub mod hash;
pub mod keypair;

pub use envelope::Envelope;
pub use error::{CryptoError, Result};
pub use hash::{digest_hex, digest_hex_many};
pub use keypair::{LetterKeypair, RecipientPublicKey};
