//! # courier-client
//!
//! The client role for the courier overlay network: generate a letter
//! keypair, seal letters to a recipient, submit them to a relay chosen
//! through the directory, and later pull a synchronized ledger copy to
//! decrypt the letters addressed to you.
//!
//! Keypair generation and persistence live in `courier-crypto`
//! ([`courier_crypto::LetterKeypair`]); this crate adds the network legwork.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod error;

pub use client::{decrypt_own_letters, CourierClient, ReceivedLetter};
pub use error::{ClientError, Result};
