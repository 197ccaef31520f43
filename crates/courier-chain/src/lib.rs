//! # courier-chain
//!
//! The append-only block ledger for the courier overlay network.
//!
//! Provides:
//! - [`Block`] and [`LetterEntry`]: hash-linked block structure carrying
//!   encrypted letters
//! - [`validate_chain`]: full-chain validation reporting the first failure
//! - [`ChainManifest`]: the chain summary exchanged between nodes, with
//!   divergence detection
//! - [`Ledger`]: durable file-backed storage with a multi-chain directory
//!   layout keyed by genesis hash, atomic replacement and losing-fork
//!   snapshots
//!
//! ## Chain identity
//!
//! A chain is identified by its genesis block's hash. A relay may retain
//! several chains on disk at once; exactly one is active, tracked by the
//! relay configuration.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod block;
pub mod error;
pub mod ledger;
pub mod manifest;

pub use block::{validate_chain, Block, LetterEntry, RelayMetrics};
pub use error::{ChainError, Result};
pub use ledger::{Ledger, SyncOutcome};
pub use manifest::{divergence_point, manifest_divergence, ChainManifest};
