//! # courier-directory
//!
//! The directory authority for the courier overlay network.
//!
//! Provides:
//! - [`Registry`]: the relay table with heartbeat upserts, canonical
//!   manifest tracking and sync-status flags, persisted as one JSON document
//! - [`selector::select_best_relay`]: weighted relay scoring
//! - [`Prober`]: background reachability probing with firewall heuristics
//! - [`broadcast::broadcast_sync`]: post-upsert fan-out nudging relays to pull
//! - [`http::router`]: the directory's HTTP API
//!
//! The canonical manifest is the longest chain manifest observed across all
//! reporting relays; it only ever grows.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod broadcast;
pub mod error;
pub mod http;
pub mod probe;
pub mod record;
pub mod registry;
pub mod selector;

pub use error::{DirectoryError, Result};
pub use http::{router, DirectoryApp};
pub use probe::{Prober, DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_TIMEOUT};
pub use record::{HeartbeatPayload, HeartbeatResponse, RelayRecord, SyncStatus};
pub use registry::{ProbeMetrics, Registry};
pub use selector::{select_best_relay, ScoreInputs};
