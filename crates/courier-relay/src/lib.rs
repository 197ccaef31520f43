//! # courier-relay
//!
//! The relay node for the courier overlay network.
//!
//! Provides:
//! - [`WritePipeline`]: the durable FIFO letter queue with a single drain
//!   worker, retry/backoff and cancellation
//! - [`SyncEngine`]: single-flight chain synchronization with
//!   longest-chain-wins fork resolution and orphaned-letter replay
//! - [`Reporter`]: single-flight heartbeats to the directory with backoff
//!   retry and directory-mandated genesis switches
//! - [`RelayNode`]: the wired-up node with its background loops
//! - [`http::router`]: the relay's HTTP API
//!
//! ## Write path
//!
//! Letters are accepted concurrently but committed strictly in arrival
//! order: enqueue, pre-write sync, append one block against the post-sync
//! tail, fire-and-forget a report, resolve the submitter.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod node;
pub mod queue;
pub mod report;
pub mod single_flight;
pub mod sync;

pub use config::{MetricsConfig, RelayConfig, DEFAULT_REPORT_INTERVAL, DEFAULT_SYNC_INTERVAL};
pub use error::{RelayError, Result};
pub use identity::RelayIdentity;
pub use node::{RelayNode, RelayState};
pub use queue::{PendingEntry, QueueStatus, WritePipeline, DEFAULT_RETRY_DELAY};
pub use report::{ReportInfo, Reporter};
pub use single_flight::SingleFlight;
pub use sync::{
    ConflictRecord, SyncEngine, SyncSummary, NO_ALTERNATE_RELAY_REASON, NO_DIRECTORY_REASON,
};
