//! The letter write pipeline.
//!
//! Accepts letter submissions concurrently and commits them one at a time in
//! arrival order. Every accepted letter is either durably in the ledger or
//! explicitly rejected to its submitter.
//!
//! ## Queue model
//!
//! A single worker drains a strict-FIFO queue persisted at
//! `<relayRoot>/pending-letters.json` after every mutation (enqueue, shift,
//! bulk replay append, clear). On restart the persisted queue is reloaded and
//! processing resumes. A crash loses at most the currently processing entry's
//! commit state, so a letter may be committed twice but never lost.
//!
//! ## Worker state machine
//!
//! `idle -> draining -> idle`. Triggering while draining is a no-op; the
//! worker re-checks the queue before going idle.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use courier_chain::{Block, LetterEntry, RelayMetrics};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::{RelayError, Result};

/// Backoff before retrying a transiently failed entry.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// How many queue entries a status report includes.
const STATUS_HEAD_LEN: usize = 10;

/// A queued letter awaiting commit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    /// Unique entry id.
    pub id: String,
    /// Opaque encrypted envelope.
    pub letter_payload: String,
    /// Recipient fingerprint.
    pub owner_fingerprint: String,
    /// Relay observations to stamp into the block.
    #[serde(default)]
    pub relay_metrics: RelayMetrics,
    /// When the entry was enqueued.
    pub enqueued_at: String,
    /// Processing attempts so far.
    pub attempts: u32,
    /// Index of the orphaned block this entry was harvested from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replayed_from_block: Option<u64>,
}

impl PendingEntry {
    /// Build an entry for a fresh submission.
    pub fn new(payload: String, owner_fingerprint: String, relay_metrics: RelayMetrics) -> Self {
        Self {
            id: random_id(),
            letter_payload: payload,
            owner_fingerprint,
            relay_metrics,
            enqueued_at: Utc::now().to_rfc3339(),
            attempts: 0,
            replayed_from_block: None,
        }
    }

    /// Build an entry replaying a letter orphaned by a chain replacement.
    ///
    /// Payload and fingerprint are preserved byte-for-byte; the letter gets a
    /// fresh block with a fresh timestamp when it re-commits.
    pub fn replayed(block_index: u64, letter: &LetterEntry) -> Self {
        Self {
            id: random_id(),
            letter_payload: letter.payload.clone(),
            owner_fingerprint: letter.owner_fingerprint.clone(),
            relay_metrics: RelayMetrics::new(),
            enqueued_at: Utc::now().to_rfc3339(),
            attempts: 0,
            replayed_from_block: Some(block_index),
        }
    }
}

/// Persisted queue document.
#[derive(Serialize, Deserialize, Default)]
struct QueueFile {
    queue: Vec<PendingEntry>,
}

/// Queue status exposed by `/api/status`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Entries waiting (including any being processed).
    pub pending: usize,
    /// Whether the worker is currently draining.
    pub processing: bool,
    /// Last error the worker saw, if any.
    pub last_error: Option<String>,
    /// Metadata of the first entries in line.
    pub head: Vec<QueueEntrySummary>,
}

/// Queue entry metadata in status reports.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntrySummary {
    /// Entry id.
    pub id: String,
    /// Recipient fingerprint.
    pub owner_fingerprint: String,
    /// Processing attempts so far.
    pub attempts: u32,
    /// When the entry was enqueued.
    pub enqueued_at: String,
    /// Orphaned block index, for replayed entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replayed_from_block: Option<u64>,
}

/// Durable FIFO store.
struct QueueStore {
    path: PathBuf,
    entries: VecDeque<PendingEntry>,
}

impl QueueStore {
    fn persist(&self) -> Result<()> {
        let file = QueueFile {
            queue: self.entries.iter().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| RelayError::TransientIo(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| RelayError::TransientIo(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| RelayError::TransientIo(e.to_string()))?;
        Ok(())
    }
}

/// The serialized letter write pipeline.
pub struct WritePipeline {
    store: Mutex<QueueStore>,
    waiters: Mutex<HashMap<String, oneshot::Sender<Result<Block>>>>,
    /// Id of the entry whose commit is in flight right now.
    current: Mutex<Option<String>>,
    wake: Notify,
    processing: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl WritePipeline {
    /// Open the pipeline, loading any persisted queue at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| RelayError::TransientIo(e.to_string()))?;
            if raw.trim().is_empty() {
                VecDeque::new()
            } else {
                let file: QueueFile = serde_json::from_str(&raw)
                    .map_err(|e| RelayError::TransientIo(format!("pending-letters.json: {}", e)))?;
                file.queue.into()
            }
        } else {
            VecDeque::new()
        };
        if !entries.is_empty() {
            info!(pending = entries.len(), "Resuming persisted letter queue");
        }
        Ok(Self {
            store: Mutex::new(QueueStore { path, entries }),
            waiters: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            wake: Notify::new(),
            processing: AtomicBool::new(false),
            last_error: Mutex::new(None),
        })
    }

    /// Enqueue a letter and return a handle resolving when it is committed
    /// or rejected.
    pub fn enqueue(
        &self,
        payload: String,
        owner_fingerprint: String,
        relay_metrics: RelayMetrics,
    ) -> Result<oneshot::Receiver<Result<Block>>> {
        let entry = PendingEntry::new(payload, owner_fingerprint, relay_metrics);
        let (tx, rx) = oneshot::channel();
        {
            let mut store = self.store.lock().expect("queue lock poisoned");
            store.entries.push_back(entry.clone());
            if let Err(e) = store.persist() {
                store.entries.pop_back();
                return Err(e);
            }
        }
        self.waiters
            .lock()
            .expect("waiter lock poisoned")
            .insert(entry.id.clone(), tx);
        debug!(id = %entry.id, "Letter enqueued");
        self.wake.notify_one();
        Ok(rx)
    }

    /// Append replayed entries harvested from an orphaned fork.
    ///
    /// They land behind anything already queued, preserving their original
    /// orphaned order among themselves.
    pub fn enqueue_replayed(&self, entries: Vec<PendingEntry>) -> Result<usize> {
        let count = entries.len();
        if count == 0 {
            return Ok(0);
        }
        let mut store = self.store.lock().expect("queue lock poisoned");
        let before = store.entries.len();
        store.entries.extend(entries);
        if let Err(e) = store.persist() {
            store.entries.truncate(before);
            return Err(e);
        }
        info!(count, "Requeued orphaned letters for replay");
        Ok(count)
    }

    /// Reject every pending entry with a cancellation error and drain the
    /// persistent queue. The entry whose commit is in flight keeps its
    /// waiter; its result arrives when the commit finishes.
    pub fn clear(&self) -> Result<usize> {
        let current = self.current.lock().expect("current lock poisoned").clone();
        let drained: Vec<PendingEntry> = {
            let mut store = self.store.lock().expect("queue lock poisoned");
            let drained = store.entries.drain(..).collect();
            store.persist()?;
            drained
        };
        let mut waiters = self.waiters.lock().expect("waiter lock poisoned");
        let mut cancelled = 0;
        for entry in &drained {
            if current.as_deref() == Some(entry.id.as_str()) {
                continue;
            }
            if let Some(tx) = waiters.remove(&entry.id) {
                let _ = tx.send(Err(RelayError::Cancelled("queue cleared".to_string())));
            }
            cancelled += 1;
        }
        info!(cancelled, "Cleared letter queue");
        Ok(drained.len())
    }

    /// Current queue status.
    pub fn status(&self) -> QueueStatus {
        let store = self.store.lock().expect("queue lock poisoned");
        QueueStatus {
            pending: store.entries.len(),
            processing: self.processing.load(Ordering::SeqCst),
            last_error: self.last_error.lock().expect("error lock poisoned").clone(),
            head: store
                .entries
                .iter()
                .take(STATUS_HEAD_LEN)
                .map(|e| QueueEntrySummary {
                    id: e.id.clone(),
                    owner_fingerprint: e.owner_fingerprint.clone(),
                    attempts: e.attempts,
                    enqueued_at: e.enqueued_at.clone(),
                    replayed_from_block: e.replayed_from_block,
                })
                .collect(),
        }
    }

    /// Number of pending entries.
    pub fn pending_len(&self) -> usize {
        self.store.lock().expect("queue lock poisoned").entries.len()
    }

    /// Nudge the worker; a no-op while it is already draining.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Drain the queue forever, committing entries with `commit`.
    ///
    /// Exactly one worker runs this. Retryable failures keep the entry at
    /// the head and back off; permanent failures shift the entry and reject
    /// its waiter.
    pub async fn run<F, Fut>(
        self: Arc<Self>,
        mut commit: F,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: FnMut(PendingEntry) -> Fut,
        Fut: Future<Output = Result<Block>>,
    {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let Some(entry) = self.begin_next() else {
                self.processing.store(false, Ordering::SeqCst);
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };
            self.processing.store(true, Ordering::SeqCst);

            let outcome = commit(entry.clone()).await;
            match outcome {
                Ok(block) => {
                    debug!(id = %entry.id, index = block.index, "Letter committed");
                    self.finish(&entry.id, Ok(block));
                }
                Err(e) if e.is_retryable() => {
                    warn!(id = %entry.id, attempts = entry.attempts, error = %e, "Commit failed, will retry");
                    self.note_error(&e);
                    *self.current.lock().expect("current lock poisoned") = None;
                    tokio::select! {
                        _ = tokio::time::sleep(DEFAULT_RETRY_DELAY) => {}
                        _ = shutdown.changed() => return,
                    }
                }
                Err(e) => {
                    error!(id = %entry.id, error = %e, "Letter rejected");
                    self.note_error(&e);
                    self.finish(&entry.id, Err(e));
                }
            }
        }
    }

    /// Claim the head entry: bump its attempt counter, persist, mark it
    /// current and return a clone.
    fn begin_next(&self) -> Option<PendingEntry> {
        let mut store = self.store.lock().expect("queue lock poisoned");
        let front = store.entries.front_mut()?;
        front.attempts += 1;
        let entry = front.clone();
        if let Err(e) = store.persist() {
            warn!(error = %e, "Failed to persist attempt counter");
        }
        *self.current.lock().expect("current lock poisoned") = Some(entry.id.clone());
        Some(entry)
    }

    /// Shift the entry off the queue (if still there) and resolve its waiter.
    fn finish(&self, id: &str, result: Result<Block>) {
        {
            let mut store = self.store.lock().expect("queue lock poisoned");
            if store.entries.front().map(|e| e.id.as_str()) == Some(id) {
                store.entries.pop_front();
                if let Err(e) = store.persist() {
                    warn!(error = %e, "Failed to persist queue shift");
                }
            }
        }
        *self.current.lock().expect("current lock poisoned") = None;
        if let Some(tx) = self.waiters.lock().expect("waiter lock poisoned").remove(id) {
            let _ = tx.send(result);
        }
    }

    fn note_error(&self, error: &RelayError) {
        *self.last_error.lock().expect("error lock poisoned") = Some(error.to_string());
    }
}

fn random_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
