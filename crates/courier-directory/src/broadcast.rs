//! Post-upsert sync fan-out.
//!
//! After a relay reports, the directory nudges every other relay with a
//! public URL to pull the latest chain. Failures are logged per target; no
//! retries, no ordering guarantees.

use tracing::{debug, warn};

use crate::record::RelayRecord;

/// POST `/api/sync` to every relay except `exclude_onion`, in parallel.
///
/// Fire-and-forget: each request runs in its own task and the function
/// returns immediately.
pub fn broadcast_sync(client: &reqwest::Client, relays: &[RelayRecord], exclude_onion: &str) {
    for relay in relays {
        if relay.onion == exclude_onion {
            continue;
        }
        let Some(url) = relay.reachable_url().map(str::to_string) else {
            continue;
        };
        let endpoint = format!("{}/api/sync", url.trim_end_matches('/'));
        let onion = relay.onion.clone();
        let client = client.clone();
        tokio::spawn(async move {
            match client.post(&endpoint).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(onion, "Sync nudge delivered");
                }
                Ok(response) => {
                    warn!(onion, status = %response.status(), "Sync nudge rejected");
                }
                Err(error) => {
                    warn!(onion, error = %error, "Sync nudge failed");
                }
            }
        });
    }
}
