//! The client role: seal letters, pick a relay, submit and later retrieve.
//!
//! A client owns a [`LetterKeypair`], seals letters to a recipient's public
//! key, submits them to a relay chosen through the directory (or an explicit
//! relay override) and later pulls a synchronized copy of the ledger to
//! decrypt the letters addressed to its own fingerprint.

use std::time::Duration;

use courier_chain::Block;
use courier_crypto::{Envelope, LetterKeypair, RecipientPublicKey};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{ClientError, Result};

/// Timeout for client HTTP calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// A letter recovered from the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedLetter {
    /// Index of the block carrying the letter.
    pub block_index: u64,
    /// Block timestamp.
    pub timestamp: String,
    /// Decrypted letter body.
    pub plaintext: Vec<u8>,
}

/// Shape of the directory's best-relay answer.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BestRelay {
    onion: Option<String>,
    #[serde(default)]
    available: Option<bool>,
    public_url: Option<String>,
    public_access_url: Option<String>,
}

#[derive(Deserialize)]
struct BlocksResponse {
    blocks: Vec<Block>,
}

#[derive(Deserialize)]
struct LetterAccepted {
    block: Block,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client for the courier network.
pub struct CourierClient {
    http: reqwest::Client,
    directory_url: Option<String>,
    relay_url: Option<String>,
}

impl CourierClient {
    /// Create a client that resolves relays through `directory_url`.
    pub fn new(directory_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?,
            directory_url: Some(directory_url.into()),
            relay_url: None,
        })
    }

    /// Create a client pinned to one relay, bypassing the directory.
    pub fn with_relay(relay_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?,
            directory_url: None,
            relay_url: Some(relay_url.into()),
        })
    }

    /// Seal `plaintext` to `recipient` and submit it to the resolved relay.
    /// Returns the block the letter was committed into.
    pub async fn send_letter(
        &self,
        plaintext: &[u8],
        recipient: &RecipientPublicKey,
    ) -> Result<Block> {
        let relay = self.resolve_relay().await?;
        let envelope = Envelope::seal(plaintext, recipient)?;

        let response = self
            .http
            .post(format!("{}/api/letters", relay.trim_end_matches('/')))
            .json(&serde_json::json!({
                "payload": envelope.encode(),
                "ownerFingerprint": recipient.fingerprint(),
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let accepted: LetterAccepted = response
                .json()
                .await
                .map_err(|e| ClientError::MalformedResponse(e.to_string()))?;
            debug!(index = accepted.block.index, "Letter committed");
            return Ok(accepted.block);
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .map(|b| b.error)
            .unwrap_or_else(|_| status.to_string());
        Err(ClientError::RelayRejected {
            status: status.as_u16(),
            message,
        })
    }

    /// Pull the resolved relay's ledger and decrypt every letter addressed
    /// to `keypair`'s fingerprint.
    pub async fn fetch_letters(&self, keypair: &LetterKeypair) -> Result<Vec<ReceivedLetter>> {
        let relay = self.resolve_relay().await?;
        let response = self
            .http
            .get(format!("{}/api/blocks/full", relay.trim_end_matches('/')))
            .send()
            .await?;
        let body: BlocksResponse = response
            .json()
            .await
            .map_err(|e| ClientError::MalformedResponse(e.to_string()))?;
        Ok(decrypt_own_letters(&body.blocks, keypair))
    }

    /// The relay to talk to: the pinned one, else the directory's best.
    async fn resolve_relay(&self) -> Result<String> {
        if let Some(relay) = self.relay_url.as_deref() {
            return Ok(relay.to_string());
        }
        let directory = self.directory_url.as_deref().ok_or_else(|| {
            ClientError::NoRelayAvailable("neither relay nor directory configured".into())
        })?;

        let best: BestRelay = self
            .http
            .get(format!("{}/api/relays/best", directory.trim_end_matches('/')))
            .send()
            .await?
            .json()
            .await
            .map_err(|e| ClientError::MalformedResponse(e.to_string()))?;

        if best.available == Some(false) || best.onion.is_none() {
            return Err(ClientError::NoRelayAvailable(
                "directory knows no reachable relay".into(),
            ));
        }
        best.public_access_url
            .filter(|u| !u.is_empty())
            .or(best.public_url)
            .ok_or_else(|| ClientError::NoRelayAvailable("best relay has no URL".into()))
    }
}

/// Filter `blocks` for letters addressed to `keypair` and open them.
///
/// Envelopes that fail to parse or open are skipped with a warning; one
/// corrupt letter must not hide the rest of the mailbox.
pub fn decrypt_own_letters(blocks: &[Block], keypair: &LetterKeypair) -> Vec<ReceivedLetter> {
    let fingerprint = keypair.fingerprint();
    let mut letters = Vec::new();
    for block in blocks {
        for entry in &block.letters {
            if entry.owner_fingerprint != fingerprint {
                continue;
            }
            let opened = Envelope::parse(&entry.payload).and_then(|env| env.open(keypair));
            match opened {
                Ok(plaintext) => letters.push(ReceivedLetter {
                    block_index: block.index,
                    timestamp: block.timestamp.clone(),
                    plaintext,
                }),
                Err(error) => {
                    warn!(block = block.index, error = %error, "Skipping unreadable letter");
                }
            }
        }
    }
    letters
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_chain::{Ledger, RelayMetrics};
    use tempfile::TempDir;

    #[test]
    fn test_decrypt_own_letters_roundtrip_through_ledger() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::open(dir.path(), None).unwrap();

        let alice = LetterKeypair::generate();
        let bob = LetterKeypair::generate();

        // Two letters for alice, one for bob.
        for (recipient, text) in [
            (&alice, "first for alice"),
            (&bob, "for bob"),
            (&alice, "second for alice"),
        ] {
            let envelope =
                Envelope::seal(text.as_bytes(), recipient.public_key()).unwrap();
            ledger
                .append_letter_block(
                    envelope.encode(),
                    recipient.fingerprint(),
                    RelayMetrics::new(),
                )
                .unwrap();
        }

        let letters = decrypt_own_letters(ledger.blocks(), &alice);
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].plaintext, b"first for alice");
        assert_eq!(letters[0].block_index, 1);
        assert_eq!(letters[1].plaintext, b"second for alice");
        assert_eq!(letters[1].block_index, 3);

        let letters = decrypt_own_letters(ledger.blocks(), &bob);
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].plaintext, b"for bob");
    }

    #[test]
    fn test_unreadable_letters_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::open(dir.path(), None).unwrap();
        let alice = LetterKeypair::generate();

        // A garbage payload filed under alice's fingerprint.
        ledger
            .append_letter_block(
                "not an envelope".into(),
                alice.fingerprint(),
                RelayMetrics::new(),
            )
            .unwrap();
        let envelope = Envelope::seal(b"readable", alice.public_key()).unwrap();
        ledger
            .append_letter_block(envelope.encode(), alice.fingerprint(), RelayMetrics::new())
            .unwrap();

        let letters = decrypt_own_letters(ledger.blocks(), &alice);
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].plaintext, b"readable");
    }
}
