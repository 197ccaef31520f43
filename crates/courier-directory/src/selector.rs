//! Weighted relay selection.
//!
//! Scores candidates on latency, reachability and chain freshness, with a
//! heavy penalty for relays that look firewall-blocked. Selection is a pure
//! function of its inputs; ties go to the earlier candidate.

use courier_chain::ChainManifest;

use crate::record::RelayRecord;

/// Latency ceiling: anything at or above this scores zero.
const LATENCY_CEILING_MS: f64 = 3000.0;

/// Latency assumed when a candidate has no (or nonsense) latency data.
const LATENCY_DEFAULT_MS: f64 = 1500.0;

/// Score multiplier for relays that look blocked.
const GFW_PENALTY: f64 = 0.2;

/// Scoring inputs extracted from a relay record.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScoreInputs {
    /// Latest probe latency in milliseconds.
    pub latency_ms: Option<f64>,
    /// Reachability in `[0.0, 1.0]`.
    pub reachability: Option<f64>,
    /// How current the candidate's chain is relative to canonical, `[0.0, 1.0]`.
    pub chain_freshness: Option<f64>,
    /// Whether the candidate looks firewall-blocked.
    pub gfw_blocked: bool,
}

impl ScoreInputs {
    /// Extract scoring inputs from a record, deriving freshness from the
    /// canonical manifest when one exists.
    pub fn from_record(record: &RelayRecord, canonical: Option<&ChainManifest>) -> Self {
        let chain_freshness = canonical.and_then(|c| {
            if c.length == 0 {
                None
            } else {
                Some((record.chain_length() as f64 / c.length as f64).min(1.0))
            }
        });
        Self {
            latency_ms: record.latency_ms.map(|l| l as f64),
            reachability: record.reachability,
            chain_freshness,
            gfw_blocked: record.gfw_blocked.unwrap_or(false),
        }
    }
}

/// Score one candidate.
pub fn score(inputs: &ScoreInputs) -> f64 {
    let latency = match inputs.latency_ms {
        Some(l) if l > 0.0 => l,
        _ => LATENCY_DEFAULT_MS,
    };
    let latency_score = (1.0 - latency.min(LATENCY_CEILING_MS) / LATENCY_CEILING_MS).max(0.0);
    let reachability_score = inputs.reachability.unwrap_or(0.5);
    let freshness_score = inputs.chain_freshness.unwrap_or(0.5);
    let penalty = if inputs.gfw_blocked { GFW_PENALTY } else { 1.0 };

    (0.5 * latency_score + 0.25 * reachability_score + 0.25 * freshness_score) * penalty
}

/// Pick the best-scoring relay; ties broken by input order.
///
/// Returns `None` on empty input.
pub fn select_best_relay<'a>(
    candidates: &'a [RelayRecord],
    canonical: Option<&ChainManifest>,
) -> Option<&'a RelayRecord> {
    let mut best: Option<(&RelayRecord, f64)> = None;
    for candidate in candidates {
        let s = score(&ScoreInputs::from_record(candidate, canonical));
        match best {
            Some((_, best_score)) if s <= best_score => {}
            _ => best = Some((candidate, s)),
        }
    }
    best.map(|(record, _)| record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ConnectionMeta, SyncStatus};
    use chrono::Utc;

    fn candidate(
        onion: &str,
        latency_ms: Option<u64>,
        reachability: Option<f64>,
        gfw_blocked: Option<bool>,
    ) -> RelayRecord {
        RelayRecord {
            id: onion.into(),
            onion: onion.into(),
            public_url: Some(format!("http://{}:8080", onion)),
            public_access_url: None,
            nickname: None,
            fingerprint: onion.into(),
            created_at: Utc::now().to_rfc3339(),
            last_seen: Utc::now().to_rfc3339(),
            last_seen_ip: None,
            connection_meta: ConnectionMeta::default(),
            chain_summary: None,
            latency_ms,
            reachability,
            gfw_blocked,
            metrics_sampled_at: None,
            metrics_source: None,
            sync_status: SyncStatus::default(),
        }
    }

    #[test]
    fn test_empty_input_selects_none() {
        assert!(select_best_relay(&[], None).is_none());
    }

    #[test]
    fn test_gfw_penalty_outweighs_latency() {
        // A fast but blocked relay loses to a slower clean one.
        let relays = vec![
            candidate("fast-blocked", Some(100), Some(1.0), Some(true)),
            candidate("slow-clean", Some(400), Some(0.9), Some(false)),
        ];
        let best = select_best_relay(&relays, None).unwrap();
        assert_eq!(best.onion, "slow-clean");

        let blocked = score(&ScoreInputs::from_record(&relays[0], None));
        let clean = score(&ScoreInputs::from_record(&relays[1], None));
        assert!((clean - 0.5333).abs() < 0.001, "got {}", clean);
        assert!((blocked - 0.1591).abs() < 0.001, "got {}", blocked);
    }

    #[test]
    fn test_missing_latency_treated_as_1500ms() {
        let with_default = score(&ScoreInputs {
            latency_ms: None,
            ..ScoreInputs::default()
        });
        let explicit = score(&ScoreInputs {
            latency_ms: Some(1500.0),
            ..ScoreInputs::default()
        });
        assert_eq!(with_default, explicit);

        // Zero and negative latencies also fall back to the default.
        let zero = score(&ScoreInputs {
            latency_ms: Some(0.0),
            ..ScoreInputs::default()
        });
        assert_eq!(zero, with_default);
    }

    #[test]
    fn test_latency_above_ceiling_scores_zero_latency_component() {
        let slow = score(&ScoreInputs {
            latency_ms: Some(9999.0),
            reachability: Some(0.0),
            chain_freshness: Some(0.0),
            gfw_blocked: false,
        });
        assert_eq!(slow, 0.0);
    }

    #[test]
    fn test_ties_break_by_input_order() {
        let relays = vec![
            candidate("first", Some(200), Some(0.8), Some(false)),
            candidate("second", Some(200), Some(0.8), Some(false)),
        ];
        assert_eq!(select_best_relay(&relays, None).unwrap().onion, "first");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let relays = vec![
            candidate("a", Some(300), Some(0.7), Some(false)),
            candidate("b", Some(120), Some(0.95), Some(false)),
            candidate("c", None, None, None),
        ];
        let first = select_best_relay(&relays, None).unwrap().onion.clone();
        for _ in 0..10 {
            assert_eq!(select_best_relay(&relays, None).unwrap().onion, first);
        }
    }

    #[test]
    fn test_freshness_derived_from_canonical() {
        let mut behind = candidate("behind", Some(100), Some(1.0), Some(false));
        let mut current = candidate("current", Some(100), Some(1.0), Some(false));

        let chain = {
            let now = Utc::now();
            let mut blocks = vec![courier_chain::Block::genesis(now)];
            for _ in 0..3 {
                let prev = blocks.last().unwrap();
                blocks.push(courier_chain::Block::next(
                    prev,
                    vec![],
                    Default::default(),
                    "empty".into(),
                    now,
                ));
            }
            blocks
        };
        let canonical = ChainManifest::from_blocks(&chain);
        behind.chain_summary = Some(ChainManifest::from_blocks(&chain[..1]));
        current.chain_summary = Some(canonical.clone());

        let relays = vec![behind, current];
        let best = select_best_relay(&relays, Some(&canonical)).unwrap();
        assert_eq!(best.onion, "current");
    }
}
