use std::sync::Arc;

use alloy_primitives::{Address, U256};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chain::RawLog;
use crate::models::decimal;
use crate::models::governance::VoteCounts;
use crate::store::CacheStore;

use super::decoder::{EventSignature, decode_vote};
use super::head::BlockHeightCache;
use super::scanner::RangeScanner;
use super::{Freshness, FreshnessPolicy, IndexError, ScanPlan, next_marker, plan_scan};

const MAX_TRACKED_TALLIES: u64 = 4_096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TallySnapshot {
    pub proposal_id: U256,
    pub counts: VoteCounts,
    pub last_block: u64,
    pub freshness: Freshness,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedTally {
    #[serde(flatten)]
    counts: VoteCounts,
    #[serde(with = "decimal::u64")]
    last_block: u64,
}

/// Running for/against/abstain totals per proposal, extended incrementally
/// from the last scanned block instead of being recomputed.
pub struct VoteTallyAggregator {
    signature: EventSignature,
    contract: Address,
    start_block: u64,
    store: Arc<dyn CacheStore>,
    scanner: RangeScanner,
    heads: Arc<BlockHeightCache>,
    policy: FreshnessPolicy,
    in_flight: Cache<U256, Arc<Mutex<()>>>,
}

impl VoteTallyAggregator {
    pub fn new(
        signature: EventSignature,
        contract: Address,
        start_block: u64,
        store: Arc<dyn CacheStore>,
        scanner: RangeScanner,
        heads: Arc<BlockHeightCache>,
        policy: FreshnessPolicy,
    ) -> Self {
        Self {
            signature,
            contract,
            start_block,
            store,
            scanner,
            heads,
            policy,
            in_flight: Cache::builder().max_capacity(MAX_TRACKED_TALLIES).build(),
        }
    }

    pub async fn tally(&self, proposal_id: U256) -> Result<TallySnapshot, IndexError> {
        let lock = self
            .in_flight
            .get_with(proposal_id, async { Arc::new(Mutex::new(())) })
            .await;
        let _guard = lock.lock().await;

        let key = tally_key(proposal_id);
        let cached = self.load_cached(&key).await;

        let head = match self.heads.current().await {
            Ok(head) => head,
            Err(err) => {
                return match cached {
                    Some(cached) => {
                        warn!(%proposal_id, "Serving stale vote tally: {err:#}");
                        Ok(TallySnapshot {
                            proposal_id,
                            counts: cached.counts,
                            last_block: cached.last_block,
                            freshness: Freshness::Stale,
                        })
                    }
                    None => Err(IndexError::Unavailable {
                        collection: key,
                        reason: format!("{err:#}"),
                    }),
                };
            }
        };

        let last_block = cached.as_ref().map(|cached| cached.last_block);
        let mut counts = cached.map(|cached| cached.counts).unwrap_or_default();

        let range = match plan_scan(last_block, head, self.start_block, self.policy.threshold) {
            ScanPlan::Reuse => {
                return Ok(TallySnapshot {
                    proposal_id,
                    counts,
                    last_block: last_block.unwrap_or(head),
                    freshness: Freshness::Cached,
                });
            }
            ScanPlan::Scan(range) => range,
        };

        let report = self
            .scanner
            .scan(self.contract, self.signature.selector(), range.clone())
            .await;
        let first_gap = report.first_gap();
        let Some(marker) = next_marker(
            head,
            first_gap,
            self.policy.hold_checkpoint_on_gap,
            self.start_block,
        ) else {
            warn!(
                %proposal_id,
                from_block = *range.start(),
                "Holding vote tally, first chunk of the scan failed"
            );
            return Ok(TallySnapshot {
                proposal_id,
                counts,
                last_block: last_block.unwrap_or_default(),
                freshness: Freshness::Refreshed,
            });
        };

        // Sums are not idempotent: when holding the marker, fold only what lies
        // below it so the rescan does not count those votes twice.
        let counted: Vec<RawLog> = report
            .logs
            .into_iter()
            .filter(|log| log.block_number <= marker)
            .collect();
        let delta = fold_votes(&self.signature, proposal_id, &counted);
        counts.absorb(&delta);

        self.persist(&key, counts, marker).await;
        info!(
            %proposal_id,
            from_block = *range.start(),
            to_block = *range.end(),
            votes = counted.len(),
            last_block = marker,
            "Vote tally refreshed"
        );

        Ok(TallySnapshot {
            proposal_id,
            counts,
            last_block: marker,
            freshness: Freshness::Refreshed,
        })
    }

    async fn load_cached(&self, key: &str) -> Option<CachedTally> {
        match self.store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<CachedTally>(&raw) {
                Ok(cached) => Some(cached),
                Err(err) => {
                    warn!(key, "Discarding corrupt cached tally: {err}");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key, "Cache store read failed, recounting: {err:#}");
                None
            }
        }
    }

    async fn persist(&self, key: &str, counts: VoteCounts, last_block: u64) {
        let record = CachedTally { counts, last_block };
        let encoded = match serde_json::to_string(&record) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(key, "Failed to encode vote tally: {err}");
                return;
            }
        };
        if let Err(err) = self.store.set(key, encoded).await {
            warn!(key, "Failed to persist vote tally: {err:#}");
        }
    }
}

fn tally_key(proposal_id: U256) -> String {
    format!("votes:{proposal_id}")
}

/// Sums the votes cast for `proposal_id` in `logs`. Undecodable logs and
/// unknown support codes are skipped.
pub fn fold_votes(signature: &EventSignature, proposal_id: U256, logs: &[RawLog]) -> VoteCounts {
    let mut counts = VoteCounts::default();
    for log in logs {
        let vote = match decode_vote(signature, log) {
            Ok(vote) => vote,
            Err(err) => {
                warn!(
                    block = log.block_number,
                    log_index = log.log_index,
                    "Skipping undecodable vote: {err}"
                );
                continue;
            }
        };
        if vote.proposal_id != proposal_id {
            continue;
        }
        if !counts.record(vote.support, vote.votes) {
            debug!(
                %proposal_id,
                support = vote.support,
                voter = %vote.voter,
                "Ignoring vote with unknown support code"
            );
        }
    }
    counts
}
