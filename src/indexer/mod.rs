pub mod collection;
pub mod decoder;
pub mod head;
pub mod scanner;
pub mod tally;

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::chain::{ChainLogSource, RawLog};
use crate::config::{ContractsConfig, IndexerConfig};
use crate::models::decimal::parse_u256;
use crate::models::governance::{Candidate, GovernanceItem, Proposal, ProposalStatus};
use crate::store::CacheStore;

use collection::{CollectionSpec, IncrementalIndexer};
use decoder::{
    CANDIDATE_CREATED, CANDIDATE_CREATED_LEGACY, DecodeError, EventSignature, PROPOSAL_CREATED,
    VOTE_CAST,
};
use head::BlockHeightCache;
use scanner::RangeScanner;
use tally::{TallySnapshot, VoteTallyAggregator};

/// An entity reconstructed from a single creation log.
pub trait IndexedEntity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique within its collection; later logs with a known key are ignored.
    fn key(&self) -> String;

    fn created_block(&self) -> u64;

    fn decode(signature: &EventSignature, log: &RawLog) -> Result<Self, DecodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Served from cache; the chain head is within the freshness threshold.
    Cached,
    /// The delta since the cached marker was scanned during this call.
    Refreshed,
    /// The chain head could not be read, so the last cached view is served.
    Stale,
}

#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub items: Vec<T>,
    pub last_block: u64,
    pub freshness: Freshness,
}

impl<T> Snapshot<T> {
    pub fn new(items: Vec<T>, last_block: u64, freshness: Freshness) -> Self {
        Self {
            items,
            last_block,
            freshness,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("{collection} unavailable: {reason}")]
    Unavailable { collection: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    /// Blocks the head may move past the cached marker before a rescan.
    pub threshold: u64,
    pub hold_checkpoint_on_gap: bool,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            threshold: 100,
            hold_checkpoint_on_gap: false,
        }
    }
}

impl From<&IndexerConfig> for FreshnessPolicy {
    fn from(config: &IndexerConfig) -> Self {
        Self {
            threshold: config.freshness_threshold,
            hold_checkpoint_on_gap: config.hold_checkpoint_on_gap,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPlan {
    Reuse,
    Scan(RangeInclusive<u64>),
}

/// Decides between serving the cache and scanning the blocks it is missing.
pub fn plan_scan(last_block: Option<u64>, head: u64, start_block: u64, threshold: u64) -> ScanPlan {
    match last_block {
        None => ScanPlan::Scan(start_block..=head),
        Some(last) if last >= head => ScanPlan::Reuse,
        Some(last) if head - last < threshold => ScanPlan::Reuse,
        Some(last) => ScanPlan::Scan(last.saturating_add(1).max(start_block)..=head),
    }
}

/// Marker persisted after a scan up to `head`. With `hold_on_gap` the marker
/// stops right before the first failed chunk so the next scan retries it;
/// `None` when that chunk starts at `start_block` and nothing was covered.
pub fn next_marker(
    head: u64,
    first_gap: Option<u64>,
    hold_on_gap: bool,
    start_block: u64,
) -> Option<u64> {
    match first_gap {
        Some(gap) if hold_on_gap && gap <= start_block => None,
        Some(gap) if hold_on_gap => Some((gap - 1).min(head)),
        _ => Some(head),
    }
}

/// Pure lifecycle of a proposal relative to a chain height.
pub fn proposal_status(proposal: &Proposal, head: u64) -> ProposalStatus {
    if head < proposal.start_block {
        ProposalStatus::Pending
    } else if head <= proposal.end_block {
        ProposalStatus::Active
    } else {
        ProposalStatus::Ended
    }
}

/// Read side of the governance index: proposals, candidates and vote tallies
/// reconstructed from contract logs and kept warm in a [`CacheStore`].
pub struct GovernanceIndex {
    proposals: IncrementalIndexer<Proposal>,
    candidates: IncrementalIndexer<Candidate>,
    tallies: VoteTallyAggregator,
    heads: Arc<BlockHeightCache>,
}

impl GovernanceIndex {
    pub fn new(
        source: Arc<dyn ChainLogSource>,
        store: Arc<dyn CacheStore>,
        contracts: &ContractsConfig,
        config: &IndexerConfig,
    ) -> Result<Self> {
        let governor = contracts.governor_address()?;
        let data = contracts.data_address()?;
        let heads = Arc::new(BlockHeightCache::new(
            source.clone(),
            config.block_height_ttl(),
        ));
        let scanner = RangeScanner::new(source, config.scan_options());
        let policy = FreshnessPolicy::from(config);

        let proposals = IncrementalIndexer::new(
            CollectionSpec {
                name: "proposals",
                contract: governor,
                start_block: contracts.governor_start_block,
                signatures: vec![EventSignature::parse(PROPOSAL_CREATED)?],
            },
            store.clone(),
            scanner.clone(),
            heads.clone(),
            policy,
        );
        let candidates = IncrementalIndexer::new(
            CollectionSpec {
                name: "candidates",
                contract: data,
                start_block: contracts.data_start_block,
                signatures: vec![
                    EventSignature::parse(CANDIDATE_CREATED)?,
                    EventSignature::parse(CANDIDATE_CREATED_LEGACY)?,
                ],
            },
            store.clone(),
            scanner.clone(),
            heads.clone(),
            policy,
        );
        let tallies = VoteTallyAggregator::new(
            EventSignature::parse(VOTE_CAST)?,
            governor,
            contracts.vote_start_block(),
            store,
            scanner,
            heads.clone(),
            policy,
        );

        Ok(Self {
            proposals,
            candidates,
            tallies,
            heads,
        })
    }

    pub async fn list_proposals(&self) -> Result<Snapshot<Proposal>, IndexError> {
        self.proposals.snapshot().await
    }

    pub async fn list_candidates(&self) -> Result<Snapshot<Candidate>, IndexError> {
        self.candidates.snapshot().await
    }

    /// A decimal key is tried as a proposal id first, then as a candidate
    /// slug; anything else is a slug.
    pub async fn get_proposal_by_slug_or_id(
        &self,
        key: &str,
    ) -> Result<Option<GovernanceItem>, IndexError> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(None);
        }

        if let Ok(id) = parse_u256(key) {
            let proposals = self.list_proposals().await?;
            if let Some(proposal) = proposals.items.into_iter().find(|p| p.id == id) {
                return Ok(Some(GovernanceItem::Proposal(proposal)));
            }
        }

        let candidates = self.list_candidates().await?;
        Ok(candidates
            .items
            .into_iter()
            .find(|candidate| candidate.slug == key)
            .map(GovernanceItem::Candidate))
    }

    pub async fn get_vote_tally(&self, proposal_id: U256) -> Result<TallySnapshot, IndexError> {
        self.tallies.tally(proposal_id).await
    }

    pub async fn current_block_height(&self) -> Result<u64> {
        self.heads.current().await
    }

    /// Refreshes both collections every `interval` until `shutdown` flips,
    /// so request handlers mostly hit a fresh cache.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        assert!(!interval.is_zero(), "Warm interval must be positive");
        info!(interval_ms = interval.as_millis() as u64, "Starting index warmer loop");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    match changed {
                        Ok(_) => {
                            if *shutdown.borrow() {
                                info!("Index warmer shutdown signal received");
                                break;
                            }
                        }
                        Err(_) => {
                            warn!("Shutdown channel closed unexpectedly. Exiting warmer loop");
                            break;
                        }
                    }
                }
                _ = sleep(interval) => {
                    self.warm().await;
                }
            }
        }

        Ok(())
    }

    async fn warm(&self) {
        match self.list_proposals().await {
            Ok(snapshot) => debug!(
                collection = self.proposals.name(),
                items = snapshot.items.len(),
                last_block = snapshot.last_block,
                "Warmed collection"
            ),
            Err(err) => warn!("Warmer could not refresh proposals: {err}"),
        }
        match self.list_candidates().await {
            Ok(snapshot) => debug!(
                collection = self.candidates.name(),
                items = snapshot.items.len(),
                last_block = snapshot.last_block,
                "Warmed collection"
            ),
            Err(err) => warn!("Warmer could not refresh candidates: {err}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::IndexerConfig;
    use crate::store::MemoryCacheStore;
    use crate::testing::{GOVERNOR, MockChain, PROPOSER, candidate_log, proposal_log};

    pub(crate) fn contracts() -> ContractsConfig {
        ContractsConfig {
            governor_address: GOVERNOR.to_string(),
            governor_start_block: 1_000,
            data_address: GOVERNOR.to_string(),
            data_start_block: 1_000,
            vote_start_block: None,
        }
    }

    pub(crate) fn index_over(chain: &Arc<MockChain>) -> GovernanceIndex {
        GovernanceIndex::new(
            chain.clone(),
            Arc::new(MemoryCacheStore::new()),
            &contracts(),
            &IndexerConfig::default(),
        )
        .expect("index builds")
    }

    fn proposal(start_block: u64, end_block: u64) -> Proposal {
        Proposal {
            id: U256::from(1u64),
            proposer: PROPOSER,
            start_block,
            end_block,
            description: String::new(),
            title: String::new(),
            created_block: 0,
            transaction_hash: String::new(),
        }
    }

    #[test]
    fn plan_covers_cold_fresh_and_stale_caches() {
        assert_eq!(plan_scan(None, 5_000, 1_000, 100), ScanPlan::Scan(1_000..=5_000));
        assert_eq!(plan_scan(Some(4_950), 5_000, 1_000, 100), ScanPlan::Reuse);
        assert_eq!(plan_scan(Some(4_901), 5_000, 1_000, 100), ScanPlan::Reuse);
        assert_eq!(
            plan_scan(Some(4_900), 5_000, 1_000, 100),
            ScanPlan::Scan(4_901..=5_000)
        );
        // a provider lagging behind the cached marker
        assert_eq!(plan_scan(Some(6_000), 5_000, 1_000, 0), ScanPlan::Reuse);
        assert_eq!(plan_scan(Some(10), 5_000, 1_000, 0), ScanPlan::Scan(1_000..=5_000));
    }

    #[test]
    fn marker_holds_before_first_gap_only_when_asked() {
        assert_eq!(next_marker(900, None, true, 0), Some(900));
        assert_eq!(next_marker(900, Some(500), false, 0), Some(900));
        assert_eq!(next_marker(900, Some(500), true, 0), Some(499));
        assert_eq!(next_marker(900, Some(0), false, 0), Some(900));
        assert_eq!(next_marker(900, Some(0), true, 0), None);
        assert_eq!(next_marker(900, Some(100), true, 100), None);
    }

    #[test]
    fn status_follows_voting_window() {
        let proposal = proposal(110, 200);
        assert_eq!(proposal_status(&proposal, 100), ProposalStatus::Pending);
        assert_eq!(proposal_status(&proposal, 110), ProposalStatus::Active);
        assert_eq!(proposal_status(&proposal, 200), ProposalStatus::Active);
        assert_eq!(proposal_status(&proposal, 201), ProposalStatus::Ended);
    }

    #[tokio::test]
    async fn lookup_prefers_proposal_ids_then_slugs() {
        let chain = Arc::new(MockChain::at_height(20_000));
        let proposals = EventSignature::parse(PROPOSAL_CREATED).unwrap();
        let candidates = EventSignature::parse(CANDIDATE_CREATED).unwrap();
        chain.push_log(proposal_log(&proposals, 42, 5_000, "# Forty two"));
        chain.push_log(candidate_log(&candidates, "42", 6_000, 0));
        chain.push_log(candidate_log(&candidates, "7", 6_500, 0));
        chain.push_log(candidate_log(&candidates, "lil-vibes", 7_000, 42));
        let index = index_over(&chain);

        match index.get_proposal_by_slug_or_id("42").await.unwrap() {
            Some(GovernanceItem::Proposal(found)) => assert_eq!(found.title, "Forty two"),
            other => panic!("expected proposal, got {other:?}"),
        }
        match index.get_proposal_by_slug_or_id("7").await.unwrap() {
            Some(GovernanceItem::Candidate(found)) => assert_eq!(found.slug, "7"),
            other => panic!("expected candidate, got {other:?}"),
        }
        match index.get_proposal_by_slug_or_id("lil-vibes").await.unwrap() {
            Some(GovernanceItem::Candidate(found)) => {
                assert_eq!(found.proposal_id_to_update, Some(U256::from(42u64)))
            }
            other => panic!("expected candidate, got {other:?}"),
        }
        assert_eq!(index.get_proposal_by_slug_or_id("missing").await.unwrap(), None);
        assert_eq!(index.get_proposal_by_slug_or_id("  ").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lookup_without_chain_or_cache_is_unavailable() {
        let chain = Arc::new(MockChain::default());
        let index = index_over(&chain);
        assert!(matches!(
            index.get_proposal_by_slug_or_id("1").await,
            Err(IndexError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn warmer_refreshes_until_shutdown() {
        let chain = Arc::new(MockChain::at_height(5_000));
        let index = Arc::new(index_over(&chain));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(index.clone().run(Duration::from_millis(10), shutdown_rx));
        sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        // proposals scanned once, candidates once per shape; later ticks hit the cache
        assert_eq!(chain.calls().len(), 3);
        let snapshot = index.list_proposals().await.unwrap();
        assert_eq!(snapshot.freshness, Freshness::Cached);
    }
}
