use std::collections::HashSet;
use std::marker::PhantomData;
use std::ops::RangeInclusive;
use std::sync::Arc;

use alloy_primitives::Address;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chain::RawLog;
use crate::models::decimal::parse_u64;
use crate::store::CacheStore;

use super::decoder::EventSignature;
use super::head::BlockHeightCache;
use super::scanner::RangeScanner;
use super::{
    Freshness, FreshnessPolicy, IndexError, IndexedEntity, ScanPlan, Snapshot, next_marker,
    plan_scan,
};

/// Where a collection lives on chain and which event shapes create it.
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub name: &'static str,
    pub contract: Address,
    pub start_block: u64,
    /// Primary shape first; later entries are tried only when the earlier
    /// ones return no logs for the scanned range.
    pub signatures: Vec<EventSignature>,
}

struct CachedCollection<T> {
    items: Vec<T>,
    last_block: u64,
}

struct ScanOutcome<T> {
    entities: Vec<T>,
    first_gap: Option<u64>,
}

pub struct IncrementalIndexer<T> {
    spec: CollectionSpec,
    store: Arc<dyn CacheStore>,
    scanner: RangeScanner,
    heads: Arc<BlockHeightCache>,
    policy: FreshnessPolicy,
    in_flight: Mutex<()>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: IndexedEntity> IncrementalIndexer<T> {
    pub fn new(
        spec: CollectionSpec,
        store: Arc<dyn CacheStore>,
        scanner: RangeScanner,
        heads: Arc<BlockHeightCache>,
        policy: FreshnessPolicy,
    ) -> Self {
        assert!(
            !spec.signatures.is_empty(),
            "A collection needs at least one event signature"
        );
        assert!(!spec.name.is_empty(), "Collection name cannot be empty");
        Self {
            spec,
            store,
            scanner,
            heads,
            policy,
            in_flight: Mutex::new(()),
            _entity: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    fn entities_key(&self) -> String {
        format!("{}:entities", self.spec.name)
    }

    fn marker_key(&self) -> String {
        format!("{}:last_block", self.spec.name)
    }

    /// Returns the collection newest first, scanning only the blocks added
    /// since the cached marker when the cache has fallen behind.
    pub async fn snapshot(&self) -> Result<Snapshot<T>, IndexError> {
        // One scan per collection at a time; waiters see the fresh cache.
        let _guard = self.in_flight.lock().await;
        let cached = self.load_cached().await;

        let head = match self.heads.current().await {
            Ok(head) => head,
            Err(err) => return self.fallback(cached, &err),
        };

        let (existing, last_block) = match cached {
            Some(cached) => (cached.items, Some(cached.last_block)),
            None => (Vec::new(), None),
        };

        let range = match plan_scan(
            last_block,
            head,
            self.spec.start_block,
            self.policy.threshold,
        ) {
            ScanPlan::Reuse => {
                debug!(collection = self.spec.name, head, "Serving cached collection");
                return Ok(Snapshot::new(
                    existing,
                    last_block.unwrap_or(head),
                    Freshness::Cached,
                ));
            }
            ScanPlan::Scan(range) => range,
        };

        let outcome = self.scan_range(range.clone()).await;
        let added = outcome.entities.len();
        let merged = merge_entities(existing, outcome.entities);
        let Some(marker) = next_marker(
            head,
            outcome.first_gap,
            self.policy.hold_checkpoint_on_gap,
            self.spec.start_block,
        ) else {
            // First chunk failed: nothing contiguous to record, keep the cache as is.
            warn!(
                collection = self.spec.name,
                from_block = *range.start(),
                "Holding cache marker, first chunk of the scan failed"
            );
            return Ok(Snapshot::new(
                merged,
                last_block.unwrap_or_default(),
                Freshness::Refreshed,
            ));
        };
        self.persist(&merged, marker).await;

        info!(
            collection = self.spec.name,
            from_block = *range.start(),
            to_block = *range.end(),
            decoded = added,
            total = merged.len(),
            last_block = marker,
            "Collection refreshed"
        );
        Ok(Snapshot::new(merged, marker, Freshness::Refreshed))
    }

    async fn scan_range(&self, range: RangeInclusive<u64>) -> ScanOutcome<T> {
        let mut first_gap: Option<u64> = None;
        let variants = self.spec.signatures.len();

        for (position, signature) in self.spec.signatures.iter().enumerate() {
            let report = self
                .scanner
                .scan(self.spec.contract, signature.selector(), range.clone())
                .await;
            first_gap = match (first_gap, report.first_gap()) {
                (Some(current), Some(gap)) => Some(current.min(gap)),
                (current, gap) => current.or(gap),
            };

            if report.logs.is_empty() && position + 1 < variants {
                debug!(
                    collection = self.spec.name,
                    signature = %signature.canonical(),
                    "No logs for event shape, trying alternate"
                );
                continue;
            }

            let entities = decode_logs(self.spec.name, signature, &report.logs);
            return ScanOutcome {
                entities,
                first_gap,
            };
        }

        ScanOutcome {
            entities: Vec::new(),
            first_gap,
        }
    }

    async fn load_cached(&self) -> Option<CachedCollection<T>> {
        let collection = self.spec.name;
        let marker = match self.store.get(&self.marker_key()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(collection, "Cache store read failed, rebuilding: {err:#}");
                return None;
            }
        };
        let last_block = match parse_u64(&marker) {
            Ok(block) => block,
            Err(err) => {
                warn!(collection, "Discarding corrupt cache marker: {err}");
                return None;
            }
        };

        let raw_items = match self.store.get(&self.entities_key()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                warn!(collection, "Cache marker present without entities, rebuilding");
                return None;
            }
            Err(err) => {
                warn!(collection, "Cache store read failed, rebuilding: {err:#}");
                return None;
            }
        };
        match serde_json::from_str::<Vec<T>>(&raw_items) {
            Ok(items) => Some(CachedCollection { items, last_block }),
            Err(err) => {
                warn!(collection, "Discarding corrupt cached entities: {err}");
                None
            }
        }
    }

    async fn persist(&self, items: &[T], last_block: u64) {
        let collection = self.spec.name;
        let encoded = match serde_json::to_string(items) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(collection, "Failed to encode collection for caching: {err}");
                return;
            }
        };

        // Entities before the marker: a crash in between only causes a rescan.
        if let Err(err) = self.store.set(&self.entities_key(), encoded).await {
            warn!(collection, "Failed to persist cached entities: {err:#}");
            return;
        }
        if let Err(err) = self
            .store
            .set(&self.marker_key(), last_block.to_string())
            .await
        {
            warn!(collection, "Failed to persist cache marker: {err:#}");
        }
    }

    fn fallback(
        &self,
        cached: Option<CachedCollection<T>>,
        err: &anyhow::Error,
    ) -> Result<Snapshot<T>, IndexError> {
        match cached {
            Some(cached) => {
                warn!(
                    collection = self.spec.name,
                    last_block = cached.last_block,
                    "Serving stale collection: {err:#}"
                );
                Ok(Snapshot::new(
                    cached.items,
                    cached.last_block,
                    Freshness::Stale,
                ))
            }
            None => Err(IndexError::Unavailable {
                collection: self.spec.name.to_string(),
                reason: format!("{err:#}"),
            }),
        }
    }
}

fn decode_logs<T: IndexedEntity>(
    collection: &str,
    signature: &EventSignature,
    logs: &[RawLog],
) -> Vec<T> {
    let mut entities = Vec::with_capacity(logs.len());
    for log in logs {
        match T::decode(signature, log) {
            Ok(entity) => entities.push(entity),
            Err(err) => warn!(
                collection,
                event = signature.name(),
                block = log.block_number,
                log_index = log.log_index,
                "Skipping undecodable log: {err}"
            ),
        }
    }
    entities
}

/// Adds `incoming` entities whose key is not already present; the first
/// observation of a key always wins.
pub fn merge_entities<T: IndexedEntity>(existing: Vec<T>, incoming: Vec<T>) -> Vec<T> {
    let mut seen: HashSet<String> = existing.iter().map(IndexedEntity::key).collect();
    let mut merged = existing;
    for entity in incoming {
        if seen.insert(entity.key()) {
            merged.push(entity);
        } else {
            debug!(key = %entity.key(), "Ignoring already indexed entity");
        }
    }
    sort_newest_first(&mut merged);
    merged
}

pub fn sort_newest_first<T: IndexedEntity>(items: &mut [T]) {
    items.sort_by(|a, b| b.created_block().cmp(&a.created_block()));
}
