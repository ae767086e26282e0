use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use anyhow::{Result, anyhow};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::chain::{ChainLogSource, RawLog};

pub const DEFAULT_CHUNK_SIZE: u64 = 50_000;
pub const MAX_CHUNK_CONCURRENCY: usize = 5;

/// What a chunk fetch gets before the scanner gives up on it and moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFailurePolicy {
    pub retries: u32,
    pub timeout: Duration,
}

impl Default for ChunkFailurePolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub chunk_size: u64,
    pub concurrency: usize,
    pub failure_policy: ChunkFailurePolicy,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: 1,
            failure_policy: ChunkFailurePolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanReport {
    /// Logs from every chunk that succeeded, ascending by block then log index.
    pub logs: Vec<RawLog>,
    pub chunks: usize,
    pub failed_chunks: Vec<RangeInclusive<u64>>,
}

impl ScanReport {
    pub fn is_complete(&self) -> bool {
        self.failed_chunks.is_empty()
    }

    pub fn first_gap(&self) -> Option<u64> {
        self.failed_chunks.iter().map(|chunk| *chunk.start()).min()
    }
}

/// Consecutive, non-overlapping chunks of at most `chunk_size` blocks
/// covering `from..=to`.
pub fn chunk_ranges(from: u64, to: u64, chunk_size: u64) -> Vec<RangeInclusive<u64>> {
    assert!(chunk_size > 0, "Chunk size must be positive");
    let mut chunks = Vec::new();
    if from > to {
        return chunks;
    }

    let mut start = from;
    loop {
        let end = start.saturating_add(chunk_size - 1).min(to);
        chunks.push(start..=end);
        if end == to {
            break;
        }
        start = end + 1;
    }
    chunks
}

#[derive(Clone)]
pub struct RangeScanner {
    source: Arc<dyn ChainLogSource>,
    options: ScanOptions,
}

impl RangeScanner {
    pub fn new(source: Arc<dyn ChainLogSource>, options: ScanOptions) -> Self {
        assert!(options.chunk_size > 0, "Chunk size must be positive");
        assert!(
            (1..=MAX_CHUNK_CONCURRENCY).contains(&options.concurrency),
            "Chunk concurrency must be between 1 and {MAX_CHUNK_CONCURRENCY}"
        );
        Self { source, options }
    }

    /// Fetches every log for `topic0` emitted by `address` in `range`.
    ///
    /// Never fails as a whole: a chunk that still errors or times out after
    /// the configured retries is skipped and listed in
    /// [`ScanReport::failed_chunks`].
    pub async fn scan(
        &self,
        address: Address,
        topic0: B256,
        range: RangeInclusive<u64>,
    ) -> ScanReport {
        let chunks = chunk_ranges(*range.start(), *range.end(), self.options.chunk_size);
        let chunk_count = chunks.len();

        let outcomes: Vec<(RangeInclusive<u64>, Result<Vec<RawLog>>)> = stream::iter(
            chunks
                .into_iter()
                .map(|chunk| self.fetch_chunk(address, topic0, chunk)),
        )
        .buffered(self.options.concurrency)
        .collect()
        .await;

        let mut report = ScanReport {
            chunks: chunk_count,
            ..ScanReport::default()
        };
        for (chunk, outcome) in outcomes {
            match outcome {
                Ok(logs) => report
                    .logs
                    .extend(logs.into_iter().filter(|log| !log.removed)),
                Err(err) => {
                    warn!(
                        from_block = *chunk.start(),
                        to_block = *chunk.end(),
                        "Skipping chunk after failed log fetch: {err:#}"
                    );
                    report.failed_chunks.push(chunk);
                }
            }
        }

        report
            .logs
            .sort_by_key(|log| (log.block_number, log.log_index));
        debug!(
            %topic0,
            chunks = report.chunks,
            failed = report.failed_chunks.len(),
            complete = report.is_complete(),
            logs = report.logs.len(),
            "Range scan finished"
        );
        report
    }

    async fn fetch_chunk(
        &self,
        address: Address,
        topic0: B256,
        chunk: RangeInclusive<u64>,
    ) -> (RangeInclusive<u64>, Result<Vec<RawLog>>) {
        let policy = self.options.failure_policy;
        let mut attempt = 0u32;
        loop {
            let fetch = self.source.fetch_logs(address, topic0, chunk.clone());
            let outcome = match tokio::time::timeout(policy.timeout, fetch).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("log fetch timed out after {:?}", policy.timeout)),
            };

            match outcome {
                Ok(logs) => return (chunk, Ok(logs)),
                Err(err) if attempt < policy.retries => {
                    attempt += 1;
                    debug!(
                        from_block = *chunk.start(),
                        to_block = *chunk.end(),
                        attempt,
                        "Retrying chunk: {err:#}"
                    );
                }
                Err(err) => return (chunk, Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::decoder::{EventSignature, PROPOSAL_CREATED};
    use crate::testing::{GOVERNOR, MockChain, proposal_log};

    fn scanner(chain: &Arc<MockChain>, options: ScanOptions) -> RangeScanner {
        RangeScanner::new(Arc::clone(chain) as Arc<dyn ChainLogSource>, options)
    }

    #[test]
    fn chunks_cover_the_range_without_overlap() {
        assert_eq!(
            chunk_ranges(1_000, 1_000 + 2 * 50_000 + 10, 50_000),
            vec![1_000..=50_999, 51_000..=100_999, 101_000..=101_010]
        );
        assert_eq!(chunk_ranges(5, 5, 10), vec![5..=5]);
        assert_eq!(chunk_ranges(0, 19, 10), vec![0..=9, 10..=19]);
        assert!(chunk_ranges(10, 9, 10).is_empty());
        assert_eq!(
            chunk_ranges(u64::MAX - 1, u64::MAX, 10),
            vec![u64::MAX - 1..=u64::MAX]
        );
    }

    #[tokio::test]
    async fn failed_chunk_is_skipped_and_reported() {
        let signature = EventSignature::parse(PROPOSAL_CREATED).unwrap();
        let chain = Arc::new(MockChain::at_height(400));
        chain.push_log(proposal_log(&signature, 1, 50, "one"));
        chain.push_log(proposal_log(&signature, 2, 150, "two"));
        chain.push_log(proposal_log(&signature, 3, 250, "three"));
        chain.fail_chunk(100..=199);

        let options = ScanOptions {
            chunk_size: 100,
            ..ScanOptions::default()
        };
        let report = scanner(&chain, options)
            .scan(GOVERNOR, signature.selector(), 0..=299)
            .await;

        assert_eq!(report.chunks, 3);
        assert_eq!(report.failed_chunks, vec![100..=199]);
        assert_eq!(report.first_gap(), Some(100));
        let blocks: Vec<u64> = report.logs.iter().map(|log| log.block_number).collect();
        assert_eq!(blocks, vec![50, 250]);
    }

    #[tokio::test]
    async fn retries_before_skipping() {
        let signature = EventSignature::parse(PROPOSAL_CREATED).unwrap();
        let chain = Arc::new(MockChain::at_height(100));
        chain.fail_chunk(0..=99);

        let options = ScanOptions {
            chunk_size: 100,
            concurrency: 1,
            failure_policy: ChunkFailurePolicy {
                retries: 2,
                timeout: Duration::from_secs(1),
            },
        };
        let report = scanner(&chain, options)
            .scan(GOVERNOR, signature.selector(), 0..=99)
            .await;

        assert!(!report.is_complete());
        assert_eq!(chain.calls().len(), 3, "one attempt plus two retries");
    }

    #[tokio::test]
    async fn hanging_chunk_times_out_like_a_failure() {
        let signature = EventSignature::parse(PROPOSAL_CREATED).unwrap();
        let chain = Arc::new(MockChain::at_height(200));
        chain.push_log(proposal_log(&signature, 9, 120, "late"));
        chain.hang_chunk(0..=99);

        let options = ScanOptions {
            chunk_size: 100,
            concurrency: 1,
            failure_policy: ChunkFailurePolicy {
                retries: 0,
                timeout: Duration::from_millis(50),
            },
        };
        let report = scanner(&chain, options)
            .scan(GOVERNOR, signature.selector(), 0..=199)
            .await;

        assert_eq!(report.failed_chunks, vec![0..=99]);
        assert_eq!(report.logs.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_scan_keeps_ascending_order() {
        let signature = EventSignature::parse(PROPOSAL_CREATED).unwrap();
        let chain = Arc::new(MockChain::at_height(1_000));
        for (id, block) in [(4u64, 950u64), (1, 5), (3, 640), (2, 333)] {
            chain.push_log(proposal_log(&signature, id, block, "p"));
        }

        let options = ScanOptions {
            chunk_size: 100,
            concurrency: 4,
            ..ScanOptions::default()
        };
        let report = scanner(&chain, options)
            .scan(GOVERNOR, signature.selector(), 0..=999)
            .await;

        assert_eq!(report.chunks, 10);
        let blocks: Vec<u64> = report.logs.iter().map(|log| log.block_number).collect();
        assert_eq!(blocks, vec![5, 333, 640, 950]);
    }

    #[tokio::test]
    async fn removed_logs_are_dropped() {
        let signature = EventSignature::parse(PROPOSAL_CREATED).unwrap();
        let chain = Arc::new(MockChain::at_height(100));
        let mut reorged = proposal_log(&signature, 1, 10, "gone");
        reorged.removed = true;
        chain.push_log(reorged);

        let report = scanner(&chain, ScanOptions::default())
            .scan(GOVERNOR, signature.selector(), 0..=99)
            .await;
        assert!(report.logs.is_empty());
        assert!(report.is_complete());
    }
}
