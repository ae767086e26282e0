//! Capability the indexer needs from a chain node: logs by range and the
//! current height. The JSON-RPC implementation lives in [`crate::rpc`].

use std::ops::RangeInclusive;

use alloy_primitives::{Address, B256, Bytes};
use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: Option<B256>,
    pub removed: bool,
}

impl RawLog {
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }
}

#[async_trait]
pub trait ChainLogSource: Send + Sync {
    /// Logs emitted by `address` whose first topic is `topic0`, for blocks in
    /// `range` (both ends inclusive).
    async fn fetch_logs(
        &self,
        address: Address,
        topic0: B256,
        range: RangeInclusive<u64>,
    ) -> Result<Vec<RawLog>>;

    async fn current_block_height(&self) -> Result<u64>;
}
