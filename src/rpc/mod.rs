use std::ops::RangeInclusive;
use std::time::Duration;

use alloy_primitives::{Address, B256, Bytes, U64};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::{ChainLogSource, RawLog};

const MAX_LOGS_PER_RESPONSE: usize = 100_000;

#[derive(Clone)]
pub struct RpcClient {
    inner: HttpClient,
}

impl RpcClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        assert!(!endpoint.is_empty(), "RPC endpoint must be provided");
        assert!(
            timeout >= Duration::from_millis(100),
            "Timeout below 100ms is unsafe"
        );

        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(endpoint)
            .with_context(|| format!("Failed to build RPC client for {endpoint}"))?;

        Ok(Self { inner: client })
    }

    pub async fn fetch_latest_block_number(&self) -> Result<u64> {
        let response: U64 = self
            .inner
            .request("eth_blockNumber", rpc_params![])
            .await
            .context("RPC call eth_blockNumber failed")?;
        let height = response.to::<u64>();
        if height >= 1_000_000_000_000 {
            return Err(anyhow!("Block height {height} failed sanity check"));
        }
        Ok(height)
    }

    pub async fn fetch_logs_in_range(
        &self,
        address: Address,
        topic0: B256,
        range: RangeInclusive<u64>,
    ) -> Result<Vec<RawLog>> {
        let (from_block, to_block) = (*range.start(), *range.end());
        assert!(from_block <= to_block, "Log range must be ordered");

        let filter = LogFilter {
            address,
            topics: vec![topic0],
            from_block: U64::from(from_block),
            to_block: U64::from(to_block),
        };
        let response: Vec<RpcLog> = self
            .inner
            .request("eth_getLogs", rpc_params![filter])
            .await
            .with_context(|| format!("RPC call eth_getLogs failed for [{from_block}, {to_block}]"))?;
        if response.len() > MAX_LOGS_PER_RESPONSE {
            return Err(anyhow!(
                "eth_getLogs returned {} logs which exceeds the defensive bound of {MAX_LOGS_PER_RESPONSE}",
                response.len()
            ));
        }

        let mut logs = Vec::with_capacity(response.len());
        for entry in response {
            match RawLog::try_from(entry) {
                Ok(log) => logs.push(log),
                Err(err) => debug!(from_block, to_block, "Ignoring pending log: {err}"),
            }
        }
        Ok(logs)
    }
}

#[async_trait]
impl ChainLogSource for RpcClient {
    async fn fetch_logs(
        &self,
        address: Address,
        topic0: B256,
        range: RangeInclusive<u64>,
    ) -> Result<Vec<RawLog>> {
        self.fetch_logs_in_range(address, topic0, range).await
    }

    async fn current_block_height(&self) -> Result<u64> {
        self.fetch_latest_block_number().await
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogFilter {
    address: Address,
    topics: Vec<B256>,
    from_block: U64,
    to_block: U64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    #[serde(default)]
    topics: Vec<B256>,
    #[serde(default)]
    data: Bytes,
    block_number: Option<U64>,
    log_index: Option<U64>,
    transaction_hash: Option<B256>,
    #[serde(default)]
    removed: bool,
}

impl TryFrom<RpcLog> for RawLog {
    type Error = anyhow::Error;

    fn try_from(log: RpcLog) -> Result<Self, Self::Error> {
        let block_number = log
            .block_number
            .ok_or_else(|| anyhow!("log without block number"))?;
        Ok(Self {
            address: log.address,
            topics: log.topics,
            data: log.data,
            block_number: block_number.to::<u64>(),
            log_index: log.log_index.map(|index| index.to::<u64>()).unwrap_or(0),
            transaction_hash: log.transaction_hash,
            removed: log.removed,
        })
    }
}
