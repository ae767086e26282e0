use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use moka::future::Cache;

use crate::chain::ChainLogSource;

const HEAD_KEY: &str = "head";

/// Chain height memoised for about one block time. Concurrent lookups while
/// the entry is empty share a single RPC call.
pub struct BlockHeightCache {
    source: Arc<dyn ChainLogSource>,
    cache: Cache<&'static str, u64>,
}

impl BlockHeightCache {
    pub fn new(source: Arc<dyn ChainLogSource>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(1)
            .time_to_live(ttl)
            .build();
        Self { source, cache }
    }

    pub async fn current(&self) -> Result<u64> {
        self.cache
            .try_get_with(HEAD_KEY, self.source.current_block_height())
            .await
            .map_err(|err| anyhow!("chain height unavailable: {err:#}"))
    }

    pub async fn invalidate(&self) {
        self.cache.invalidate(HEAD_KEY).await;
    }
}
