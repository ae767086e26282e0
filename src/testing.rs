//! Scripted chain source and log builders shared by unit tests.

use std::ops::RangeInclusive;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::{Address, B256, Bytes, U256, address};
use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::chain::{ChainLogSource, RawLog};
use crate::indexer::decoder::EventSignature;
use crate::store::{CacheStore, MemoryCacheStore};

pub const GOVERNOR: Address = address!("5d2c31ce16924c2a71d317e5bbfd5ce387854039");
pub const PROPOSER: Address = address!("00000000000000000000000000000000000000aa");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub topic0: B256,
    pub from_block: u64,
    pub to_block: u64,
}

#[derive(Default)]
pub struct MockChain {
    height: Mutex<Option<u64>>,
    logs: Mutex<Vec<RawLog>>,
    failing: Mutex<Vec<RangeInclusive<u64>>>,
    hanging: Mutex<Vec<RangeInclusive<u64>>>,
    calls: Mutex<Vec<FetchCall>>,
    height_calls: AtomicUsize,
}

impl MockChain {
    pub fn at_height(height: u64) -> Self {
        let chain = Self::default();
        chain.set_height(Some(height));
        chain
    }

    /// `None` makes every height lookup fail.
    pub fn set_height(&self, height: Option<u64>) {
        *self.height.lock().unwrap() = height;
    }

    pub fn push_log(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    /// Fetches for exactly this chunk fail until [`MockChain::heal`] is called.
    pub fn fail_chunk(&self, range: RangeInclusive<u64>) {
        self.failing.lock().unwrap().push(range);
    }

    pub fn hang_chunk(&self, range: RangeInclusive<u64>) {
        self.hanging.lock().unwrap().push(range);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.hanging.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, topic0: B256) -> Vec<FetchCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.topic0 == topic0)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn height_calls(&self) -> usize {
        self.height_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainLogSource for MockChain {
    async fn fetch_logs(
        &self,
        address: Address,
        topic0: B256,
        range: RangeInclusive<u64>,
    ) -> Result<Vec<RawLog>> {
        self.calls.lock().unwrap().push(FetchCall {
            topic0,
            from_block: *range.start(),
            to_block: *range.end(),
        });

        let hangs = self.hanging.lock().unwrap().contains(&range);
        if hangs {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }
        let fails = self.failing.lock().unwrap().contains(&range);
        if fails {
            return Err(anyhow!("429 Too Many Requests"));
        }

        let logs = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                log.address == address
                    && log.topic0() == Some(topic0)
                    && range.contains(&log.block_number)
            })
            .cloned()
            .collect();
        Ok(logs)
    }

    async fn current_block_height(&self) -> Result<u64> {
        self.height_calls.fetch_add(1, Ordering::SeqCst);
        self.height
            .lock()
            .unwrap()
            .ok_or_else(|| anyhow!("connection refused"))
    }
}

/// Memory store whose reads and writes can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryCacheStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl FlakyStore {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Writes that reached the underlying store.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("cache read refused for {key}"));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("cache write refused for {key}"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value).await
    }
}

fn raw_log(signature: &EventSignature, indexed: Vec<B256>, body: Vec<DynSolValue>, block: u64) -> RawLog {
    let mut topics = vec![signature.selector()];
    topics.extend(indexed);
    RawLog {
        address: GOVERNOR,
        topics,
        data: Bytes::from(DynSolValue::Tuple(body).abi_encode_params()),
        block_number: block,
        log_index: 0,
        transaction_hash: Some(B256::with_last_byte((block % 251) as u8)),
        removed: false,
    }
}

fn uint(value: u64) -> DynSolValue {
    DynSolValue::Uint(U256::from(value), 256)
}

pub fn proposal_log(signature: &EventSignature, id: u64, block: u64, description: &str) -> RawLog {
    raw_log(
        signature,
        Vec::new(),
        vec![
            uint(id),
            DynSolValue::Address(PROPOSER),
            DynSolValue::Array(vec![DynSolValue::Address(GOVERNOR)]),
            DynSolValue::Array(vec![uint(0)]),
            DynSolValue::Array(vec![DynSolValue::String(String::new())]),
            DynSolValue::Array(vec![DynSolValue::Bytes(vec![0x01, 0x02])]),
            uint(block + 10),
            uint(block + 100),
            DynSolValue::String(description.to_string()),
        ],
        block,
    )
}

fn candidate_head() -> Vec<DynSolValue> {
    vec![
        DynSolValue::Array(vec![DynSolValue::Address(GOVERNOR)]),
        DynSolValue::Array(vec![DynSolValue::Uint(
            U256::from(1_000_000_000_000_000_000u64),
            256,
        )]),
        DynSolValue::Array(vec![DynSolValue::String(
            "transfer(address,uint256)".to_string(),
        )]),
        DynSolValue::Array(vec![DynSolValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef])]),
    ]
}

pub fn candidate_log(
    signature: &EventSignature,
    slug: &str,
    block: u64,
    proposal_id_to_update: u64,
) -> RawLog {
    let mut body = candidate_head();
    body.extend([
        DynSolValue::String(format!("# {slug}\nDraft body")),
        DynSolValue::String(slug.to_string()),
        uint(proposal_id_to_update),
        DynSolValue::FixedBytes(B256::repeat_byte(0x11), 32),
    ]);
    raw_log(signature, vec![PROPOSER.into_word()], body, block)
}

pub fn legacy_candidate_log(signature: &EventSignature, slug: &str, block: u64) -> RawLog {
    let mut body = candidate_head();
    body.extend([
        DynSolValue::String(format!("# {slug}\nDraft body")),
        DynSolValue::String(slug.to_string()),
        DynSolValue::FixedBytes(B256::repeat_byte(0x22), 32),
    ]);
    raw_log(signature, vec![PROPOSER.into_word()], body, block)
}

pub fn vote_log(
    signature: &EventSignature,
    proposal_id: u64,
    support: u8,
    votes: u64,
    block: u64,
) -> RawLog {
    let voter = Address::with_last_byte((block % 251) as u8);
    raw_log(
        signature,
        vec![voter.into_word()],
        vec![
            uint(proposal_id),
            DynSolValue::Uint(U256::from(support), 8),
            uint(votes),
            DynSolValue::String(String::new()),
        ],
        block,
    )
}
