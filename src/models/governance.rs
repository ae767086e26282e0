use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use super::decimal;

pub const MAX_TITLE_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    #[serde(with = "decimal::u256")]
    pub id: U256,
    pub proposer: Address,
    #[serde(with = "decimal::u64")]
    pub start_block: u64,
    #[serde(with = "decimal::u64")]
    pub end_block: u64,
    pub description: String,
    pub title: String,
    #[serde(with = "decimal::u64")]
    pub created_block: u64,
    #[serde(default)]
    pub transaction_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub slug: String,
    pub proposer: Address,
    pub description: String,
    pub title: String,
    #[serde(with = "decimal::u64")]
    pub created_block: u64,
    #[serde(default)]
    pub targets: Vec<Address>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub calldatas: Vec<String>,
    #[serde(with = "decimal::option_u256", default)]
    pub proposal_id_to_update: Option<U256>,
    #[serde(default)]
    pub encoded_proposal_hash: String,
}

/// A decoded `VoteCast` event, folded into [`VoteCounts`] and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteCast {
    pub voter: Address,
    pub proposal_id: U256,
    pub support: u8,
    pub votes: U256,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteCounts {
    #[serde(with = "decimal::u256")]
    pub for_votes: U256,
    #[serde(with = "decimal::u256")]
    pub against_votes: U256,
    #[serde(with = "decimal::u256")]
    pub abstain_votes: U256,
}

impl VoteCounts {
    /// Adds `votes` to the bucket for `support`. Unknown support codes are
    /// ignored and reported as `false`.
    pub fn record(&mut self, support: u8, votes: U256) -> bool {
        let bucket = match support {
            0 => &mut self.against_votes,
            1 => &mut self.for_votes,
            2 => &mut self.abstain_votes,
            _ => return false,
        };
        *bucket = bucket.saturating_add(votes);
        true
    }

    pub fn absorb(&mut self, other: &VoteCounts) {
        self.for_votes = self.for_votes.saturating_add(other.for_votes);
        self.against_votes = self.against_votes.saturating_add(other.against_votes);
        self.abstain_votes = self.abstain_votes.saturating_add(other.abstain_votes);
    }

    pub fn total(&self) -> U256 {
        self.for_votes
            .saturating_add(self.against_votes)
            .saturating_add(self.abstain_votes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum GovernanceItem {
    Proposal(Proposal),
    Candidate(Candidate),
}

/// First non-empty line of a description with markdown heading markers
/// removed, bounded to [`MAX_TITLE_CHARS`] characters.
pub fn derive_title(description: &str) -> String {
    let Some(line) = description
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
    else {
        return String::new();
    };

    let stripped = line.trim_start_matches('#').trim();
    if stripped.chars().count() <= MAX_TITLE_CHARS {
        return stripped.to_string();
    }
    let truncated: String = stripped.chars().take(MAX_TITLE_CHARS).collect();
    truncated.trim_end().to_string()
}

// Response envelopes for the governance HTTP API

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FreshnessView {
    Cached,
    Refreshed,
    Stale,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalWithStatus {
    #[serde(flatten)]
    pub proposal: Proposal,
    pub status: Option<ProposalStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionResponse<T> {
    pub available: bool,
    pub freshness: FreshnessView,
    #[serde(with = "decimal::u64")]
    pub last_block: u64,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTallyResponse {
    #[serde(with = "decimal::u256")]
    pub proposal_id: U256,
    #[serde(flatten)]
    pub counts: VoteCounts,
    #[serde(with = "decimal::u256")]
    pub total_votes: U256,
    pub freshness: FreshnessView,
    #[serde(with = "decimal::u64")]
    pub last_block: u64,
}
