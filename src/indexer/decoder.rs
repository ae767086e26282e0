use std::collections::HashMap;

use alloy_dyn_abi::{DynSolValue, EventExt};
use alloy_json_abi::Event;
use alloy_primitives::{Address, B256, U256};

use crate::chain::RawLog;
use crate::models::governance::{Candidate, Proposal, VoteCast, derive_title};

use super::IndexedEntity;

pub const PROPOSAL_CREATED: &str = "ProposalCreated(uint256 id, address proposer, address[] targets, uint256[] values, string[] signatures, bytes[] calldatas, uint256 startBlock, uint256 endBlock, string description)";

pub const CANDIDATE_CREATED: &str = "ProposalCandidateCreated(address indexed msgSender, address[] targets, uint256[] values, string[] signatures, bytes[] calldatas, string description, string slug, uint256 proposalIdToUpdate, bytes32 encodedProposalHash)";

/// Shape emitted by data contracts deployed before proposal updates existed.
pub const CANDIDATE_CREATED_LEGACY: &str = "ProposalCandidateCreated(address indexed msgSender, address[] targets, uint256[] values, string[] signatures, bytes[] calldatas, string description, string slug, bytes32 encodedProposalHash)";

pub const VOTE_CAST: &str =
    "VoteCast(address indexed voter, uint256 proposalId, uint8 support, uint256 votes, string reason)";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid event signature {signature:?}: {reason}")]
    Signature { signature: String, reason: String },
    #[error("log topic does not match {0}")]
    SelectorMismatch(String),
    #[error("ABI decoding failed: {0}")]
    Abi(#[from] alloy_dyn_abi::Error),
    #[error("argument {0} is missing or has an unexpected type")]
    MissingField(&'static str),
}

/// A parsed event declaration, one per shape a contract may have emitted.
#[derive(Debug, Clone)]
pub struct EventSignature {
    event: Event,
    selector: B256,
}

impl EventSignature {
    pub fn parse(signature: &str) -> Result<Self, DecodeError> {
        let event = Event::parse(signature).map_err(|err| DecodeError::Signature {
            signature: signature.to_string(),
            reason: err.to_string(),
        })?;
        let selector = event.selector();
        Ok(Self { event, selector })
    }

    pub fn selector(&self) -> B256 {
        self.selector
    }

    pub fn name(&self) -> &str {
        &self.event.name
    }

    /// Canonical `Name(type,...)` form the selector is hashed from.
    pub fn canonical(&self) -> String {
        self.event.signature()
    }

    pub fn decode(&self, log: &RawLog) -> Result<DecodedArgs, DecodeError> {
        if log.topic0() != Some(self.selector) {
            return Err(DecodeError::SelectorMismatch(self.canonical()));
        }

        let decoded = self
            .event
            .decode_log_parts(log.topics.iter().copied(), &log.data, true)?;

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let mut values = HashMap::with_capacity(self.event.inputs.len());
        for input in &self.event.inputs {
            let value = if input.indexed {
                indexed.next()
            } else {
                body.next()
            };
            if let Some(value) = value {
                values.insert(input.name.clone(), value);
            }
        }
        Ok(DecodedArgs { values })
    }
}

/// Event arguments addressed by their declared parameter name.
#[derive(Debug, Default)]
pub struct DecodedArgs {
    values: HashMap<String, DynSolValue>,
}

impl DecodedArgs {
    pub fn uint(&self, name: &str) -> Option<U256> {
        match self.values.get(name)? {
            DynSolValue::Uint(value, _) => Some(*value),
            _ => None,
        }
    }

    pub fn address(&self, name: &str) -> Option<Address> {
        match self.values.get(name)? {
            DynSolValue::Address(address) => Some(*address),
            _ => None,
        }
    }

    pub fn string(&self, name: &str) -> Option<String> {
        match self.values.get(name)? {
            DynSolValue::String(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn word(&self, name: &str) -> Option<B256> {
        match self.values.get(name)? {
            DynSolValue::FixedBytes(word, 32) => Some(*word),
            _ => None,
        }
    }

    pub fn addresses(&self, name: &str) -> Vec<Address> {
        self.array(name)
            .iter()
            .filter_map(|value| match value {
                DynSolValue::Address(address) => Some(*address),
                _ => None,
            })
            .collect()
    }

    pub fn uints_as_decimal(&self, name: &str) -> Vec<String> {
        self.array(name)
            .iter()
            .filter_map(|value| match value {
                DynSolValue::Uint(value, _) => Some(value.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn strings(&self, name: &str) -> Vec<String> {
        self.array(name)
            .iter()
            .filter_map(|value| match value {
                DynSolValue::String(value) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn bytes_as_hex(&self, name: &str) -> Vec<String> {
        self.array(name)
            .iter()
            .filter_map(|value| match value {
                DynSolValue::Bytes(bytes) => Some(format!("0x{}", hex::encode(bytes))),
                _ => None,
            })
            .collect()
    }

    fn array(&self, name: &str) -> &[DynSolValue] {
        match self.values.get(name) {
            Some(DynSolValue::Array(values)) => values,
            _ => &[],
        }
    }
}

impl IndexedEntity for Proposal {
    fn key(&self) -> String {
        self.id.to_string()
    }

    fn created_block(&self) -> u64 {
        self.created_block
    }

    fn decode(signature: &EventSignature, log: &RawLog) -> Result<Self, DecodeError> {
        let args = signature.decode(log)?;
        let id = args.uint("id").ok_or(DecodeError::MissingField("id"))?;
        let description = args.string("description").unwrap_or_default();

        Ok(Proposal {
            id,
            proposer: args.address("proposer").unwrap_or(Address::ZERO),
            start_block: saturating_block(args.uint("startBlock")),
            end_block: saturating_block(args.uint("endBlock")),
            title: derive_title(&description),
            description,
            created_block: log.block_number,
            transaction_hash: log
                .transaction_hash
                .map(|hash| hash.to_string())
                .unwrap_or_default(),
        })
    }
}

impl IndexedEntity for Candidate {
    fn key(&self) -> String {
        self.slug.clone()
    }

    fn created_block(&self) -> u64 {
        self.created_block
    }

    fn decode(signature: &EventSignature, log: &RawLog) -> Result<Self, DecodeError> {
        let args = signature.decode(log)?;
        let slug = args
            .string("slug")
            .filter(|slug| !slug.is_empty())
            .ok_or(DecodeError::MissingField("slug"))?;
        let description = args.string("description").unwrap_or_default();

        Ok(Candidate {
            slug,
            proposer: args.address("msgSender").unwrap_or(Address::ZERO),
            title: derive_title(&description),
            description,
            created_block: log.block_number,
            targets: args.addresses("targets"),
            values: args.uints_as_decimal("values"),
            signatures: args.strings("signatures"),
            calldatas: args.bytes_as_hex("calldatas"),
            proposal_id_to_update: args
                .uint("proposalIdToUpdate")
                .filter(|id| !id.is_zero()),
            encoded_proposal_hash: args
                .word("encodedProposalHash")
                .map(|hash| hash.to_string())
                .unwrap_or_default(),
        })
    }
}

pub fn decode_vote(signature: &EventSignature, log: &RawLog) -> Result<VoteCast, DecodeError> {
    let args = signature.decode(log)?;
    let support = args
        .uint("support")
        .ok_or(DecodeError::MissingField("support"))?;

    Ok(VoteCast {
        voter: args.address("voter").unwrap_or(Address::ZERO),
        proposal_id: args
            .uint("proposalId")
            .ok_or(DecodeError::MissingField("proposalId"))?,
        // uint8 on chain; anything wider is an unknown code and gets ignored later
        support: u8::try_from(support).unwrap_or(u8::MAX),
        votes: args.uint("votes").ok_or(DecodeError::MissingField("votes"))?,
        block_number: log.block_number,
    })
}

fn saturating_block(value: Option<U256>) -> u64 {
    value
        .map(|block| u64::try_from(block).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
