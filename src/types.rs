//! Core data model: blocks, transactions, votes/proposals (encoded as
//! transactions per spec §3), and the well-known database paths consensus
//! reads and writes (spec §6).

use crate::crypto::{Address, Hash, PrivateKey, PublicKey, Signature, hash_bytes, hash_data, recover, sign};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Wall-clock length of one epoch, in milliseconds.
pub const EPOCH_MS: i64 = 2_000;
/// Minimum validator-set size a block's `validators` snapshot must carry.
pub const MIN_NUM_VALIDATORS: usize = 1;
/// Global transaction pool capacity.
pub const MAX_POOL_SIZE: usize = 10_000;
/// Per-account transaction pool capacity.
pub const MAX_PER_ACCOUNT: usize = 64;
/// Number of trailing `/consensus/number/<N>` entries retained before being NULLed out (spec §4.5 step 7).
pub const CONSENSUS_STATE_RETENTION: u64 = 1000;
/// Maximum blocks returned per chain-segment response (spec §4.7).
pub const CHAIN_SEGMENT_LIMIT: usize = 20;

/// A single write-operation. `Set` is an ordered batch of the other four and
/// may not itself nest a `Set` (spec §3: "an ordered list of the others").
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Operation {
    SetValue { path: String, value: Value },
    SetRule { path: String, rule: Value },
    SetFunction { path: String, function: Value },
    SetOwner { path: String, owner: Value },
    Set(Vec<Operation>),
}

impl Operation {
    /// `Set` may only contain the four leaf variants, not further `Set`s.
    pub fn is_well_formed(&self) -> bool {
        match self {
            Operation::Set(ops) => ops.iter().all(|op| !matches!(op, Operation::Set(_))),
            _ => true,
        }
    }

    pub fn target_paths(&self) -> Vec<&str> {
        match self {
            Operation::SetValue { path, .. }
            | Operation::SetRule { path, .. }
            | Operation::SetFunction { path, .. }
            | Operation::SetOwner { path, .. } => vec![path.as_str()],
            Operation::Set(ops) => ops.iter().flat_map(|op| op.target_paths()).collect(),
        }
    }
}

/// The signed payload of a transaction, everything a signature covers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TxBody {
    pub operation: Operation,
    /// `>= 0` for an ordered, per-account nonce. `-1` marks an unordered
    /// transaction, deduplicated by `(address, timestamp, hash)` instead.
    pub nonce: i64,
    pub timestamp: i64,
    pub gas_price: Option<u64>,
    pub parent_tx_hash: Option<Hash>,
}

/// A signed transaction. `address` is recovered from `signature` over `tx_body`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub tx_body: TxBody,
    pub signature: Signature,
    pub address: Address,
    pub hash: Hash,
}

impl Transaction {
    pub fn new_signed(tx_body: TxBody, key: &PrivateKey) -> Self {
        let body_hash = hash_data(&tx_body);
        let signature = sign(key, &body_hash.0);
        let address = key.public_key().to_address();
        Transaction {
            tx_body,
            signature,
            address,
            hash: body_hash,
        }
    }

    /// Re-derive the body hash and recover the signer; true iff both agree
    /// with the carried `hash`/`address` fields.
    pub fn verify(&self) -> bool {
        let body_hash = hash_data(&self.tx_body);
        if body_hash != self.hash {
            return false;
        }
        recover(&body_hash.0, &self.signature) == Some(self.address)
    }

    pub fn is_unordered(&self) -> bool {
        self.tx_body.nonce < 0
    }

    /// If this transaction writes a vote record, extract it.
    pub fn as_vote(&self) -> Option<VoteRecord> {
        let Operation::SetValue { path, value } = &self.tx_body.operation else {
            return None;
        };
        let (number, addr_segment) = parse_vote_path(path)?;
        if addr_segment != format_address(&self.address) {
            return None;
        }
        let block_hash: Hash = serde_json::from_value(value.get("block_hash")?.clone()).ok()?;
        let stake = value.get("stake")?.as_u64()?;
        Some(VoteRecord {
            number,
            block_hash,
            stake,
            validator: self.address,
        })
    }

    /// If this transaction writes a proposal record, extract it.
    pub fn as_proposal(&self) -> Option<ProposalRecord> {
        let Operation::SetValue { path, value } = &self.tx_body.operation else {
            return None;
        };
        let number = parse_propose_path(path)?;
        let block_hash: Hash = serde_json::from_value(value.get("block_hash")?.clone()).ok()?;
        Some(ProposalRecord {
            number,
            block_hash,
            proposer: self.address,
        })
    }
}

pub fn vote_path(number: u64, addr: &Address) -> String {
    format!("/consensus/number/{}/{}", number, format_address(addr))
}

pub fn propose_path(number: u64) -> String {
    format!("/consensus/number/{}/propose", number)
}

pub fn whitelist_path() -> &'static str {
    "/consensus/whitelist"
}

pub fn staking_path(addr: &Address) -> String {
    format!("/staking/consensus/{}/0/balance", format_address(addr))
}

fn format_address(addr: &Address) -> String {
    format!("{}", addr)
}

fn parse_vote_path(path: &str) -> Option<(u64, String)> {
    let rest = path.strip_prefix("/consensus/number/")?;
    let mut parts = rest.splitn(2, '/');
    let number: u64 = parts.next()?.parse().ok()?;
    let addr = parts.next()?.to_string();
    if addr == "propose" {
        return None;
    }
    Some((number, addr))
}

fn parse_propose_path(path: &str) -> Option<u64> {
    let rest = path.strip_prefix("/consensus/number/")?;
    let rest = rest.strip_suffix("/propose")?;
    rest.parse().ok()
}

/// A vote extracted from a transaction (spec §3 "Vote").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteRecord {
    pub number: u64,
    pub block_hash: Hash,
    pub stake: u64,
    pub validator: Address,
}

/// A proposal extracted from a transaction (spec §3 "Proposal").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposalRecord {
    pub number: u64,
    pub block_hash: Hash,
    pub proposer: Address,
}

/// Everything a block's `hash` digests, i.e. the block minus the `hash` field itself.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct BlockHeader {
    number: u64,
    epoch: u64,
    last_hash: Hash,
    proposer: Address,
    validators: BTreeMap<Address, u64>,
    transactions: Vec<Transaction>,
    last_votes: Vec<Transaction>,
    gas_amount_total: u64,
    gas_cost_total: u64,
    state_proof_hash: Hash,
    timestamp: i64,
}

/// An immutable block record (spec §3 "Block").
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub number: u64,
    pub epoch: u64,
    pub last_hash: Hash,
    pub proposer: Address,
    pub validators: BTreeMap<Address, u64>,
    pub transactions: Vec<Transaction>,
    pub last_votes: Vec<Transaction>,
    pub gas_amount_total: u64,
    pub gas_cost_total: u64,
    pub state_proof_hash: Hash,
    pub timestamp: i64,
    pub hash: Hash,
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        number: u64,
        epoch: u64,
        last_hash: Hash,
        proposer: Address,
        validators: BTreeMap<Address, u64>,
        transactions: Vec<Transaction>,
        last_votes: Vec<Transaction>,
        gas_amount_total: u64,
        gas_cost_total: u64,
        state_proof_hash: Hash,
        timestamp: i64,
    ) -> Self {
        let header = BlockHeader {
            number,
            epoch,
            last_hash,
            proposer,
            validators: validators.clone(),
            transactions: transactions.clone(),
            last_votes: last_votes.clone(),
            gas_amount_total,
            gas_cost_total,
            state_proof_hash,
            timestamp,
        };
        let hash = hash_data(&header);
        Block {
            number,
            epoch,
            last_hash,
            proposer,
            validators,
            transactions,
            last_votes,
            gas_amount_total,
            gas_cost_total,
            state_proof_hash,
            timestamp,
            hash,
        }
    }

    pub fn genesis(validators: BTreeMap<Address, u64>, timestamp: i64) -> Self {
        Block::new(
            0,
            0,
            Hash::default(),
            Address::ZERO,
            validators,
            vec![],
            vec![],
            0,
            0,
            hash_bytes(b"triarch-genesis-state"),
            timestamp,
        )
    }

    /// Recompute the digest over this block's fields and compare to the carried `hash`.
    pub fn hash_is_internally_consistent(&self) -> bool {
        let recomputed = Block::new(
            self.number,
            self.epoch,
            self.last_hash,
            self.proposer,
            self.validators.clone(),
            self.transactions.clone(),
            self.last_votes.clone(),
            self.gas_amount_total,
            self.gas_cost_total,
            self.state_proof_hash,
            self.timestamp,
        )
        .hash;
        recomputed == self.hash
    }

    pub fn total_stake(&self) -> u64 {
        self.validators.values().sum()
    }
}
