//! `ConsensusEngine`: epoch clock, proposer selection, proposal/vote
//! construction and verification, three-chain finalization, and catch-up
//! (spec §4.5–§4.7). Owns `BlockPool`, `TransactionPool`, `Blockchain`, and
//! `StateVersionManager` behind a single serialized entry point per method,
//! matching the teacher's one-`SimplexState`-per-loop-iteration model.

use crate::block_pool::{BlockPool, BlockPoolError};
use crate::blockchain::{Blockchain, ChainError};
use crate::crypto::{hash_bytes, hash_data, Address, Hash, PrivateKey};
use crate::db_view::{DatabaseView, ExecError};
use crate::state::{StateError, StateVersionManager, VersionName};
use crate::tx_pool::TransactionPool;
use crate::types::{
    propose_path, vote_path, Block, Operation, Transaction, TxBody, CONSENSUS_STATE_RETENTION,
    MIN_NUM_VALIDATORS,
};
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("block is malformed or internally inconsistent")]
    InvalidBlock,
    #[error("proposal transaction does not reference its own block")]
    InvalidProposal,
    #[error("unknown predecessor block")]
    UnknownPredecessor,
    #[error("predecessor could not be notarized from its last_votes")]
    PredecessorNotNotarized,
    #[error("epoch did not strictly increase over the predecessor")]
    EpochNotMonotonic,
    #[error("proposer does not match the elected validator for this epoch")]
    WrongProposer,
    #[error("validator set is smaller than the minimum required")]
    TooFewValidators,
    #[error("replaying the block against its predecessor's state failed")]
    ReplayFailed,
    #[error("state proof or gas accounting mismatch against the block header")]
    InconsistentExecution,
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Pool(#[from] BlockPoolError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Starting,
    Syncing,
    Serving,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Starting,
    Running,
    Stopped,
}

/// Side effects the engine wants performed; the event loop (or a test
/// harness) interprets these against the transport/reporter (spec §1's
/// collaborator boundary made explicit, as the teacher does with
/// `ConsensusAction`).
#[derive(Clone, Debug)]
pub enum ConsensusAction {
    BroadcastProposal(Block, Transaction),
    BroadcastVote(Transaction),
    RequestChainSegment(Block),
    ReportFinalized { state_proof_hash: Hash, block_number: u64 },
}

/// The epoch clock's NTP collaborator boundary (spec §4.5 step 2): content
/// of the actual probe is out of scope, same as `ShardReporter`'s parent
/// chain. Implementations must not block the consensus event loop.
pub trait NtpProbe: Send + Sync {
    fn probe_delta_ms(&self) -> i64;
}

/// Default probe when no real NTP client is wired in: reports no drift.
pub struct NoopNtpProbe;

impl NtpProbe for NoopNtpProbe {
    fn probe_delta_ms(&self) -> i64 {
        0
    }
}

pub fn finalized_version_name(number: u64) -> VersionName {
    format!("final-{number}")
}

fn branch_version_name(hash: &Hash) -> VersionName {
    format!("blk-{hash}")
}

pub struct ConsensusEngine {
    address: Address,
    key: PrivateKey,
    genesis_timestamp: i64,
    epoch_ms: i64,
    time_adjustment: Mutex<i64>,
    status: Mutex<EngineStatus>,
    node_status: Mutex<NodeStatus>,
    strict_state_proof: bool,
    state: Arc<StateVersionManager>,
    blocks: Arc<BlockPool>,
    pool: Arc<TransactionPool>,
    chain: Arc<Blockchain>,
    finalized_tip: Mutex<Block>,
    proposed_epochs: Mutex<HashSet<u64>>,
    ntp_probe: Arc<dyn NtpProbe>,
}

impl ConsensusEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        address: Address,
        key: PrivateKey,
        genesis_timestamp: i64,
        epoch_ms: i64,
        strict_state_proof: bool,
        state: Arc<StateVersionManager>,
        blocks: Arc<BlockPool>,
        pool: Arc<TransactionPool>,
        chain: Arc<Blockchain>,
    ) -> Self {
        ConsensusEngine {
            address,
            key,
            genesis_timestamp,
            epoch_ms,
            time_adjustment: Mutex::new(0),
            status: Mutex::new(EngineStatus::Starting),
            node_status: Mutex::new(NodeStatus::Starting),
            strict_state_proof,
            state,
            blocks,
            pool,
            chain,
            finalized_tip: Mutex::new(Block::genesis(BTreeMap::new(), genesis_timestamp)),
            proposed_epochs: Mutex::new(HashSet::new()),
            ntp_probe: Arc::new(NoopNtpProbe),
        }
    }

    /// Override the default no-op NTP probe with a real one, e.g. at node
    /// startup before the engine is wrapped in an `Arc`.
    pub fn with_ntp_probe(mut self, probe: Arc<dyn NtpProbe>) -> Self {
        self.ntp_probe = probe;
        self
    }

    /// Bootstrap from a known finalized block (normally genesis, or the
    /// chain tip recovered from disk). Does not itself append to the
    /// chain or register a state version — callers own that during
    /// genesis construction / startup recovery.
    pub fn init(&self, last_block: Block) {
        *self.finalized_tip.lock().unwrap() = last_block;
        *self.status.lock().unwrap() = EngineStatus::Running;
        *self.node_status.lock().unwrap() = NodeStatus::Serving;
    }

    pub fn stop(&self) {
        *self.status.lock().unwrap() = EngineStatus::Stopped;
    }

    pub fn set_node_status(&self, status: NodeStatus) {
        *self.node_status.lock().unwrap() = status;
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock().unwrap()
    }

    pub fn finalized_tip(&self) -> Block {
        self.finalized_tip.lock().unwrap().clone()
    }

    pub fn node_status(&self) -> NodeStatus {
        *self.node_status.lock().unwrap()
    }

    pub fn epoch_for(&self, now_ms: i64) -> u64 {
        let adjustment = *self.time_adjustment.lock().unwrap();
        let elapsed = now_ms - self.genesis_timestamp - adjustment;
        (elapsed.max(0) / self.epoch_ms) as u64
    }

    /// Every 100 epochs the caller probes NTP and reports a delta; clamp it
    /// to a small interval so a malicious/faulty peer can't skew the clock.
    pub fn maybe_resync_clock(&self, epoch: u64, ntp_delta_ms: i64) {
        if epoch == 0 || epoch % 100 != 0 {
            return;
        }
        let clamped = ntp_delta_ms.clamp(-1_000, 1_000);
        *self.time_adjustment.lock().unwrap() = clamped;
    }

    fn proposer_seed(last_votes: &[Transaction], epoch: u64) -> Hash {
        let votes_hash = hash_data(&last_votes.to_vec());
        let mut bytes = Vec::with_capacity(40);
        bytes.extend_from_slice(votes_hash.as_ref());
        bytes.extend_from_slice(&epoch.to_be_bytes());
        hash_bytes(&bytes)
    }

    fn select_proposer(seed: &Hash, validators: &BTreeMap<Address, u64>) -> Option<Address> {
        let total: u64 = validators.values().sum();
        if total == 0 {
            return None;
        }
        let mut rng = ChaCha20Rng::from_seed(seed.0);
        let draw = rng.gen_range(0..total);
        let mut cumulative = 0u64;
        for (addr, stake) in validators.iter() {
            cumulative += stake;
            if cumulative > draw {
                return Some(*addr);
            }
        }
        validators.keys().next_back().copied()
    }

    /// The block this node currently considers the chain to extend: the
    /// longest notarized tip if the pool has one, else the finalized tip.
    fn current_lastblock(&self) -> (Block, VersionName, Vec<Transaction>) {
        if let Some(hash) = self.blocks.longest_notarized_tip() {
            if let Some(info) = self.blocks.get(&hash) {
                let version = self
                    .blocks
                    .state_version_for(&hash)
                    .unwrap_or_else(|| branch_version_name(&hash));
                return (info.block, version, info.as_last_votes());
            }
        }
        let tip = self.finalized_tip.lock().unwrap().clone();
        let version = finalized_version_name(tip.number);
        (tip, version, Vec::new())
    }

    /// Resolve a hash to a block this node knows about, either in the pool
    /// or as the finalized tip, along with its state version and the
    /// transactions that notarized it (its successor's `last_votes`).
    fn resolve(&self, hash: &Hash) -> Option<(Block, VersionName, Vec<Transaction>)> {
        if let Some(info) = self.blocks.get(hash) {
            let version = self
                .blocks
                .state_version_for(hash)
                .unwrap_or_else(|| branch_version_name(hash));
            return Some((info.block, version, info.as_last_votes()));
        }
        let tip = self.finalized_tip.lock().unwrap();
        if tip.hash == *hash {
            return Some((tip.clone(), finalized_version_name(tip.number), Vec::new()));
        }
        None
    }

    fn is_notarized_or_finalized(&self, hash: &Hash) -> bool {
        if self.finalized_tip.lock().unwrap().hash == *hash {
            return true;
        }
        self.blocks.get(hash).map(|i| i.notarized).unwrap_or(false)
    }

    /// Epoch tick: attempt finalization, then propose if elected.
    pub fn tick(&self, now_ms: i64) -> Result<Vec<ConsensusAction>, ConsensusError> {
        if *self.node_status.lock().unwrap() != NodeStatus::Serving {
            return Ok(Vec::new());
        }
        let mut actions = self.try_finalize()?;
        let epoch = self.epoch_for(now_ms);
        self.maybe_resync_clock(epoch, self.ntp_probe.probe_delta_ms());
        actions.extend(self.try_propose(now_ms)?);
        Ok(actions)
    }

    fn try_propose(&self, now_ms: i64) -> Result<Vec<ConsensusAction>, ConsensusError> {
        let epoch = self.epoch_for(now_ms);
        let (last_block, last_version, last_votes_for_next) = self.current_lastblock();
        if epoch <= last_block.epoch {
            return Ok(Vec::new());
        }
        if !self.proposed_epochs.lock().unwrap().insert(epoch) {
            return Ok(Vec::new());
        }

        let seed = Self::proposer_seed(&last_block.last_votes, epoch);
        let Some(proposer) = Self::select_proposer(&seed, &last_block.validators) else {
            return Ok(Vec::new());
        };
        if proposer != self.address {
            return Ok(Vec::new());
        }

        let (block, proposal_tx, version_name) =
            self.construct_proposal(&last_block, &last_version, last_votes_for_next, epoch, now_ms)?;

        self.blocks.add_seen_block(block.clone(), Some(proposal_tx.clone()), version_name);
        let mut actions = vec![ConsensusAction::BroadcastProposal(block.clone(), proposal_tx)];
        if let Some(vote_action) = self.cast_vote(&block, now_ms)? {
            actions.push(vote_action);
        }
        Ok(actions)
    }

    fn construct_proposal(
        &self,
        last_block: &Block,
        last_version: &str,
        last_votes: Vec<Transaction>,
        epoch: u64,
        now_ms: i64,
    ) -> Result<(Block, Transaction, VersionName), ConsensusError> {
        let (temp_name, _root) = self.state.clone_to_temp(last_version, "propose")?;
        let number = last_block.number + 1;
        let view = DatabaseView::new(&self.state, temp_name.clone(), number);

        let (ok, _, _) = view.execute_list(&last_votes);
        if !ok {
            return Err(ConsensusError::ReplayFailed);
        }

        let mut included = Vec::new();
        let mut gas_amount_total = 0u64;
        let mut gas_cost_total = 0u64;
        for tx in self.pool.pending() {
            let backup = view.backup();
            match view.execute(&tx) {
                Ok(outcome) => {
                    included.push(tx);
                    gas_amount_total += outcome.gas_amount;
                    gas_cost_total += outcome.gas_cost;
                }
                Err(_) => view.restore(backup),
            }
        }

        let state_proof_hash = if self.strict_state_proof {
            view.state_proof("/")
        } else {
            Hash::default()
        };

        let block = Block::new(
            number,
            epoch,
            last_block.hash,
            self.address,
            last_block.validators.clone(),
            included,
            last_votes,
            gas_amount_total,
            gas_cost_total,
            state_proof_hash,
            now_ms,
        );

        let operation = if number > CONSENSUS_STATE_RETENTION {
            Operation::Set(vec![
                Operation::SetValue {
                    path: propose_path(number),
                    value: json!({ "block_hash": block.hash }),
                },
                Operation::SetValue {
                    path: propose_path(number - CONSENSUS_STATE_RETENTION),
                    value: serde_json::Value::Null,
                },
            ])
        } else {
            Operation::SetValue {
                path: propose_path(number),
                value: json!({ "block_hash": block.hash }),
            }
        };
        let proposal_body = TxBody {
            operation,
            nonce: -1,
            timestamp: now_ms,
            gas_price: None,
            parent_tx_hash: None,
        };
        let proposal_tx = Transaction::new_signed(proposal_body, &self.key);
        view.execute(&proposal_tx).map_err(|_| ConsensusError::ReplayFailed)?;

        Ok((block, proposal_tx, temp_name))
    }

    fn cast_vote(&self, block: &Block, now_ms: i64) -> Result<Option<ConsensusAction>, ConsensusError> {
        if self.blocks.voted_block_at_epoch(block.epoch).is_some() {
            return Ok(None);
        }
        let Some(stake) = block.validators.get(&self.address).copied() else {
            return Ok(None);
        };
        let body = TxBody {
            operation: Operation::SetValue {
                path: vote_path(block.number, &self.address),
                value: json!({ "block_hash": block.hash, "stake": stake }),
            },
            nonce: -1,
            timestamp: now_ms,
            gas_price: None,
            parent_tx_hash: None,
        };
        let tx = Transaction::new_signed(body, &self.key);
        self.blocks.record_own_vote(block.epoch, block.hash);
        self.blocks.add_seen_vote(tx.clone())?;
        Ok(Some(ConsensusAction::BroadcastVote(tx)))
    }

    /// Receive a PROPOSE message: validate per the ordered rejection list
    /// in spec §4.5, admit on success, and vote if this is the first valid
    /// proposal seen for that epoch.
    pub fn on_proposal(&self, block: Block, proposal_tx: Transaction, now_ms: i64) -> Result<Vec<ConsensusAction>, ConsensusError> {
        if *self.node_status.lock().unwrap() != NodeStatus::Serving {
            return Ok(Vec::new());
        }
        let record = proposal_tx.as_proposal().ok_or(ConsensusError::InvalidProposal)?;
        if record.block_hash != block.hash {
            return Err(ConsensusError::InvalidProposal);
        }
        if !block.hash_is_internally_consistent() || !proposal_tx.verify() {
            return Err(ConsensusError::InvalidBlock);
        }

        if block.number <= self.finalized_tip.lock().unwrap().number {
            return Ok(Vec::new());
        }

        let last_notarized = self.current_lastblock().0;
        if block.number > last_notarized.number + 1 {
            return Ok(vec![ConsensusAction::RequestChainSegment(last_notarized)]);
        }

        let Some((predecessor, pred_version, pred_last_votes_slot)) = self.resolve(&block.last_hash) else {
            return Err(ConsensusError::UnknownPredecessor);
        };
        let _ = pred_last_votes_slot;

        if !self.is_notarized_or_finalized(&predecessor.hash) {
            let (temp_name, _) = self.state.clone_to_temp(&pred_version, "notarize-check")?;
            let view = DatabaseView::new(&self.state, temp_name, predecessor.number + 1);
            let (ok, ..) = view.execute_list(&block.last_votes);
            if !ok {
                return Err(ConsensusError::PredecessorNotNotarized);
            }
            let total: u64 = predecessor.validators.values().sum();
            let tallied: u64 = block
                .last_votes
                .iter()
                .filter_map(|t| t.as_vote())
                .map(|v| v.stake)
                .sum();
            if tallied * 3 <= total * 2 {
                return Err(ConsensusError::PredecessorNotNotarized);
            }
        }

        if predecessor.epoch >= block.epoch {
            return Err(ConsensusError::EpochNotMonotonic);
        }

        let seed = Self::proposer_seed(&predecessor.last_votes, block.epoch);
        let expected = Self::select_proposer(&seed, &predecessor.validators);
        if expected != Some(block.proposer) {
            return Err(ConsensusError::WrongProposer);
        }

        if block.validators.len() < MIN_NUM_VALIDATORS {
            return Err(ConsensusError::TooFewValidators);
        }

        let (temp_name, _) = self.state.clone_to_temp(&pred_version, "verify")?;
        let view = DatabaseView::new(&self.state, temp_name.clone(), block.number);
        let (votes_ok, ..) = view.execute_list(&block.last_votes);
        let (txs_ok, gas_amount_total, gas_cost_total) = view.execute_list(&block.transactions);
        if !votes_ok || !txs_ok {
            return Err(ConsensusError::ReplayFailed);
        }
        if gas_amount_total != block.gas_amount_total || gas_cost_total != block.gas_cost_total {
            return Err(ConsensusError::InconsistentExecution);
        }
        if self.strict_state_proof && view.state_proof("/") != block.state_proof_hash {
            return Err(ConsensusError::InconsistentExecution);
        }
        view.execute(&proposal_tx).map_err(|_| ConsensusError::ReplayFailed)?;

        let first_at_epoch = self.blocks.voted_block_at_epoch(block.epoch).is_none();
        self.blocks.add_seen_block(block.clone(), Some(proposal_tx), temp_name);

        let mut actions = Vec::new();
        if first_at_epoch {
            if let Some(vote_action) = self.cast_vote(&block, now_ms)? {
                actions.push(vote_action);
            }
        }
        Ok(actions)
    }

    /// Receive a VOTE message: admit it to the owning `BlockInfo` and
    /// rebroadcast on success.
    pub fn on_vote(&self, vote_tx: Transaction) -> Result<Vec<ConsensusAction>, ConsensusError> {
        if *self.node_status.lock().unwrap() != NodeStatus::Serving {
            return Ok(Vec::new());
        }
        if !vote_tx.verify() {
            return Err(ConsensusError::InvalidBlock);
        }
        self.blocks.add_seen_vote(vote_tx.clone())?;
        Ok(vec![ConsensusAction::BroadcastVote(vote_tx)])
    }

    /// Finalize every un-appended block strictly before the tip of any
    /// three-consecutive-epoch notarized suffix (spec §4.6).
    pub fn try_finalize(&self) -> Result<Vec<ConsensusAction>, ConsensusError> {
        let mut actions = Vec::new();
        for _ in 0..CONSENSUS_STATE_RETENTION {
            let chain = self.blocks.finalizable_chain();
            let [a, b, _c] = match chain.as_slice() {
                [a, b, c] => [a.clone(), b.clone(), c.clone()],
                _ => break,
            };
            let finalized_number = self.finalized_tip.lock().unwrap().number;
            let mut progressed = false;
            for info in [a, b] {
                if info.block.number <= finalized_number {
                    continue;
                }
                progressed = true;
                self.chain.append(&info.block)?;

                let version = self
                    .blocks
                    .state_version_for(&info.block.hash)
                    .unwrap_or_else(|| branch_version_name(&info.block.hash));
                let target = finalized_version_name(info.block.number);
                self.state.transfer(&version, &target)?;
                self.state.finalize(&target)?;

                let confirmed: Vec<(Address, i64)> = info
                    .block
                    .transactions
                    .iter()
                    .filter(|tx| tx.tx_body.nonce >= 0)
                    .map(|tx| (tx.address, tx.tx_body.nonce))
                    .collect();
                self.pool.clean_up_for_new_block(&confirmed);

                let released = self.blocks.clean_up_after_finalization(&info.block);
                for version_name in released {
                    let _ = self.state.delete(&version_name);
                }

                *self.finalized_tip.lock().unwrap() = info.block.clone();
                actions.push(ConsensusAction::ReportFinalized {
                    state_proof_hash: info.block.state_proof_hash,
                    block_number: info.block.number,
                });
            }
            if !progressed {
                break;
            }
        }
        Ok(actions)
    }

    /// Validate and apply a received chain segment (spec §4.7), promoting
    /// its tail to the new finalized tip on success.
    pub fn apply_chain_segment(&self, segment: Vec<Block>) -> Result<(), ConsensusError> {
        Blockchain::validate_segment(&segment)?;
        let mut current = self.finalized_tip.lock().unwrap().clone();
        let mut current_version = finalized_version_name(current.number);
        for block in segment {
            if block.last_hash != current.hash || block.number != current.number + 1 {
                return Err(ConsensusError::InvalidBlock);
            }
            let (temp_name, _) = self.state.clone_to_temp(&current_version, "catchup")?;
            let view = DatabaseView::new(&self.state, temp_name.clone(), block.number);
            let (votes_ok, ..) = view.execute_list(&block.last_votes);
            let (txs_ok, gas_amount_total, gas_cost_total) = view.execute_list(&block.transactions);
            if !votes_ok || !txs_ok {
                return Err(ConsensusError::ReplayFailed);
            }
            if gas_amount_total != block.gas_amount_total || gas_cost_total != block.gas_cost_total {
                return Err(ConsensusError::InconsistentExecution);
            }
            if self.strict_state_proof && view.state_proof("/") != block.state_proof_hash {
                return Err(ConsensusError::InconsistentExecution);
            }
            self.chain.append(&block)?;
            let target = finalized_version_name(block.number);
            self.state.transfer(&temp_name, &target)?;
            self.state.finalize(&target)?;
            current_version = target;
            current = block;
        }
        *self.finalized_tip.lock().unwrap() = current;
        Ok(())
    }

    pub fn request_chain_segment(&self) -> ConsensusAction {
        ConsensusAction::RequestChainSegment(self.current_lastblock().0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair_from_id;

    fn make_engine(id: u64, validators: BTreeMap<Address, u64>, genesis_ts: i64) -> (ConsensusEngine, Address) {
        let (pk, sk) = generate_keypair_from_id(id);
        let addr = pk.to_address();
        let state = Arc::new(StateVersionManager::new());
        let genesis = Block::genesis(validators, genesis_ts);
        state.init_finalized(&finalized_version_name(0));
        let engine = ConsensusEngine::new(
            addr,
            sk,
            genesis_ts,
            2_000,
            true,
            state,
            Arc::new(BlockPool::new()),
            Arc::new(TransactionPool::new()),
            Arc::new(Blockchain::in_memory().unwrap()),
        );
        engine.init(genesis);
        (engine, addr)
    }

    #[test]
    fn epoch_for_is_monotonic_step_function() {
        let validators = BTreeMap::new();
        let (engine, _) = make_engine(0, validators, 1_000_000);
        assert_eq!(engine.epoch_for(1_000_000), 0);
        assert_eq!(engine.epoch_for(1_002_000), 1);
        assert_eq!(engine.epoch_for(1_003_999), 1);
        assert_eq!(engine.epoch_for(1_004_000), 2);
    }

    #[test]
    fn select_proposer_is_deterministic_given_same_seed() {
        let mut validators = BTreeMap::new();
        let mut addrs = Vec::new();
        for i in 0..5 {
            let (pk, _) = generate_keypair_from_id(i);
            validators.insert(pk.to_address(), 100);
            addrs.push(pk.to_address());
        }
        let seed = hash_bytes(b"fixed-seed");
        let a = ConsensusEngine::select_proposer(&seed, &validators);
        let b = ConsensusEngine::select_proposer(&seed, &validators);
        assert_eq!(a, b);
        assert!(addrs.contains(&a.unwrap()));
    }

    #[test]
    fn single_validator_proposes_and_self_notarizes() {
        let (pk, sk) = generate_keypair_from_id(0);
        let mut validators = BTreeMap::new();
        validators.insert(pk.to_address(), 100);

        let state = Arc::new(StateVersionManager::new());
        state.init_finalized(&finalized_version_name(0));
        let genesis = Block::genesis(validators, 0);
        let engine = ConsensusEngine::new(
            pk.to_address(),
            sk,
            0,
            2_000,
            true,
            state,
            Arc::new(BlockPool::new()),
            Arc::new(TransactionPool::new()),
            Arc::new(Blockchain::in_memory().unwrap()),
        );
        engine.init(genesis);

        let actions = engine.tick(2_000).unwrap();
        assert!(actions.iter().any(|a| matches!(a, ConsensusAction::BroadcastProposal(..))));
        assert!(actions.iter().any(|a| matches!(a, ConsensusAction::BroadcastVote(_))));
    }
}
