//! Targeted rejection-path tests mirroring the ordered rejection list
//! `ConsensusEngine::on_proposal` enforces (spec §4.5), plus a
//! `BlockPool`-level check that a replayed vote can't inflate notarization.

use std::collections::BTreeMap;
use std::sync::Arc;
use triarch::block_pool::BlockPool;
use triarch::blockchain::Blockchain;
use triarch::consensus::{ConsensusAction, ConsensusEngine, ConsensusError, NodeStatus};
use triarch::crypto::{generate_keypair_from_id, sign, Address, Hash, PrivateKey};
use triarch::state::StateVersionManager;
use triarch::tx_pool::TransactionPool;
use triarch::types::{propose_path, vote_path, Block, Operation, Transaction, TxBody};
use serde_json::json;

const EPOCH_MS: i64 = 2_000;

fn make_engine(validators: BTreeMap<Address, u64>, genesis_ts: i64) -> (ConsensusEngine, Address, PrivateKey) {
    let (pk, sk) = generate_keypair_from_id(0);
    let addr = pk.to_address();
    let state = Arc::new(StateVersionManager::new());
    state.init_finalized("final-0");
    let genesis = Block::genesis(validators, genesis_ts);
    let engine = ConsensusEngine::new(
        addr,
        sk.clone(),
        genesis_ts,
        EPOCH_MS,
        true,
        state,
        Arc::new(BlockPool::new()),
        Arc::new(TransactionPool::new()),
        Arc::new(Blockchain::in_memory().unwrap()),
    );
    engine.init(genesis);
    engine.set_node_status(NodeStatus::Serving);
    (engine, addr, sk)
}

fn signed_proposal_tx(number: u64, block_hash: Hash, key: &PrivateKey) -> Transaction {
    let body = TxBody {
        operation: Operation::SetValue {
            path: propose_path(number),
            value: json!({ "block_hash": block_hash }),
        },
        nonce: -1,
        timestamp: 0,
        gas_price: None,
        parent_tx_hash: None,
    };
    Transaction::new_signed(body, key)
}

/// A single validator (this node's own address) holding all the stake: the
/// weighted proposer draw always resolves to it, so tests can construct a
/// block and know in advance whether it will be accepted or rejected.
fn solo_validator() -> BTreeMap<Address, u64> {
    let (pk, _) = generate_keypair_from_id(0);
    let mut validators = BTreeMap::new();
    validators.insert(pk.to_address(), 100);
    validators
}

#[test]
fn on_proposal_rejects_an_impostor_proposer() {
    let validators = solo_validator();
    let genesis = Block::genesis(validators.clone(), 0);
    let (engine, _, _) = make_engine(validators.clone(), 0);

    // A keypair that isn't the (sole, deterministically-elected) validator.
    let (impostor_pk, impostor_key) = generate_keypair_from_id(99);
    let block = Block::new(
        1,
        1,
        genesis.hash,
        impostor_pk.to_address(),
        validators,
        vec![],
        vec![],
        0,
        0,
        Hash::default(),
        EPOCH_MS,
    );
    let proposal_tx = signed_proposal_tx(1, block.hash, &impostor_key);

    let result = engine.on_proposal(block, proposal_tx, EPOCH_MS);
    assert!(matches!(result, Err(ConsensusError::WrongProposer)));
}

#[test]
fn on_proposal_rejects_a_block_tampered_after_hashing() {
    let validators = solo_validator();
    let genesis = Block::genesis(validators.clone(), 0);
    let (engine, my_addr, my_key) = make_engine(validators.clone(), 0);

    let mut block = Block::new(
        1,
        1,
        genesis.hash,
        my_addr,
        validators,
        vec![],
        vec![],
        0,
        0,
        Hash::default(),
        EPOCH_MS,
    );
    let proposal_tx = signed_proposal_tx(1, block.hash, &my_key);
    // Tamper with the block after the proposal transaction committed to its hash.
    block.timestamp += 1;

    let result = engine.on_proposal(block, proposal_tx, EPOCH_MS);
    assert!(matches!(result, Err(ConsensusError::InvalidProposal) | Err(ConsensusError::InvalidBlock)));
}

#[test]
fn on_proposal_requests_catchup_instead_of_replaying_a_far_future_block() {
    let validators = solo_validator();
    let genesis = Block::genesis(validators.clone(), 0);
    let (engine, my_addr, my_key) = make_engine(validators.clone(), 0);

    let far_ahead = Block::new(
        50,
        50,
        Hash::default(),
        my_addr,
        validators,
        vec![],
        vec![],
        0,
        0,
        Hash::default(),
        50 * EPOCH_MS,
    );
    let proposal_tx = signed_proposal_tx(50, far_ahead.hash, &my_key);

    let actions = engine.on_proposal(far_ahead, proposal_tx, 50 * EPOCH_MS).unwrap();
    assert!(
        actions.iter().any(|a| matches!(a, ConsensusAction::RequestChainSegment(b) if b.hash == genesis.hash)),
        "a proposal far beyond the known tip should trigger a catch-up request, not a vote"
    );
}

#[test]
fn on_vote_rejects_a_forged_signature() {
    let validators = solo_validator();
    let genesis = Block::genesis(validators.clone(), 0);
    let (engine, my_addr, my_key) = make_engine(validators.clone(), 0);

    let block = Block::new(
        1,
        1,
        genesis.hash,
        my_addr,
        validators,
        vec![],
        vec![],
        0,
        0,
        Hash::default(),
        EPOCH_MS,
    );
    let proposal_tx = signed_proposal_tx(1, block.hash, &my_key);
    engine.on_proposal(block.clone(), proposal_tx, EPOCH_MS).unwrap();
    let before = engine.finalized_tip();

    let vote_body = TxBody {
        operation: Operation::SetValue {
            path: vote_path(block.number, &my_addr),
            value: json!({ "block_hash": block.hash, "stake": 100 }),
        },
        nonce: -1,
        timestamp: EPOCH_MS,
        gas_price: None,
        parent_tx_hash: None,
    };
    let mut forged_tx = Transaction::new_signed(vote_body, &my_key);
    // Swap in a signature over an unrelated payload: recovers to the right
    // key, but not to a message matching this transaction's own body hash.
    forged_tx.signature = sign(&my_key, b"unrelated-payload");

    let result = engine.on_vote(forged_tx);
    assert!(result.is_err());
    assert_eq!(engine.finalized_tip(), before);
}

#[test]
fn replaying_an_identical_vote_does_not_inflate_the_notarization_tally() {
    let (pk_a, _) = generate_keypair_from_id(0);
    let (pk_b, sk_b) = generate_keypair_from_id(1);
    let mut validators = BTreeMap::new();
    validators.insert(pk_a.to_address(), 100);
    validators.insert(pk_b.to_address(), 100);

    let block = Block::new(
        1,
        1,
        Hash::default(),
        pk_a.to_address(),
        validators,
        vec![],
        vec![],
        0,
        0,
        Hash::default(),
        EPOCH_MS,
    );

    let pool = BlockPool::new();
    pool.add_seen_block(block.clone(), None, "blk-1".into());

    let vote_body = TxBody {
        operation: Operation::SetValue {
            path: vote_path(block.number, &pk_b.to_address()),
            value: json!({ "block_hash": block.hash, "stake": 100 }),
        },
        nonce: -1,
        timestamp: EPOCH_MS,
        gas_price: None,
        parent_tx_hash: None,
    };
    let vote_tx = Transaction::new_signed(vote_body, &sk_b);

    pool.add_seen_vote(vote_tx.clone()).unwrap();
    let tally_after_first = pool.get(&block.hash).unwrap().tally;
    pool.add_seen_vote(vote_tx).unwrap();
    let tally_after_second = pool.get(&block.hash).unwrap().tally;

    assert_eq!(tally_after_first, 100);
    assert_eq!(tally_after_second, 100, "replaying the identical vote must not change the tally");
    assert!(!pool.get(&block.hash).unwrap().notarized, "2/3 of 200 total stake is not met by a single 100-stake vote");
}
