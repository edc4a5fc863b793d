//! Fork then resolution (spec §8 scenario 4): two branches of equal length
//! both reach notarization; whichever first completes a three-consecutive-
//! epoch notarized suffix finalizes, and the loser is pruned once its
//! number is at or below the finalized number.

use std::collections::{BTreeMap, HashSet};
use triarch::block_pool::BlockPool;
use triarch::crypto::{generate_keypair_from_id, Address, Hash, PrivateKey};
use triarch::types::{vote_path, Block, Operation, Transaction, TxBody};
use serde_json::json;

/// Four equal-stake validators, as in `block_pool.rs`'s own tests: three of
/// four is the smallest quorum that clears the strict 2/3 threshold.
fn validators() -> (BTreeMap<Address, u64>, Vec<(Address, PrivateKey)>) {
    let mut v = BTreeMap::new();
    let mut keys = Vec::new();
    for i in 0..4 {
        let (pk, sk) = generate_keypair_from_id(100 + i);
        v.insert(pk.to_address(), 100);
        keys.push((pk.to_address(), sk));
    }
    (v, keys)
}

fn block(number: u64, epoch: u64, parent: Hash, proposer_seed: u64, validators: BTreeMap<Address, u64>) -> Block {
    let (pk, _) = generate_keypair_from_id(proposer_seed);
    Block::new(number, epoch, parent, pk.to_address(), validators, vec![], vec![], 0, 0, Hash::default(), 0)
}

fn vote_tx(key: &PrivateKey, number: u64, block_hash: Hash) -> Transaction {
    let addr = key.public_key().to_address();
    let body = TxBody {
        operation: Operation::SetValue {
            path: vote_path(number, &addr),
            value: json!({ "block_hash": block_hash, "stake": 100 }),
        },
        nonce: -1,
        timestamp: 1,
        gas_price: None,
        parent_tx_hash: None,
    };
    Transaction::new_signed(body, key)
}

/// Build and fully notarize a three-block chain rooted at `genesis`, using a
/// distinct proposer seed per branch so branch A and branch B never collide
/// on a block hash despite sharing epoch numbers.
fn notarize_branch(pool: &BlockPool, validators: &BTreeMap<Address, u64>, keys: &[(Address, PrivateKey)], branch_seed: u64) -> Vec<Block> {
    let mut prev_hash = Hash::default();
    let mut blocks = Vec::new();
    for epoch in 1..=3u64 {
        let b = block(epoch, epoch, prev_hash, branch_seed + epoch, validators.clone());
        pool.add_seen_block(b.clone(), None, format!("branch{branch_seed}-v{epoch}"));
        for (_, key) in &keys[..3] {
            pool.add_seen_vote(vote_tx(key, epoch, b.hash)).unwrap();
        }
        prev_hash = b.hash;
        blocks.push(b);
    }
    blocks
}

#[test]
fn equal_length_forks_both_notarize_and_one_is_pruned_once_the_other_finalizes() {
    let pool = BlockPool::new();
    let (v, keys) = validators();

    // Two proposers build competing three-epoch chains from the same genesis.
    let branch_a = notarize_branch(&pool, &v, &keys, 0);
    let branch_b = notarize_branch(&pool, &v, &keys, 10);

    assert_ne!(branch_a[0].hash, branch_b[0].hash, "branches must not collide");

    // Both branches are notarized and both their tips are still in contention.
    let tips: HashSet<Hash> = pool.longest_notarized_tips().into_iter().collect();
    assert!(tips.contains(&branch_a[2].hash));
    assert!(tips.contains(&branch_b[2].hash));

    // Whichever branch's suffix is inspected first, the pool can finalize
    // a complete three-consecutive-epoch notarized chain.
    let chain = pool.finalizable_chain();
    assert_eq!(chain.len(), 3);
    let winner = if chain[0].block.hash == branch_a[0].hash { &branch_a } else { &branch_b };
    let loser = if winner[0].hash == branch_a[0].hash { &branch_b } else { &branch_a };
    assert_eq!(chain[0].block.hash, winner[0].hash);
    assert_eq!(chain[2].block.hash, winner[2].hash);

    // Finalizing the first block of the winning suffix prunes every other
    // block at or below that number, including the loser's first block.
    pool.clean_up_after_finalization(&winner[0]);
    assert!(pool.has_seen_block(&winner[0].hash));
    assert!(!pool.has_seen_block(&loser[0].hash), "the losing branch's block at the finalized number must be pruned");
}
