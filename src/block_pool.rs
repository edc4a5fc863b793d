//! `BlockPool`: the DAG of seen proposals and votes (spec §4.4), keyed by
//! block hash, tracking notarization tally and the longest notarized tips.

use crate::crypto::{Address, Hash};
use crate::state::VersionName;
use crate::types::{Block, Transaction};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockPoolError {
    #[error("unknown block: {0}")]
    UnknownBlock(Hash),
    #[error("vote transaction does not target this block")]
    VoteMismatch,
}

#[derive(Clone, Debug)]
pub struct BlockInfo {
    pub block: Block,
    /// The proposal transaction that carried this block (absent for genesis).
    pub proposal: Option<Transaction>,
    /// Vote transactions accepted for this block, one per distinct validator.
    pub votes: Vec<Transaction>,
    pub notarized: bool,
    pub tally: u64,
}

impl BlockInfo {
    fn new(block: Block, proposal: Option<Transaction>) -> Self {
        BlockInfo {
            block,
            proposal,
            votes: Vec::new(),
            notarized: false,
            tally: 0,
        }
    }

    fn recompute_tally(&mut self) {
        let mut seen: HashSet<Address> = HashSet::new();
        let mut tally = 0u64;
        for tx in &self.votes {
            if let Some(record) = tx.as_vote() {
                if seen.insert(record.validator) {
                    tally += record.stake;
                }
            }
        }
        self.tally = tally;
        self.notarized = tally * 3 > self.block.total_stake() * 2;
    }

    /// The transactions this block's successor must carry as `last_votes`:
    /// this block's own proposal transaction, then every vote it received.
    pub fn as_last_votes(&self) -> Vec<Transaction> {
        let mut out = Vec::with_capacity(self.votes.len() + 1);
        out.extend(self.proposal.clone());
        out.extend(self.votes.iter().cloned());
        out
    }
}

struct Inner {
    by_hash: HashMap<Hash, BlockInfo>,
    by_epoch: HashMap<u64, Hash>,
    by_number: HashMap<u64, HashSet<Hash>>,
    children: HashMap<Hash, HashSet<Hash>>,
    state_by_hash: HashMap<Hash, VersionName>,
    longest_notarized_tips: Vec<Hash>,
}

pub struct BlockPool {
    inner: Mutex<Inner>,
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockPool {
    pub fn new() -> Self {
        BlockPool {
            inner: Mutex::new(Inner {
                by_hash: HashMap::new(),
                by_epoch: HashMap::new(),
                by_number: HashMap::new(),
                children: HashMap::new(),
                state_by_hash: HashMap::new(),
                longest_notarized_tips: Vec::new(),
            }),
        }
    }

    pub fn has_seen_block(&self, hash: &Hash) -> bool {
        self.inner.lock().unwrap().by_hash.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<BlockInfo> {
        self.inner.lock().unwrap().by_hash.get(hash).cloned()
    }

    pub fn voted_block_at_epoch(&self, epoch: u64) -> Option<Hash> {
        self.inner.lock().unwrap().by_epoch.get(&epoch).copied()
    }

    pub fn state_version_for(&self, hash: &Hash) -> Option<VersionName> {
        self.inner.lock().unwrap().state_by_hash.get(hash).cloned()
    }

    /// Insert a freshly-validated block with the state version it was
    /// executed against. Idempotent: returns `false` if already known.
    pub fn add_seen_block(&self, block: Block, proposal: Option<Transaction>, state_version: VersionName) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.by_hash.contains_key(&block.hash) {
            return false;
        }
        let hash = block.hash;
        let number = block.number;
        let parent = block.last_hash;
        let info = BlockInfo::new(block, proposal);
        inner.by_hash.insert(hash, info);
        inner.by_number.entry(number).or_default().insert(hash);
        inner.children.entry(parent).or_default().insert(hash);
        inner.state_by_hash.insert(hash, state_version);
        Self::recompute_tips(&mut inner);
        true
    }

    /// Record that this node voted for `hash` at `epoch` (the one-vote rule
    /// is enforced by the caller checking `voted_block_at_epoch` first).
    pub fn record_own_vote(&self, epoch: u64, hash: Hash) {
        self.inner.lock().unwrap().by_epoch.insert(epoch, hash);
    }

    /// Add a vote transaction to the BlockInfo it targets, re-tally, and
    /// flip `notarized` if the stake threshold is now crossed.
    pub fn add_seen_vote(&self, vote_tx: Transaction) -> Result<bool, BlockPoolError> {
        let record = vote_tx.as_vote().ok_or(BlockPoolError::VoteMismatch)?;
        let mut inner = self.inner.lock().unwrap();
        let info = inner
            .by_hash
            .get_mut(&record.block_hash)
            .ok_or(BlockPoolError::UnknownBlock(record.block_hash))?;
        if info
            .votes
            .iter()
            .any(|v| v.as_vote().is_some_and(|r| r.validator == record.validator))
        {
            return Ok(info.notarized); // one-vote rule: duplicate discarded
        }
        info.votes.push(vote_tx);
        let was_notarized = info.notarized;
        info.recompute_tally();
        let became_notarized = !was_notarized && info.notarized;
        if became_notarized {
            Self::recompute_tips(&mut inner);
        }
        Ok(became_notarized)
    }

    fn recompute_tips(inner: &mut Inner) {
        // A tip is any notarized block with no notarized child. Among the
        // maximal chains rooted at those tips, keep the longest (by number);
        // ties break on greatest epoch.
        let mut tips: Vec<Hash> = inner
            .by_hash
            .iter()
            .filter(|(_, info)| info.notarized)
            .filter(|(hash, _)| {
                !inner
                    .children
                    .get(*hash)
                    .map(|kids| kids.iter().any(|k| inner.by_hash.get(k).is_some_and(|i| i.notarized)))
                    .unwrap_or(false)
            })
            .map(|(hash, _)| *hash)
            .collect();
        tips.sort_by(|a, b| {
            let ia = &inner.by_hash[a];
            let ib = &inner.by_hash[b];
            ib.block
                .number
                .cmp(&ia.block.number)
                .then(ib.block.epoch.cmp(&ia.block.epoch))
        });
        inner.longest_notarized_tips = tips;
    }

    pub fn longest_notarized_tip(&self) -> Option<Hash> {
        self.inner.lock().unwrap().longest_notarized_tips.first().copied()
    }

    pub fn longest_notarized_tips(&self) -> Vec<Hash> {
        self.inner.lock().unwrap().longest_notarized_tips.clone()
    }

    /// The chain of hashes from `tip_hash` back to (and excluding) the
    /// finalized ancestor still present in the pool.
    pub fn extending_chain(&self, tip_hash: &Hash) -> Vec<Hash> {
        let inner = self.inner.lock().unwrap();
        let mut chain = Vec::new();
        let mut current = *tip_hash;
        while let Some(info) = inner.by_hash.get(&current) {
            chain.push(current);
            current = info.block.last_hash;
        }
        chain.reverse();
        chain
    }

    /// If there exists a suffix of three consecutive-epoch notarized blocks
    /// among the notarized chains, return `[A, B, C]` (A finalizes).
    pub fn finalizable_chain(&self) -> Vec<BlockInfo> {
        let inner = self.inner.lock().unwrap();
        for tip in &inner.longest_notarized_tips {
            let chain = {
                let mut c = Vec::new();
                let mut current = *tip;
                while let Some(info) = inner.by_hash.get(&current) {
                    c.push(info.clone());
                    current = info.block.last_hash;
                }
                c.reverse();
                c
            };
            if chain.len() < 3 {
                continue;
            }
            for window in chain.windows(3) {
                let [a, b, c] = [&window[0], &window[1], &window[2]];
                if !(a.notarized && b.notarized && c.notarized) {
                    continue;
                }
                if b.block.epoch == a.block.epoch + 1 && c.block.epoch == b.block.epoch + 1 {
                    return vec![a.clone(), b.clone(), c.clone()];
                }
            }
        }
        Vec::new()
    }

    /// Every `BlockInfo` reachable from a longest-notarized tip back to (and
    /// excluding) its finalized ancestor, deduplicated — the DAG fragments a
    /// catch-up response carries as `catchUpInfo` (spec §4.7) so a peer that
    /// requested a chain segment also recovers this node's pool state.
    pub fn catch_up_fragments(&self) -> Vec<BlockInfo> {
        let inner = self.inner.lock().unwrap();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for tip in &inner.longest_notarized_tips {
            let mut current = *tip;
            while let Some(info) = inner.by_hash.get(&current) {
                if seen.insert(current) {
                    out.push(info.clone());
                }
                current = info.block.last_hash;
            }
        }
        out
    }

    /// Drop every block at number <= `finalized.number` except `finalized`
    /// itself, and their state versions. Callers are responsible for
    /// releasing the returned version names from `StateVersionManager`.
    pub fn clean_up_after_finalization(&self, finalized: &Block) -> Vec<VersionName> {
        let mut inner = self.inner.lock().unwrap();
        let mut released = Vec::new();
        let numbers: Vec<u64> = inner
            .by_number
            .keys()
            .copied()
            .filter(|n| *n <= finalized.number)
            .collect();
        for number in numbers {
            if let Some(hashes) = inner.by_number.remove(&number) {
                for hash in hashes {
                    if hash == finalized.hash {
                        // Keep the finalized block's own record but drop its pool-owned
                        // state version: ownership has transferred to the chain.
                        if let Some(v) = inner.state_by_hash.remove(&hash) {
                            released.push(v);
                        }
                        inner.by_number.entry(number).or_default().insert(hash);
                        continue;
                    }
                    inner.by_hash.remove(&hash);
                    inner.children.remove(&hash);
                    if let Some(v) = inner.state_by_hash.remove(&hash) {
                        released.push(v);
                    }
                }
            }
        }
        Self::recompute_tips(&mut inner);
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair_from_id;
    use crate::types::{vote_path, Operation, TxBody};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn block(number: u64, epoch: u64, parent: Hash, validators: BTreeMap<Address, u64>) -> Block {
        let (pk, _) = generate_keypair_from_id(number);
        Block::new(number, epoch, parent, pk.to_address(), validators, vec![], vec![], 0, 0, Hash::default(), 0)
    }

    /// Four equal-stake validators: a strict-majority quorum (> 2/3 of 400)
    /// needs three of them, so tests can distinguish "below quorum" (two
    /// votes, 200/400) from "quorum reached" (three votes, 300/400) cleanly,
    /// unlike three equal validators where 2/3 of the total is an unreachable
    /// tie under the strict `tally * 3 > total_stake * 2` threshold.
    fn validators() -> (BTreeMap<Address, u64>, Vec<(Address, crate::crypto::PrivateKey)>) {
        let mut v = BTreeMap::new();
        let mut keys = Vec::new();
        for i in 0..4 {
            let (pk, sk) = generate_keypair_from_id(100 + i);
            v.insert(pk.to_address(), 100);
            keys.push((pk.to_address(), sk));
        }
        (v, keys)
    }

    fn vote_tx(key: &crate::crypto::PrivateKey, number: u64, block_hash: Hash) -> Transaction {
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

    #[test]
    fn duplicate_block_insertion_is_idempotent() {
        let pool = BlockPool::new();
        let (v, _) = validators();
        let b = block(1, 1, Hash::default(), v);
        assert!(pool.add_seen_block(b.clone(), None, "v1".into()));
        assert!(!pool.add_seen_block(b, None, "v1".into()));
    }

    #[test]
    fn notarization_flips_at_two_thirds_stake() {
        let pool = BlockPool::new();
        let (v, keys) = validators();
        let b = block(1, 1, Hash::default(), v);
        pool.add_seen_block(b.clone(), None, "v1".into());

        let became = pool.add_seen_vote(vote_tx(&keys[0].1, 1, b.hash)).unwrap();
        assert!(!became);

        let became = pool.add_seen_vote(vote_tx(&keys[1].1, 1, b.hash)).unwrap();
        assert!(!became, "two of four equal-stake votes is exactly 1/2, short of the strict 2/3 quorum");

        let became = pool.add_seen_vote(vote_tx(&keys[2].1, 1, b.hash)).unwrap();
        assert!(became);
        assert!(pool.get(&b.hash).unwrap().notarized);
    }

    #[test]
    fn duplicate_vote_from_same_validator_is_discarded() {
        let pool = BlockPool::new();
        let (v, keys) = validators();
        let b = block(1, 1, Hash::default(), v);
        pool.add_seen_block(b.clone(), None, "v1".into());
        pool.add_seen_vote(vote_tx(&keys[0].1, 1, b.hash)).unwrap();
        pool.add_seen_vote(vote_tx(&keys[0].1, 1, b.hash)).unwrap();
        assert_eq!(pool.get(&b.hash).unwrap().tally, 100);
    }

    #[test]
    fn finalizable_chain_requires_three_consecutive_notarized_epochs() {
        let pool = BlockPool::new();
        let (v, keys) = validators();
        let genesis_hash = Hash::default();
        let mut prev_hash = genesis_hash;
        let mut blocks = Vec::new();
        for epoch in 1..=3u64 {
            let b = block(epoch, epoch, prev_hash, v.clone());
            pool.add_seen_block(b.clone(), None, format!("v{epoch}"));
            for (_, key) in &keys[..3] {
                pool.add_seen_vote(vote_tx(key, epoch, b.hash)).unwrap();
            }
            prev_hash = b.hash;
            blocks.push(b);
        }
        let chain = pool.finalizable_chain();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].block.hash, blocks[0].hash);
        assert_eq!(chain[2].block.hash, blocks[2].hash);
    }

    #[test]
    fn catch_up_fragments_cover_the_whole_notarized_chain() {
        let pool = BlockPool::new();
        let (v, keys) = validators();
        let mut prev_hash = Hash::default();
        let mut hashes = Vec::new();
        for epoch in 1..=3u64 {
            let b = block(epoch, epoch, prev_hash, v.clone());
            pool.add_seen_block(b.clone(), None, format!("v{epoch}"));
            for (_, key) in &keys[..3] {
                pool.add_seen_vote(vote_tx(key, epoch, b.hash)).unwrap();
            }
            prev_hash = b.hash;
            hashes.push(b.hash);
        }
        let fragments = pool.catch_up_fragments();
        let fragment_hashes: HashSet<Hash> = fragments.iter().map(|f| f.block.hash).collect();
        assert_eq!(fragment_hashes, hashes.into_iter().collect());
    }
}
