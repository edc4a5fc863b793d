//! `TransactionPool`: mempool of pending transactions (spec §4.3).
//! Ordered per-account, deduplicated globally by hash, bounded by both a
//! global and a per-account capacity.

use crate::crypto::{Address, Hash};
use crate::types::{Transaction, MAX_PER_ACCOUNT, MAX_POOL_SIZE};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("transaction pool is full")]
    PoolFull,
    #[error("per-account queue for {0} is full")]
    AccountQueueFull(Address),
    #[error("transaction already present in pool")]
    Duplicate,
    #[error("transaction failed signature verification")]
    InvalidSignature,
}

/// Ordered queue of one account's pending transactions. `nonce`-ordered
/// transactions are kept sorted by nonce; unordered ones (`nonce < 0`) are
/// appended in arrival order and never reordered against each other.
#[derive(Default)]
struct AccountQueue {
    ordered: BTreeMap<i64, Transaction>,
    unordered: VecDeque<Transaction>,
}

impl AccountQueue {
    fn len(&self) -> usize {
        self.ordered.len() + self.unordered.len()
    }

    fn insert(&mut self, tx: Transaction) {
        if tx.is_unordered() {
            self.unordered.push_back(tx);
        } else {
            self.ordered.insert(tx.tx_body.nonce, tx);
        }
    }

    fn all(&self) -> Vec<Transaction> {
        let mut out: Vec<Transaction> = self.ordered.values().cloned().collect();
        out.extend(self.unordered.iter().cloned());
        out
    }
}

struct Inner {
    by_account: HashMap<Address, AccountQueue>,
    seen_hashes: HashSet<Hash>,
    total: usize,
}

pub struct TransactionPool {
    inner: Mutex<Inner>,
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionPool {
    pub fn new() -> Self {
        TransactionPool {
            inner: Mutex::new(Inner {
                by_account: HashMap::new(),
                seen_hashes: HashSet::new(),
                total: 0,
            }),
        }
    }

    /// Admit a transaction: rejects duplicates and over-capacity pools, but
    /// does not check nonce continuity or account balance — that is
    /// `DatabaseView::execute`'s job at block-assembly time.
    pub fn admit(&self, tx: Transaction) -> Result<(), PoolError> {
        if !tx.verify() {
            return Err(PoolError::InvalidSignature);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.seen_hashes.contains(&tx.hash) {
            return Err(PoolError::Duplicate);
        }
        if inner.total >= MAX_POOL_SIZE {
            return Err(PoolError::PoolFull);
        }
        let addr = tx.address;
        let queue = inner.by_account.entry(addr).or_default();
        if queue.len() >= MAX_PER_ACCOUNT {
            return Err(PoolError::AccountQueueFull(addr));
        }
        let hash = tx.hash;
        queue.insert(tx);
        inner.seen_hashes.insert(hash);
        inner.total += 1;
        Ok(())
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.lock().unwrap().seen_hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every pending transaction, grouped by account then ordered within
    /// the account (nonce-ordered first, then unordered by arrival).
    /// Proposal construction (spec §4.5 step 2) takes transactions in this
    /// shape and applies them through `DatabaseView::execute`, dropping any
    /// that fail so only valid transactions make it into the block.
    pub fn pending(&self) -> Vec<Transaction> {
        let inner = self.inner.lock().unwrap();
        inner.by_account.values().flat_map(|q| q.all()).collect()
    }

    pub fn remove(&self, hash: &Hash) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.seen_hashes.remove(hash) {
            return;
        }
        inner.total = inner.total.saturating_sub(1);
        let mut emptied = Vec::new();
        for (addr, queue) in inner.by_account.iter_mut() {
            let before = queue.len();
            queue.ordered.retain(|_, tx| &tx.hash != hash);
            queue.unordered.retain(|tx| &tx.hash != hash);
            if queue.len() != before {
                if queue.len() == 0 {
                    emptied.push(*addr);
                }
                break;
            }
        }
        for addr in emptied {
            inner.by_account.remove(&addr);
        }
    }

    /// Drop every pending transaction by a given account whose nonce is now
    /// at or below the account's latest confirmed nonce, called after a
    /// block finalizes (spec §4.5 step 9, "drop all consumed transactions").
    pub fn clean_up_for_new_block(&self, confirmed: &[(Address, i64)]) {
        let mut inner = self.inner.lock().unwrap();
        for (addr, confirmed_nonce) in confirmed {
            let Some(queue) = inner.by_account.get_mut(addr) else {
                continue;
            };
            let stale: Vec<Hash> = queue
                .ordered
                .range(..=*confirmed_nonce)
                .map(|(_, tx)| tx.hash)
                .collect();
            for hash in &stale {
                queue.ordered.retain(|_, tx| &tx.hash != hash);
                inner.seen_hashes.remove(hash);
                inner.total = inner.total.saturating_sub(1);
            }
            if queue.len() == 0 {
                inner.by_account.remove(addr);
            }
        }
    }

    /// Purge transactions that failed re-validation (e.g. after a reorg
    /// makes their nonce stale). Mirrors `remove` for a batch of hashes.
    pub fn remove_invalid(&self, hashes: &[Hash]) {
        for hash in hashes {
            self.remove(hash);
        }
    }
}
