//! `Blockchain`: the append-only finalized log (spec §4.4), persisted with
//! `redb`. Every block here has already passed the three-chain finalization
//! rule in `ConsensusEngine` — this module only ever appends.

use crate::crypto::Hash;
use crate::types::{Block, CHAIN_SEGMENT_LIMIT};
use redb::{Database, TableDefinition};
use std::path::Path;
use thiserror::Error;

const BLOCKS_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("blocks");
const HASH_INDEX_TABLE: TableDefinition<&[u8; 32], u64> = TableDefinition::new("hash_index");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const META_TIP: &str = "tip";

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Database error: {0}")]
    Database(Box<redb::DatabaseError>),
    #[error("Transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("Table error: {0}")]
    Table(Box<redb::TableError>),
    #[error("Storage error: {0}")]
    Storage(Box<redb::StorageError>),
    #[error("Commit error: {0}")]
    Commit(Box<redb::CommitError>),
    #[error("Serialization error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("block {0} is not a direct successor of the current tip")]
    NotContiguous(u64),
    #[error("block {0} fails hash self-consistency")]
    InconsistentHash(u64),
    #[error("block {0} does not chain from its predecessor")]
    BrokenLink(u64),
}

impl From<redb::DatabaseError> for ChainError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Database(Box::new(e))
    }
}

impl From<redb::TransactionError> for ChainError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<redb::TableError> for ChainError {
    fn from(e: redb::TableError) -> Self {
        Self::Table(Box::new(e))
    }
}

impl From<redb::StorageError> for ChainError {
    fn from(e: redb::StorageError) -> Self {
        Self::Storage(Box::new(e))
    }
}

impl From<redb::CommitError> for ChainError {
    fn from(e: redb::CommitError) -> Self {
        Self::Commit(Box::new(e))
    }
}

pub struct Blockchain {
    db: Database,
}

impl Blockchain {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let db = Database::create(path)?;
        {
            let txn = db.begin_write()?;
            {
                txn.open_table(BLOCKS_TABLE)?;
                txn.open_table(HASH_INDEX_TABLE)?;
                txn.open_table(META_TABLE)?;
            }
            txn.commit()?;
        }
        Ok(Blockchain { db })
    }

    pub fn in_memory() -> Result<Self, ChainError> {
        let tmp = tempfile::NamedTempFile::new().expect("tempfile creation");
        Self::open(tmp.path())
    }

    /// Append one block. Must be the immediate successor of the current tip
    /// (or the genesis block if the chain is empty).
    pub fn append(&self, block: &Block) -> Result<(), ChainError> {
        if !block.hash_is_internally_consistent() {
            return Err(ChainError::InconsistentHash(block.number));
        }
        let txn = self.db.begin_write()?;
        {
            let mut blocks = txn.open_table(BLOCKS_TABLE)?;
            let mut hashes = txn.open_table(HASH_INDEX_TABLE)?;
            let mut meta = txn.open_table(META_TABLE)?;

            let expected_number = match meta.get(META_TIP)? {
                Some(tip) => {
                    let tip_number = tip.value();
                    let tip_bytes = blocks
                        .get(tip_number)?
                        .expect("tip entry present under its own number")
                        .value()
                        .to_vec();
                    let tip_block: Block = bincode::deserialize(&tip_bytes)?;
                    if block.last_hash != tip_block.hash {
                        return Err(ChainError::BrokenLink(block.number));
                    }
                    tip_number + 1
                }
                None => 0,
            };
            if block.number != expected_number {
                return Err(ChainError::NotContiguous(block.number));
            }

            let encoded = bincode::serialize(block)?;
            blocks.insert(block.number, encoded)?;
            hashes.insert(&block.hash.0, block.number)?;
            meta.insert(META_TIP, block.number)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get(&self, number: u64) -> Result<Option<Block>, ChainError> {
        let txn = self.db.begin_read()?;
        let blocks = txn.open_table(BLOCKS_TABLE)?;
        match blocks.get(number)? {
            Some(entry) => Ok(Some(bincode::deserialize(entry.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_by_hash(&self, hash: &Hash) -> Result<Option<Block>, ChainError> {
        let txn = self.db.begin_read()?;
        let hashes = txn.open_table(HASH_INDEX_TABLE)?;
        match hashes.get(&hash.0)? {
            Some(number) => self.get(number.value()),
            None => Ok(None),
        }
    }

    pub fn tip(&self) -> Result<Option<Block>, ChainError> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META_TABLE)?;
        match meta.get(META_TIP)? {
            Some(number) => self.get(number.value()),
            None => Ok(None),
        }
    }

    pub fn tip_number(&self) -> Result<Option<u64>, ChainError> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META_TABLE)?;
        Ok(meta.get(META_TIP)?.map(|v| v.value()))
    }

    /// A contiguous run of blocks strictly after `after_number`, capped at
    /// `CHAIN_SEGMENT_LIMIT` (spec §4.7 catch-up response).
    pub fn segment(&self, after_number: u64, limit: usize) -> Result<Vec<Block>, ChainError> {
        let limit = limit.min(CHAIN_SEGMENT_LIMIT);
        let mut out = Vec::with_capacity(limit);
        let mut number = after_number + 1;
        while out.len() < limit {
            match self.get(number)? {
                Some(block) => out.push(block),
                None => break,
            }
            number += 1;
        }
        Ok(out)
    }

    /// Check that a received segment is internally hash-linked and each
    /// block is self-consistent, before handing it to the caller to replay.
    pub fn validate_segment(blocks: &[Block]) -> Result<(), ChainError> {
        for (i, block) in blocks.iter().enumerate() {
            if !block.hash_is_internally_consistent() {
                return Err(ChainError::InconsistentHash(block.number));
            }
            if i > 0 {
                let prev = &blocks[i - 1];
                if block.last_hash != prev.hash || block.number != prev.number + 1 {
                    return Err(ChainError::BrokenLink(block.number));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair_from_id;
    use std::collections::BTreeMap;

    fn child_of(parent: &Block, proposer_id: u64) -> Block {
        let (pk, _) = generate_keypair_from_id(proposer_id);
        let mut validators = BTreeMap::new();
        validators.insert(pk.to_address(), 100);
        Block::new(
            parent.number + 1,
            parent.epoch + 1,
            parent.hash,
            pk.to_address(),
            validators,
            vec![],
            vec![],
            0,
            0,
            crate::crypto::hash_bytes(b"state"),
            parent.timestamp + 2_000,
        )
    }

    #[test]
    fn append_and_read_back() {
        let chain = Blockchain::in_memory().unwrap();
        let (pk, _) = generate_keypair_from_id(0);
        let mut validators = BTreeMap::new();
        validators.insert(pk.to_address(), 100);
        let genesis = Block::genesis(validators, 0);
        chain.append(&genesis).unwrap();

        let block1 = child_of(&genesis, 1);
        chain.append(&block1).unwrap();

        assert_eq!(chain.tip().unwrap().unwrap().number, 1);
        assert_eq!(chain.get_by_hash(&block1.hash).unwrap().unwrap().number, 1);
    }

    #[test]
    fn append_rejects_non_contiguous_block() {
        let chain = Blockchain::in_memory().unwrap();
        let (pk, _) = generate_keypair_from_id(0);
        let mut validators = BTreeMap::new();
        validators.insert(pk.to_address(), 100);
        let genesis = Block::genesis(validators, 0);
        chain.append(&genesis).unwrap();

        let skip = child_of(&child_of(&genesis, 1), 2); // number 2, but tip is still 0
        assert!(matches!(chain.append(&skip), Err(ChainError::NotContiguous(2))));
    }

    #[test]
    fn segment_is_capped_and_contiguous() {
        let chain = Blockchain::in_memory().unwrap();
        let (pk, _) = generate_keypair_from_id(0);
        let mut validators = BTreeMap::new();
        validators.insert(pk.to_address(), 100);
        let mut prev = Block::genesis(validators, 0);
        chain.append(&prev).unwrap();
        for i in 1..=25u64 {
            let next = child_of(&prev, i);
            chain.append(&next).unwrap();
            prev = next;
        }
        let seg = chain.segment(0, 100).unwrap();
        assert_eq!(seg.len(), CHAIN_SEGMENT_LIMIT);
        assert_eq!(seg[0].number, 1);
    }

    #[test]
    fn validate_segment_detects_broken_link() {
        let (pk, _) = generate_keypair_from_id(0);
        let mut validators = BTreeMap::new();
        validators.insert(pk.to_address(), 100);
        let genesis = Block::genesis(validators, 0);
        let block1 = child_of(&genesis, 1);
        let mut block2 = child_of(&block1, 2);
        block2.last_hash = crate::crypto::Hash::default();
        assert!(Blockchain::validate_segment(&[block1, block2]).is_err());
    }
}
