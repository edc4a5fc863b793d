//! Thin JSON-RPC client mirroring the teacher's `client.rs`
//! (`HttpClient`/`HttpClientBuilder`/`rpc_params!`), talking to
//! `TriarchRpcServer` (spec §6).

use crate::crypto::{Address, Hash, PrivateKey};
use crate::rpc::NumberOrHash;
use crate::types::{Block, Operation, Transaction, TxBody};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;

pub struct TriarchClient {
    client: HttpClient,
}

impl TriarchClient {
    pub fn new(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let client = HttpClientBuilder::default().build(url)?;
        Ok(TriarchClient { client })
    }

    pub async fn get_block_by_number(&self, number: u64) -> Result<Option<Block>, Box<dyn std::error::Error>> {
        let params = rpc_params![NumberOrHash::Number(number)];
        let block: Option<Block> = self.client.request("get_block", params).await?;
        Ok(block)
    }

    pub async fn get_block_by_hash(&self, hash: Hash) -> Result<Option<Block>, Box<dyn std::error::Error>> {
        let params = rpc_params![NumberOrHash::Hash(hash)];
        let block: Option<Block> = self.client.request("get_block", params).await?;
        Ok(block)
    }

    pub async fn get_status(&self) -> Result<crate::rpc::NodeStatusReport, Box<dyn std::error::Error>> {
        let status = self.client.request("get_status", rpc_params![]).await?;
        Ok(status)
    }

    pub async fn get_validators(&self) -> Result<Vec<(Address, u64)>, Box<dyn std::error::Error>> {
        let validators = self.client.request("get_validators", rpc_params![]).await?;
        Ok(validators)
    }

    /// Build, sign, and submit a single-operation transaction.
    pub async fn submit_operation(
        &self,
        operation: Operation,
        nonce: i64,
        timestamp: i64,
        key: &PrivateKey,
    ) -> Result<Hash, Box<dyn std::error::Error>> {
        let tx_body = TxBody { operation, nonce, timestamp, gas_price: None, parent_tx_hash: None };
        let tx = Transaction::new_signed(tx_body, key);
        let params = rpc_params![tx];
        let hash: Hash = self.client.request("submit_transaction", params).await?;
        Ok(hash)
    }
}
