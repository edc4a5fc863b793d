//! The sharding-report cross-chain reporter (spec §6's
//! `send_and_wait_finalized(parent_chain_endpoint, tx_body, private_key)`).
//! Content of the parent-chain job is out of scope; this crate only owns
//! the collaborator boundary and its failure/retry behaviour (spec §7:
//! "external (reporter) failures are reported and retried at the next
//! reporting period").

use crate::crypto::{Hash, PrivateKey};
use crate::types::{Operation, Transaction, TxBody};
use async_trait::async_trait;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::HttpClientBuilder;
use jsonrpsee::rpc_params;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("reporter endpoint unreachable: {0}")]
    Unreachable(String),
}

/// Called once per `ConsensusAction::ReportFinalized` (spec §4.6 step 6).
/// Implementations must not block the consensus event loop; failures are
/// logged and simply tried again on the next report.
#[async_trait]
pub trait ShardReporter: Send + Sync {
    async fn report_finalized(&self, state_proof_hash: Hash, block_number: u64);
}

/// Default reporter when no `parent_chain_endpoint` is configured: logs at
/// `info!` and does nothing else.
pub struct NoopReporter;

#[async_trait]
impl ShardReporter for NoopReporter {
    async fn report_finalized(&self, state_proof_hash: Hash, block_number: u64) {
        log::info!("finalized block {block_number} state proof {state_proof_hash} (no reporter configured)");
    }
}

/// Sends `/sharding/shard/.../proof_hash_map/<N>/proof_hash` writes to a
/// parent-chain JSON-RPC endpoint as an ordinary signed transaction, the
/// same shape `client.rs` uses for any other operation.
pub struct HttpShardReporter {
    endpoint: String,
    key: PrivateKey,
    shard_path: String,
}

impl HttpShardReporter {
    pub fn new(endpoint: impl Into<String>, key: PrivateKey, shard_path: impl Into<String>) -> Self {
        HttpShardReporter { endpoint: endpoint.into(), key, shard_path: shard_path.into() }
    }

    async fn send_and_wait_finalized(&self, tx_body: TxBody) -> Result<Hash, ReportError> {
        let client = HttpClientBuilder::default()
            .build(&self.endpoint)
            .map_err(|e| ReportError::Unreachable(e.to_string()))?;
        let tx = Transaction::new_signed(tx_body, &self.key);
        let hash = tx.hash;
        let params = rpc_params![tx];
        client
            .request::<Hash, _>("submit_transaction", params)
            .await
            .map_err(|e| ReportError::Unreachable(e.to_string()))?;
        Ok(hash)
    }
}

#[async_trait]
impl ShardReporter for HttpShardReporter {
    async fn report_finalized(&self, state_proof_hash: Hash, block_number: u64) {
        let path = format!("{}/proof_hash_map/{block_number}/proof_hash", self.shard_path);
        let tx_body = TxBody {
            operation: Operation::SetValue { path, value: serde_json::json!(state_proof_hash) },
            nonce: -1,
            timestamp: wall_clock_ms(),
            gas_price: None,
            parent_tx_hash: None,
        };
        match self.send_and_wait_finalized(tx_body).await {
            Ok(hash) => log::info!("reported finalized block {block_number} to parent chain as {hash}"),
            Err(e) => log::warn!("sharding report for block {block_number} failed, retrying next period: {e}"),
        }
    }
}

fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
