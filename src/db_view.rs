//! `DatabaseView`: a handle bound to one state version plus a block-number
//! snapshot (spec §4.2). Evaluates transactions against the rule/owner/
//! function evaluator — an explicit non-goal collaborator boundary (spec
//! §1) modeled here as three small traits, with a default, permissive
//! implementation sufficient to drive the consensus paths named in spec §6.

use crate::crypto::{Address, hash_data};
use crate::state::{StateError, StateVersionManager, TreeMap, VersionName};
use crate::types::{Operation, Transaction};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ExecError {
    #[error("nonce mismatch: expected {expected}, got {actual}")]
    NonceMismatch { expected: i64, actual: i64 },
    #[error("timestamp is stale")]
    TimestampStale,
    #[error("write to {0} denied by rule")]
    RuleDenied(String),
    #[error("write to {0} denied by owner policy")]
    OwnerDenied(String),
    #[error("function evaluator rejected write to {0}: {1}")]
    FunctionFailed(String, String),
    #[error("gas limit exceeded")]
    GasExceeded,
    #[error("malformed operation")]
    Malformed,
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecOutcome {
    pub gas_amount: u64,
    pub gas_cost: u64,
}

pub struct EvalContext {
    pub address: Address,
    pub timestamp: i64,
    pub block_number: u64,
}

/// Read access to the tree a rule/owner evaluator needs to make its decision.
pub trait TreeReader {
    fn read(&self, path: &str) -> Option<Value>;
}

pub trait RuleEvaluator: Send + Sync {
    fn is_writable(&self, path: &str, ctx: &EvalContext, reader: &dyn TreeReader) -> bool;
}

pub trait OwnerEvaluator: Send + Sync {
    fn is_permitted(&self, path: &str, ctx: &EvalContext, reader: &dyn TreeReader) -> bool;
}

pub trait FunctionEvaluator: Send + Sync {
    fn on_write(&self, path: &str, value: &Value, ctx: &EvalContext) -> Result<(), String>;
}

/// Permit-by-default evaluator that looks for the nearest ancestor
/// `/rules/<path>`/`/owners/<path>` record, falling back to allow when none
/// is set. This is deliberately simple — a full expression language is a
/// non-goal (spec §1) — but is enough to let an operator deny specific
/// subtrees (e.g. lock `/consensus/whitelist` to a governance-only writer).
pub struct StaticRuleSet;

impl RuleEvaluator for StaticRuleSet {
    fn is_writable(&self, path: &str, _ctx: &EvalContext, reader: &dyn TreeReader) -> bool {
        nearest_ancestor_permits(path, "/rules", reader)
    }
}

impl OwnerEvaluator for StaticRuleSet {
    fn is_permitted(&self, path: &str, _ctx: &EvalContext, reader: &dyn TreeReader) -> bool {
        nearest_ancestor_permits(path, "/owners", reader)
    }
}

fn nearest_ancestor_permits(path: &str, prefix: &str, reader: &dyn TreeReader) -> bool {
    let mut candidate = path.to_string();
    loop {
        if let Some(value) = reader.read(&format!("{prefix}{candidate}")) {
            return value.as_bool().unwrap_or(true);
        }
        match candidate.rfind('/') {
            Some(0) | None => return true, // no rule anywhere on the path: permit by default
            Some(idx) => candidate.truncate(idx),
        }
    }
}

pub struct NoopFunctionEvaluator;

impl FunctionEvaluator for NoopFunctionEvaluator {
    fn on_write(&self, _path: &str, _value: &Value, _ctx: &EvalContext) -> Result<(), String> {
        Ok(())
    }
}

pub struct Evaluators {
    pub rules: Arc<dyn RuleEvaluator>,
    pub owners: Arc<dyn OwnerEvaluator>,
    pub functions: Arc<dyn FunctionEvaluator>,
}

impl Default for Evaluators {
    fn default() -> Self {
        Evaluators {
            rules: Arc::new(StaticRuleSet),
            owners: Arc::new(StaticRuleSet),
            functions: Arc::new(NoopFunctionEvaluator),
        }
    }
}

/// Per-operation gas formula: a small constant plus a size-proportional
/// term, so `gas_amount_total`/`gas_cost_total` are deterministic and
/// reproducible without needing a real metering VM (spec doesn't define one;
/// §1 scopes the evaluator out entirely).
fn gas_for_value(value: &Value) -> u64 {
    let size = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0) as u64;
    1 + size / 256
}

pub struct DatabaseView<'a> {
    manager: &'a StateVersionManager,
    version: VersionName,
    block_number: u64,
    evaluators: Evaluators,
}

impl<'a> TreeReader for DatabaseView<'a> {
    fn read(&self, path: &str) -> Option<Value> {
        let raw = self.manager.get(&self.version, path.as_bytes())?;
        serde_json::from_slice(&raw).ok()
    }
}

impl<'a> DatabaseView<'a> {
    pub fn new(manager: &'a StateVersionManager, version: impl Into<VersionName>, block_number: u64) -> Self {
        DatabaseView {
            manager,
            version: version.into(),
            block_number,
            evaluators: Evaluators::default(),
        }
    }

    pub fn with_evaluators(mut self, evaluators: Evaluators) -> Self {
        self.evaluators = evaluators;
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn get_value(&self, path: &str) -> Option<Value> {
        self.read(path)
    }

    fn write_raw(&self, path: &str, value: &Value) -> Result<(), StateError> {
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        self.manager.set(&self.version, path.as_bytes().to_vec(), bytes)
    }

    pub fn get_account_nonce_and_timestamp(&self, addr: &Address) -> (i64, i64) {
        let path = format!("/accounts/{}/meta", addr);
        match self.read(&path) {
            Some(v) => {
                let nonce = v.get("nonce").and_then(Value::as_i64).unwrap_or(-1);
                let ts = v.get("timestamp").and_then(Value::as_i64).unwrap_or(0);
                (nonce, ts)
            }
            None => (-1, 0),
        }
    }

    fn bump_account_meta(&self, addr: &Address, nonce: i64, timestamp: i64) -> Result<(), StateError> {
        let path = format!("/accounts/{}/meta", addr);
        self.write_raw(&path, &serde_json::json!({ "nonce": nonce, "timestamp": timestamp }))
    }

    /// Execute one transaction's operation against this view, in place.
    /// On failure, nothing is mutated (callers wanting a hard guarantee
    /// across a multi-op `Set` should wrap the call in `backup`/`restore`).
    pub fn execute(&self, tx: &Transaction) -> Result<ExecOutcome, ExecError> {
        if !tx.tx_body.operation.is_well_formed() {
            return Err(ExecError::Malformed);
        }

        let (account_nonce, account_ts) = self.get_account_nonce_and_timestamp(&tx.address);
        if tx.tx_body.nonce >= 0 {
            if tx.tx_body.nonce != account_nonce + 1 {
                return Err(ExecError::NonceMismatch {
                    expected: account_nonce + 1,
                    actual: tx.tx_body.nonce,
                });
            }
        } else if tx.tx_body.timestamp <= account_ts {
            return Err(ExecError::TimestampStale);
        }

        let ctx = EvalContext {
            address: tx.address,
            timestamp: tx.tx_body.timestamp,
            block_number: self.block_number,
        };

        let backup = self.backup();
        match self.apply_operation(&tx.tx_body.operation, &ctx) {
            Ok(outcome) => {
                let next_nonce = if tx.tx_body.nonce >= 0 { tx.tx_body.nonce } else { account_nonce };
                self.bump_account_meta(&tx.address, next_nonce, tx.tx_body.timestamp)
                    .map_err(ExecError::from)?;
                Ok(outcome)
            }
            Err(e) => {
                self.restore(backup);
                Err(e)
            }
        }
    }

    fn apply_operation(&self, op: &Operation, ctx: &EvalContext) -> Result<ExecOutcome, ExecError> {
        match op {
            Operation::SetValue { path, value } => self.apply_write(path, value, ctx),
            Operation::SetRule { path, rule } => {
                self.apply_write(&format!("/rules{path}"), rule, ctx)
            }
            Operation::SetFunction { path, function } => {
                self.apply_write(&format!("/functions{path}"), function, ctx)
            }
            Operation::SetOwner { path, owner } => {
                self.apply_write(&format!("/owners{path}"), owner, ctx)
            }
            Operation::Set(ops) => {
                let mut total_amount = 0u64;
                let mut total_cost = 0u64;
                for inner in ops {
                    let outcome = self.apply_operation(inner, ctx)?;
                    total_amount += outcome.gas_amount;
                    total_cost += outcome.gas_cost;
                }
                Ok(ExecOutcome {
                    gas_amount: total_amount,
                    gas_cost: total_cost,
                })
            }
        }
    }

    fn apply_write(&self, path: &str, value: &Value, ctx: &EvalContext) -> Result<ExecOutcome, ExecError> {
        if !self.evaluators.rules.is_writable(path, ctx, self) {
            return Err(ExecError::RuleDenied(path.to_string()));
        }
        if !self.evaluators.owners.is_permitted(path, ctx, self) {
            return Err(ExecError::OwnerDenied(path.to_string()));
        }
        self.evaluators
            .functions
            .on_write(path, value, ctx)
            .map_err(|e| ExecError::FunctionFailed(path.to_string(), e))?;

        self.write_raw(path, value)?;

        let gas_amount = gas_for_value(value);
        Ok(ExecOutcome {
            gas_amount,
            gas_cost: gas_amount,
        })
    }

    /// Apply each transaction in order; returns `false` as soon as one fails
    /// (callers wanting per-tx atomicity call `backup`/`restore` themselves,
    /// as proposal construction does to drop only the failing transaction).
    pub fn execute_list(&self, txs: &[Transaction]) -> (bool, u64, u64) {
        let mut gas_amount_total = 0;
        let mut gas_cost_total = 0;
        for tx in txs {
            match self.execute(tx) {
                Ok(outcome) => {
                    gas_amount_total += outcome.gas_amount;
                    gas_cost_total += outcome.gas_cost;
                }
                Err(_) => return (false, gas_amount_total, gas_cost_total),
            }
        }
        (true, gas_amount_total, gas_cost_total)
    }

    pub fn backup(&self) -> TreeMap {
        self.manager.snapshot(&self.version).unwrap_or_default()
    }

    pub fn restore(&self, snapshot: TreeMap) {
        let _ = self.manager.restore(&self.version, snapshot);
    }

    /// Deterministic digest of the full tree under this version (spec §4.1's
    /// `state_proof_hash`).
    pub fn state_proof(&self, path: &str) -> crate::crypto::Hash {
        let entries = self.manager.entries_under(&self.version, path.as_bytes());
        hash_data(&entries)
    }

    pub fn root(&self) -> crate::crypto::Hash {
        self.manager.get_root(&self.version).unwrap_or_default()
    }

    pub fn state_info(&self, path: &str) -> (usize, usize) {
        let entries = self.manager.entries_under(&self.version, path.as_bytes());
        let size: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
        (size, entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair_from_id;
    use crate::state::StateVersionManager;
    use crate::types::TxBody;

    fn make_tx(addr_key: &crate::crypto::PrivateKey, nonce: i64, path: &str, value: Value) -> Transaction {
        let body = TxBody {
            operation: Operation::SetValue { path: path.to_string(), value },
            nonce,
            timestamp: 1000 + nonce.max(0),
            gas_price: Some(1),
            parent_tx_hash: None,
        };
        Transaction::new_signed(body, addr_key)
    }

    #[test]
    fn execute_applies_ordered_nonce() {
        let mgr = StateVersionManager::new();
        mgr.init_finalized("v0");
        let view = DatabaseView::new(&mgr, "v0", 1);
        let (_, key) = generate_keypair_from_id(1);

        let tx1 = make_tx(&key, 1, "/a", serde_json::json!(1));
        assert!(view.execute(&tx1).is_ok());

        // Replay of the same nonce must fail.
        let tx1_again = make_tx(&key, 1, "/a", serde_json::json!(2));
        assert!(matches!(view.execute(&tx1_again), Err(ExecError::NonceMismatch { .. })));

        let tx2 = make_tx(&key, 2, "/a", serde_json::json!(2));
        assert!(view.execute(&tx2).is_ok());
        assert_eq!(view.get_value("/a"), Some(serde_json::json!(2)));
    }

    #[test]
    fn failed_execution_leaves_state_untouched() {
        let mgr = StateVersionManager::new();
        mgr.init_finalized("v0");
        let view = DatabaseView::new(&mgr, "v0", 1);
        let (_, key) = generate_keypair_from_id(2);

        let tx_bad_nonce = make_tx(&key, 5, "/a", serde_json::json!("x"));
        assert!(view.execute(&tx_bad_nonce).is_err());
        assert_eq!(view.get_value("/a"), None);
    }

    #[test]
    fn rule_denial_blocks_write_but_keeps_other_paths_open() {
        struct DenyPath(String);
        impl RuleEvaluator for DenyPath {
            fn is_writable(&self, path: &str, _ctx: &EvalContext, _reader: &dyn TreeReader) -> bool {
                path != self.0
            }
        }
        let mgr = StateVersionManager::new();
        mgr.init_finalized("v0");
        let view = DatabaseView::new(&mgr, "v0", 1).with_evaluators(Evaluators {
            rules: Arc::new(DenyPath("/locked".to_string())),
            owners: Arc::new(StaticRuleSet),
            functions: Arc::new(NoopFunctionEvaluator),
        });
        let (_, key) = generate_keypair_from_id(3);

        let denied = make_tx(&key, 1, "/locked", serde_json::json!(1));
        assert!(matches!(view.execute(&denied), Err(ExecError::RuleDenied(_))));

        let allowed = make_tx(&key, 1, "/open", serde_json::json!(1));
        assert!(view.execute(&allowed).is_ok());
    }

    #[test]
    fn state_proof_is_deterministic_and_order_independent() {
        let mgr = StateVersionManager::new();
        mgr.init_finalized("a");
        mgr.init_finalized("b");
        let view_a = DatabaseView::new(&mgr, "a", 1);
        let view_b = DatabaseView::new(&mgr, "b", 1);
        let (_, key) = generate_keypair_from_id(4);

        view_a.execute(&make_tx(&key, 1, "/x", serde_json::json!(1))).unwrap();
        view_a.execute(&make_tx(&key, 2, "/y", serde_json::json!(2))).unwrap();

        view_b.execute(&make_tx(&key, 1, "/y", serde_json::json!(2))).unwrap();
        view_b.execute(&make_tx(&key, 2, "/x", serde_json::json!(1))).unwrap();

        assert_eq!(view_a.state_proof("/"), view_b.state_proof("/"));
    }
}
