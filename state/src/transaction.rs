//! Transactions: staged store mutations applied on commit

use enginelink_core::{BridgeError, BridgeResult, Timestamp, TransactionId, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// How many terminated transaction ids are remembered for error reporting
const RETIRED_LIMIT: usize = 1024;

/// A mutation staged inside a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StagedOp {
    Set { key: String, value: Value },
    Delete { key: String },
}

impl StagedOp {
    pub fn key(&self) -> &str {
        match self {
            StagedOp::Set { key, .. } | StagedOp::Delete { key } => key,
        }
    }
}

/// Transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

/// An open group of staged operations
///
/// Staged operations stay invisible to readers until commit.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub ops: Vec<StagedOp>,
    pub status: TransactionStatus,
    pub started_at: Timestamp,
    pub timeout_at: Timestamp,
}

impl Transaction {
    pub fn new(timeout: Duration) -> Self {
        let started_at = Timestamp::now();
        Self {
            id: TransactionId::generate(),
            ops: Vec::new(),
            status: TransactionStatus::Active,
            started_at,
            timeout_at: started_at.plus_millis(timeout.as_millis() as u64),
        }
    }

    pub fn stage(&mut self, op: StagedOp) {
        self.ops.push(op);
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.timeout_at
    }

    pub fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            status: self.status,
            op_count: self.ops.len(),
            started_at: Some(self.started_at),
            timeout_at: Some(self.timeout_at),
        }
    }
}

/// Read-only view of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub status: TransactionStatus,
    pub op_count: usize,
    /// Unknown once the transaction has been retired
    pub started_at: Option<Timestamp>,
    pub timeout_at: Option<Timestamp>,
}

/// Active transactions plus a bounded memory of terminated ids
#[derive(Debug, Default)]
pub struct TransactionTable {
    active: HashMap<TransactionId, Transaction>,
    retired: VecDeque<(TransactionId, TransactionStatus)>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new transaction and return its id
    pub fn begin(&mut self, timeout: Duration) -> TransactionId {
        let txn = Transaction::new(timeout);
        let id = txn.id;
        self.active.insert(id, txn);
        id
    }

    /// Look up an active transaction
    pub fn active_mut(&mut self, id: &TransactionId) -> BridgeResult<&mut Transaction> {
        if !self.active.contains_key(id) {
            return Err(self.unavailable(id));
        }
        self.active
            .get_mut(id)
            .ok_or_else(|| BridgeError::Internal(format!("transaction {} vanished", id)))
    }

    pub fn get(&self, id: &TransactionId) -> Option<&Transaction> {
        self.active.get(id)
    }

    /// Terminate a transaction, returning it with its final status
    pub fn finish(
        &mut self,
        id: &TransactionId,
        status: TransactionStatus,
    ) -> BridgeResult<Transaction> {
        let mut txn = self.active.remove(id).ok_or_else(|| self.unavailable(id))?;
        txn.status = status;

        self.retired.push_back((*id, status));
        while self.retired.len() > RETIRED_LIMIT {
            self.retired.pop_front();
        }

        Ok(txn)
    }

    /// Ids of active transactions whose deadline has passed
    pub fn expired(&self, now: Timestamp) -> Vec<TransactionId> {
        self.active
            .values()
            .filter(|t| t.is_expired(now))
            .map(|t| t.id)
            .collect()
    }

    pub fn info(&self, id: &TransactionId) -> Option<TransactionInfo> {
        if let Some(txn) = self.active.get(id) {
            return Some(txn.info());
        }
        self.retired
            .iter()
            .rev()
            .find(|(retired, _)| retired == id)
            .map(|(id, status)| TransactionInfo {
                id: *id,
                status: *status,
                op_count: 0,
                started_at: None,
                timeout_at: None,
            })
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn unavailable(&self, id: &TransactionId) -> BridgeError {
        let reason = match self.retired.iter().rev().find(|(retired, _)| retired == id) {
            Some((_, TransactionStatus::Committed)) => "already committed",
            Some((_, _)) => "already rolled back",
            None => "unknown transaction",
        };
        BridgeError::invalid_transaction(*id, reason)
    }
}
