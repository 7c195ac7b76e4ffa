//! Concurrency control manager
//!
//! Owns the transaction table and the selected strategy. Every statement
//! flows through `validate_object`; transaction endings flow through
//! `end_transaction`/`abort_transaction`, which drive the status ladders
//! (`Active → PartiallyCommitted → Committed → Terminated` on success,
//! `→ Failed → Aborted → Terminated` on failure). The strategy cannot be
//! swapped while any transaction is live.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::{MinitxError, Result};
use crate::types::Row;

use super::{
    Action, ActionKind, AlgorithmKind, CcEngine, CcResponse, ConcurrencyControl, MvccEngine, Tid,
    Transaction, TransactionStatus,
};

/// Main concurrency control manager
pub struct CcManager {
    algorithm: AlgorithmKind,
    engine: CcEngine,
    transactions: HashMap<Tid, Transaction>,
    next_tid: Tid,
    next_aid: u64,
    max_retry: u32,
    lock_timeout: Duration,
    max_versions: usize,
}

impl CcManager {
    pub fn new(algorithm: AlgorithmKind, lock_timeout: Duration, max_versions: usize, max_retry: u32) -> Self {
        log::info!("concurrency control algorithm: {}", algorithm);
        Self {
            algorithm,
            engine: CcEngine::new(algorithm, lock_timeout, max_versions),
            transactions: HashMap::new(),
            next_tid: 1,
            next_aid: 1,
            max_retry,
            lock_timeout,
            max_versions,
        }
    }

    pub fn algorithm(&self) -> AlgorithmKind {
        self.algorithm
    }

    /// The multi-version engine, when selected (write-intent and
    /// read-only declarations pass through here)
    pub fn mvcc_mut(&mut self) -> Option<&mut MvccEngine> {
        self.engine.as_mvcc_mut()
    }

    /// Begin a new transaction and return its id
    pub fn begin_transaction(&mut self) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        self.transactions.insert(tid, Transaction::new(tid));
        log::info!("transaction {} began", tid);
        tid
    }

    pub fn transaction(&self, tid: Tid) -> Option<&Transaction> {
        self.transactions.get(&tid)
    }

    pub fn status(&self, tid: Tid) -> Option<TransactionStatus> {
        self.transactions.get(&tid).map(|t| t.status)
    }

    /// Tids of transactions that may still issue statements
    pub fn active_transactions(&self) -> Vec<Tid> {
        let mut tids: Vec<Tid> = self
            .transactions
            .values()
            .filter(|t| t.is_runnable())
            .map(|t| t.tid)
            .collect();
        tids.sort_unstable();
        tids
    }

    /// Validate one row access for a transaction, recording the action
    /// and its outcome. Exhausting the bounded retry budget converts a
    /// blocking denial into a fatal one.
    pub fn validate_object(&mut self, row: &Row, tid: Tid, action: ActionKind) -> Result<CcResponse> {
        let txn = self
            .transactions
            .get(&tid)
            .ok_or_else(|| MinitxError::txn_not_found(tid))?;
        if !txn.is_runnable() {
            return Ok(CcResponse::deny(format!(
                "Transaction {} is not in an active state",
                tid
            )));
        }

        let txn_snapshot = txn.clone();
        let response = self.engine.check_permission(&txn_snapshot, row, action);

        let outcome = if response.allowed {
            "ALLOWED"
        } else if response.waiting {
            "BLOCKED"
        } else {
            "DENIED"
        };
        log::debug!(
            "T{} {} {} -> {}: {}",
            tid,
            action,
            row.object_id,
            outcome,
            response.message
        );

        // Record the action; repeated attempts at the same object share
        // one action and accumulate its retry count.
        let max_retry = self.max_retry;
        let next_aid = &mut self.next_aid;
        let txn = self.transactions.get_mut(&tid).expect("looked up above");
        let idx = match txn.find_action_index(&row.object_id, action) {
            Some(idx) => idx,
            None => {
                let aid = *next_aid;
                *next_aid += 1;
                txn.add_action(Action::new(aid, tid, row.object_id.clone(), action));
                txn.actions.len() - 1
            }
        };
        let action_entry = &mut txn.actions[idx];
        let retries_exhausted = if response.allowed {
            action_entry.mark_executed();
            false
        } else if response.waiting {
            txn.wait_time += action_entry.wait_time();
            action_entry.increment_retry();
            action_entry.mark_blocked();
            action_entry.should_abort(max_retry)
        } else {
            action_entry.mark_denied();
            false
        };

        if retries_exhausted {
            log::info!(
                "transaction {} exhausted {} retries on {}",
                tid,
                max_retry,
                row.object_id
            );
            return Ok(CcResponse::deny(format!(
                "Transaction {} aborted: retry limit reached on {}",
                tid, row.object_id
            ))
            .with_cascaded(response.cascaded));
        }

        Ok(response)
    }

    /// Attempt to commit: `Active → PartiallyCommitted → Committed →
    /// Terminated` when the strategy allows it, the failure ladder when
    /// it does not. A `waiting` response leaves the transaction active
    /// for the client to retry.
    pub fn end_transaction(&mut self, tid: Tid) -> Result<CcResponse> {
        let txn = self
            .transactions
            .get(&tid)
            .ok_or_else(|| MinitxError::txn_not_found(tid))?
            .clone();
        if !txn.is_runnable() {
            return Err(MinitxError::txn_not_active(tid));
        }

        let response = self.engine.commit(&txn);
        let txn = self.transactions.get_mut(&tid).expect("looked up above");

        if response.allowed {
            txn.set_status(TransactionStatus::PartiallyCommitted);
            txn.set_status(TransactionStatus::Committed);
            txn.set_status(TransactionStatus::Terminated);
            log::info!("transaction {} committed", tid);
        } else if response.waiting {
            // Blocked commit: stays active, the client retries
            log::debug!("transaction {} commit blocked: {}", tid, response.message);
        } else {
            txn.set_status(TransactionStatus::Failed);
            let failed = txn.clone();
            self.engine.abort(&failed);
            let txn = self.transactions.get_mut(&tid).expect("looked up above");
            txn.set_status(TransactionStatus::Aborted);
            txn.set_status(TransactionStatus::Terminated);
            log::info!("transaction {} failed to commit: {}", tid, response.message);
        }
        Ok(response)
    }

    /// Abort a transaction through the failure ladder
    pub fn abort_transaction(&mut self, tid: Tid) -> Result<CcResponse> {
        let txn = self
            .transactions
            .get_mut(&tid)
            .ok_or_else(|| MinitxError::txn_not_found(tid))?;
        txn.set_status(TransactionStatus::Failed);
        let snapshot = txn.clone();

        let response = self.engine.abort(&snapshot);

        let txn = self.transactions.get_mut(&tid).expect("looked up above");
        txn.set_status(TransactionStatus::Aborted);
        txn.set_status(TransactionStatus::Terminated);
        log::info!("transaction {} aborted", tid);
        Ok(response)
    }

    /// Swap the strategy. Refused while any transaction is live.
    pub fn set_algorithm(&mut self, algorithm: AlgorithmKind) -> Result<()> {
        if algorithm == self.algorithm {
            return Ok(());
        }
        let active = self.active_transactions();
        if !active.is_empty() {
            return Err(MinitxError::Transaction(format!(
                "Cannot change algorithm while transactions are active: {:?}",
                active
            )));
        }
        log::info!("switching concurrency control algorithm to {}", algorithm);
        self.algorithm = algorithm;
        self.engine = CcEngine::new(algorithm, self.lock_timeout, self.max_versions);
        Ok(())
    }

    /// Drop terminated transactions from the table
    pub fn clear_completed(&mut self) {
        self.transactions
            .retain(|_, t| t.status != TransactionStatus::Terminated);
    }
}
