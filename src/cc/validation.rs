//! Validation-based (optimistic) concurrency control
//!
//! Statements always execute during the read/write phase; conflicts are
//! found at commit by backward validation. Each committer receives a
//! monotone validation stamp and is checked against every transaction
//! validated after the committer began: an intersection between such a
//! transaction's write set and the committer's read or write set aborts
//! the committer.

use std::collections::{HashMap, HashSet};

use crate::types::Row;

use super::{ActionKind, CcResponse, ConcurrencyControl, Tid, Transaction};

/// Read/write sets of one transaction still in its read/write phase
#[derive(Debug, Default)]
struct ActiveSets {
    /// Validation-counter value when the transaction first touched an
    /// object; peers validated after this point are conflict candidates
    start_seq: u64,
    read_set: HashSet<String>,
    write_set: HashSet<String>,
}

/// Write set retained from a validated transaction
#[derive(Debug)]
struct ValidatedTxn {
    tid: Tid,
    validation_seq: u64,
    write_set: HashSet<String>,
}

/// Optimistic strategy: record sets during execution, validate at commit
#[derive(Default)]
pub struct ValidationEngine {
    active: HashMap<Tid, ActiveSets>,
    /// Validated transactions kept for backward checks against peers
    /// that overlapped them
    validated: Vec<ValidatedTxn>,
    validation_counter: u64,
}

impl ValidationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn sets_mut(&mut self, tid: Tid) -> &mut ActiveSets {
        let start_seq = self.validation_counter;
        self.active.entry(tid).or_insert_with(|| ActiveSets {
            start_seq,
            ..ActiveSets::default()
        })
    }

    /// Drop validated history no active transaction can conflict with
    fn prune_validated(&mut self) {
        match self.active.values().map(|s| s.start_seq).min() {
            Some(oldest) => self.validated.retain(|v| v.validation_seq > oldest),
            None => self.validated.clear(),
        }
    }

    /// The recorded read set of a transaction (test hook)
    pub fn read_set(&self, tid: Tid) -> Option<&HashSet<String>> {
        self.active.get(&tid).map(|s| &s.read_set)
    }

    /// The recorded write set of a transaction (test hook)
    pub fn write_set(&self, tid: Tid) -> Option<&HashSet<String>> {
        self.active.get(&tid).map(|s| &s.write_set)
    }
}

impl ConcurrencyControl for ValidationEngine {
    fn check_permission(&mut self, txn: &Transaction, row: &Row, action: ActionKind) -> CcResponse {
        let tid = txn.tid;
        let sets = self.sets_mut(tid);
        match action {
            ActionKind::Read => {
                sets.read_set.insert(row.object_id.clone());
                CcResponse::allow(format!(
                    "Transaction {} reads {} (optimistic)",
                    tid, row.object_id
                ))
            }
            ActionKind::Write => {
                // A write implies having observed the object
                sets.read_set.insert(row.object_id.clone());
                sets.write_set.insert(row.object_id.clone());
                CcResponse::allow(format!(
                    "Transaction {} writes {} (optimistic)",
                    tid, row.object_id
                ))
            }
        }
    }

    fn commit(&mut self, txn: &Transaction) -> CcResponse {
        let tid = txn.tid;
        let sets = match self.active.remove(&tid) {
            Some(sets) => sets,
            // A transaction that touched nothing validates trivially
            None => {
                return CcResponse::allow(format!(
                    "Transaction {} validated (empty sets) and committed",
                    tid
                ))
            }
        };

        // Backward validation: peers validated after this transaction
        // began must not have written anything it read or wrote.
        let conflict = self
            .validated
            .iter()
            .filter(|peer| peer.validation_seq > sets.start_seq)
            .find(|peer| {
                !peer.write_set.is_disjoint(&sets.read_set)
                    || !peer.write_set.is_disjoint(&sets.write_set)
            })
            .map(|peer| peer.tid);

        if let Some(conflicting) = conflict {
            log::info!(
                "validation failed for transaction {} against {}",
                tid,
                conflicting
            );
            self.prune_validated();
            return CcResponse::deny(format!(
                "Transaction {} aborted: validation failed against transaction {}",
                tid, conflicting
            ));
        }

        self.validation_counter += 1;
        let seq = self.validation_counter;
        self.validated.push(ValidatedTxn {
            tid,
            validation_seq: seq,
            write_set: sets.write_set,
        });
        self.prune_validated();
        CcResponse::allow(format!(
            "Transaction {} validated (seq {}) and committed",
            tid, seq
        ))
    }

    fn abort(&mut self, txn: &Transaction) -> CcResponse {
        self.active.remove(&txn.tid);
        self.prune_validated();
        CcResponse::allow(format!("Transaction {} aborted, sets cleared", txn.tid))
    }
}
