//! Multi-version two-phase locking
//!
//! Read-only transactions take no locks and read the newest committed
//! version. Updaters take shared locks to read and exclusive locks to
//! write, with wound-wait deadlock prevention: an older requester (lower
//! tid) wounds younger conflicting holders, a younger requester waits.
//! Blocked operations park in a FIFO operation queue that is re-evaluated
//! whenever locks are released; commit stamps the transaction's
//! uncommitted versions with the next global commit timestamp.

use std::collections::HashSet;

use crate::types::{Row, RowData};

use super::version::{RowVersion, UNCOMMITTED_TS};
use super::{CcResponse, MvLockKind, MvccEngine, QueuedOp, Tid, TxnKind, TxnState};

impl MvccEngine {
    pub(crate) fn read_mv2pl(&mut self, tid: Tid, row: &Row) -> CcResponse {
        let object_id = &row.object_id;
        self.store.ensure_seeded(object_id, row.data.clone());

        let info = self.txns.get(&tid).expect("transaction begun");
        let lock_free = info.kind == TxnKind::ReadOnly || !info.write_intents.contains(object_id);

        if lock_free {
            // Newest committed version as of the current counter
            let chain = self.store.chain(object_id);
            let selected = chain
                .iter()
                .rev()
                .find(|v| v.committed && v.commit_ts.map_or(false, |c| c <= self.ts_counter))
                .unwrap_or(&chain[0]);
            let data = selected.data.clone();

            let info = self.txns.get_mut(&tid).expect("transaction begun");
            info.read_set.insert(object_id.clone());
            return CcResponse::allow_with_value(
                format!("T{} reads {} (read-only)", tid, object_id),
                data,
            );
        }

        let (acquired, wounded) = self.acquire_mv_lock(tid, object_id, MvLockKind::Shared);
        if !acquired {
            self.queue.push(QueuedOp::Read {
                tid,
                object_id: object_id.clone(),
            });
            return CcResponse::deny_waiting(format!(
                "T{} blocked waiting for lock-S({}) {}",
                tid,
                object_id,
                self.queue_string()
            ))
            .with_cascaded(wounded);
        }

        let data = self
            .store
            .chain(object_id)
            .last()
            .expect("chains are never empty")
            .data
            .clone();
        let info = self.txns.get_mut(&tid).expect("transaction begun");
        info.read_set.insert(object_id.clone());
        let from_queue = info.locks_from_queue.remove(object_id);

        let suffix = if from_queue { " from queue" } else { "" };
        CcResponse::allow_with_value(
            format!("T{} reads {} (lock-S acquired{})", tid, object_id, suffix),
            data,
        )
        .with_cascaded(wounded)
    }

    pub(crate) fn write_mv2pl(&mut self, tid: Tid, row: &Row) -> CcResponse {
        let object_id = &row.object_id;
        self.store.ensure_seeded(object_id, RowData::new());
        self.txns
            .get_mut(&tid)
            .expect("transaction begun")
            .write_intents
            .insert(object_id.clone());

        let (acquired, wounded) = self.acquire_mv_lock(tid, object_id, MvLockKind::Exclusive);
        if !acquired {
            self.queue.push(QueuedOp::Write {
                tid,
                object_id: object_id.clone(),
                data: row.data.clone(),
            });
            return CcResponse::deny_waiting(format!(
                "T{} blocked waiting for lock-X({}) {}",
                tid,
                object_id,
                self.queue_string()
            ))
            .with_cascaded(wounded);
        }

        self.append_uncommitted(tid, object_id, row.data.clone());
        let info = self.txns.get_mut(&tid).expect("transaction begun");
        info.write_set.insert(object_id.clone());
        let from_queue = info.locks_from_queue.remove(object_id);

        let suffix = if from_queue { " from queue" } else { "" };
        CcResponse::allow(format!(
            "T{} writes {}@inf (lock-X acquired{})",
            tid, object_id, suffix
        ))
        .with_cascaded(wounded)
    }

    pub(crate) fn commit_mv2pl(&mut self, tid: Tid) -> CcResponse {
        // A transaction with parked operations cannot commit yet; its
        // commit joins the queue behind them.
        let has_pending = self
            .queue
            .iter()
            .any(|op| op.tid() == tid && !matches!(op, QueuedOp::Commit { .. }));
        if has_pending {
            if !self
                .queue
                .iter()
                .any(|op| matches!(op, QueuedOp::Commit { tid: t } if *t == tid))
            {
                self.queue.push(QueuedOp::Commit { tid });
            }
            return CcResponse::deny_waiting(format!(
                "T{} is blocked, cannot commit {}",
                tid,
                self.queue_string()
            ));
        }

        let kind = self.txns.get(&tid).expect("transaction begun").kind;
        let message = if kind == TxnKind::ReadOnly {
            format!("T{} (read-only) COMMIT", tid)
        } else {
            let commit_ts = self.ts_counter + 1;
            self.stamp_versions(tid, commit_ts);
            self.ts_counter = commit_ts;
            format!("T{} COMMIT (TS={})", tid, commit_ts)
        };

        let executed = self.release_locks_and_drain(tid);
        if executed > 0 {
            CcResponse::allow(format!("{}, processed queue {}", message, self.queue_string()))
        } else {
            CcResponse::allow(message)
        }
    }

    /// Stamp every uncommitted version this transaction wrote with its
    /// commit timestamp
    fn stamp_versions(&mut self, tid: Tid, commit_ts: u64) {
        let write_set: Vec<String> = self
            .txns
            .get_mut(&tid)
            .map(|info| {
                info.ts = commit_ts;
                info.write_set.iter().cloned().collect()
            })
            .unwrap_or_default();
        for object_id in write_set {
            if let Some(chain) = self.store.chain_mut(&object_id) {
                for version in chain.iter_mut() {
                    if version.w_ts == UNCOMMITTED_TS && version.creator == tid {
                        version.r_ts = commit_ts;
                        version.w_ts = commit_ts;
                        version.commit_ts = Some(commit_ts);
                        version.committed = true;
                    }
                }
            }
            self.store.trim(&object_id);
        }
    }

    /// Append an uncommitted version, overwriting the transaction's own
    /// trailing uncommitted version so a retried statement does not stack
    /// duplicates
    fn append_uncommitted(&mut self, tid: Tid, object_id: &str, data: RowData) {
        let chain = self.store.chain_mut(object_id).expect("seeded");
        if let Some(last) = chain.last_mut() {
            if last.w_ts == UNCOMMITTED_TS && last.creator == tid {
                last.data = data;
                return;
            }
        }
        let vid = chain.len() as u64;
        chain.push(RowVersion {
            vid,
            data,
            r_ts: UNCOMMITTED_TS,
            w_ts: UNCOMMITTED_TS,
            creator: tid,
            commit_ts: None,
            committed: false,
        });
    }

    /// Wound-wait lock acquisition. The tid is the age: an older (lower
    /// tid) requester wounds every younger conflicting holder; a younger
    /// requester waits behind any older holder. Returns whether the lock
    /// was acquired and the wounded transactions.
    fn acquire_mv_lock(
        &mut self,
        tid: Tid,
        object_id: &str,
        want: MvLockKind,
    ) -> (bool, Vec<Tid>) {
        if let Some(&held) = self.txns.get(&tid).and_then(|i| i.locks_held.get(object_id)) {
            // An exclusive lock satisfies any request; shared satisfies
            // shared. Anything else is an upgrade resolved below.
            if held == MvLockKind::Exclusive || want == MvLockKind::Shared {
                return (true, Vec::new());
            }
        }

        let conflicting: Vec<Tid> = self
            .txns
            .iter()
            .filter(|(&other, _)| other != tid)
            .filter(|(_, info)| match info.locks_held.get(object_id) {
                Some(MvLockKind::Exclusive) => true,
                Some(MvLockKind::Shared) => want == MvLockKind::Exclusive,
                None => false,
            })
            .map(|(&other, _)| other)
            .collect();

        let mut wounded = Vec::new();
        let mut must_wait = false;
        for other in conflicting {
            if tid < other {
                wounded.push(other);
            } else {
                must_wait = true;
            }
        }
        for &victim in &wounded {
            self.wound(victim);
        }

        if must_wait {
            self.blocked.insert(tid);
            return (false, wounded);
        }

        self.txns
            .get_mut(&tid)
            .expect("transaction begun")
            .locks_held
            .insert(object_id.to_string(), want);
        (true, wounded)
    }

    /// Wound a younger transaction: release its locks, purge its parked
    /// operations, drop its uncommitted versions, and mark it for
    /// restart.
    fn wound(&mut self, tid: Tid) {
        log::info!("wound-wait: transaction {} wounded, must restart", tid);
        if let Some(info) = self.txns.get_mut(&tid) {
            info.locks_held.clear();
            info.read_set.clear();
            info.write_set.clear();
            info.locks_from_queue.clear();
            info.state = TxnState::Aborted;
        }
        self.store
            .remove_everywhere(|v| v.w_ts == UNCOMMITTED_TS && v.creator == tid);
        self.queue.retain(|op| op.tid() != tid);
        self.blocked.remove(&tid);
    }

    /// Release a transaction's locks and drain the operation queue in
    /// FIFO order until no further operation can run. Returns how many
    /// parked operations executed.
    pub(crate) fn release_locks_and_drain(&mut self, tid: Tid) -> usize {
        if let Some(info) = self.txns.get_mut(&tid) {
            info.locks_held.clear();
        }

        let mut executed = 0usize;
        loop {
            let mut progress = false;
            let mut wounded_now: HashSet<Tid> = HashSet::new();
            let ops: Vec<QueuedOp> = std::mem::take(&mut self.queue);
            let mut remaining: Vec<QueuedOp> = Vec::new();

            for op in ops {
                if wounded_now.contains(&op.tid()) {
                    continue;
                }
                match op {
                    QueuedOp::Read { tid: t, object_id } => {
                        let (ok, wounded) = self.acquire_mv_lock(t, &object_id, MvLockKind::Shared);
                        wounded_now.extend(wounded);
                        if ok {
                            let info = self.txns.get_mut(&t).expect("queued txn exists");
                            info.read_set.insert(object_id.clone());
                            info.locks_from_queue.insert(object_id.clone());
                            log::debug!("queue: T{} acquired lock-S({})", t, object_id);
                            executed += 1;
                            progress = true;
                        } else {
                            remaining.push(QueuedOp::Read { tid: t, object_id });
                        }
                    }
                    QueuedOp::Write { tid: t, object_id, data } => {
                        let (ok, wounded) =
                            self.acquire_mv_lock(t, &object_id, MvLockKind::Exclusive);
                        wounded_now.extend(wounded);
                        if ok {
                            self.append_uncommitted(t, &object_id, data);
                            let info = self.txns.get_mut(&t).expect("queued txn exists");
                            info.write_set.insert(object_id.clone());
                            info.locks_from_queue.insert(object_id.clone());
                            log::debug!("queue: T{} acquired lock-X({})", t, object_id);
                            executed += 1;
                            progress = true;
                        } else {
                            remaining.push(QueuedOp::Write { tid: t, object_id, data });
                        }
                    }
                    QueuedOp::Commit { tid: t } => {
                        let still_pending = remaining
                            .iter()
                            .any(|o| o.tid() == t && !matches!(o, QueuedOp::Commit { .. }));
                        if still_pending {
                            remaining.push(QueuedOp::Commit { tid: t });
                            continue;
                        }
                        let kind = self.txns.get(&t).map(|i| i.kind).unwrap_or(TxnKind::Update);
                        if kind != TxnKind::ReadOnly {
                            let commit_ts = self.ts_counter + 1;
                            self.stamp_versions(t, commit_ts);
                            self.ts_counter = commit_ts;
                            log::debug!("queue: T{} committed (TS={})", t, commit_ts);
                        } else {
                            log::debug!("queue: T{} (read-only) committed", t);
                        }
                        if let Some(info) = self.txns.get_mut(&t) {
                            info.state = TxnState::Committed;
                            info.locks_held.clear();
                        }
                        self.blocked.remove(&t);
                        executed += 1;
                        progress = true;
                    }
                }
            }

            remaining.retain(|op| !wounded_now.contains(&op.tid()));
            self.queue = remaining;
            if !progress {
                break;
            }
        }

        // Anything no longer parked is no longer blocked
        let queue = &self.queue;
        self.blocked.retain(|t| queue.iter().any(|op| op.tid() == *t));
        executed
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ConcurrencyControl, MvccVariant, Transaction};
    use super::*;
    use crate::cc::ActionKind;
    use crate::types::Value;

    fn engine() -> MvccEngine {
        MvccEngine::new(MvccVariant::Mv2pl, 10)
    }

    fn row(object_id: &str, value: i64) -> Row {
        let mut data = RowData::new();
        data.insert("value".into(), Value::Integer(value));
        Row::new(object_id, "t", data)
    }

    #[test]
    fn test_read_only_transaction_reads_committed_without_locks() {
        let mut engine = engine();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);

        // T1 writes X and commits
        engine.declare_write_intent(1, "X");
        assert!(engine.check_permission(&t1, &row("X", 10), ActionKind::Write).allowed);
        assert!(engine.commit(&t1).allowed);

        engine.set_read_only(2);
        let response = engine.check_permission(&t2, &row("X", 0), ActionKind::Read);
        assert!(response.allowed);
        assert_eq!(
            response.value.unwrap().get("value"),
            Some(&Value::Integer(10))
        );
        assert!(engine.txns.get(&2).unwrap().locks_held.is_empty());
    }

    #[test]
    fn test_younger_writer_is_wounded() {
        let mut engine = engine();
        let t1 = Transaction::new(1);
        let t8 = Transaction::new(8);

        // T8 writes X first; the older T1 then wounds it
        assert!(engine.check_permission(&t8, &row("X", 80), ActionKind::Write).allowed);
        let response = engine.check_permission(&t1, &row("X", 10), ActionKind::Write);

        assert!(response.allowed);
        assert_eq!(response.cascaded, vec![8]);
        assert_eq!(engine.txn_state(8), Some(TxnState::Aborted));
        // T8's uncommitted version is gone; T1's is in place
        let chain = engine.versions("X");
        assert!(chain.iter().all(|v| v.creator != 8));
        assert!(chain.iter().any(|v| v.creator == 1 && v.w_ts == UNCOMMITTED_TS));
    }

    #[test]
    fn test_younger_requester_waits_in_queue() {
        let mut engine = engine();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);

        assert!(engine.check_permission(&t1, &row("X", 10), ActionKind::Write).allowed);
        let response = engine.check_permission(&t2, &row("X", 20), ActionKind::Write);

        assert!(!response.allowed);
        assert!(response.waiting);
        assert!(!response.is_fatal());
        assert_eq!(engine.queue.len(), 1);
        assert!(engine.blocked.contains(&2));
    }

    #[test]
    fn test_commit_stamps_versions_and_drains_queue() {
        let mut engine = engine();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);

        assert!(engine.check_permission(&t1, &row("X", 10), ActionKind::Write).allowed);
        assert!(!engine.check_permission(&t2, &row("X", 20), ActionKind::Write).allowed);

        let response = engine.commit(&t1);
        assert!(response.allowed);

        // T1's version is stamped with commit ts 1
        let chain = engine.versions("X");
        let stamped = chain.iter().find(|v| v.creator == 1).unwrap();
        assert_eq!(stamped.commit_ts, Some(1));
        assert_eq!(stamped.w_ts, 1);

        // T2's parked write executed during the drain
        assert!(engine.queue.is_empty());
        assert!(!engine.blocked.contains(&2));
        assert!(chain.iter().any(|v| v.creator == 2 && v.w_ts == UNCOMMITTED_TS));
    }

    #[test]
    fn test_queued_commit_executes_after_queued_write() {
        let mut engine = engine();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);

        assert!(engine.check_permission(&t1, &row("X", 10), ActionKind::Write).allowed);
        assert!(!engine.check_permission(&t2, &row("X", 20), ActionKind::Write).allowed);

        // T2's commit parks behind its blocked write
        let response = engine.commit(&t2);
        assert!(!response.allowed);
        assert!(response.waiting);

        // T1's commit frees the lock; the drain runs T2's write and then
        // its commit
        assert!(engine.commit(&t1).allowed);
        assert_eq!(engine.txn_state(2), Some(TxnState::Committed));
        let chain = engine.versions("X");
        let t2_version = chain.iter().find(|v| v.creator == 2).unwrap();
        assert_eq!(t2_version.commit_ts, Some(2));
    }

    #[test]
    fn test_retried_write_overwrites_own_uncommitted_version() {
        let mut engine = engine();
        let t1 = Transaction::new(1);

        assert!(engine.check_permission(&t1, &row("X", 10), ActionKind::Write).allowed);
        assert!(engine.check_permission(&t1, &row("X", 11), ActionKind::Write).allowed);

        let uncommitted: Vec<_> = engine
            .versions("X")
            .iter()
            .filter(|v| v.creator == 1)
            .collect();
        assert_eq!(uncommitted.len(), 1);
        assert_eq!(
            uncommitted[0].data.get("value"),
            Some(&Value::Integer(11))
        );
    }

    #[test]
    fn test_update_transaction_read_takes_shared_lock() {
        let mut engine = engine();
        let t1 = Transaction::new(1);

        engine.declare_write_intent(1, "X");
        let response = engine.check_permission(&t1, &row("X", 0), ActionKind::Read);
        assert!(response.allowed);
        assert_eq!(
            engine.txns.get(&1).unwrap().locks_held.get("X"),
            Some(&MvLockKind::Shared)
        );
    }

    #[test]
    fn test_shared_to_exclusive_upgrade_wounds_younger_reader() {
        let mut engine = engine();
        let t1 = Transaction::new(1);
        let t2 = Transaction::new(2);

        engine.declare_write_intent(1, "X");
        engine.declare_write_intent(2, "X");
        assert!(engine.check_permission(&t1, &row("X", 0), ActionKind::Read).allowed);
        assert!(engine.check_permission(&t2, &row("X", 0), ActionKind::Read).allowed);

        // T1 upgrades: T2's shared lock conflicts and T2 is younger
        let response = engine.check_permission(&t1, &row("X", 10), ActionKind::Write);
        assert!(response.allowed);
        assert_eq!(response.cascaded, vec![2]);
        assert_eq!(
            engine.txns.get(&1).unwrap().locks_held.get("X"),
            Some(&MvLockKind::Exclusive)
        );
    }
}
