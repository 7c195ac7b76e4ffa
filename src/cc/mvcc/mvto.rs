//! Multi-version timestamp ordering
//!
//! Reads select the newest version no younger than the reader and record
//! which version they observed. A write behind the head's read timestamp
//! aborts the writer: its versions are deleted, it receives a fresh
//! timestamp, and every live transaction that read one of the deleted
//! versions is aborted too, recursively, to a fixed point. A transaction
//! whose very first operation aborted is replayed in place; otherwise the
//! caller must restart it from its first statement.

use std::collections::{HashSet, VecDeque};

use crate::types::{Row, RowData};

use super::version::RowVersion;
use super::{CcResponse, MvccEngine, Tid, Timestamp, TxnState};

impl MvccEngine {
    pub(crate) fn read_mvto(&mut self, tid: Tid, row: &Row) -> CcResponse {
        let object_id = &row.object_id;
        self.store.ensure_seeded(object_id, row.data.clone());
        let ts = self.txns.get(&tid).expect("transaction begun").ts;

        let versions = self.store.chain_mut(object_id).expect("seeded above");
        // Newest version written no later than the reader
        let idx = versions.iter().rposition(|v| v.w_ts <= ts).unwrap_or(0);
        let bumped = versions[idx].r_ts < ts;
        if bumped {
            versions[idx].r_ts = ts;
        }
        let vid = versions[idx].vid;
        let observed_w_ts = versions[idx].w_ts;
        let data = versions[idx].data.clone();

        let info = self.txns.get_mut(&tid).expect("transaction begun");
        info.read_set.insert(object_id.clone());
        info.read_versions.insert(object_id.clone(), observed_w_ts);

        let message = if bumped {
            format!(
                "T{} reads {} version {}, R-TS updated to {}",
                tid, object_id, vid, ts
            )
        } else {
            format!("T{} reads {} version {}, R-TS not updated", tid, object_id, vid)
        };
        CcResponse::allow_with_value(message, data)
    }

    /// The raw MVTO write: abort on a stale write, overwrite in place at
    /// an equal timestamp, append a new version otherwise.
    fn write_mvto_raw(&mut self, tid: Tid, object_id: &str, data: &RowData) -> (bool, String) {
        let ts = self.txns.get(&tid).expect("transaction begun").ts;
        let versions = self.store.chain_mut(object_id).expect("seeded");
        let head = versions.last().expect("chains are never empty");

        if ts < head.r_ts {
            return (
                false,
                format!(
                    "T{} ABORTED: TS({}) < R-TS({}) on {}, rollback required",
                    tid, ts, head.r_ts, object_id
                ),
            );
        }

        let rollbacks = self.txns.get(&tid).expect("transaction begun").rollback_count;
        let message;
        if ts == head.w_ts {
            let head = versions.last_mut().expect("chains are never empty");
            head.data = data.clone();
            head.r_ts = ts;
            message = format!("T{} overwrites {} version {}", tid, object_id, head.vid);
        } else {
            let vid = head.vid + 1;
            versions.push(RowVersion {
                vid,
                data: data.clone(),
                r_ts: ts,
                w_ts: ts,
                creator: tid,
                commit_ts: None,
                committed: true,
            });
            message = if rollbacks > 0 {
                format!(
                    "T{} creates {} version {} (after rollback #{}, TS={})",
                    tid, object_id, vid, rollbacks, ts
                )
            } else {
                format!("T{} creates {} version {}", tid, object_id, vid)
            };
        }

        let info = self.txns.get_mut(&tid).expect("transaction begun");
        info.write_set.insert(object_id.to_string());
        (true, message)
    }

    /// Write with rollback handling. A failed write always rolls the
    /// writer back (fresh timestamp, versions deleted, dependents
    /// cascaded); if the write was the transaction's first operation it
    /// is re-executed in place, otherwise the abort is surfaced and the
    /// caller restarts the transaction from its first statement.
    pub(crate) fn validate_write_mvto(&mut self, tid: Tid, row: &Row) -> CcResponse {
        let object_id = &row.object_id;
        self.store.ensure_seeded(object_id, RowData::new());

        let (ok, message) = self.write_mvto_raw(tid, object_id, &row.data);
        if ok {
            return CcResponse::allow(message);
        }

        let abort_message = message;
        let info = self.txns.get(&tid).expect("transaction begun");
        let is_first_operation = info.read_set.is_empty() && info.write_set.is_empty();

        let (_, cascaded) = self.rollback_mvto(tid);
        log::info!(
            "mvto: rolled back transaction {} ({} cascaded)",
            tid,
            cascaded.len()
        );

        if is_first_operation {
            // Safe to replay immediately under the new timestamp
            let (ok, message) = self.write_mvto_raw(tid, object_id, &row.data);
            let response = if ok {
                CcResponse::allow(message)
            } else {
                CcResponse::deny(message)
            };
            return response.with_cascaded(cascaded);
        }

        CcResponse::deny(abort_message).with_cascaded(cascaded)
    }

    /// Roll back a transaction and cascade over its dependents until a
    /// fixed point: every live transaction that observed one of the
    /// deleted versions is rolled back the same way. Returns the victim's
    /// fresh timestamp and every cascaded tid (nested included).
    pub(crate) fn rollback_mvto(&mut self, tid: Tid) -> (Timestamp, Vec<Tid>) {
        let (new_ts, immediate) = self.rollback_mvto_single(tid);

        let mut all_cascaded: Vec<Tid> = Vec::new();
        let mut seen: HashSet<Tid> = HashSet::new();
        let mut worklist: VecDeque<Tid> = immediate.into();

        while let Some(cascaded_tid) = worklist.pop_front() {
            if !seen.insert(cascaded_tid) {
                continue;
            }
            all_cascaded.push(cascaded_tid);
            let (_, nested) = self.rollback_mvto_single(cascaded_tid);
            worklist.extend(nested);
        }

        (new_ts, all_cascaded)
    }

    /// One iteration of the cascade: delete the transaction's versions,
    /// reassign its timestamp, re-declare it active, and report the
    /// transactions that depended on a deleted version.
    fn rollback_mvto_single(&mut self, tid: Tid) -> (Timestamp, Vec<Tid>) {
        let old_ts = self.txns.get(&tid).expect("transaction begun").ts;

        // Fresh timestamp beyond every live peer
        let max_concurrent = self
            .txns
            .iter()
            .filter(|(other, _)| **other != tid)
            .map(|(_, info)| info.ts)
            .max()
            .unwrap_or(0);
        let new_ts = self.operation_count.max(max_concurrent + 1);
        self.operation_count = new_ts;

        let old_write_set = {
            let info = self.txns.get_mut(&tid).expect("transaction begun");
            info.rollback_count += 1;
            info.ts = new_ts;
            info.read_set.clear();
            info.read_versions.clear();
            info.buffered_writes.clear();
            info.locks_held.clear();
            info.state = TxnState::Active;
            std::mem::take(&mut info.write_set)
        };

        // Delete the versions written under the old timestamp
        for object_id in &old_write_set {
            self.store.remove_where(object_id, |v| v.w_ts == old_ts);
        }

        // Dependents: live transactions that read a now-deleted version
        let mut immediate = Vec::new();
        for (&other, info) in &self.txns {
            if other == tid || info.state != TxnState::Active {
                continue;
            }
            let depends = old_write_set
                .iter()
                .any(|object_id| info.read_versions.get(object_id) == Some(&old_ts));
            if depends {
                immediate.push(other);
            }
        }
        for other in &immediate {
            if let Some(info) = self.txns.get_mut(other) {
                info.state = TxnState::Aborted;
            }
        }

        (new_ts, immediate)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ConcurrencyControl, MvccVariant, Transaction};
    use super::*;
    use crate::cc::ActionKind;
    use crate::types::Value;

    fn engine() -> MvccEngine {
        MvccEngine::new(MvccVariant::Mvto, 10)
    }

    fn row(object_id: &str, value: i64) -> Row {
        let mut data = RowData::new();
        data.insert("value".into(), Value::Integer(value));
        Row::new(object_id, "t", data)
    }

    #[test]
    fn test_read_selects_newest_visible_version() {
        let mut engine = engine();
        let t2 = Transaction::new(2);
        let t5 = Transaction::new(5);

        // T2 writes A; T5 reads the version written by T2
        assert!(engine.check_permission(&t2, &row("A", 10), ActionKind::Write).allowed);
        let response = engine.check_permission(&t5, &row("A", 0), ActionKind::Read);
        assert!(response.allowed);
        assert_eq!(
            response.value.unwrap().get("value"),
            Some(&Value::Integer(10))
        );

        // The observed version's r_ts advanced to the reader
        let chain = engine.versions("A");
        assert_eq!(chain.last().unwrap().r_ts, 5);
    }

    #[test]
    fn test_older_reader_sees_older_version() {
        let mut engine = engine();
        let t1 = Transaction::new(1);
        let t3 = Transaction::new(3);

        engine.check_permission(&t1, &row("A", 0), ActionKind::Read);
        assert!(engine.check_permission(&t3, &row("A", 30), ActionKind::Write).allowed);

        // T1 still reads the base version, not T3's
        let response = engine.check_permission(&t1, &row("A", 0), ActionKind::Read);
        assert_eq!(
            response.value.unwrap().get("value"),
            Some(&Value::Integer(0))
        );
    }

    #[test]
    fn test_stale_write_rolls_back_and_replays_first_operation() {
        let mut engine = engine();
        let t1 = Transaction::new(1);
        let t5 = Transaction::new(5);

        // T5 reads A, pushing its r_ts to 5; T1's first write of A is
        // stale, so T1 is rolled back with a fresh timestamp and replayed
        engine.check_permission(&t5, &row("A", 0), ActionKind::Read);
        let response = engine.check_permission(&t1, &row("A", 10), ActionKind::Write);
        assert!(response.allowed, "first-operation write replays in place");
        assert!(engine.txn_ts(1).unwrap() > 5);
    }

    #[test]
    fn test_stale_write_mid_transaction_surfaces_abort() {
        let mut engine = engine();
        let t1 = Transaction::new(1);
        let t5 = Transaction::new(5);

        // T1 has already read B, so a failed write cannot be replayed
        engine.check_permission(&t1, &row("B", 0), ActionKind::Read);
        engine.check_permission(&t5, &row("A", 0), ActionKind::Read);
        let response = engine.check_permission(&t1, &row("A", 10), ActionKind::Write);

        assert!(!response.allowed);
        assert!(response.is_fatal());
        // Re-declared active for the restart under a fresh timestamp
        assert_eq!(engine.txn_state(1), Some(TxnState::Active));
        assert!(engine.txn_ts(1).unwrap() > 5);
    }

    #[test]
    fn test_cascading_abort_of_dependent_reader() {
        let mut engine = engine();
        let t2 = Transaction::new(2);
        let t3 = Transaction::new(3);
        let t4 = Transaction::new(4);

        // T3 writes A; T4 reads T3's version and writes B
        assert!(engine.check_permission(&t3, &row("A", 30), ActionKind::Write).allowed);
        assert!(engine.check_permission(&t4, &row("A", 0), ActionKind::Read).allowed);
        assert!(engine.check_permission(&t4, &row("B", 40), ActionKind::Write).allowed);

        // T2's stale write of A rolls back T2 alone: nobody observed a
        // version of T2, so the cascade set is empty and the first
        // operation replays in place.
        let response = engine.check_permission(&t2, &row("A", 20), ActionKind::Write);
        assert!(response.allowed);
        assert!(response.cascaded.is_empty());

        // Rolling T3 back cascades into T4, which observed T3's version
        // of A.
        let (_, cascaded) = engine.rollback_mvto(3);
        assert_eq!(cascaded, vec![4]);
        // T4's own version of B is gone with it
        assert!(engine
            .versions("B")
            .iter()
            .all(|v| v.creator != 4));
        // Both are re-declared active for replay
        assert_eq!(engine.txn_state(3), Some(TxnState::Active));
        assert_eq!(engine.txn_state(4), Some(TxnState::Active));
    }

    #[test]
    fn test_commit_is_a_no_op() {
        let mut engine = engine();
        let t1 = Transaction::new(1);
        assert!(engine.check_permission(&t1, &row("A", 10), ActionKind::Write).allowed);
        let response = engine.commit(&t1);
        assert!(response.allowed);
        assert_eq!(engine.txn_state(1), Some(TxnState::Committed));
    }
}
