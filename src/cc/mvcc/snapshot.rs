//! Snapshot isolation
//!
//! Every transaction reads the newest version committed no later than its
//! start; writes buffer in the transaction until commit. Two commit-time
//! policies: first-committer-wins aborts a committer whose write set was
//! overwritten by a commit after its snapshot, first-updater-wins takes a
//! per-object exclusive reservation at write time and aborts the second
//! reserver immediately.

use crate::types::{Row, RowData};

use super::version::RowVersion;
use super::{CcResponse, MvccEngine, MvccVariant, Tid, TxnState};

impl MvccEngine {
    pub(crate) fn read_snapshot(&mut self, tid: Tid, row: &Row) -> CcResponse {
        let object_id = &row.object_id;
        self.store.ensure_seeded(object_id, row.data.clone());
        let ts = self.txns.get(&tid).expect("transaction begun").ts;

        let chain = self.store.chain(object_id);
        let selected = chain
            .iter()
            .rev()
            .find(|v| v.commit_ts.map_or(false, |c| c <= ts))
            .unwrap_or(&chain[0]);
        let data = selected.data.clone();

        let info = self.txns.get_mut(&tid).expect("transaction begun");
        info.read_set.insert(object_id.clone());
        CcResponse::allow_with_value(format!("T{} reads {} (snapshot)", tid, object_id), data)
    }

    pub(crate) fn write_snapshot(&mut self, tid: Tid, row: &Row) -> CcResponse {
        let object_id = &row.object_id;
        self.store.ensure_seeded(object_id, RowData::new());

        if self.variant() == MvccVariant::SnapshotFuw {
            // First-updater-wins: a live reservation by anyone else kills
            // this writer immediately.
            let holder = self
                .txns
                .iter()
                .filter(|(&other, _)| other != tid)
                .find(|(_, info)| {
                    info.state == TxnState::Active && info.reservations.contains(object_id)
                })
                .map(|(&other, _)| other);
            if let Some(holder) = holder {
                let info = self.txns.get_mut(&tid).expect("transaction begun");
                info.state = TxnState::Aborted;
                log::info!(
                    "si-fuw: transaction {} lost the update race on {} to {}",
                    tid,
                    object_id,
                    holder
                );
                return CcResponse::deny(format!(
                    "T{} ABORTED: exclusive reservation on {} held by T{}",
                    tid, object_id, holder
                ));
            }
            self.txns
                .get_mut(&tid)
                .expect("transaction begun")
                .reservations
                .insert(object_id.clone());
        }

        let info = self.txns.get_mut(&tid).expect("transaction begun");
        info.write_set.insert(object_id.clone());
        info.buffered_writes.insert(object_id.clone(), row.data.clone());
        CcResponse::allow(format!("T{} writes {} (buffered)", tid, object_id))
    }

    pub(crate) fn commit_snapshot(&mut self, tid: Tid) -> CcResponse {
        let (ts, write_set_empty) = {
            let info = self.txns.get(&tid).expect("transaction begun");
            (info.ts, info.write_set.is_empty())
        };
        if write_set_empty {
            return CcResponse::allow(format!("T{} COMMIT (read-only)", tid));
        }

        if self.variant() == MvccVariant::SnapshotFcw {
            // First-committer-wins: any version of a written object
            // committed after this transaction's snapshot wins.
            let write_set: Vec<String> = self
                .txns
                .get(&tid)
                .expect("transaction begun")
                .write_set
                .iter()
                .cloned()
                .collect();
            for object_id in &write_set {
                let lost = self.store.chain(object_id).iter().any(|v| {
                    v.creator != tid && v.commit_ts.map_or(false, |c| c > ts)
                });
                if lost {
                    log::info!(
                        "si-fcw: transaction {} lost the commit race on {}",
                        tid,
                        object_id
                    );
                    return CcResponse::deny(format!(
                        "T{} ABORTED: write-write conflict on {}",
                        tid, object_id
                    ));
                }
            }
        }

        self.ts_counter += 1;
        let commit_ts = self.ts_counter;
        let buffered: Vec<(String, RowData)> = {
            let info = self.txns.get_mut(&tid).expect("transaction begun");
            info.reservations.clear();
            info.buffered_writes.drain().collect()
        };
        for (object_id, data) in buffered {
            let vid = self.store.chain(&object_id).len() as u64;
            self.store.push(
                &object_id,
                RowVersion {
                    vid,
                    data,
                    r_ts: commit_ts,
                    w_ts: commit_ts,
                    creator: tid,
                    commit_ts: Some(commit_ts),
                    committed: true,
                },
            );
        }

        CcResponse::allow(format!("T{} COMMIT (ts-counter={})", tid, commit_ts))
    }
}
