//! Version chains shared by the multi-version strategies

use std::collections::HashMap;

use crate::cc::{Tid, Timestamp};
use crate::types::RowData;

/// Sentinel write timestamp of a version whose creator has not committed
pub const UNCOMMITTED_TS: Timestamp = Timestamp::MAX;

/// One version of an object. Versions of an object form a write-ordered
/// chain; an uncommitted version carries `UNCOMMITTED_TS` until its
/// creator commits, at which point all of the creator's versions receive
/// the same commit timestamp.
#[derive(Debug, Clone)]
pub struct RowVersion {
    pub vid: u64,
    pub data: RowData,
    pub r_ts: Timestamp,
    pub w_ts: Timestamp,
    pub creator: Tid,
    pub commit_ts: Option<Timestamp>,
    pub committed: bool,
}

/// The version store: one chain per object, trimmed to a bounded number
/// of committed versions.
pub struct VersionStore {
    chains: HashMap<String, Vec<RowVersion>>,
    max_versions: usize,
}

impl VersionStore {
    pub fn new(max_versions: usize) -> Self {
        Self {
            chains: HashMap::new(),
            max_versions: max_versions.max(1),
        }
    }

    /// Seed an object's chain with a committed base version holding the
    /// given data. No-op when the chain already exists.
    pub fn ensure_seeded(&mut self, object_id: &str, initial: RowData) {
        self.chains.entry(object_id.to_string()).or_insert_with(|| {
            vec![RowVersion {
                vid: 0,
                data: initial,
                r_ts: 0,
                w_ts: 0,
                creator: 0,
                commit_ts: Some(0),
                committed: true,
            }]
        });
    }

    pub fn chain(&self, object_id: &str) -> &[RowVersion] {
        self.chains
            .get(object_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn chain_mut(&mut self, object_id: &str) -> Option<&mut Vec<RowVersion>> {
        self.chains.get_mut(object_id)
    }

    /// Append a version and trim the chain
    pub fn push(&mut self, object_id: &str, version: RowVersion) {
        self.chains
            .entry(object_id.to_string())
            .or_default()
            .push(version);
        self.trim(object_id);
    }

    /// Keep at most `max_versions` committed versions per chain, dropping
    /// the oldest. Uncommitted versions are never trimmed.
    pub fn trim(&mut self, object_id: &str) {
        let max = self.max_versions;
        if let Some(chain) = self.chains.get_mut(object_id) {
            let mut committed = chain.iter().filter(|v| v.committed).count();
            while committed > max {
                if let Some(pos) = chain.iter().position(|v| v.committed) {
                    chain.remove(pos);
                    committed -= 1;
                } else {
                    break;
                }
            }
        }
    }

    /// Remove every version of an object matching the predicate
    pub fn remove_where<F: Fn(&RowVersion) -> bool>(&mut self, object_id: &str, pred: F) {
        if let Some(chain) = self.chains.get_mut(object_id) {
            chain.retain(|v| !pred(v));
        }
    }

    /// Remove matching versions across every chain
    pub fn remove_everywhere<F: Fn(&RowVersion) -> bool>(&mut self, pred: F) {
        for chain in self.chains.values_mut() {
            chain.retain(|v| !pred(v));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(vid: u64, w_ts: Timestamp, committed: bool) -> RowVersion {
        RowVersion {
            vid,
            data: RowData::new(),
            r_ts: w_ts,
            w_ts,
            creator: 1,
            commit_ts: committed.then_some(w_ts),
            committed,
        }
    }

    #[test]
    fn test_seeding_is_idempotent() {
        let mut store = VersionStore::new(10);
        store.ensure_seeded("x", RowData::new());
        store.push("x", version(1, 5, true));
        store.ensure_seeded("x", RowData::new());
        assert_eq!(store.chain("x").len(), 2);
    }

    #[test]
    fn test_trim_keeps_newest_committed() {
        let mut store = VersionStore::new(3);
        store.ensure_seeded("x", RowData::new());
        for i in 1..=5 {
            store.push("x", version(i, i, true));
        }
        let chain = store.chain("x");
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].w_ts, 3);
        assert_eq!(chain[2].w_ts, 5);
    }

    #[test]
    fn test_trim_never_drops_uncommitted() {
        let mut store = VersionStore::new(1);
        store.ensure_seeded("x", RowData::new());
        store.push("x", version(1, UNCOMMITTED_TS, false));
        store.push("x", version(2, 7, true));
        store.push("x", version(3, 8, true));

        let chain = store.chain("x");
        assert_eq!(chain.len(), 2);
        assert!(chain.iter().any(|v| !v.committed));
        assert_eq!(chain.iter().filter(|v| v.committed).count(), 1);
    }

    #[test]
    fn test_remove_where() {
        let mut store = VersionStore::new(10);
        store.ensure_seeded("x", RowData::new());
        store.push("x", version(1, 4, true));
        store.remove_where("x", |v| v.w_ts == 4);
        assert_eq!(store.chain("x").len(), 1);
    }
}
