//! Multi-version concurrency control
//!
//! Three strategies over one shared version store: MVTO (timestamp reads
//! and writes with cascading rollback), MV2PL (locks for updaters with
//! wound-wait prevention and an operation queue), and snapshot isolation
//! with first-committer-wins or first-updater-wins commit policies.

pub mod mv2pl;
pub mod mvto;
pub mod snapshot;
pub mod version;

pub use version::{RowVersion, VersionStore, UNCOMMITTED_TS};

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::types::{Row, RowData};

use super::{ActionKind, CcResponse, ConcurrencyControl, Tid, Timestamp, Transaction};

/// The multi-version sub-variant in use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MvccVariant {
    Mvto,
    Mv2pl,
    SnapshotFcw,
    SnapshotFuw,
}

impl fmt::Display for MvccVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MvccVariant::Mvto => write!(f, "MVTO"),
            MvccVariant::Mv2pl => write!(f, "MV2PL"),
            MvccVariant::SnapshotFcw => write!(f, "SI-FCW"),
            MvccVariant::SnapshotFuw => write!(f, "SI-FUW"),
        }
    }
}

/// Whether a transaction intends to write (declared by the coordinator)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    Update,
    ReadOnly,
}

/// Engine-internal transaction state. Distinct from the CC manager's
/// transaction status: MVTO re-activates rolled-back transactions for
/// replay without the manager's lifecycle regressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// Lock kind for MV2PL updaters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MvLockKind {
    Shared,
    Exclusive,
}

/// Per-transaction bookkeeping shared by the variants
#[derive(Debug)]
pub(crate) struct TxnInfo {
    pub ts: Timestamp,
    pub kind: TxnKind,
    pub state: TxnState,
    pub read_set: HashSet<String>,
    pub write_set: HashSet<String>,
    /// Objects the coordinator has declared this transaction will write
    /// (MV2PL lock decisions)
    pub write_intents: HashSet<String>,
    /// Write timestamp of the version each read observed (cascading
    /// rollback under MVTO)
    pub read_versions: HashMap<String, Timestamp>,
    pub locks_held: HashMap<String, MvLockKind>,
    /// Per-object exclusive reservations (SI first-updater-wins)
    pub reservations: HashSet<String>,
    /// Writes buffered until commit (snapshot isolation)
    pub buffered_writes: HashMap<String, RowData>,
    pub rollback_count: u32,
    /// Objects whose lock was granted while draining the queue
    pub locks_from_queue: HashSet<String>,
}

impl TxnInfo {
    fn new(ts: Timestamp) -> Self {
        Self {
            ts,
            kind: TxnKind::Update,
            state: TxnState::Active,
            read_set: HashSet::new(),
            write_set: HashSet::new(),
            write_intents: HashSet::new(),
            read_versions: HashMap::new(),
            locks_held: HashMap::new(),
            reservations: HashSet::new(),
            buffered_writes: HashMap::new(),
            rollback_count: 0,
            locks_from_queue: HashSet::new(),
        }
    }
}

/// A blocked operation parked until locks free up (MV2PL). The queue is
/// drained in FIFO order when a transaction releases its locks; it is not
/// a thread-parking primitive.
#[derive(Debug, Clone)]
pub(crate) enum QueuedOp {
    Read { tid: Tid, object_id: String },
    Write { tid: Tid, object_id: String, data: RowData },
    Commit { tid: Tid },
}

impl QueuedOp {
    pub(crate) fn tid(&self) -> Tid {
        match self {
            QueuedOp::Read { tid, .. } | QueuedOp::Write { tid, .. } | QueuedOp::Commit { tid } => {
                *tid
            }
        }
    }

    fn label(&self) -> String {
        match self {
            QueuedOp::Read { tid, object_id } => format!("R{}({})", tid, object_id),
            QueuedOp::Write { tid, object_id, .. } => format!("W{}({})", tid, object_id),
            QueuedOp::Commit { tid } => format!("C{}", tid),
        }
    }
}

/// The multi-version engine
pub struct MvccEngine {
    variant: MvccVariant,
    pub(crate) store: VersionStore,
    pub(crate) txns: HashMap<Tid, TxnInfo>,
    /// Global commit-timestamp counter (MV2PL and SI), strictly monotone
    pub(crate) ts_counter: Timestamp,
    /// Operation counter feeding MVTO timestamp reassignment
    pub(crate) operation_count: u64,
    pub(crate) queue: Vec<QueuedOp>,
    pub(crate) blocked: HashSet<Tid>,
}

impl MvccEngine {
    pub fn new(variant: MvccVariant, max_versions: usize) -> Self {
        Self {
            variant,
            store: VersionStore::new(max_versions),
            txns: HashMap::new(),
            ts_counter: 0,
            operation_count: 0,
            queue: Vec::new(),
            blocked: HashSet::new(),
        }
    }

    pub fn variant(&self) -> MvccVariant {
        self.variant
    }

    /// Register a transaction with the engine. Under MVTO the timestamp
    /// is the tid; under the counter-based variants it is the current
    /// global counter.
    pub fn begin(&mut self, tid: Tid) {
        if self.txns.contains_key(&tid) {
            return;
        }
        let ts = match self.variant {
            MvccVariant::Mvto => tid,
            _ => self.ts_counter,
        };
        self.txns.insert(tid, TxnInfo::new(ts));
        log::debug!(
            "mvcc/{}: transaction {} started with ts {}",
            self.variant,
            tid,
            ts
        );
    }

    /// Classify a transaction as read-only (MV2PL takes no locks for it)
    pub fn set_read_only(&mut self, tid: Tid) {
        self.begin(tid);
        if let Some(info) = self.txns.get_mut(&tid) {
            info.kind = TxnKind::ReadOnly;
        }
    }

    /// Declare a write intent so an MV2PL read of the object takes a
    /// shared lock rather than the lock-free committed-read path
    pub fn declare_write_intent(&mut self, tid: Tid, object_id: &str) {
        self.begin(tid);
        if let Some(info) = self.txns.get_mut(&tid) {
            info.write_intents.insert(object_id.to_string());
        }
    }

    /// The version chain of an object (test and diagnostic hook)
    pub fn versions(&self, object_id: &str) -> &[RowVersion] {
        self.store.chain(object_id)
    }

    /// Engine-internal state of a transaction (test hook)
    pub fn txn_state(&self, tid: Tid) -> Option<TxnState> {
        self.txns.get(&tid).map(|info| info.state)
    }

    /// The engine timestamp of a transaction (test hook)
    pub fn txn_ts(&self, tid: Tid) -> Option<Timestamp> {
        self.txns.get(&tid).map(|info| info.ts)
    }

    pub(crate) fn queue_string(&self) -> String {
        if self.queue.is_empty() {
            return String::new();
        }
        let labels: Vec<String> = self.queue.iter().map(|op| op.label()).collect();
        format!("Q = [{}]", labels.join(", "))
    }
}

impl ConcurrencyControl for MvccEngine {
    fn check_permission(&mut self, txn: &Transaction, row: &Row, action: ActionKind) -> CcResponse {
        let tid = txn.tid;
        self.begin(tid);
        self.operation_count += 1;

        match self.txns.get(&tid).map(|info| info.state) {
            Some(TxnState::Aborted) => {
                return CcResponse::deny(format!(
                    "Transaction {} aborted: must restart before further statements",
                    tid
                ));
            }
            Some(TxnState::Committed) => {
                return CcResponse::deny(format!("Transaction {} already committed", tid));
            }
            _ => {}
        }

        match (action, self.variant) {
            (ActionKind::Read, MvccVariant::Mvto) => self.read_mvto(tid, row),
            (ActionKind::Read, MvccVariant::Mv2pl) => self.read_mv2pl(tid, row),
            (ActionKind::Read, _) => self.read_snapshot(tid, row),
            (ActionKind::Write, MvccVariant::Mvto) => self.validate_write_mvto(tid, row),
            (ActionKind::Write, MvccVariant::Mv2pl) => self.write_mv2pl(tid, row),
            (ActionKind::Write, _) => self.write_snapshot(tid, row),
        }
    }

    fn commit(&mut self, txn: &Transaction) -> CcResponse {
        let tid = txn.tid;
        let state = match self.txns.get(&tid) {
            Some(info) => info.state,
            None => return CcResponse::deny(format!("Transaction {} not found", tid)),
        };
        match state {
            TxnState::Aborted => {
                return CcResponse::deny(format!("Transaction {} already aborted", tid))
            }
            TxnState::Committed => {
                // A queued MV2PL commit may have executed during a drain
                return CcResponse::allow(format!("Transaction {} already committed", tid));
            }
            TxnState::Active => {}
        }

        let response = match self.variant {
            MvccVariant::Mvto => {
                CcResponse::allow(format!("Transaction {} committed (MVTO)", tid))
            }
            MvccVariant::Mv2pl => self.commit_mv2pl(tid),
            _ => self.commit_snapshot(tid),
        };

        if let Some(info) = self.txns.get_mut(&tid) {
            if response.allowed {
                info.state = TxnState::Committed;
            } else if !response.waiting {
                info.state = TxnState::Aborted;
            }
        }
        response
    }

    fn abort(&mut self, txn: &Transaction) -> CcResponse {
        let tid = txn.tid;
        if !self.txns.contains_key(&tid) {
            return CcResponse::allow(format!("Transaction {} not found", tid));
        }

        {
            let info = self.txns.get_mut(&tid).expect("checked above");
            info.rollback_count += 1;
            info.state = TxnState::Aborted;
            info.read_set.clear();
            info.write_set.clear();
            info.write_intents.clear();
            info.read_versions.clear();
            info.buffered_writes.clear();
            info.reservations.clear();
            info.locks_from_queue.clear();
        }

        if self.variant == MvccVariant::Mv2pl {
            self.store
                .remove_everywhere(|v| v.w_ts == UNCOMMITTED_TS && v.creator == tid);
            self.queue.retain(|op| op.tid() != tid);
            self.blocked.remove(&tid);
            // Freeing the locks may unblock queued operations
            self.release_locks_and_drain(tid);
        }

        let rollbacks = self
            .txns
            .get(&tid)
            .map(|info| info.rollback_count)
            .unwrap_or_default();
        CcResponse::allow(format!(
            "Transaction {} aborted (rollback #{})",
            tid, rollbacks
        ))
    }
}
