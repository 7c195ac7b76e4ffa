//! Concurrency control
//!
//! Five interchangeable strategies behind one interface: single-version
//! two-phase locking with deadlock detection, timestamp ordering,
//! optimistic validation, and a multi-version engine with MVTO, MV2PL and
//! snapshot-isolation variants. The manager selects one strategy at
//! construction; every statement consults it through `check_permission`
//! before touching the transaction buffer or the log.

pub mod lock;
pub mod manager;
pub mod mvcc;
pub mod timestamp;
pub mod transaction;
pub mod validation;

pub use lock::LockBased;
pub use manager::CcManager;
pub use mvcc::{MvccEngine, MvccVariant};
pub use timestamp::TimestampOrdering;
pub use transaction::{Action, ActionStatus, Transaction, TransactionStatus};
pub use validation::ValidationEngine;

use std::time::Duration;

use crate::types::{Row, RowData};

/// Transaction identifier. Doubles as the logical timestamp under MVTO
/// and the wound-wait age comparison.
pub type Tid = u64;

/// Logical timestamp
pub type Timestamp = u64;

/// Type of access a statement requests on a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Read,
    Write,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Read => write!(f, "READ"),
            ActionKind::Write => write!(f, "WRITE"),
        }
    }
}

/// Which concurrency control strategy the engine runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    LockBased,
    TimestampBased,
    ValidationBased,
    Mvcc(MvccVariant),
}

impl std::fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlgorithmKind::LockBased => write!(f, "LockBased"),
            AlgorithmKind::TimestampBased => write!(f, "TimestampBased"),
            AlgorithmKind::ValidationBased => write!(f, "ValidationBased"),
            AlgorithmKind::Mvcc(variant) => write!(f, "MVCC/{}", variant),
        }
    }
}

/// Outcome of a concurrency control decision.
///
/// `allowed = false` with `waiting = true` is a blocking decision the
/// client may retry. `allowed = false` with an "aborted"/"died" token in
/// the message is a victim decision: the coordinator must tear the
/// transaction down. `cascaded` lists further transactions invalidated by
/// this decision (MVTO cascading rollback, MV2PL wounds).
#[derive(Debug, Clone)]
pub struct CcResponse {
    pub allowed: bool,
    pub message: String,
    /// A particular version's row data, for multi-version reads
    pub value: Option<RowData>,
    pub waiting: bool,
    pub cascaded: Vec<Tid>,
}

impl CcResponse {
    pub fn allow(message: impl Into<String>) -> Self {
        Self {
            allowed: true,
            message: message.into(),
            value: None,
            waiting: false,
            cascaded: Vec::new(),
        }
    }

    pub fn allow_with_value(message: impl Into<String>, value: RowData) -> Self {
        Self {
            value: Some(value),
            ..Self::allow(message)
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: message.into(),
            value: None,
            waiting: false,
            cascaded: Vec::new(),
        }
    }

    pub fn deny_waiting(message: impl Into<String>) -> Self {
        Self {
            waiting: true,
            ..Self::deny(message)
        }
    }

    pub fn with_cascaded(mut self, cascaded: Vec<Tid>) -> Self {
        self.cascaded = cascaded;
        self
    }

    /// Whether this denial means the transaction must be torn down rather
    /// than retried: the message carries an "aborted" or "died" token.
    pub fn is_fatal(&self) -> bool {
        if self.allowed {
            return false;
        }
        let lower = self.message.to_lowercase();
        lower.contains("aborted") || lower.contains("died")
    }
}

/// The capability set every concurrency control strategy implements.
///
/// Engines never write to storage and never mutate the transaction table;
/// they adjudicate access, track their own bookkeeping, and report
/// victims through the response.
pub trait ConcurrencyControl {
    /// Adjudicate one row access. Returns synchronously: allowed, blocked
    /// (`waiting`), or aborted (fatal token in the message).
    fn check_permission(&mut self, txn: &Transaction, row: &Row, action: ActionKind) -> CcResponse;

    /// Finalize visibility of the transaction's writes.
    fn commit(&mut self, txn: &Transaction) -> CcResponse;

    /// Release all engine state held for the transaction.
    fn abort(&mut self, txn: &Transaction) -> CcResponse;
}

/// The selected strategy, as a tagged union behind one handle
pub enum CcEngine {
    LockBased(LockBased),
    TimestampBased(TimestampOrdering),
    ValidationBased(ValidationEngine),
    Mvcc(MvccEngine),
}

impl CcEngine {
    pub fn new(kind: AlgorithmKind, lock_timeout: Duration, max_versions: usize) -> Self {
        match kind {
            AlgorithmKind::LockBased => CcEngine::LockBased(LockBased::new(lock_timeout)),
            AlgorithmKind::TimestampBased => CcEngine::TimestampBased(TimestampOrdering::new()),
            AlgorithmKind::ValidationBased => CcEngine::ValidationBased(ValidationEngine::new()),
            AlgorithmKind::Mvcc(variant) => CcEngine::Mvcc(MvccEngine::new(variant, max_versions)),
        }
    }

    /// The multi-version engine, when that is the selected strategy
    pub fn as_mvcc_mut(&mut self) -> Option<&mut MvccEngine> {
        match self {
            CcEngine::Mvcc(engine) => Some(engine),
            _ => None,
        }
    }
}

impl ConcurrencyControl for CcEngine {
    fn check_permission(&mut self, txn: &Transaction, row: &Row, action: ActionKind) -> CcResponse {
        match self {
            CcEngine::LockBased(e) => e.check_permission(txn, row, action),
            CcEngine::TimestampBased(e) => e.check_permission(txn, row, action),
            CcEngine::ValidationBased(e) => e.check_permission(txn, row, action),
            CcEngine::Mvcc(e) => e.check_permission(txn, row, action),
        }
    }

    fn commit(&mut self, txn: &Transaction) -> CcResponse {
        match self {
            CcEngine::LockBased(e) => e.commit(txn),
            CcEngine::TimestampBased(e) => e.commit(txn),
            CcEngine::ValidationBased(e) => e.commit(txn),
            CcEngine::Mvcc(e) => e.commit(txn),
        }
    }

    fn abort(&mut self, txn: &Transaction) -> CcResponse {
        match self {
            CcEngine::LockBased(e) => e.abort(txn),
            CcEngine::TimestampBased(e) => e.abort(txn),
            CcEngine::ValidationBased(e) => e.abort(txn),
            CcEngine::Mvcc(e) => e.abort(txn),
        }
    }
}
