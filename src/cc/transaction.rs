//! Transaction and per-statement action bookkeeping

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::{ActionKind, Tid, Timestamp};

/// Status of a transaction in its lifecycle.
///
/// Transitions are strictly monotone:
/// `Active → PartiallyCommitted → Committed → Terminated`, or
/// `Active → Failed → Aborted → Terminated` (also entered from
/// `PartiallyCommitted` when the commit attempt fails).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    PartiallyCommitted,
    Failed,
    Committed,
    Aborted,
    Terminated,
}

impl TransactionStatus {
    fn can_become(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Active, PartiallyCommitted)
                | (Active, Failed)
                | (PartiallyCommitted, Committed)
                | (PartiallyCommitted, Failed)
                | (Failed, Aborted)
                | (Committed, Terminated)
                | (Aborted, Terminated)
        )
    }
}

/// Status of an action as the CC engine adjudicates it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Executed,
    Denied,
    Blocked,
}

/// One row access attempted by a transaction
#[derive(Debug, Clone)]
pub struct Action {
    pub aid: u64,
    pub tid: Tid,
    pub object_id: String,
    pub kind: ActionKind,
    pub status: ActionStatus,
    pub retry_count: u32,
    pub blocked_at: Option<Instant>,
}

impl Action {
    pub fn new(aid: u64, tid: Tid, object_id: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            aid,
            tid,
            object_id: object_id.into(),
            kind,
            status: ActionStatus::Pending,
            retry_count: 0,
            blocked_at: None,
        }
    }

    pub fn mark_executed(&mut self) {
        self.status = ActionStatus::Executed;
        self.blocked_at = None;
    }

    pub fn mark_denied(&mut self) {
        self.status = ActionStatus::Denied;
    }

    pub fn mark_blocked(&mut self) {
        self.status = ActionStatus::Blocked;
        self.blocked_at = Some(Instant::now());
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    /// How long this action has been blocked
    pub fn wait_time(&self) -> Duration {
        match (self.status, self.blocked_at) {
            (ActionStatus::Blocked, Some(at)) => at.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Whether the bounded retry budget is exhausted
    pub fn should_abort(&self, max_retry: u32) -> bool {
        self.retry_count >= max_retry
    }
}

fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

/// A transaction as the CC manager tracks it. The transaction id doubles
/// as its logical timestamp; wall-clock fields are diagnostic only.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub tid: Tid,
    pub status: TransactionStatus,
    /// Wall-clock start (Unix epoch millis, diagnostic)
    pub start_millis: u64,
    /// Wall-clock finish, stamped on the first terminal transition
    pub finish_millis: Option<u64>,
    /// Validation sequence number (stamped by the OCC engine at commit)
    pub validation_seq: Option<u64>,
    pub actions: Vec<Action>,
    /// Accumulated blocked time across this transaction's actions
    pub wait_time: Duration,
}

impl Transaction {
    pub fn new(tid: Tid) -> Self {
        Self {
            tid,
            status: TransactionStatus::Active,
            start_millis: now_millis(),
            finish_millis: None,
            validation_seq: None,
            actions: Vec::new(),
            wait_time: Duration::ZERO,
        }
    }

    /// The transaction's logical timestamp
    pub fn ts(&self) -> Timestamp {
        self.tid
    }

    /// Apply a status transition, refusing regressions. Returns whether
    /// the status changed.
    pub fn set_status(&mut self, status: TransactionStatus) -> bool {
        if self.status == status {
            return false;
        }
        if !self.status.can_become(status) {
            log::warn!(
                "transaction {}: refusing status change {:?} -> {:?}",
                self.tid,
                self.status,
                status
            );
            return false;
        }
        self.status = status;
        if matches!(
            status,
            TransactionStatus::Committed | TransactionStatus::Aborted | TransactionStatus::Terminated
        ) && self.finish_millis.is_none()
        {
            self.finish_millis = Some(now_millis());
        }
        true
    }

    /// Whether the transaction may still issue statements
    pub fn is_runnable(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::Active | TransactionStatus::PartiallyCommitted
        )
    }

    pub fn add_action(&mut self, action: Action) {
        debug_assert_eq!(action.tid, self.tid);
        self.actions.push(action);
    }

    /// Index of the most recent action for an object/kind pair, used to
    /// accumulate retry counts across repeated attempts of the same
    /// statement.
    pub fn find_action_index(&self, object_id: &str, kind: ActionKind) -> Option<usize> {
        self.actions
            .iter()
            .rposition(|a| a.object_id == object_id && a.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_starts_active() {
        let txn = Transaction::new(1);
        assert_eq!(txn.status, TransactionStatus::Active);
        assert_eq!(txn.ts(), 1);
        assert!(txn.actions.is_empty());
        assert!(txn.is_runnable());
    }

    #[test]
    fn test_commit_path_transitions() {
        let mut txn = Transaction::new(1);
        assert!(txn.set_status(TransactionStatus::PartiallyCommitted));
        assert!(txn.set_status(TransactionStatus::Committed));
        assert!(txn.finish_millis.is_some());
        assert!(txn.set_status(TransactionStatus::Terminated));
    }

    #[test]
    fn test_abort_path_transitions() {
        let mut txn = Transaction::new(1);
        assert!(txn.set_status(TransactionStatus::Failed));
        assert!(txn.set_status(TransactionStatus::Aborted));
        assert!(txn.set_status(TransactionStatus::Terminated));
    }

    #[test]
    fn test_regressions_are_refused() {
        let mut txn = Transaction::new(1);
        txn.set_status(TransactionStatus::PartiallyCommitted);
        txn.set_status(TransactionStatus::Committed);

        assert!(!txn.set_status(TransactionStatus::Active));
        assert!(!txn.set_status(TransactionStatus::Failed));
        assert_eq!(txn.status, TransactionStatus::Committed);
    }

    #[test]
    fn test_action_retry_budget() {
        let mut action = Action::new(1, 1, "users:1", ActionKind::Write);
        assert!(!action.should_abort(3));
        for _ in 0..3 {
            action.increment_retry();
        }
        assert!(action.should_abort(3));
    }

    #[test]
    fn test_action_block_and_execute() {
        let mut action = Action::new(1, 1, "users:1", ActionKind::Read);
        action.mark_blocked();
        assert_eq!(action.status, ActionStatus::Blocked);
        assert!(action.blocked_at.is_some());

        action.mark_executed();
        assert_eq!(action.status, ActionStatus::Executed);
        assert!(action.blocked_at.is_none());
        assert_eq!(action.wait_time(), Duration::ZERO);
    }
}
