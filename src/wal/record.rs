//! WAL record model and its undo/redo projections
//!
//! A record is self-describing: control records (`Start`, `Commit`,
//! `Abort`, `Checkpoint`) carry no payload beyond their type; data
//! records carry the table name and the old/new row images from which the
//! inverse and original storage operations are derived.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cc::Tid;
use crate::types::{CompareOp, Condition, DataDeletion, DataWrite, RowData};

/// Action carried by a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogAction {
    Start,
    Write,
    Commit,
    Abort,
    Checkpoint,
}

impl LogAction {
    /// On-disk action code
    pub fn code(self) -> u8 {
        match self {
            LogAction::Start => 0,
            LogAction::Write => 1,
            LogAction::Commit => 2,
            LogAction::Abort => 3,
            LogAction::Checkpoint => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LogAction::Start),
            1 => Some(LogAction::Write),
            2 => Some(LogAction::Commit),
            3 => Some(LogAction::Abort),
            4 => Some(LogAction::Checkpoint),
            _ => None,
        }
    }
}

/// A WAL log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Owning transaction (0 for checkpoint records)
    pub tid: Tid,
    /// The logged action
    pub action: LogAction,
    /// Wall-clock timestamp (Unix epoch millis, diagnostic only)
    pub ts: u64,
    /// Affected table; empty for control records
    pub table: String,
    /// Row image before the change (absent for inserts and controls)
    pub old_row: Option<RowData>,
    /// Row image after the change (absent for deletes and controls)
    pub new_row: Option<RowData>,
}

/// A storage operation derived from a log record, ready to apply through
/// the storage interface.
#[derive(Debug, Clone)]
pub enum StorageOp {
    Write(DataWrite),
    Delete(DataDeletion),
    Update {
        table: String,
        old_row: RowData,
        new_row: RowData,
    },
}

fn now_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

/// Conditions matching every column of a row exactly
fn full_row_conditions(row: &RowData) -> Vec<Condition> {
    row.iter()
        .map(|(column, value)| Condition::new(column.clone(), CompareOp::Eq, value.clone()))
        .collect()
}

impl LogRecord {
    fn control(tid: Tid, action: LogAction) -> Self {
        Self {
            tid,
            action,
            ts: now_millis(),
            table: String::new(),
            old_row: None,
            new_row: None,
        }
    }

    /// Transaction started
    pub fn start(tid: Tid) -> Self {
        Self::control(tid, LogAction::Start)
    }

    /// Transaction committed
    pub fn commit(tid: Tid) -> Self {
        Self::control(tid, LogAction::Commit)
    }

    /// Transaction aborted
    pub fn abort(tid: Tid) -> Self {
        Self::control(tid, LogAction::Abort)
    }

    /// Checkpoint marker; carries no payload beyond its type
    pub fn checkpoint() -> Self {
        Self::control(0, LogAction::Checkpoint)
    }

    /// A data-changing record: insert (old absent), delete (new absent),
    /// or update (both present).
    pub fn write(tid: Tid, table: &str, old_row: Option<RowData>, new_row: Option<RowData>) -> Self {
        Self {
            tid,
            action: LogAction::Write,
            ts: now_millis(),
            table: table.to_string(),
            old_row,
            new_row,
        }
    }

    /// Whether this record changes data (as opposed to marking lifecycle)
    pub fn is_data_change(&self) -> bool {
        self.action == LogAction::Write
    }

    /// The inverse storage operation: what must run to make this record
    /// never have happened.
    ///
    /// - insert (old absent, new present): delete rows matching new
    /// - delete (old present, new absent): re-insert old
    /// - update (both present): update new back to old
    pub fn undo_op(&self) -> Option<StorageOp> {
        if self.action != LogAction::Write {
            return None;
        }
        match (&self.old_row, &self.new_row) {
            (None, Some(new)) => Some(StorageOp::Delete(DataDeletion {
                table: self.table.clone(),
                conditions: full_row_conditions(new),
            })),
            (Some(old), None) => Some(StorageOp::Write(DataWrite::insert_row(
                self.table.clone(),
                old,
            ))),
            (Some(old), Some(new)) => Some(StorageOp::Update {
                table: self.table.clone(),
                old_row: new.clone(),
                new_row: old.clone(),
            }),
            (None, None) => None,
        }
    }

    /// The original storage operation this record describes.
    pub fn redo_op(&self) -> Option<StorageOp> {
        if self.action != LogAction::Write {
            return None;
        }
        match (&self.old_row, &self.new_row) {
            (None, Some(new)) => Some(StorageOp::Write(DataWrite::insert_row(
                self.table.clone(),
                new,
            ))),
            (Some(old), None) => Some(StorageOp::Delete(DataDeletion {
                table: self.table.clone(),
                conditions: full_row_conditions(old),
            })),
            (Some(old), Some(new)) => Some(StorageOp::Update {
                table: self.table.clone(),
                old_row: old.clone(),
                new_row: new.clone(),
            }),
            (None, None) => None,
        }
    }
}
