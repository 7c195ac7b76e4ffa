//! Per-transaction staging buffer
//!
//! Writes are not applied to storage until COMMIT. Each open transaction
//! owns an ordered list of staged operations (replayed against storage as
//! a batch at commit) plus a per-table secondary view used to answer
//! this-transaction-only reads. Staged rows are visible to the owning
//! transaction, invisible to everyone else, and discarded in one step on
//! abort.

use std::collections::HashMap;

use crate::cc::Tid;
use crate::types::{Condition, RowData};

/// Kind of a staged operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferedOpKind {
    Insert,
    Update,
    Delete,
}

/// One staged write, in the order the transaction issued it
#[derive(Debug, Clone)]
pub struct BufferedOp {
    pub kind: BufferedOpKind,
    pub table: String,
    /// The row being inserted, the new row of an update, or the row being
    /// deleted
    pub data: RowData,
    /// Conditions of the originating UPDATE/DELETE statement
    pub conditions: Vec<Condition>,
    /// The pre-image of an update
    pub old_data: Option<RowData>,
}

/// Buffers write operations per transaction until COMMIT
#[derive(Debug, Default)]
pub struct TransactionBuffer {
    /// tid -> ordered staged operations
    ops: HashMap<Tid, Vec<BufferedOp>>,
    /// tid -> table -> rows as this transaction would see them
    staged_rows: HashMap<Tid, HashMap<String, Vec<RowData>>>,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty buffer for a transaction
    pub fn start(&mut self, tid: Tid) {
        self.ops.entry(tid).or_default();
        self.staged_rows.entry(tid).or_default();
        log::debug!("started buffer for transaction {}", tid);
    }

    fn ensure(&mut self, tid: Tid) {
        if !self.ops.contains_key(&tid) {
            self.start(tid);
        }
    }

    /// Stage an INSERT
    pub fn buffer_insert(&mut self, tid: Tid, table: &str, row: RowData) {
        self.ensure(tid);
        self.ops.get_mut(&tid).expect("buffer started").push(BufferedOp {
            kind: BufferedOpKind::Insert,
            table: table.to_string(),
            data: row.clone(),
            conditions: Vec::new(),
            old_data: None,
        });
        self.staged_rows
            .get_mut(&tid)
            .expect("buffer started")
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Stage an UPDATE of `old` into `new`
    pub fn buffer_update(
        &mut self,
        tid: Tid,
        table: &str,
        old: RowData,
        new: RowData,
        conditions: Vec<Condition>,
    ) {
        self.ensure(tid);
        self.ops.get_mut(&tid).expect("buffer started").push(BufferedOp {
            kind: BufferedOpKind::Update,
            table: table.to_string(),
            data: new.clone(),
            conditions,
            old_data: Some(old.clone()),
        });
        if let Some(rows) = self
            .staged_rows
            .get_mut(&tid)
            .expect("buffer started")
            .get_mut(table)
        {
            for row in rows.iter_mut() {
                if *row == old {
                    *row = new.clone();
                }
            }
        }
    }

    /// Stage a DELETE of `row`
    pub fn buffer_delete(&mut self, tid: Tid, table: &str, row: RowData, conditions: Vec<Condition>) {
        self.ensure(tid);
        self.ops.get_mut(&tid).expect("buffer started").push(BufferedOp {
            kind: BufferedOpKind::Delete,
            table: table.to_string(),
            data: row.clone(),
            conditions,
            old_data: None,
        });
        if let Some(rows) = self
            .staged_rows
            .get_mut(&tid)
            .expect("buffer started")
            .get_mut(table)
        {
            rows.retain(|r| *r != row);
        }
    }

    /// The ordered staged operations of a transaction
    pub fn ops(&self, tid: Tid) -> &[BufferedOp] {
        self.ops.get(&tid).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Rows a transaction has staged for a table (inserts surviving later
    /// staged updates and deletes)
    pub fn staged_rows(&self, tid: Tid, table: &str) -> &[RowData] {
        self.staged_rows
            .get(&tid)
            .and_then(|tables| tables.get(table))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Overlay a transaction's staged writes onto rows just read from
    /// storage, yielding the transaction's private view of the table:
    /// staged inserts are appended, staged updates replace rows matched by
    /// full old-row equality, staged deletes remove their rows.
    pub fn overlay(&self, tid: Tid, table: &str, base: Vec<RowData>) -> Vec<RowData> {
        let ops = match self.ops.get(&tid) {
            Some(ops) => ops,
            None => return base,
        };

        let mut view = base;
        for op in ops.iter().filter(|op| op.table == table) {
            match op.kind {
                BufferedOpKind::Insert => view.push(op.data.clone()),
                BufferedOpKind::Update => {
                    let old = op.old_data.as_ref().expect("update carries pre-image");
                    for row in view.iter_mut() {
                        if row == old {
                            *row = op.data.clone();
                        }
                    }
                }
                BufferedOpKind::Delete => view.retain(|row| *row != op.data),
            }
        }
        view
    }

    /// Whether a transaction has any staged writes
    pub fn is_empty(&self, tid: Tid) -> bool {
        self.ops.get(&tid).map(|v| v.is_empty()).unwrap_or(true)
    }

    /// Discard both structures for a transaction in one step. Invoked on
    /// every terminal transition (commit after flush, abort, recovery undo).
    pub fn clear(&mut self, tid: Tid) {
        self.ops.remove(&tid);
        self.staged_rows.remove(&tid);
        log::debug!("cleared buffer for transaction {}", tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn row(pairs: &[(&str, i64)]) -> RowData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Integer(*v)))
            .collect()
    }

    #[test]
    fn test_insert_then_overlay_appends() {
        let mut buffer = TransactionBuffer::new();
        buffer.start(1);
        buffer.buffer_insert(1, "t", row(&[("id", 1)]));

        let view = buffer.overlay(1, "t", vec![row(&[("id", 9)])]);
        assert_eq!(view.len(), 2);
        assert_eq!(view[1], row(&[("id", 1)]));
    }

    #[test]
    fn test_update_replaces_matching_base_row() {
        let mut buffer = TransactionBuffer::new();
        buffer.start(1);
        buffer.buffer_update(1, "t", row(&[("id", 9)]), row(&[("id", 10)]), vec![]);

        let view = buffer.overlay(1, "t", vec![row(&[("id", 9)]), row(&[("id", 2)])]);
        assert_eq!(view, vec![row(&[("id", 10)]), row(&[("id", 2)])]);
    }

    #[test]
    fn test_delete_removes_row_from_view() {
        let mut buffer = TransactionBuffer::new();
        buffer.start(1);
        buffer.buffer_delete(1, "t", row(&[("id", 9)]), vec![]);

        let view = buffer.overlay(1, "t", vec![row(&[("id", 9)]), row(&[("id", 2)])]);
        assert_eq!(view, vec![row(&[("id", 2)])]);
    }

    #[test]
    fn test_staged_insert_then_update_then_delete() {
        let mut buffer = TransactionBuffer::new();
        buffer.start(1);
        buffer.buffer_insert(1, "t", row(&[("id", 1)]));
        buffer.buffer_update(1, "t", row(&[("id", 1)]), row(&[("id", 2)]), vec![]);
        assert_eq!(buffer.staged_rows(1, "t"), &[row(&[("id", 2)])]);

        buffer.buffer_delete(1, "t", row(&[("id", 2)]), vec![]);
        assert!(buffer.staged_rows(1, "t").is_empty());

        // The op list keeps all three in order for commit replay
        assert_eq!(buffer.ops(1).len(), 3);
        let view = buffer.overlay(1, "t", vec![]);
        assert!(view.is_empty());
    }

    #[test]
    fn test_buffers_are_isolated_per_transaction() {
        let mut buffer = TransactionBuffer::new();
        buffer.start(1);
        buffer.start(2);
        buffer.buffer_insert(1, "t", row(&[("id", 1)]));

        // Another transaction's view is unaffected
        assert!(buffer.overlay(2, "t", vec![]).is_empty());
        assert!(buffer.staged_rows(2, "t").is_empty());
    }

    #[test]
    fn test_clear_discards_everything() {
        let mut buffer = TransactionBuffer::new();
        buffer.start(1);
        buffer.buffer_insert(1, "t", row(&[("id", 1)]));
        buffer.clear(1);

        assert!(buffer.ops(1).is_empty());
        assert!(buffer.staged_rows(1, "t").is_empty());
        assert!(buffer.is_empty(1));
    }
}
