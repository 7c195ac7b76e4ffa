//! WAL buffering, checkpointing, and undo recovery
//!
//! The recovery manager owns the on-disk log plus a bounded in-memory WAL
//! buffer. Records accumulate in the buffer and reach disk when:
//!
//! - the buffer grows past `wal_size` (a checkpoint record is appended
//!   after the overflowed contents are flushed),
//! - a `Commit` record is logged (the commit record and every prior
//!   buffered record are synced to disk before the call returns), or
//! - an explicit checkpoint runs.
//!
//! Crash recovery runs once at construction, before any client work: scan
//! the log from the last checkpoint marker, collect the transactions that
//! started but neither committed nor aborted, walk their data records
//! backwards applying each record's undo form through the storage
//! interface, then append an `Abort` record per undone transaction.
//! Re-running recovery against an already-recovered log changes nothing:
//! the appended aborts move those transactions out of the undo list.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cc::Tid;
use crate::error::Result;
use crate::storage::StorageEngine;
use crate::types::{CompareOp, Condition, DataRetrieval, RowData};

use super::file::{LogFile, HEADER_LEN};
use super::record::{LogAction, LogRecord, StorageOp};

struct Inner {
    log: LogFile,
    buffer: Vec<LogRecord>,
    /// Offset recovery scans from; advanced by quiescent checkpoints
    scan_from: u64,
}

/// Singleton service owning the WAL buffer and the on-disk log
pub struct RecoveryManager {
    inner: Mutex<Inner>,
    wal_size: usize,
    checkpoint_path: PathBuf,
}

impl RecoveryManager {
    /// Open the log at the given path (the checkpoint marker lives next
    /// to it) and run crash recovery against the given storage before
    /// returning.
    pub fn open(log_path: &Path, wal_size: usize, storage: &StorageEngine) -> Result<Self> {
        let log = LogFile::open(log_path)?;
        let checkpoint_path = log_path.with_extension("checkpoint");

        let end = log.end_offset()?;
        let scan_from = Self::read_marker(&checkpoint_path).clamp(HEADER_LEN, end);

        let manager = Self {
            inner: Mutex::new(Inner {
                log,
                buffer: Vec::new(),
                scan_from,
            }),
            wal_size,
            checkpoint_path,
        };
        manager.recover(storage)?;
        Ok(manager)
    }

    fn now_millis() -> u64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(dur) => dur.as_millis() as u64,
            Err(_) => 0,
        }
    }

    /// Append a record to the WAL buffer, flushing per the policy above.
    pub fn write_log(&self, record: LogRecord) -> Result<()> {
        let mut inner = self.inner.lock().expect("wal lock poisoned");
        let is_commit = record.action == LogAction::Commit;
        inner.buffer.push(record);

        if is_commit {
            // The commit record and everything before it must be durable
            // before the commit is acknowledged.
            Self::flush_locked(&mut inner, true)?;
        } else if inner.buffer.len() > self.wal_size {
            log::debug!(
                "WAL buffer exceeded {} records, flushing to disk",
                self.wal_size
            );
            Self::flush_locked(&mut inner, false)?;
            inner.log.append(&LogRecord::checkpoint())?;
        }
        Ok(())
    }

    /// Flush the buffer to disk. On I/O failure the buffer is left intact
    /// and ready for retry.
    fn flush_locked(inner: &mut Inner, sync: bool) -> Result<()> {
        if !inner.buffer.is_empty() {
            inner.log.append_all(&inner.buffer)?;
            inner.buffer.clear();
        }
        if sync {
            inner.log.sync()?;
        }
        Ok(())
    }

    /// Force every buffered record to disk.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("wal lock poisoned");
        Self::flush_locked(&mut inner, true)
    }

    /// Number of records waiting in the in-memory buffer
    pub fn pending(&self) -> usize {
        self.inner.lock().expect("wal lock poisoned").buffer.len()
    }

    /// Every record currently on disk (oldest first)
    pub fn disk_records(&self) -> Result<Vec<LogRecord>> {
        let inner = self.inner.lock().expect("wal lock poisoned");
        Ok(inner
            .log
            .iter_records()?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }

    /// Transactions with a `Start` on record but neither `Commit` nor
    /// `Abort`, considering both the disk log (from the scan offset) and
    /// the in-memory buffer.
    fn open_tids_locked(inner: &Inner) -> Result<BTreeSet<Tid>> {
        let mut open = BTreeSet::new();
        let disk = inner.log.records_from(inner.scan_from)?;
        for record in disk
            .iter()
            .map(|(_, r)| r)
            .chain(inner.buffer.iter())
        {
            match record.action {
                LogAction::Start => {
                    open.insert(record.tid);
                }
                LogAction::Commit | LogAction::Abort => {
                    open.remove(&record.tid);
                }
                _ => {}
            }
        }
        Ok(open)
    }

    /// Take a checkpoint: persist storage, flush the buffer, append a
    /// checkpoint record, and — when no transaction is open — declare the
    /// whole log redundant and truncate it. A failure at any step leaves
    /// the pre-checkpoint state.
    pub fn checkpoint(&self, storage: &StorageEngine) -> Result<()> {
        let mut inner = self.inner.lock().expect("wal lock poisoned");
        // Log before data: every buffered record reaches disk before the
        // table files do
        Self::flush_locked(&mut inner, true)?;
        storage.flush_all()?;
        let open = Self::open_tids_locked(&inner)?;

        inner.log.append(&LogRecord::checkpoint())?;
        inner.log.sync()?;

        if open.is_empty() {
            inner.log.truncate_after(HEADER_LEN)?;
            inner.scan_from = HEADER_LEN;
            log::info!("checkpoint complete, log truncated");
        } else {
            log::info!(
                "checkpoint complete with {} open transaction(s)",
                open.len()
            );
        }
        self.write_marker(inner.scan_from, &open)?;
        Ok(())
    }

    fn write_marker(&self, offset: u64, open: &BTreeSet<Tid>) -> Result<()> {
        let marker = serde_json::json!({
            "offset": offset,
            "open_transactions": open.iter().collect::<Vec<_>>(),
            "timestamp": Self::now_millis(),
        });
        fs::write(&self.checkpoint_path, serde_json::to_string_pretty(&marker)?)?;
        Ok(())
    }

    /// Read the checkpoint marker's scan offset, defaulting to the start
    /// of the log when the marker is missing or unreadable.
    fn read_marker(path: &Path) -> u64 {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return HEADER_LEN,
        };
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(json) => json
                .get("offset")
                .and_then(|v| v.as_u64())
                .unwrap_or(HEADER_LEN),
            Err(e) => {
                log::warn!("failed to parse checkpoint marker: {}", e);
                HEADER_LEN
            }
        }
    }

    /// Crash recovery (runs once at construction).
    fn recover(&self, storage: &StorageEngine) -> Result<()> {
        let mut inner = self.inner.lock().expect("wal lock poisoned");
        let records = inner.log.records_from(inner.scan_from)?;
        if records.is_empty() {
            return Ok(());
        }
        log::info!("starting recovery from WAL ({} records)", records.len());

        let mut undo_list = BTreeSet::new();
        for (_, record) in &records {
            match record.action {
                LogAction::Start => {
                    undo_list.insert(record.tid);
                }
                LogAction::Commit | LogAction::Abort => {
                    undo_list.remove(&record.tid);
                }
                _ => {}
            }
        }

        if undo_list.is_empty() {
            log::info!("recovery complete, nothing to undo");
            return Ok(());
        }

        for (_, record) in records.iter().rev() {
            if !undo_list.contains(&record.tid) {
                continue;
            }
            if let Some(op) = record.undo_op() {
                Self::apply_op(storage, &op)?;
            }
        }

        for tid in &undo_list {
            log::info!("undoing incomplete transaction {}", tid);
            inner.log.append(&LogRecord::abort(*tid))?;
        }
        inner.log.sync()?;
        storage.flush_all()?;

        log::info!(
            "recovery complete, rolled back {} transaction(s)",
            undo_list.len()
        );
        Ok(())
    }

    /// Runtime rollback: the crash-recovery procedure restricted to one
    /// transaction, over both the disk log and the in-memory buffer.
    /// Appends the transaction's `Abort` record and forces a flush.
    pub fn recover_transaction(&self, tid: Tid, storage: &StorageEngine) -> Result<()> {
        let mut inner = self.inner.lock().expect("wal lock poisoned");

        let disk = inner.log.records_from(inner.scan_from)?;
        let sequence: Vec<LogRecord> = disk
            .into_iter()
            .map(|(_, r)| r)
            .chain(inner.buffer.iter().cloned())
            .filter(|r| r.tid == tid)
            .collect();

        for record in sequence.iter().rev() {
            if let Some(op) = record.undo_op() {
                Self::apply_op(storage, &op)?;
            }
        }

        inner.buffer.push(LogRecord::abort(tid));
        Self::flush_locked(&mut inner, true)?;
        log::info!("rolled back transaction {}", tid);
        Ok(())
    }

    /// Apply a derived storage operation idempotently: restoring a row
    /// that is already present, or removing one that is already gone, is
    /// a no-op. This keeps recovery safe to re-run and harmless for
    /// logged writes that never reached storage.
    fn apply_op(storage: &StorageEngine, op: &StorageOp) -> Result<()> {
        match op {
            StorageOp::Write(write) if write.is_insert() => {
                let row: RowData = write
                    .columns
                    .iter()
                    .cloned()
                    .zip(write.new_values.iter().cloned())
                    .collect();
                let conditions: Vec<Condition> = row
                    .iter()
                    .map(|(c, v)| Condition::new(c.clone(), CompareOp::Eq, v.clone()))
                    .collect();
                let existing = storage.read(&DataRetrieval {
                    table: write.table.clone(),
                    columns: Vec::new(),
                    conditions,
                })?;
                if existing.is_empty() {
                    storage.write(write)?;
                }
            }
            StorageOp::Write(write) => {
                storage.write(write)?;
            }
            StorageOp::Delete(deletion) => {
                storage.delete(deletion)?;
            }
            StorageOp::Update {
                table,
                old_row,
                new_row,
            } => {
                storage.update_matching(table, old_row, new_row)?;
            }
        }
        Ok(())
    }
}
