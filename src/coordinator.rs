//! Statement coordinator
//!
//! Wires storage, the transaction buffer, concurrency control and the
//! write-ahead log together per statement. A write statement is
//! adjudicated row by row, staged in the buffer and logged without a
//! flush; a read statement consults the CC engine (which may hand back a
//! particular version), reads the committed baseline from storage and
//! overlays the transaction's own staged writes. COMMIT applies the
//! staged batch, makes the data durable, and forces the commit record to
//! disk before acknowledging. A statement arriving outside an open
//! transaction runs inside an invisible single-statement transaction.

use std::sync::Mutex;

use crate::buffer::{BufferedOp, BufferedOpKind, TransactionBuffer};
use crate::cc::{ActionKind, CcManager, CcResponse, Tid};
use crate::error::{MinitxError, Result};
use crate::storage::StorageEngine;
use crate::types::{
    matches_all, CompareOp, Condition, DataDeletion, DataRetrieval, DataWrite, Row, RowData,
    TableSchema, Value,
};
use crate::wal::{LogRecord, RecoveryManager};
use crate::Config;

/// One client's view of the engine: at most one open transaction
#[derive(Debug, Default)]
pub struct Session {
    pub txn_id: Option<Tid>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }
}

/// An already-elaborated statement (parsing and planning live elsewhere)
#[derive(Debug, Clone)]
pub enum Statement {
    Begin,
    Commit,
    Abort,
    CreateTable(TableSchema),
    DropTable(String),
    Select(DataRetrieval),
    Insert {
        table: String,
        row: RowData,
    },
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        conditions: Vec<Condition>,
    },
    Delete {
        table: String,
        conditions: Vec<Condition>,
    },
}

/// Outcome of a statement
#[derive(Debug)]
pub enum StatementResult {
    Rows(Vec<RowData>),
    Affected(usize),
    TransactionStarted(Tid),
    TransactionCommitted,
    TransactionAborted,
    Ok,
}

/// The engine facade: storage, WAL/recovery, concurrency control and the
/// per-transaction staging buffer behind one handle.
pub struct Database {
    storage: StorageEngine,
    recovery: RecoveryManager,
    cc: Mutex<CcManager>,
    buffer: Mutex<TransactionBuffer>,
}

impl Database {
    /// Open (or create) a database. Crash recovery runs here, before any
    /// statement is accepted.
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let storage = StorageEngine::new(config.data_dir.clone())?;
        let recovery = RecoveryManager::open(&config.log_path(), config.wal_size, &storage)?;
        let cc = CcManager::new(
            config.cc_algorithm,
            config.lock_timeout,
            config.max_versions_per_object,
            config.max_retry,
        );

        Ok(Self {
            storage,
            recovery,
            cc: Mutex::new(cc),
            buffer: Mutex::new(TransactionBuffer::new()),
        })
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.storage
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Execute one statement on behalf of a session
    pub fn execute(&self, session: &mut Session, statement: Statement) -> Result<StatementResult> {
        match statement {
            Statement::Begin => {
                if session.txn_id.is_some() {
                    return Err(MinitxError::Transaction(
                        "Transaction already in progress".into(),
                    ));
                }
                let tid = self.begin_txn()?;
                session.txn_id = Some(tid);
                Ok(StatementResult::TransactionStarted(tid))
            }
            Statement::Commit => {
                let tid = session.txn_id.ok_or_else(|| {
                    MinitxError::Transaction("No transaction in progress".into())
                })?;
                match self.commit_txn(tid) {
                    Ok(()) => {
                        session.txn_id = None;
                        Ok(StatementResult::TransactionCommitted)
                    }
                    Err(e) => {
                        // A blocked commit keeps the transaction open for
                        // retry; anything else tore it down.
                        if !self.is_runnable(tid) {
                            session.txn_id = None;
                        }
                        Err(e)
                    }
                }
            }
            Statement::Abort => {
                let tid = session.txn_id.take().ok_or_else(|| {
                    MinitxError::Transaction("No transaction in progress".into())
                })?;
                self.abort_txn(tid)?;
                Ok(StatementResult::TransactionAborted)
            }
            Statement::CreateTable(schema) => {
                self.storage.create_table(schema)?;
                Ok(StatementResult::Ok)
            }
            Statement::DropTable(name) => {
                self.storage.drop_table(&name)?;
                Ok(StatementResult::Ok)
            }
            Statement::Select(retrieval) => {
                self.with_txn(session, |tid| self.read_rows(tid, &retrieval))
                    .map(StatementResult::Rows)
            }
            Statement::Insert { table, row } => {
                self.with_txn(session, |tid| self.insert_row(tid, &table, row.clone()))
                    .map(StatementResult::Affected)
            }
            Statement::Update {
                table,
                assignments,
                conditions,
            } => self
                .with_txn(session, |tid| {
                    self.update_rows(tid, &table, &assignments, &conditions)
                })
                .map(StatementResult::Affected),
            Statement::Delete { table, conditions } => self
                .with_txn(session, |tid| self.delete_rows(tid, &table, &conditions))
                .map(StatementResult::Affected),
        }
    }

    /// Take an explicit checkpoint
    pub fn checkpoint(&self) -> Result<()> {
        self.recovery.checkpoint(&self.storage)
    }

    /// Force buffered WAL records to disk without checkpointing
    pub fn flush_wal(&self) -> Result<()> {
        self.recovery.flush()
    }

    /// Drop terminated transactions from the transaction table
    pub fn clear_completed_transactions(&self) {
        self.cc.lock().expect("cc lock poisoned").clear_completed();
    }

    /// Declare a session's open transaction read-only (MV2PL reads then
    /// take no locks)
    pub fn declare_read_only(&self, session: &Session) -> Result<()> {
        let tid = session
            .txn_id
            .ok_or_else(|| MinitxError::Transaction("No transaction in progress".into()))?;
        let mut cc = self.cc.lock().expect("cc lock poisoned");
        if let Some(mvcc) = cc.mvcc_mut() {
            mvcc.set_read_only(tid);
        }
        Ok(())
    }

    fn is_runnable(&self, tid: Tid) -> bool {
        self.cc
            .lock()
            .expect("cc lock poisoned")
            .transaction(tid)
            .map(|t| t.is_runnable())
            .unwrap_or(false)
    }

    /// Run a statement body inside the session's transaction, or inside
    /// an invisible single-statement transaction when none is open.
    fn with_txn<R>(&self, session: &mut Session, body: impl Fn(Tid) -> Result<R>) -> Result<R> {
        if let Some(tid) = session.txn_id {
            let result = body(tid);
            if let Err(e) = &result {
                match e {
                    // Hard storage or log failures take the whole
                    // transaction down; schema violations and retriable
                    // CC denials leave it open.
                    MinitxError::Io(_) | MinitxError::WalCorrupt(_) | MinitxError::Internal(_) => {
                        log::error!("transaction {} failed on storage/log: {}", tid, e);
                        if self.is_runnable(tid) {
                            if let Err(abort_err) = self.abort_txn(tid) {
                                log::error!("abort of {} failed: {}", tid, abort_err);
                            }
                        }
                        session.txn_id = None;
                    }
                    _ => {
                        // A torn-down victim no longer owns a transaction
                        if !self.is_runnable(tid) {
                            log::debug!("transaction {} torn down mid-statement: {}", tid, e);
                            session.txn_id = None;
                        }
                    }
                }
            }
            return result;
        }

        // Auto-commit mode
        let tid = self.begin_txn()?;
        match body(tid) {
            Ok(value) => {
                self.commit_txn(tid)?;
                Ok(value)
            }
            Err(e) => {
                if self.is_runnable(tid) {
                    if let Err(abort_err) = self.abort_txn(tid) {
                        log::error!("auto-commit abort of {} failed: {}", tid, abort_err);
                    }
                }
                Err(e)
            }
        }
    }

    fn begin_txn(&self) -> Result<Tid> {
        let tid = self.cc.lock().expect("cc lock poisoned").begin_transaction();
        self.buffer.lock().expect("buffer lock poisoned").start(tid);
        self.recovery.write_log(LogRecord::start(tid))?;
        Ok(tid)
    }

    /// Commit: CC decision first, then the staged batch to storage, data
    /// durable, and the commit record on disk before acknowledgement.
    fn commit_txn(&self, tid: Tid) -> Result<()> {
        let response = {
            let mut cc = self.cc.lock().expect("cc lock poisoned");
            cc.end_transaction(tid)?
        };
        if response.waiting {
            return Err(MinitxError::txn_blocked(tid, &response.message));
        }
        if !response.allowed {
            // The CC manager already walked the failure ladder
            self.teardown_cascaded(&response.cascaded);
            self.buffer.lock().expect("buffer lock poisoned").clear(tid);
            self.recovery.write_log(LogRecord::abort(tid))?;
            return Err(MinitxError::txn_aborted(tid, &response.message));
        }
        self.teardown_cascaded(&response.cascaded);

        let ops: Vec<BufferedOp> = self
            .buffer
            .lock()
            .expect("buffer lock poisoned")
            .ops(tid)
            .to_vec();

        if let Err(e) = self.apply_ops(&ops) {
            log::error!("commit of {} failed while applying the buffer: {}", tid, e);
            self.buffer.lock().expect("buffer lock poisoned").clear(tid);
            self.recovery.recover_transaction(tid, &self.storage)?;
            return Err(e);
        }

        // Log before data: the transaction's records go to disk, then the
        // table files, then the commit record that seals them.
        self.recovery.flush()?;
        self.storage.flush_all()?;
        self.recovery.write_log(LogRecord::commit(tid))?;

        self.buffer.lock().expect("buffer lock poisoned").clear(tid);
        Ok(())
    }

    fn apply_ops(&self, ops: &[BufferedOp]) -> Result<()> {
        for op in ops {
            match op.kind {
                BufferedOpKind::Insert => {
                    self.storage
                        .write(&DataWrite::insert_row(op.table.clone(), &op.data))?;
                }
                BufferedOpKind::Update => {
                    let old = op.old_data.as_ref().expect("update carries pre-image");
                    self.storage.update_matching(&op.table, old, &op.data)?;
                }
                BufferedOpKind::Delete => {
                    self.storage.delete(&DataDeletion {
                        table: op.table.clone(),
                        conditions: conditions_for_row(&op.data),
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Voluntary abort: staged writes never reached storage, so the
    /// buffer is discarded, the abort is logged, and the CC engine
    /// releases its state.
    fn abort_txn(&self, tid: Tid) -> Result<()> {
        self.buffer.lock().expect("buffer lock poisoned").clear(tid);
        self.recovery.write_log(LogRecord::abort(tid))?;
        self.cc
            .lock()
            .expect("cc lock poisoned")
            .abort_transaction(tid)?;
        Ok(())
    }

    /// Tear down a victim: CC abort, buffer discard, WAL rollback (which
    /// appends the abort record and forces a flush).
    fn teardown(&self, tid: Tid) {
        if let Err(e) = self
            .cc
            .lock()
            .expect("cc lock poisoned")
            .abort_transaction(tid)
        {
            log::debug!("teardown of {}: cc abort: {}", tid, e);
        }
        self.buffer.lock().expect("buffer lock poisoned").clear(tid);
        if let Err(e) = self.recovery.recover_transaction(tid, &self.storage) {
            log::error!("teardown of {}: wal rollback failed: {}", tid, e);
        }
    }

    fn teardown_cascaded(&self, cascaded: &[Tid]) {
        for &tid in cascaded {
            log::info!("tearing down cascaded victim {}", tid);
            self.teardown(tid);
        }
    }

    /// Interpret a CC response for the current statement: pass allowed
    /// responses through (with any version value), surface blocking as a
    /// retriable failure, and turn victim decisions into a hard failure
    /// after tearing the transaction down.
    fn handle_response(&self, tid: Tid, response: CcResponse) -> Result<Option<RowData>> {
        if response.allowed {
            self.teardown_cascaded(&response.cascaded);
            return Ok(response.value);
        }
        if response.waiting {
            return Err(MinitxError::txn_blocked(tid, &response.message));
        }
        self.teardown_cascaded(&response.cascaded);
        if response.is_fatal() {
            self.teardown(tid);
            return Err(MinitxError::txn_aborted(tid, &response.message));
        }
        Err(MinitxError::Transaction(response.message))
    }

    fn validate(&self, tid: Tid, row: &Row, action: ActionKind) -> Result<Option<RowData>> {
        let response = {
            let mut cc = self.cc.lock().expect("cc lock poisoned");
            cc.validate_object(row, tid, action)?
        };
        self.handle_response(tid, response)
    }

    fn read_rows(&self, tid: Tid, retrieval: &DataRetrieval) -> Result<Vec<RowData>> {
        let schema = self.storage.schema(&retrieval.table)?;
        let base = self.storage.read(&DataRetrieval {
            table: retrieval.table.clone(),
            columns: Vec::new(),
            conditions: retrieval.conditions.clone(),
        })?;

        let mut rows = Vec::with_capacity(base.len());
        for row_data in base {
            let object_id = schema.object_id(&row_data);
            let row = Row::new(object_id, &retrieval.table, row_data.clone());
            let version = self.validate(tid, &row, ActionKind::Read)?;
            rows.push(version.unwrap_or(row_data));
        }

        // Overlay this transaction's own staged writes
        let mut view = self
            .buffer
            .lock()
            .expect("buffer lock poisoned")
            .overlay(tid, &retrieval.table, rows);
        view.retain(|row| matches_all(&retrieval.conditions, row));

        if !retrieval.columns.is_empty() {
            for column in &retrieval.columns {
                if schema.find_column(column).is_none() {
                    return Err(MinitxError::unknown_column(&retrieval.table, column));
                }
            }
            view = view
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .filter(|(column, _)| retrieval.columns.contains(column))
                        .collect()
                })
                .collect();
        }
        Ok(view)
    }

    fn insert_row(&self, tid: Tid, table: &str, row_data: RowData) -> Result<usize> {
        let schema = self.storage.schema(table)?;
        let object_id = schema.object_id(&row_data);
        let row = Row::new(object_id, table, row_data.clone());
        self.validate(tid, &row, ActionKind::Write)?;

        self.buffer
            .lock()
            .expect("buffer lock poisoned")
            .buffer_insert(tid, table, row_data.clone());
        self.recovery
            .write_log(LogRecord::write(tid, table, None, Some(row_data)))?;
        Ok(1)
    }

    fn update_rows(
        &self,
        tid: Tid,
        table: &str,
        assignments: &[(String, Value)],
        conditions: &[Condition],
    ) -> Result<usize> {
        let schema = self.storage.schema(table)?;
        for (column, _) in assignments {
            if schema.find_column(column).is_none() {
                return Err(MinitxError::unknown_column(table, column));
            }
        }

        let matching = self.private_view(tid, table, conditions)?;
        let mut affected = 0;
        for old_row in matching {
            let mut new_row = old_row.clone();
            for (column, value) in assignments {
                new_row.insert(column.clone(), value.clone());
            }

            let object_id = schema.object_id(&old_row);
            let row = Row::new(object_id, table, new_row.clone());
            self.validate(tid, &row, ActionKind::Write)?;

            self.recovery.write_log(LogRecord::write(
                tid,
                table,
                Some(old_row.clone()),
                Some(new_row.clone()),
            ))?;
            self.buffer.lock().expect("buffer lock poisoned").buffer_update(
                tid,
                table,
                old_row.clone(),
                new_row,
                conditions_for_row(&old_row),
            );
            affected += 1;
        }
        Ok(affected)
    }

    fn delete_rows(&self, tid: Tid, table: &str, conditions: &[Condition]) -> Result<usize> {
        let schema = self.storage.schema(table)?;
        let matching = self.private_view(tid, table, conditions)?;

        let mut affected = 0;
        for row_data in matching {
            let object_id = schema.object_id(&row_data);
            let row = Row::new(object_id, table, row_data.clone());
            self.validate(tid, &row, ActionKind::Write)?;

            self.recovery
                .write_log(LogRecord::write(tid, table, Some(row_data.clone()), None))?;
            self.buffer.lock().expect("buffer lock poisoned").buffer_delete(
                tid,
                table,
                row_data.clone(),
                conditions_for_row(&row_data),
            );
            affected += 1;
        }
        Ok(affected)
    }

    /// Rows of a table as this transaction sees them: committed baseline
    /// filtered by the conditions, with the transaction's staged writes
    /// overlaid and re-filtered.
    fn private_view(
        &self,
        tid: Tid,
        table: &str,
        conditions: &[Condition],
    ) -> Result<Vec<RowData>> {
        let base = self.storage.read(&DataRetrieval {
            table: table.to_string(),
            columns: Vec::new(),
            conditions: conditions.to_vec(),
        })?;
        let mut view = self
            .buffer
            .lock()
            .expect("buffer lock poisoned")
            .overlay(tid, table, base);
        view.retain(|row| matches_all(conditions, row));
        Ok(view)
    }
}

/// Conditions matching every column of a row exactly
fn conditions_for_row(row: &RowData) -> Vec<Condition> {
    row.iter()
        .map(|(column, value)| Condition::new(column.clone(), CompareOp::Eq, value.clone()))
        .collect()
}
