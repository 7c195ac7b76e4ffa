//! Error types for minitx
//!
//! Defines a unified error type that can represent errors from all
//! subsystems. Statement-level failures are formatted so that the first
//! clause names the transaction and the cause.

use std::fmt;
use std::io;

use crate::cc::Tid;

/// Unified error type for minitx operations
#[derive(Debug)]
pub enum MinitxError {
    /// I/O error (log file, table files)
    Io(io::Error),
    /// Table-related error (not found, already exists, etc.)
    Table(String),
    /// Column-related error
    Column(String),
    /// Type error (wrong type for operation)
    Type(String),
    /// Transaction error (lifecycle, CC denial, victim selection)
    Transaction(String),
    /// Constraint violation (primary key, nullability)
    Constraint(String),
    /// JSON-related error (catalog, table files, checkpoint marker)
    Json(String),
    /// Write-ahead log error (encoding, corrupt record)
    WalCorrupt(String),
    /// Generic internal error
    Internal(String),
}

impl MinitxError {
    /// "Table 'x' doesn't exist"
    pub fn table_not_found(table_name: &str) -> Self {
        MinitxError::Table(format!("Table '{}' doesn't exist", table_name))
    }

    /// "Table 'x' already exists"
    pub fn table_already_exists(table_name: &str) -> Self {
        MinitxError::Table(format!("Table '{}' already exists", table_name))
    }

    /// "Unknown column 'c' in table 'x'"
    pub fn unknown_column(table_name: &str, column: &str) -> Self {
        MinitxError::Column(format!(
            "Unknown column '{}' in table '{}'",
            column, table_name
        ))
    }

    /// "Transaction N does not exist"
    pub fn txn_not_found(tid: Tid) -> Self {
        MinitxError::Transaction(format!("Transaction {} does not exist", tid))
    }

    /// "Transaction N is not active"
    pub fn txn_not_active(tid: Tid) -> Self {
        MinitxError::Transaction(format!("Transaction {} is not active", tid))
    }

    /// A denied-but-retriable concurrency decision. The first clause names
    /// the transaction; the caller may retry the statement.
    pub fn txn_blocked(tid: Tid, detail: &str) -> Self {
        MinitxError::Transaction(format!("Transaction {} must wait: {}", tid, detail))
    }

    /// A fatal concurrency decision: the transaction has been torn down.
    pub fn txn_aborted(tid: Tid, detail: &str) -> Self {
        MinitxError::Transaction(format!("Transaction {} aborted: {}", tid, detail))
    }
}

impl fmt::Display for MinitxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MinitxError::Io(e) => write!(f, "{}", e),
            MinitxError::Table(msg) => write!(f, "{}", msg),
            MinitxError::Column(msg) => write!(f, "{}", msg),
            MinitxError::Type(msg) => write!(f, "{}", msg),
            MinitxError::Transaction(msg) => write!(f, "{}", msg),
            MinitxError::Constraint(msg) => write!(f, "{}", msg),
            MinitxError::Json(msg) => write!(f, "{}", msg),
            MinitxError::WalCorrupt(msg) => write!(f, "{}", msg),
            MinitxError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for MinitxError {}

impl From<io::Error> for MinitxError {
    fn from(e: io::Error) -> Self {
        MinitxError::Io(e)
    }
}

impl From<serde_json::Error> for MinitxError {
    fn from(e: serde_json::Error) -> Self {
        MinitxError::Json(e.to_string())
    }
}

impl From<bincode::Error> for MinitxError {
    fn from(e: bincode::Error) -> Self {
        MinitxError::WalCorrupt(e.to_string())
    }
}

/// Result type alias for minitx operations
pub type Result<T> = std::result::Result<T, MinitxError>;
