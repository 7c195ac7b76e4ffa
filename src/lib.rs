//! minitx: a minimal multi-strategy transactional engine
//!
//! The core of a pedagogical database engine: five interchangeable
//! concurrency-control strategies (2PL with deadlock detection, timestamp
//! ordering, optimistic validation, and multi-version MVTO / MV2PL /
//! snapshot isolation), a buffered write-ahead log with checkpoints and
//! undo recovery on restart, and a per-transaction staging buffer over a
//! simple table store. SQL parsing, planning, indexes and the network
//! layer live elsewhere; the engine consumes already-elaborated per-row
//! requests.

use std::path::PathBuf;
use std::time::Duration;

pub mod buffer;
pub mod cc;
pub mod coordinator;
pub mod error;
pub mod storage;
pub mod types;
pub mod wal;

pub use cc::{AlgorithmKind, MvccVariant};
pub use coordinator::{Database, Session, Statement, StatementResult};
pub use error::{MinitxError, Result};

/// Engine configuration, immutable after startup
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the catalog, table files and (by default) the log
    pub data_dir: PathBuf,
    /// Log file location; defaults to `wal.log` inside the data directory
    pub log_file_path: Option<PathBuf>,
    /// WAL buffer flush threshold, in records
    pub wal_size: usize,
    /// The concurrency control strategy
    pub cc_algorithm: AlgorithmKind,
    /// How long a 2PL waiter may queue before its request expires
    pub lock_timeout: Duration,
    /// Blocked-statement retries before the transaction is aborted
    pub max_retry: u32,
    /// Committed versions kept per object under the multi-version engine
    pub max_versions_per_object: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_file_path: None,
            wal_size: 50,
            cc_algorithm: AlgorithmKind::LockBased,
            lock_timeout: Duration::from_secs(30),
            max_retry: 3,
            max_versions_per_object: 10,
        }
    }
}

impl Config {
    /// A default configuration rooted at the given data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// The resolved log file path
    pub fn log_path(&self) -> PathBuf {
        self.log_file_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("wal.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.wal_size, 50);
        assert_eq!(config.cc_algorithm, AlgorithmKind::LockBased);
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retry, 3);
        assert_eq!(config.max_versions_per_object, 10);
    }

    #[test]
    fn test_log_path_defaults_into_data_dir() {
        let config = Config::with_data_dir("/tmp/db");
        assert_eq!(config.log_path(), PathBuf::from("/tmp/db/wal.log"));

        let custom = Config {
            log_file_path: Some(PathBuf::from("/elsewhere/engine.wal")),
            ..config
        };
        assert_eq!(custom.log_path(), PathBuf::from("/elsewhere/engine.wal"));
    }
}
