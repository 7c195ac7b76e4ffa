//! Write-ahead logging and undo recovery

pub mod file;
pub mod record;
pub mod recovery;

pub use file::LogFile;
pub use record::{LogAction, LogRecord, StorageOp};
pub use recovery::RecoveryManager;
