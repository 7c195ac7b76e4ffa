//! Append-only binary log file
//!
//! ## On-disk format
//!
//! File header: 4-byte magic `MTXL`, 4-byte format version (LE).
//!
//! Each record:
//! - 1-byte action code (start=0, write=1, commit=2, abort=3, checkpoint=4)
//! - 8-byte transaction id (LE)
//! - 8-byte timestamp (LE, Unix epoch millis)
//! - 4-byte length + UTF-8 table name (empty for control records)
//! - 4-byte length + bincode-encoded old_row map (length 0 when absent)
//! - 4-byte length + bincode-encoded new_row map (length 0 when absent)
//!
//! Row maps are `BTreeMap`s, so field order is fixed and a record replays
//! to exactly the bytes it was written from. A truncated tail (torn write
//! at crash time) ends iteration with a warning rather than an error.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{MinitxError, Result};
use crate::types::RowData;

use super::record::{LogAction, LogRecord};

const MAGIC: &[u8; 4] = b"MTXL";
const FORMAT_VERSION: u32 = 1;

/// Byte offset of the first record
pub const HEADER_LEN: u64 = 8;

/// Handle to the append-only on-disk log
pub struct LogFile {
    path: PathBuf,
    file: File,
}

impl LogFile {
    /// Open (or create) the log file, writing the header if the file is
    /// new and validating it otherwise.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(MAGIC)?;
            file.write_all(&FORMAT_VERSION.to_le_bytes())?;
            file.sync_all()?;
        } else {
            let mut magic = [0u8; 4];
            let mut version = [0u8; 4];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut magic)?;
            file.read_exact(&mut version)?;
            if &magic != MAGIC {
                return Err(MinitxError::WalCorrupt(format!(
                    "Log file '{}' has bad magic",
                    path.display()
                )));
            }
            let version = u32::from_le_bytes(version);
            if version != FORMAT_VERSION {
                return Err(MinitxError::WalCorrupt(format!(
                    "Log file '{}' has unsupported format version {}",
                    path.display(),
                    version
                )));
            }
        }

        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Current end-of-log offset
    pub fn end_offset(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn encode_row(row: &Option<RowData>) -> Result<Vec<u8>> {
        match row {
            Some(data) => Ok(bincode::serialize(data)?),
            None => Ok(Vec::new()),
        }
    }

    /// Append one record; returns the offset it was written at.
    pub fn append(&mut self, record: &LogRecord) -> Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;

        let table_bytes = record.table.as_bytes();
        let old_bytes = Self::encode_row(&record.old_row)?;
        let new_bytes = Self::encode_row(&record.new_row)?;

        let mut buf =
            Vec::with_capacity(1 + 8 + 8 + 12 + table_bytes.len() + old_bytes.len() + new_bytes.len());
        buf.push(record.action.code());
        buf.extend_from_slice(&record.tid.to_le_bytes());
        buf.extend_from_slice(&record.ts.to_le_bytes());
        buf.extend_from_slice(&(table_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(table_bytes);
        buf.extend_from_slice(&(old_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&old_bytes);
        buf.extend_from_slice(&(new_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&new_bytes);

        self.file.write_all(&buf)?;
        self.file.flush()?;
        Ok(offset)
    }

    /// Append a batch of records; returns the offset of the first.
    pub fn append_all(&mut self, records: &[LogRecord]) -> Result<u64> {
        let start = self.file.seek(SeekFrom::End(0))?;
        for record in records {
            self.append(record)?;
        }
        Ok(start)
    }

    /// Force the file contents to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Read every record from the beginning of the log.
    pub fn iter_records(&self) -> Result<Vec<(u64, LogRecord)>> {
        self.records_from(HEADER_LEN)
    }

    /// Read records starting at the given offset, each tagged with the
    /// offset it begins at. A torn tail stops iteration with a warning.
    pub fn records_from(&self, offset: u64) -> Result<Vec<(u64, LogRecord)>> {
        let mut file = File::open(&self.path)?;
        let end = file.metadata()?.len();
        let mut pos = offset.max(HEADER_LEN);
        file.seek(SeekFrom::Start(pos))?;

        let mut records = Vec::new();
        while pos < end {
            match Self::read_record(&mut file, end, pos) {
                Ok(Some((record, next))) => {
                    records.push((pos, record));
                    pos = next;
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!(
                        "stopping log scan at offset {} of '{}': {}",
                        pos,
                        self.path.display(),
                        e
                    );
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Read one record at `pos`; returns the record and the next offset,
    /// or `None` on a clean torn tail.
    fn read_record(file: &mut File, end: u64, pos: u64) -> Result<Option<(LogRecord, u64)>> {
        let mut fixed = [0u8; 17];
        if pos + 17 > end {
            return Ok(None);
        }
        file.read_exact(&mut fixed)?;

        let action = LogAction::from_code(fixed[0]).ok_or_else(|| {
            MinitxError::WalCorrupt(format!("unknown action code {}", fixed[0]))
        })?;
        let tid = u64::from_le_bytes(fixed[1..9].try_into().expect("8 bytes"));
        let ts = u64::from_le_bytes(fixed[9..17].try_into().expect("8 bytes"));

        let mut cursor = pos + 17;
        let table_bytes = Self::read_chunk(file, end, &mut cursor)?;
        let table = String::from_utf8(table_bytes)
            .map_err(|e| MinitxError::WalCorrupt(format!("bad table name: {}", e)))?;
        let old_bytes = Self::read_chunk(file, end, &mut cursor)?;
        let new_bytes = Self::read_chunk(file, end, &mut cursor)?;

        let old_row = if old_bytes.is_empty() {
            None
        } else {
            Some(bincode::deserialize(&old_bytes)?)
        };
        let new_row = if new_bytes.is_empty() {
            None
        } else {
            Some(bincode::deserialize(&new_bytes)?)
        };

        Ok(Some((
            LogRecord {
                tid,
                action,
                ts,
                table,
                old_row,
                new_row,
            },
            cursor,
        )))
    }

    /// Read one length-prefixed chunk, advancing the cursor
    fn read_chunk(file: &mut File, end: u64, cursor: &mut u64) -> Result<Vec<u8>> {
        if *cursor + 4 > end {
            return Err(MinitxError::WalCorrupt("truncated length prefix".into()));
        }
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as u64;
        *cursor += 4;

        if *cursor + len > end {
            return Err(MinitxError::WalCorrupt("truncated record payload".into()));
        }
        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data)?;
        *cursor += len;
        Ok(data)
    }

    /// Discard everything after the given offset
    pub fn truncate_after(&mut self, offset: u64) -> Result<()> {
        let offset = offset.max(HEADER_LEN);
        self.file.set_len(offset)?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.sync_all()?;
        Ok(())
    }
}
