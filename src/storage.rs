//! Storage engine for minitx
//!
//! ## Storage Format
//!
//! The storage engine uses a simple file-based format:
//!
//! ### Directory Structure
//! ```text
//! data/
//! ├── catalog.json      # Table metadata (schemas)
//! ├── wal.log           # Write-ahead log (owned by wal::recovery)
//! ├── wal.checkpoint    # Checkpoint marker (owned by wal::recovery)
//! └── tables/
//!     ├── users.dat     # Row data for 'users' table
//!     └── ...
//! ```
//!
//! ### Table Data Format (.dat files)
//! Each row is stored as a JSON line (JSONL format) for simplicity:
//! ```json
//! {"id":1,"name":"alice"}
//! {"id":2,"name":"bob"}
//! ```
//!
//! This format is human readable (good for educational purposes), easy to
//! parse and debug, and append-friendly.
//!
//! The engine holds every table in memory and answers the row-level
//! contract the coordinator and the recovery manager consume:
//! `read(DataRetrieval)`, `write(DataWrite)` (INSERT when conditions are
//! empty, UPDATE otherwise), `delete(DataDeletion)`, plus the
//! old-row/new-row swap used when undoing logged updates.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{MinitxError, Result};
use crate::types::{matches_all, DataDeletion, DataRetrieval, DataWrite, RowData, TableSchema};

/// Catalog file storing table metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Catalog {
    tables: HashMap<String, TableSchema>,
}

impl Catalog {
    fn new() -> Self {
        Self {
            tables: HashMap::new(),
        }
    }
}

/// In-memory table data
#[derive(Debug)]
struct TableData {
    schema: TableSchema,
    rows: Vec<RowData>,
    /// Set when the in-memory rows differ from the .dat file
    dirty: bool,
}

impl TableData {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            dirty: false,
        }
    }
}

/// The storage engine manages all table data and persistence
pub struct StorageEngine {
    /// Base directory for data files
    data_dir: PathBuf,
    /// In-memory table data, protected by RwLock for concurrent access
    tables: RwLock<HashMap<String, TableData>>,
}

impl StorageEngine {
    /// Create a new storage engine rooted at the given data directory,
    /// loading any catalog and table files already present.
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(data_dir.join("tables"))?;

        let engine = Self {
            data_dir,
            tables: RwLock::new(HashMap::new()),
        };

        engine.load()?;
        Ok(engine)
    }

    fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }

    /// Validate a table name to prevent path traversal
    fn validate_table_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(MinitxError::Table("Table name cannot be empty".into()));
        }
        if name.contains("..") || name.contains('/') || name.contains('\\') || name.contains('\0') {
            return Err(MinitxError::Table(format!(
                "Invalid table name '{}': contains forbidden characters",
                name
            )));
        }
        if name.len() > 255 {
            return Err(MinitxError::Table("Table name too long".into()));
        }
        Ok(())
    }

    fn table_path(&self, table_name: &str) -> PathBuf {
        self.data_dir
            .join("tables")
            .join(format!("{}.dat", table_name))
    }

    /// Load the catalog and every table file into memory
    fn load(&self) -> Result<()> {
        let path = self.catalog_path();
        if !path.exists() {
            return Ok(());
        }

        let file = File::open(&path)?;
        let catalog: Catalog = serde_json::from_reader(file).map_err(|e| {
            MinitxError::Json(format!(
                "Failed to parse catalog '{}': {}",
                path.display(),
                e
            ))
        })?;

        let mut tables = self.tables.write().expect("tables lock poisoned");
        for (name, schema) in catalog.tables {
            let mut table = TableData::new(schema);

            let path = self.table_path(&name);
            if path.exists() {
                let file = File::open(&path)?;
                let reader = BufReader::new(file);
                for (idx, line_res) in reader.lines().enumerate() {
                    let line = line_res?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let row: RowData = serde_json::from_str(&line).map_err(|e| {
                        MinitxError::Json(format!(
                            "Failed to parse row in '{}', line {}: {}",
                            path.display(),
                            idx + 1,
                            e
                        ))
                    })?;
                    table.rows.push(row);
                }
            }

            tables.insert(name, table);
        }

        Ok(())
    }

    /// Save catalog to disk (atomic temp-file + rename)
    fn save_catalog(&self) -> Result<()> {
        let tables = self.tables.read().expect("tables lock poisoned");
        let catalog = Catalog {
            tables: tables
                .iter()
                .map(|(name, data)| (name.clone(), data.schema.clone()))
                .collect(),
        };
        drop(tables);

        let path = self.catalog_path();
        let temp_path = path.with_extension("json.tmp");
        let file = File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &catalog)?;
        fs::rename(temp_path, path)?;
        Ok(())
    }

    /// Save a table's rows to disk (full rewrite, atomic temp-file + rename)
    fn save_table_rows(&self, table_name: &str, rows: &[RowData]) -> Result<()> {
        let path = self.table_path(table_name);
        let temp_path = path.with_extension("dat.tmp");

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        for row in rows {
            let json = serde_json::to_string(row)?;
            writeln!(writer, "{}", json)?;
        }
        writer.flush()?;
        fs::rename(temp_path, path)?;
        Ok(())
    }

    /// Create a new table
    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        Self::validate_table_name(&schema.name)?;
        for pk in &schema.primary_keys {
            if schema.find_column(pk).is_none() {
                return Err(MinitxError::unknown_column(&schema.name, pk));
            }
        }

        let name = schema.name.clone();
        {
            let mut tables = self.tables.write().expect("tables lock poisoned");
            if tables.contains_key(&name) {
                return Err(MinitxError::table_already_exists(&name));
            }
            tables.insert(name.clone(), TableData::new(schema));
        }

        self.save_catalog()?;
        File::create(self.table_path(&name))?;
        Ok(())
    }

    /// Drop a table
    pub fn drop_table(&self, table_name: &str) -> Result<()> {
        {
            let mut tables = self.tables.write().expect("tables lock poisoned");
            if tables.remove(table_name).is_none() {
                return Err(MinitxError::table_not_found(table_name));
            }
        }

        self.save_catalog()?;
        let path = self.table_path(table_name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Get a clone of a table's schema
    pub fn schema(&self, table_name: &str) -> Result<TableSchema> {
        let tables = self.tables.read().expect("tables lock poisoned");
        tables
            .get(table_name)
            .map(|t| t.schema.clone())
            .ok_or_else(|| MinitxError::table_not_found(table_name))
    }

    /// Check whether a table exists
    pub fn has_table(&self, table_name: &str) -> bool {
        let tables = self.tables.read().expect("tables lock poisoned");
        tables.contains_key(table_name)
    }

    /// Read rows matching the retrieval's conditions, projected to its
    /// columns (all columns when the projection is empty).
    pub fn read(&self, retrieval: &DataRetrieval) -> Result<Vec<RowData>> {
        let tables = self.tables.read().expect("tables lock poisoned");
        let table = tables
            .get(&retrieval.table)
            .ok_or_else(|| MinitxError::table_not_found(&retrieval.table))?;

        for column in &retrieval.columns {
            if table.schema.find_column(column).is_none() {
                return Err(MinitxError::unknown_column(&retrieval.table, column));
            }
        }

        let mut out = Vec::new();
        for row in &table.rows {
            if !matches_all(&retrieval.conditions, row) {
                continue;
            }
            if retrieval.columns.is_empty() {
                out.push(row.clone());
            } else {
                out.push(
                    row.iter()
                        .filter(|(k, _)| retrieval.columns.contains(k))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                );
            }
        }
        Ok(out)
    }

    /// Apply a write. Empty conditions inserts one new row built from the
    /// write's columns; otherwise the named columns of every matching row
    /// are updated. Returns the number of affected rows.
    pub fn write(&self, write: &DataWrite) -> Result<usize> {
        if write.columns.len() != write.new_values.len() {
            return Err(MinitxError::Column(format!(
                "Column count doesn't match value count (expected {}, got {})",
                write.columns.len(),
                write.new_values.len()
            )));
        }

        let mut tables = self.tables.write().expect("tables lock poisoned");
        let table = tables
            .get_mut(&write.table)
            .ok_or_else(|| MinitxError::table_not_found(&write.table))?;

        for column in &write.columns {
            if table.schema.find_column(column).is_none() {
                return Err(MinitxError::unknown_column(&write.table, column));
            }
        }

        if write.is_insert() {
            let row: RowData = write
                .columns
                .iter()
                .cloned()
                .zip(write.new_values.iter().cloned())
                .collect();
            Self::validate_row(&table.schema, &row)?;
            Self::check_primary_key(&table.schema, &table.rows, &row, None)?;
            table.rows.push(row);
            table.dirty = true;
            return Ok(1);
        }

        let mut affected = 0;
        for idx in 0..table.rows.len() {
            if !matches_all(&write.conditions, &table.rows[idx]) {
                continue;
            }
            let mut updated = table.rows[idx].clone();
            for (column, value) in write.columns.iter().zip(write.new_values.iter()) {
                updated.insert(column.clone(), value.clone());
            }
            Self::validate_row(&table.schema, &updated)?;
            Self::check_primary_key(&table.schema, &table.rows, &updated, Some(idx))?;
            table.rows[idx] = updated;
            affected += 1;
        }
        if affected > 0 {
            table.dirty = true;
        }
        Ok(affected)
    }

    /// Delete rows matching the deletion's conditions. Returns the number
    /// of removed rows.
    pub fn delete(&self, deletion: &DataDeletion) -> Result<usize> {
        let mut tables = self.tables.write().expect("tables lock poisoned");
        let table = tables
            .get_mut(&deletion.table)
            .ok_or_else(|| MinitxError::table_not_found(&deletion.table))?;

        let before = table.rows.len();
        table
            .rows
            .retain(|row| !matches_all(&deletion.conditions, row));
        let removed = before - table.rows.len();
        if removed > 0 {
            table.dirty = true;
        }
        Ok(removed)
    }

    /// Replace every row equal to `old_row` with `new_row`. This is the
    /// form recovery uses to undo and redo logged updates.
    pub fn update_matching(
        &self,
        table_name: &str,
        old_row: &RowData,
        new_row: &RowData,
    ) -> Result<usize> {
        let mut tables = self.tables.write().expect("tables lock poisoned");
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| MinitxError::table_not_found(table_name))?;

        let mut affected = 0;
        for row in table.rows.iter_mut() {
            if row == old_row {
                *row = new_row.clone();
                affected += 1;
            }
        }
        if affected > 0 {
            table.dirty = true;
        }
        Ok(affected)
    }

    /// Persist every dirty table. Invoked by checkpoints.
    pub fn flush_all(&self) -> Result<()> {
        let mut tables = self.tables.write().expect("tables lock poisoned");
        for (name, table) in tables.iter_mut() {
            if !table.dirty {
                continue;
            }
            self.save_table_rows(name, &table.rows)?;
            table.dirty = false;
        }
        Ok(())
    }

    fn validate_row(schema: &TableSchema, row: &RowData) -> Result<()> {
        for column in &schema.columns {
            let value = row.get(&column.name);
            let is_null = value.map(|v| v.is_null()).unwrap_or(true);
            if is_null && !column.nullable {
                return Err(MinitxError::Constraint(format!(
                    "Column '{}' of table '{}' cannot be NULL",
                    column.name, schema.name
                )));
            }
        }
        for key in row.keys() {
            if schema.find_column(key).is_none() {
                return Err(MinitxError::unknown_column(&schema.name, key));
            }
        }
        Ok(())
    }

    fn check_primary_key(
        schema: &TableSchema,
        rows: &[RowData],
        candidate: &RowData,
        skip_idx: Option<usize>,
    ) -> Result<()> {
        if schema.primary_keys.is_empty() {
            return Ok(());
        }
        for (idx, row) in rows.iter().enumerate() {
            if Some(idx) == skip_idx {
                continue;
            }
            let same_key = schema
                .primary_keys
                .iter()
                .all(|pk| row.get(pk) == candidate.get(pk));
            if same_key {
                return Err(MinitxError::Constraint(format!(
                    "Duplicate primary key in table '{}'",
                    schema.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnDef, CompareOp, Condition, DataType, Value};
    use tempfile::tempdir;

    fn users_schema() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                ColumnDef::new("id", DataType::Integer, false),
                ColumnDef::new("name", DataType::Varchar(Some(64)), true),
            ],
            vec!["id".into()],
        )
    }

    fn user_row(id: i64, name: &str) -> RowData {
        let mut row = RowData::new();
        row.insert("id".into(), Value::Integer(id));
        row.insert("name".into(), Value::Text(name.into()));
        row
    }

    fn insert(storage: &StorageEngine, id: i64, name: &str) {
        let row = user_row(id, name);
        storage.write(&DataWrite::insert_row("users", &row)).unwrap();
    }

    #[test]
    fn test_create_and_drop_table() {
        let dir = tempdir().unwrap();
        let storage = StorageEngine::new(dir.path().to_path_buf()).unwrap();

        storage.create_table(users_schema()).unwrap();
        assert!(storage.has_table("users"));
        assert!(storage.create_table(users_schema()).is_err());

        storage.drop_table("users").unwrap();
        assert!(!storage.has_table("users"));
        assert!(storage.drop_table("users").is_err());
    }

    #[test]
    fn test_insert_and_read_with_conditions() {
        let dir = tempdir().unwrap();
        let storage = StorageEngine::new(dir.path().to_path_buf()).unwrap();
        storage.create_table(users_schema()).unwrap();
        insert(&storage, 1, "alice");
        insert(&storage, 2, "bob");

        let all = storage.read(&DataRetrieval::all("users")).unwrap();
        assert_eq!(all.len(), 2);

        let filtered = storage
            .read(&DataRetrieval {
                table: "users".into(),
                columns: vec!["name".into()],
                conditions: vec![Condition::new("id", CompareOp::Gt, Value::Integer(1))],
            })
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].get("name"), Some(&Value::Text("bob".into())));
        assert!(filtered[0].get("id").is_none());
    }

    #[test]
    fn test_update_by_conditions() {
        let dir = tempdir().unwrap();
        let storage = StorageEngine::new(dir.path().to_path_buf()).unwrap();
        storage.create_table(users_schema()).unwrap();
        insert(&storage, 1, "alice");
        insert(&storage, 2, "bob");

        let affected = storage
            .write(&DataWrite {
                table: "users".into(),
                columns: vec!["name".into()],
                new_values: vec![Value::Text("carol".into())],
                conditions: vec![Condition::new("id", CompareOp::Eq, Value::Integer(2))],
            })
            .unwrap();
        assert_eq!(affected, 1);

        let rows = storage
            .read(&DataRetrieval {
                table: "users".into(),
                columns: vec![],
                conditions: vec![Condition::new("id", CompareOp::Eq, Value::Integer(2))],
            })
            .unwrap();
        assert_eq!(rows[0].get("name"), Some(&Value::Text("carol".into())));
    }

    #[test]
    fn test_delete_returns_affected_count() {
        let dir = tempdir().unwrap();
        let storage = StorageEngine::new(dir.path().to_path_buf()).unwrap();
        storage.create_table(users_schema()).unwrap();
        insert(&storage, 1, "alice");
        insert(&storage, 2, "bob");

        let removed = storage
            .delete(&DataDeletion {
                table: "users".into(),
                conditions: vec![Condition::new("id", CompareOp::Le, Value::Integer(2))],
            })
            .unwrap();
        assert_eq!(removed, 2);
        assert!(storage.read(&DataRetrieval::all("users")).unwrap().is_empty());
    }

    #[test]
    fn test_primary_key_uniqueness() {
        let dir = tempdir().unwrap();
        let storage = StorageEngine::new(dir.path().to_path_buf()).unwrap();
        storage.create_table(users_schema()).unwrap();
        insert(&storage, 1, "alice");

        let dup = user_row(1, "other");
        let err = storage.write(&DataWrite::insert_row("users", &dup));
        assert!(matches!(err, Err(MinitxError::Constraint(_))));
    }

    #[test]
    fn test_nullability_enforced() {
        let dir = tempdir().unwrap();
        let storage = StorageEngine::new(dir.path().to_path_buf()).unwrap();
        storage.create_table(users_schema()).unwrap();

        let mut row = RowData::new();
        row.insert("name".into(), Value::Text("no id".into()));
        let err = storage.write(&DataWrite::insert_row("users", &row));
        assert!(matches!(err, Err(MinitxError::Constraint(_))));
    }

    #[test]
    fn test_update_matching_swaps_rows() {
        let dir = tempdir().unwrap();
        let storage = StorageEngine::new(dir.path().to_path_buf()).unwrap();
        storage.create_table(users_schema()).unwrap();
        insert(&storage, 1, "alice");

        let old = user_row(1, "alice");
        let new = user_row(1, "alicia");
        assert_eq!(storage.update_matching("users", &old, &new).unwrap(), 1);
        // Applying the same swap again is a no-op
        assert_eq!(storage.update_matching("users", &old, &new).unwrap(), 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();
        {
            let storage = StorageEngine::new(dir.path().to_path_buf()).unwrap();
            storage.create_table(users_schema()).unwrap();
            insert(&storage, 1, "alice");
            storage.flush_all().unwrap();
        }

        let reopened = StorageEngine::new(dir.path().to_path_buf()).unwrap();
        let rows = reopened.read(&DataRetrieval::all("users")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Value::Text("alice".into())));
    }
}
