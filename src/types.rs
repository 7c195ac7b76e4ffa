//! Core types for minitx
//!
//! Defines column values, table schemas, rows, and the per-row request
//! structs (`DataRetrieval`, `DataWrite`, `DataDeletion`) that the
//! coordinator and storage engine exchange.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Column data types supported by minitx
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// 64-bit signed integer
    Integer,
    /// 64-bit floating point
    Float,
    /// Variable-length string with optional max length
    Varchar(Option<u32>),
    /// Boolean
    Boolean,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Integer => write!(f, "INTEGER"),
            DataType::Float => write!(f, "FLOAT"),
            DataType::Varchar(Some(len)) => write!(f, "VARCHAR({})", len),
            DataType::Varchar(None) => write!(f, "VARCHAR"),
            DataType::Boolean => write!(f, "BOOLEAN"),
        }
    }
}

/// A column value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,
    /// Integer value
    Integer(i64),
    /// Float value
    Float(f64),
    /// String value
    Text(String),
    /// Boolean value
    Boolean(bool),
}

// Hash is needed so values can key buffered-write and version maps.
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state), // bits keep hashing consistent
            Value::Text(s) => s.hash(state),
            Value::Boolean(b) => b.hash(state),
        }
    }
}

// NaN == NaN for map-key purposes
impl Eq for Value {}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            // Cross-type numeric comparison
            (Value::Integer(a), Value::Float(b)) => (*a as f64) == *b,
            (Value::Float(a), Value::Integer(b)) => *a == (*b as f64),
            _ => false,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.partial_cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.partial_cmp(b),
            // Cross-type numeric comparison
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", if *v { "TRUE" } else { "FALSE" }),
        }
    }
}

impl Value {
    /// Check if the value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// A row's column data. `BTreeMap` keeps the WAL encoding deterministic
/// (fixed field order on every replay).
pub type RowData = BTreeMap<String, Value>;

/// A database object as the concurrency engines see it: one row,
/// identified across tables by a derived object id.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Stable identity, derived as "table:primary-key"
    pub object_id: String,
    /// Owning table
    pub table: String,
    /// Column name -> value
    pub data: RowData,
}

impl Row {
    pub fn new(object_id: impl Into<String>, table: impl Into<String>, data: RowData) -> Self {
        Self {
            object_id: object_id.into(),
            table: table.into(),
            data,
        }
    }
}

/// Comparison operators usable in conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

/// A single filtering condition; multiple conditions combine with AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: String,
    pub op: CompareOp,
    pub operand: Value,
}

impl Condition {
    pub fn new(column: impl Into<String>, op: CompareOp, operand: Value) -> Self {
        Self {
            column: column.into(),
            op,
            operand,
        }
    }

    /// Evaluate this condition against a row. A missing column or an
    /// incomparable pair of values fails the condition.
    pub fn matches(&self, row: &RowData) -> bool {
        let value = match row.get(&self.column) {
            Some(v) => v,
            None => return false,
        };
        match self.op {
            CompareOp::Eq => value == &self.operand,
            CompareOp::Ne => value != &self.operand,
            CompareOp::Lt => matches!(value.partial_cmp(&self.operand), Some(Ordering::Less)),
            CompareOp::Le => matches!(
                value.partial_cmp(&self.operand),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
            CompareOp::Gt => matches!(value.partial_cmp(&self.operand), Some(Ordering::Greater)),
            CompareOp::Ge => matches!(
                value.partial_cmp(&self.operand),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
        }
    }
}

/// Evaluate a conjunction of conditions against a row.
pub fn matches_all(conditions: &[Condition], row: &RowData) -> bool {
    conditions.iter().all(|c| c.matches(row))
}

/// Parameters for a read: optional column projection and AND-combined
/// filtering conditions.
#[derive(Debug, Clone, Default)]
pub struct DataRetrieval {
    pub table: String,
    pub columns: Vec<String>,
    pub conditions: Vec<Condition>,
}

impl DataRetrieval {
    /// Read every column of every row of a table
    pub fn all(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            conditions: Vec::new(),
        }
    }
}

/// Parameters for a write. Empty `conditions` means INSERT; otherwise the
/// named columns of every matching row are updated.
#[derive(Debug, Clone)]
pub struct DataWrite {
    pub table: String,
    pub columns: Vec<String>,
    pub new_values: Vec<Value>,
    pub conditions: Vec<Condition>,
}

impl DataWrite {
    pub fn is_insert(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Build an INSERT for a complete row
    pub fn insert_row(table: impl Into<String>, data: &RowData) -> Self {
        Self {
            table: table.into(),
            columns: data.keys().cloned().collect(),
            new_values: data.values().cloned().collect(),
            conditions: Vec::new(),
        }
    }
}

/// Parameters for a delete
#[derive(Debug, Clone)]
pub struct DataDeletion {
    pub table: String,
    pub conditions: Vec<Condition>,
}

/// A column definition in a table schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Table schema definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Columns forming the primary key, in declaration order
    pub primary_keys: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>, primary_keys: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_keys,
        }
    }

    /// Find a column by name
    pub fn find_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Derive the stable object id for a row of this table: the primary
    /// key values joined under the table name, or the whole row when the
    /// table has no primary key.
    pub fn object_id(&self, row: &RowData) -> String {
        if self.primary_keys.is_empty() {
            let all: Vec<String> = row.values().map(|v| v.to_string()).collect();
            return format!("{}:{}", self.name, all.join(","));
        }
        let key: Vec<String> = self
            .primary_keys
            .iter()
            .map(|c| row.get(c).map(|v| v.to_string()).unwrap_or_default())
            .collect();
        format!("{}:{}", self.name, key.join(","))
    }
}
