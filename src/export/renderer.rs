//! Script renderer boundary.

use crate::entity::KeyValue;
use crate::schema::Table;
use crate::session::Value;
use std::fmt;
use std::io;

/// Kind of statements a batch turns into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Insert,
    Upsert,
    Delete,
    /// Patch deferred FK columns after all inserts
    DeferredUpdate,
    /// Null deferred FK columns before any delete
    DeferredReset,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Insert => write!(f, "insert"),
            Phase::Upsert => write!(f, "upsert"),
            Phase::Delete => write!(f, "delete"),
            Phase::DeferredUpdate => write!(f, "deferred-update"),
            Phase::DeferredReset => write!(f, "deferred-reset"),
        }
    }
}

/// Script a statement belongs to, as used by enhancers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptType {
    Insert,
    Delete,
}

impl ScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::Insert => "INSERT",
            ScriptType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete batch of rows for one statement group.
///
/// `rows` are aligned with `columns`. `key_columns` (a subset of `columns`)
/// identify rows in the target for deletes and updates.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub columns: Vec<String>,
    pub key_columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of each key column in `columns`
    pub fn key_positions(&self) -> Vec<usize> {
        self.key_columns
            .iter()
            .filter_map(|k| self.columns.iter().position(|c| c.eq_ignore_ascii_case(k)))
            .collect()
    }

    /// Positions of the non-key columns
    pub fn value_positions(&self) -> Vec<usize> {
        let keys = self.key_positions();
        (0..self.columns.len()).filter(|i| !keys.contains(i)).collect()
    }
}

impl From<&KeyValue> for Value {
    fn from(k: &KeyValue) -> Self {
        match k {
            KeyValue::Int(n) => Value::Int(*n),
            KeyValue::Text(s) => Value::Text(s.clone()),
            KeyValue::Null => Value::Null,
        }
    }
}

/// Turns batches into script text.
///
/// Calls may come from several export workers at once; each call must be
/// written as a unit.
pub trait ScriptRenderer: Send + Sync {
    fn begin_script(&self) -> io::Result<()>;

    fn begin_table(&self, table: &Table, phase: Phase) -> io::Result<()>;

    fn write_batch(&self, table: &Table, phase: Phase, batch: &Batch) -> io::Result<()>;

    fn end_table(&self, table: &Table, phase: Phase) -> io::Result<()>;

    /// Verbatim text from a script enhancer
    fn write_enhancement(&self, text: &str) -> io::Result<()>;

    fn end_script(&self) -> io::Result<()>;
}
