//! Source database access.
//!
//! A [`Session`] answers the three questions the engine asks of the source
//! database: which rows match a predicate, which destination rows join to a
//! set of source rows, and what the column values of a set of rows are.
//! [`DuckDbSession`] implements it on an embedded DuckDB database.

mod duckdb;
mod predicate;

pub use self::duckdb::DuckDbSession;
pub use predicate::{referenced_parameters, substitute_parameters};

use crate::entity::RowId;
use crate::error::Result;
use crate::schema::Table;

/// Alias of the seed table in seed predicates
pub const SEED_ALIAS: &str = "T";
/// Alias of the source table in restriction predicates
pub const SOURCE_ALIAS: &str = "A";
/// Alias of the destination table in restriction predicates
pub const DESTINATION_ALIAS: &str = "B";

/// A column value read from the source database
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact numeric rendered without quotes
    Numeric(String),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// One row: its identity plus values in table column order
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: RowId,
    pub values: Vec<Value>,
}

/// A join between two tables through an association
#[derive(Debug, Clone, Copy)]
pub struct JoinSpec<'a> {
    pub source: &'a Table,
    pub destination: &'a Table,
    /// (source column, destination column) pairs
    pub on: &'a [(String, String)],
    /// Extra predicate over aliases `A` and `B`
    pub restriction: Option<&'a str>,
}

/// Source database access used by traversal and export.
///
/// Implementations must be shareable across export workers.
pub trait Session: Send + Sync {
    /// Identities of rows of `table` matching `predicate` (alias `T`)
    fn select_identities(&self, table: &Table, predicate: &str) -> Result<Vec<RowId>>;

    /// (source identity, destination identity) pairs joined through `spec`,
    /// restricted to the given source identities
    fn join_identities(&self, spec: &JoinSpec<'_>, sources: &[RowId]) -> Result<Vec<(RowId, RowId)>>;

    /// Column values for the given identities, in the order of `ids`
    fn fetch_rows(&self, table: &Table, ids: &[RowId]) -> Result<Vec<Row>>;

    /// Start a consistent read snapshot
    fn begin_snapshot(&self) -> Result<()>;

    fn end_snapshot(&self) -> Result<()>;
}
