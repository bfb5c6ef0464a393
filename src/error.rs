//! Error taxonomy for subsetting runs.
//!
//! Every fatal error carries enough context (table, association, round, row
//! identity) to reproduce the failing step without re-running the traversal.

use thiserror::Error;

/// Result type alias using [`SubsetError`]
pub type Result<T> = std::result::Result<T, SubsetError>;

/// All errors the subsetting engine can report.
#[derive(Debug, Error)]
pub enum SubsetError {
    /// Bad schema metadata (unknown table/column in an FK, unknown association)
    #[error("schema error: {0}")]
    Schema(String),

    /// Malformed seed or restriction predicate
    #[error("query error on table '{table}' with condition '{predicate}': {message}")]
    Query {
        table: String,
        predicate: String,
        message: String,
    },

    /// The round-count or entity-count guard tripped
    #[error(
        "traversal did not converge after {rounds} rounds (new entries per round, most recent last: {growth:?})"
    )]
    TraversalDiverged { rounds: u32, growth: Vec<u64> },

    /// A dependency cycle has no viable cycle-breaking edge
    #[error("unresolvable dependency cycle between tables: {}", tables.join(", "))]
    UnresolvableCycle { tables: Vec<String> },

    /// I/O failure while exporting a table
    #[error("failed to write table '{table}'{}: {message}", row.as_ref().map(|r| format!(" at row {}", r)).unwrap_or_default())]
    Write {
        table: String,
        row: Option<String>,
        message: String,
    },

    /// The run was cancelled
    #[error("cancelled during {stage}")]
    Cancelled { stage: String },

    /// Working store failure
    #[error("working store error: {0}")]
    Store(String),

    /// Invalid configuration values
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SubsetError {
    /// Stable short code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            SubsetError::Schema(_) => "SCHEMA",
            SubsetError::Query { .. } => "QUERY",
            SubsetError::TraversalDiverged { .. } => "TRAVERSAL_DIVERGED",
            SubsetError::UnresolvableCycle { .. } => "UNRESOLVABLE_CYCLE",
            SubsetError::Write { .. } => "WRITE",
            SubsetError::Cancelled { .. } => "CANCELLED",
            SubsetError::Store(_) => "STORE",
            SubsetError::Config(_) => "CONFIG",
        }
    }
}
