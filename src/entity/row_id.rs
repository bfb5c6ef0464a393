//! Row identities.
//!
//! A [`RowId`] is the tuple of key values identifying one row of a table.
//! Single-column keys stay inline. The persisted form is compact JSON text
//! (`[1]`, `[1,"a"]`, `[null]`), which is also the working store key.

use crate::error::{Result, SubsetError};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// One component of a row identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Int(i64),
    Text(String),
    Null,
}

impl KeyValue {
    /// Render as a SQL literal usable in DuckDB predicates
    pub fn to_sql_literal(&self) -> String {
        match self {
            KeyValue::Int(n) => n.to_string(),
            KeyValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            KeyValue::Null => "NULL".to_string(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            KeyValue::Int(n) => serde_json::Value::from(*n),
            KeyValue::Text(s) => serde_json::Value::from(s.as_str()),
            KeyValue::Null => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(n) => write!(f, "{}", n),
            KeyValue::Text(s) => write!(f, "{}", s),
            KeyValue::Null => write!(f, "NULL"),
        }
    }
}

/// Identity of a row within its table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub SmallVec<[KeyValue; 2]>);

impl RowId {
    pub fn new(values: impl IntoIterator<Item = KeyValue>) -> Self {
        Self(values.into_iter().collect())
    }

    /// Single-column integer identity
    pub fn int(n: i64) -> Self {
        Self::new([KeyValue::Int(n)])
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compact JSON text used as the store key
    pub fn to_key(&self) -> String {
        serde_json::Value::Array(self.0.iter().map(KeyValue::to_json).collect()).to_string()
    }

    /// Parse a store key back into an identity
    pub fn from_key(key: &str) -> Result<Self> {
        serde_json::from_str(key)
            .map_err(|e| SubsetError::Store(format!("invalid row key '{}': {}", key, e)))
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}
