//! Immutable run configuration.
//!
//! A [`SubsetConfig`] is loaded once (YAML file merged with CLI overrides) and
//! then passed by reference into every core call. Nothing in the engine reads
//! ambient or global configuration.

use crate::dialect::SqlDialect;
use crate::error::{Result, SubsetError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Where the working set (entity graph) is materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingTableScope {
    /// Persistent table in the working schema of the source database
    #[default]
    Global,
    /// Temporary table on the session connection, dropped at run end
    SessionLocal,
    /// Separate local database file, removed at run end
    LocalDatabase,
}

impl std::str::FromStr for WorkingTableScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "global" => Ok(WorkingTableScope::Global),
            "session_local" | "session" => Ok(WorkingTableScope::SessionLocal),
            "local_database" | "local" => Ok(WorkingTableScope::LocalDatabase),
            _ => Err(format!(
                "Unknown working table scope: {}. Valid options: global, session_local, local_database",
                s
            )),
        }
    }
}

impl std::fmt::Display for WorkingTableScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkingTableScope::Global => write!(f, "global"),
            WorkingTableScope::SessionLocal => write!(f, "session_local"),
            WorkingTableScope::LocalDatabase => write!(f, "local_database"),
        }
    }
}

/// How rows are identified inside the working set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowIdentityStrategy {
    /// Primary key columns; tables without a primary key fall back to `rowid`
    #[default]
    PrimaryKey,
    /// Always use the synthetic `rowid` column
    Rowid,
}

impl std::str::FromStr for RowIdentityStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "primary_key" | "pk" => Ok(RowIdentityStrategy::PrimaryKey),
            "rowid" => Ok(RowIdentityStrategy::Rowid),
            _ => Err(format!(
                "Unknown row identity strategy: {}. Valid options: primary_key, rowid",
                s
            )),
        }
    }
}

/// Per-association overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationSettings {
    /// Extra join predicate; `A` aliases the source table, `B` the destination
    pub restriction: Option<String>,
    /// Exclude the association from traversal
    pub disabled: bool,
}

/// Complete configuration of a subsetting run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsetConfig {
    /// Target dialect of the generated script
    pub dialect: SqlDialect,
    /// Working table placement
    pub scope: WorkingTableScope,
    /// Schema holding the working table (GLOBAL scope)
    pub working_table_schema: Option<String>,
    /// Export worker count
    pub threads: usize,
    /// Rows per generated statement
    pub entities_per_statement: usize,
    /// Render inserts as upserts
    pub upsert_only: bool,
    /// Ignore dependencies: one arbitrary order, no wave barriers
    pub no_sorting: bool,
    /// Single worker, single read snapshot
    pub transactional: bool,
    /// Row identity strategy
    pub row_identity: RowIdentityStrategy,
    /// Source schema -> target schema; the empty key maps the default schema
    pub schema_mapping: BTreeMap<String, String>,
    /// Values for `${name}` placeholders in conditions
    pub parameters: BTreeMap<String, String>,
    /// Round guard for the traversal
    pub max_rounds: u32,
    /// Optional entity-count guard for the traversal
    pub max_entities: Option<u64>,
    /// Follow inverse (parent -> child) associations
    pub follow_children: bool,
    /// Per-association overrides keyed by association name
    pub associations: BTreeMap<String, AssociationSettings>,
    /// Associations preferred (and allowed) as cycle-breaking edges
    pub deferrable: Vec<String>,
}

impl Default for SubsetConfig {
    fn default() -> Self {
        Self {
            dialect: SqlDialect::default(),
            scope: WorkingTableScope::default(),
            working_table_schema: None,
            threads: 1,
            entities_per_statement: 10,
            upsert_only: false,
            no_sorting: false,
            transactional: false,
            row_identity: RowIdentityStrategy::default(),
            schema_mapping: BTreeMap::new(),
            parameters: BTreeMap::new(),
            max_rounds: 1000,
            max_entities: None,
            follow_children: true,
            associations: BTreeMap::new(),
            deferrable: Vec::new(),
        }
    }
}

impl SubsetConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| SubsetError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SubsetConfig =
            serde_yaml_ng::from_str(yaml).map_err(|e| SubsetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(SubsetError::Config("threads must be at least 1".into()));
        }
        if self.entities_per_statement == 0 {
            return Err(SubsetError::Config(
                "entities_per_statement must be at least 1".into(),
            ));
        }
        if self.max_rounds == 0 {
            return Err(SubsetError::Config("max_rounds must be at least 1".into()));
        }
        Ok(())
    }

    /// Worker count actually used by the export
    pub fn effective_threads(&self) -> usize {
        if self.transactional {
            1
        } else {
            self.threads.max(1)
        }
    }

    /// Settings for a named association, if any
    pub fn association(&self, name: &str) -> Option<&AssociationSettings> {
        self.associations.get(name).or_else(|| {
            let lower = name.to_lowercase();
            self.associations
                .iter()
                .find(|(k, _)| k.to_lowercase() == lower)
                .map(|(_, v)| v)
        })
    }

    /// Target schema for a source schema (`""` is the default schema)
    pub fn target_schema(&self, source_schema: &str) -> Option<&str> {
        self.schema_mapping
            .get(source_schema)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}
