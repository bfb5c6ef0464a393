//! Schema metadata and the association graph derived from it.
//!
//! [`Schema`] is the raw result of reading DDL: relations, their columns, keys
//! and declared references. [`AssociationGraph`] turns the references into the
//! directed associations the subsetting engine walks.

mod ddl;
mod graph;

pub use ddl::*;
pub use graph::*;

use ahash::AHashMap;
use std::fmt;

/// Position of a table in its schema (and in the association graph)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Declared type as written in the DDL, e.g. `VARCHAR(50)`
    pub sql_type: String,
    pub nullable: bool,
    /// Member of the declared primary key
    pub in_key: bool,
}

/// A declared foreign key, by name only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub constraint: Option<String>,
    pub columns: Vec<String>,
    pub target: String,
    pub target_columns: Vec<String>,
}

/// One `CREATE TABLE` plus whatever later statements added to it
#[derive(Debug, Clone)]
pub struct Relation {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<Column>,
    /// Primary key column names, in key order
    pub key: Vec<String>,
    pub references: Vec<Reference>,
    /// Column sets declared unique (constraints and unique indexes)
    pub unique_sets: Vec<Vec<String>>,
}

impl Relation {
    fn new(id: TableId, name: String) -> Self {
        Self {
            id,
            name,
            columns: Vec::new(),
            key: Vec::new(),
            references: Vec::new(),
            unique_sets: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Make `columns` the primary key; key columns are never nullable
    fn set_key(&mut self, columns: Vec<String>) {
        self.key = columns
            .into_iter()
            .map(|name| match self.column_mut(&name) {
                Some(col) => {
                    col.in_key = true;
                    col.nullable = false;
                    col.name.clone()
                }
                None => name,
            })
            .collect();
    }

    /// Whether `columns` (in any order) is the primary key or a declared unique set
    pub fn is_unique(&self, columns: &[String]) -> bool {
        let same = |set: &[String]| {
            set.len() == columns.len()
                && set
                    .iter()
                    .all(|s| columns.iter().any(|c| c.eq_ignore_ascii_case(s)))
        };
        (!self.key.is_empty() && same(&self.key)) || self.unique_sets.iter().any(|u| same(u))
    }
}

/// Relations in declaration order, looked up case-insensitively
#[derive(Debug, Default)]
pub struct Schema {
    relations: Vec<Relation>,
    by_name: AHashMap<String, TableId>,
}

impl Schema {
    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn relation(&self, id: TableId) -> Option<&Relation> {
        self.relations.get(id.0 as usize)
    }

    pub fn relation_by_name(&self, name: &str) -> Option<&Relation> {
        self.by_name
            .get(&name.to_lowercase())
            .and_then(|id| self.relation(*id))
    }

    fn relation_mut(&mut self, name: &str) -> Option<&mut Relation> {
        let id = *self.by_name.get(&name.to_lowercase())?;
        self.relations.get_mut(id.0 as usize)
    }

    /// Register a new relation; a name seen before keeps its first definition
    fn declare(&mut self, name: String) -> Option<&mut Relation> {
        let lower = name.to_lowercase();
        if self.by_name.contains_key(&lower) {
            return None;
        }
        let id = TableId(self.relations.len() as u32);
        self.by_name.insert(lower, id);
        self.relations.push(Relation::new(id, name));
        self.relations.last_mut()
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}
