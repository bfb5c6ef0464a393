//! Association graph built from foreign key metadata.
//!
//! Every foreign key yields two directed associations:
//! - the forward association, FK holder → referenced table (many-to-one)
//! - the inverse association, referenced table → FK holder (one-to-many)
//!
//! The graph is immutable after [`AssociationGraph::load`] and is shared by
//! reference between the traversal, the resolver and export workers.

use super::{Column, Relation, Schema, TableId};
use crate::config::{RowIdentityStrategy, SubsetConfig};
use crate::error::{Result, SubsetError};
use ahash::AHashMap;
use std::collections::HashSet;
use std::fmt;

/// Name of the synthetic row identity column
pub const ROWID_COLUMN: &str = "rowid";

/// Prefix of inverse association names
pub const INVERSE_PREFIX: &str = "inverse-";

/// Unique identifier for an association within the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssociationId(pub u32);

impl fmt::Display for AssociationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssociationId({})", self.0)
    }
}

/// Cardinality hint of an association
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    ManyToOne,
    OneToMany,
    OneToOne,
    ManyToMany,
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cardinality::ManyToOne => write!(f, "many-to-one"),
            Cardinality::OneToMany => write!(f, "one-to-many"),
            Cardinality::OneToOne => write!(f, "one-to-one"),
            Cardinality::ManyToMany => write!(f, "many-to-many"),
        }
    }
}

/// How rows of a table are identified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Explicit primary key columns, in key order
    PrimaryKey(Vec<String>),
    /// Synthetic `rowid` column
    RowId,
}

impl Identity {
    /// Columns selected to build a row identity
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Identity::PrimaryKey(cols) => cols.iter().map(|c| c.as_str()).collect(),
            Identity::RowId => vec![ROWID_COLUMN],
        }
    }
}

/// A table as seen by the subsetting engine
#[derive(Debug, Clone)]
pub struct Table {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<Column>,
    pub identity: Identity,
    /// Associations with this table as source, in graph order
    pub outgoing: Vec<AssociationId>,
    /// Associations with this table as destination, in graph order
    pub incoming: Vec<AssociationId>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Columns identifying a row in generated statements.
    ///
    /// Primary key tables use their key; `rowid` tables have no usable key in
    /// the target and are matched on every column.
    pub fn script_key_columns(&self) -> Vec<&str> {
        match &self.identity {
            Identity::PrimaryKey(cols) => cols.iter().map(|c| c.as_str()).collect(),
            Identity::RowId => self.column_names(),
        }
    }
}

/// A directed, FK-derived edge between two tables
#[derive(Debug, Clone)]
pub struct Association {
    pub id: AssociationId,
    pub name: String,
    pub source: TableId,
    pub destination: TableId,
    /// Join condition as (source column, destination column) pairs
    pub join: Vec<(String, String)>,
    pub cardinality: Cardinality,
    /// Rows of the source must be inserted before rows of the destination
    pub insert_source_first: bool,
    pub restriction: Option<String>,
    pub disabled: bool,
    /// True for parent → child associations
    pub inverse: bool,
    /// Table holding the foreign key columns
    pub dependent: TableId,
    /// Foreign key columns in the dependent table
    pub fk_columns: Vec<String>,
}

impl Association {
    /// Whether traversal follows this association
    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    pub fn is_self_reference(&self) -> bool {
        self.source == self.destination
    }
}

/// Static description of tables and associations.
#[derive(Debug)]
pub struct AssociationGraph {
    tables: Vec<Table>,
    associations: Vec<Association>,
    by_name: AHashMap<String, TableId>,
}

impl AssociationGraph {
    /// Build the graph from parsed schema metadata and configuration overlays.
    pub fn load(schema: &Schema, config: &SubsetConfig) -> Result<Self> {
        let mut tables: Vec<Table> = schema
            .relations()
            .iter()
            .map(|rel| Table {
                id: rel.id,
                name: rel.name.clone(),
                columns: rel.columns.clone(),
                identity: identity_for(rel, config.row_identity),
                outgoing: Vec::new(),
                incoming: Vec::new(),
            })
            .collect();

        let by_name: AHashMap<String, TableId> = tables
            .iter()
            .map(|t| (t.name.to_lowercase(), t.id))
            .collect();

        let mut associations: Vec<Association> = Vec::new();
        let mut used_names: HashSet<String> = HashSet::new();

        for child in schema.relations() {
            for fk in &child.references {
                let parent = schema.relation_by_name(&fk.target).ok_or_else(|| {
                    SubsetError::Schema(format!(
                        "table '{}' has a foreign key to unknown table '{}'",
                        child.name, fk.target
                    ))
                })?;

                let missing: Vec<&str> = fk
                    .columns
                    .iter()
                    .filter(|n| child.column(n).is_none())
                    .map(|n| n.as_str())
                    .collect();
                if !missing.is_empty() {
                    return Err(SubsetError::Schema(format!(
                        "foreign key on '{}' references unknown column(s): {}",
                        child.name,
                        missing.join(", ")
                    )));
                }

                if let Some(missing) = fk
                    .target_columns
                    .iter()
                    .find(|c| parent.column(c).is_none())
                {
                    return Err(SubsetError::Schema(format!(
                        "foreign key on '{}' references unknown column '{}.{}'",
                        child.name, parent.name, missing
                    )));
                }

                if fk.columns.len() != fk.target_columns.len() {
                    return Err(SubsetError::Schema(format!(
                        "foreign key on '{}' has {} column(s) but references {} column(s) of '{}'",
                        child.name,
                        fk.columns.len(),
                        fk.target_columns.len(),
                        parent.name
                    )));
                }

                let base = fk.constraint.clone().unwrap_or_else(|| {
                    format!("fk_{}_{}_{}", child.name, parent.name, fk.columns.join("_"))
                });
                let name = unique_name(base, &mut used_names);

                let unique = child.is_unique(&fk.columns);
                let child_is_junction = is_junction(child);

                let forward_card = if unique {
                    Cardinality::OneToOne
                } else if child_is_junction {
                    Cardinality::ManyToMany
                } else {
                    Cardinality::ManyToOne
                };
                let inverse_card = match forward_card {
                    Cardinality::ManyToOne => Cardinality::OneToMany,
                    other => other,
                };

                let join: Vec<(String, String)> = fk
                    .columns
                    .iter()
                    .cloned()
                    .zip(fk.target_columns.iter().cloned())
                    .collect();

                let forward_id = AssociationId(associations.len() as u32);
                associations.push(Association {
                    id: forward_id,
                    name: name.clone(),
                    source: child.id,
                    destination: parent.id,
                    join: join.clone(),
                    cardinality: forward_card,
                    insert_source_first: false,
                    restriction: None,
                    disabled: false,
                    inverse: false,
                    dependent: child.id,
                    fk_columns: fk.columns.clone(),
                });

                let inverse_name = unique_name(format!("{}{}", INVERSE_PREFIX, name), &mut used_names);
                let inverse_id = AssociationId(associations.len() as u32);
                associations.push(Association {
                    id: inverse_id,
                    name: inverse_name,
                    source: parent.id,
                    destination: child.id,
                    join: join.into_iter().map(|(c, p)| (p, c)).collect(),
                    cardinality: inverse_card,
                    insert_source_first: true,
                    restriction: None,
                    disabled: !config.follow_children,
                    inverse: true,
                    dependent: child.id,
                    fk_columns: fk.columns.clone(),
                });
            }
        }

        for (configured, settings) in &config.associations {
            let assoc = associations
                .iter_mut()
                .find(|a| a.name.eq_ignore_ascii_case(configured))
                .ok_or_else(|| {
                    SubsetError::Schema(format!("unknown association '{}' in configuration", configured))
                })?;
            if settings.restriction.is_some() {
                assoc.restriction = settings.restriction.clone();
            }
            if settings.disabled {
                assoc.disabled = true;
            }
        }

        for configured in &config.deferrable {
            if !associations
                .iter()
                .any(|a| a.name.eq_ignore_ascii_case(configured))
            {
                return Err(SubsetError::Schema(format!(
                    "unknown deferrable association '{}' in configuration",
                    configured
                )));
            }
        }

        for assoc in &associations {
            tables[assoc.source.0 as usize].outgoing.push(assoc.id);
            tables[assoc.destination.0 as usize].incoming.push(assoc.id);
        }

        tracing::debug!(
            tables = tables.len(),
            associations = associations.len(),
            "association graph loaded"
        );

        Ok(Self {
            tables,
            associations,
            by_name,
        })
    }

    /// All tables, in schema order
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn table(&self, id: TableId) -> &Table {
        &self.tables[id.0 as usize]
    }

    /// Look up a table by name (case-insensitive)
    pub fn table_by_name(&self, name: &str) -> Option<&Table> {
        self.by_name
            .get(&name.to_lowercase())
            .map(|id| &self.tables[id.0 as usize])
    }

    /// All associations, in stable graph order
    pub fn associations(&self) -> &[Association] {
        &self.associations
    }

    pub fn association(&self, id: AssociationId) -> &Association {
        &self.associations[id.0 as usize]
    }

    pub fn association_by_name(&self, name: &str) -> Option<&Association> {
        self.associations
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Outgoing associations of a table, in stable order
    pub fn associations_of(&self, table: TableId) -> &[AssociationId] {
        &self.tables[table.0 as usize].outgoing
    }

    /// Associations traversal follows, in stable graph order
    pub fn enabled_associations(&self) -> impl Iterator<Item = &Association> {
        self.associations.iter().filter(|a| a.is_enabled())
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

fn identity_for(relation: &Relation, strategy: RowIdentityStrategy) -> Identity {
    if strategy == RowIdentityStrategy::Rowid || relation.key.is_empty() {
        Identity::RowId
    } else {
        Identity::PrimaryKey(relation.key.clone())
    }
}

/// A junction table links two or more tables and is keyed by its foreign keys
fn is_junction(relation: &Relation) -> bool {
    relation.references.len() >= 2
        && !relation.key.is_empty()
        && relation.key.iter().all(|k| {
            relation
                .references
                .iter()
                .any(|fk| fk.columns.iter().any(|c| c.eq_ignore_ascii_case(k)))
        })
}

fn unique_name(base: String, used: &mut HashSet<String>) -> String {
    let mut name = base.clone();
    let mut n = 2;
    while !used.insert(name.to_lowercase()) {
        name = format!("{}_{}", base, n);
        n += 1;
    }
    name
}
