//! The entity graph: the materialized working set of a subsetting run.
//!
//! Entries are `(table, row identity, birthday, parent, association)` records
//! kept on two sides: [`Side::Insert`] holds the subset itself,
//! [`Side::Delete`] holds rows tagged for the delete stream.
//!
//! Storage is pluggable through [`WorkingStore`]:
//! - [`MemoryStore`]: concurrent in-process map
//! - [`DuckDbStore`]: a working table in DuckDB, with GLOBAL, SESSION_LOCAL or
//!   LOCAL_DATABASE placement

mod duckdb_store;
mod row_id;
mod store;

pub use duckdb_store::DuckDbStore;
pub use row_id::{KeyValue, RowId};
pub use store::MemoryStore;

use crate::config::SubsetConfig;
use crate::error::{Result, SubsetError};
use crate::schema::{AssociationGraph, AssociationId, TableId};
use crate::session::{substitute_parameters, JoinSpec, Session};
use ahash::{AHashMap, AHashSet};
use std::collections::VecDeque;
use std::fmt;

/// Sources joined per bulk query
pub const SOURCE_PAGE_SIZE: usize = 500;

/// Entries fetched per cursor page
pub const CURSOR_PAGE_SIZE: usize = 1000;

/// Which stream an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    Insert,
    Delete,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Insert => "INSERT",
            Side::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entity graph entry resolved against the association graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub table: TableId,
    pub row: RowId,
    /// Round in which the entry was discovered; seeds are born in round 0
    pub birthday: u32,
    pub parent: Option<(TableId, RowId)>,
    pub association: Option<AssociationId>,
}

impl Entry {
    pub fn is_seed(&self) -> bool {
        self.parent.is_none()
    }
}

/// Entry as persisted by a [`WorkingStore`], keyed by names and JSON row keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub table: String,
    pub key: String,
    pub birthday: u32,
    pub parent: Option<(String, String)>,
    pub association: Option<String>,
}

/// Restricts a scan to entries born in a given round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub birthday: Option<u32>,
}

impl ScanFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn born_in(round: u32) -> Self {
        Self {
            birthday: Some(round),
        }
    }

    pub fn matches(&self, entry: &StoredEntry) -> bool {
        self.birthday.map_or(true, |b| b == entry.birthday)
    }
}

/// Backing storage of the entity graph.
///
/// Inserts are insert-if-absent keyed by `(side, table, key)`; concurrent
/// callers never duplicate a key.
pub trait WorkingStore: Send + Sync {
    /// Insert entries not yet present; returns how many were newly added
    fn put_all(&self, side: Side, entries: &[StoredEntry]) -> Result<u64>;

    fn contains(&self, side: Side, table: &str, key: &str) -> Result<bool>;

    /// Page through a table's entries in insertion order
    fn scan(
        &self,
        side: Side,
        table: &str,
        filter: ScanFilter,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<StoredEntry>>;

    fn count(&self, side: Side, table: &str, filter: ScanFilter) -> Result<u64>;

    /// Tables with at least one entry on the given side
    fn tables(&self, side: Side) -> Result<Vec<String>>;

    /// Remove every entry of this run
    fn clear(&self) -> Result<()>;
}

/// Persistent, queryable record of the rows that make up the subset.
pub struct EntityGraph<'a> {
    graph: &'a AssociationGraph,
    session: &'a dyn Session,
    store: Box<dyn WorkingStore>,
    config: &'a SubsetConfig,
}

impl<'a> EntityGraph<'a> {
    pub fn new(
        graph: &'a AssociationGraph,
        session: &'a dyn Session,
        store: Box<dyn WorkingStore>,
        config: &'a SubsetConfig,
    ) -> Self {
        Self {
            graph,
            session,
            store,
            config,
        }
    }

    pub fn graph(&self) -> &'a AssociationGraph {
        self.graph
    }

    pub fn session(&self) -> &'a dyn Session {
        self.session
    }

    pub fn config(&self) -> &'a SubsetConfig {
        self.config
    }

    /// Materialize rows of `table` matching `predicate` as round-0 entries.
    ///
    /// The predicate uses alias `T` for the table; `${name}` placeholders are
    /// replaced from the configured parameters.
    pub fn add_seed(&self, table: TableId, predicate: &str) -> Result<u64> {
        let table = self.graph.table(table);
        let predicate = substitute_parameters(predicate, &self.config.parameters)
            .map_err(|message| SubsetError::Query {
                table: table.name.clone(),
                predicate: predicate.to_string(),
                message,
            })?;

        let ids = self.session.select_identities(table, &predicate)?;
        let entries: Vec<StoredEntry> = ids
            .iter()
            .map(|id| StoredEntry {
                table: table.name.clone(),
                key: id.to_key(),
                birthday: 0,
                parent: None,
                association: None,
            })
            .collect();

        let added = self.store.put_all(Side::Insert, &dedupe(entries))?;
        tracing::debug!(table = %table.name, matched = ids.len(), added, "seeded");
        Ok(added)
    }

    /// Seed by table name
    pub fn add_seed_by_name(&self, table: &str, predicate: &str) -> Result<u64> {
        let id = self
            .graph
            .table_by_name(table)
            .map(|t| t.id)
            .ok_or_else(|| SubsetError::Query {
                table: table.to_string(),
                predicate: predicate.to_string(),
                message: "unknown table".to_string(),
            })?;
        self.add_seed(id, predicate)
    }

    /// Join `sources` through `association` and add destination rows not yet
    /// present, born in `round`. Returns the number of new entries.
    pub fn expand(&self, association: AssociationId, sources: &[Entry], round: u32) -> Result<u64> {
        let assoc = self.graph.association(association);
        if assoc.disabled || sources.is_empty() {
            return Ok(0);
        }

        let source = self.graph.table(assoc.source);
        let destination = self.graph.table(assoc.destination);

        let restriction = match &assoc.restriction {
            Some(r) => Some(
                substitute_parameters(r, &self.config.parameters).map_err(|message| {
                    in_expansion(
                        SubsetError::Query {
                            table: destination.name.clone(),
                            predicate: r.clone(),
                            message,
                        },
                        &assoc.name,
                        round,
                    )
                })?,
            ),
            None => None,
        };

        let spec = JoinSpec {
            source,
            destination,
            on: &assoc.join,
            restriction: restriction.as_deref(),
        };

        let mut added = 0u64;
        for page in sources.chunks(SOURCE_PAGE_SIZE) {
            let ids: Vec<RowId> = page
                .iter()
                .filter(|e| e.table == assoc.source)
                .map(|e| e.row.clone())
                .collect();
            if ids.is_empty() {
                continue;
            }

            let pairs = self
                .session
                .join_identities(&spec, &ids)
                .map_err(|e| in_expansion(e, &assoc.name, round))?;
            let entries: Vec<StoredEntry> = pairs
                .into_iter()
                .map(|(src, dst)| StoredEntry {
                    table: destination.name.clone(),
                    key: dst.to_key(),
                    birthday: round,
                    parent: Some((source.name.clone(), src.to_key())),
                    association: Some(assoc.name.clone()),
                })
                .collect();

            added += self.store.put_all(Side::Insert, &dedupe(entries))?;
        }

        tracing::debug!(
            association = %assoc.name,
            sources = sources.len(),
            added,
            round,
            "expanded"
        );
        Ok(added)
    }

    /// Copy entries to the DELETE side
    pub fn mark_for_deletion(&self, entries: &[Entry]) -> Result<u64> {
        let stored: Vec<StoredEntry> = entries.iter().map(|e| self.to_stored(e)).collect();
        self.store.put_all(Side::Delete, &dedupe(stored))
    }

    /// Tag the whole subset for deletion
    pub fn mark_subset_for_deletion(&self) -> Result<u64> {
        let mut marked = 0;
        for table in self.touched_tables()? {
            let mut cursor = self.entries_of(table, Side::Insert);
            loop {
                let page = cursor.next_page()?;
                if page.is_empty() {
                    break;
                }
                marked += self.mark_for_deletion(&page)?;
            }
        }
        Ok(marked)
    }

    /// Lazy, restartable cursor over a table's entries
    pub fn entries_of(&self, table: TableId, side: Side) -> EntryCursor<'_> {
        EntryCursor::new(self, table, side, ScanFilter::all())
    }

    /// Cursor over the entries of a table born in `round`
    pub fn entries_born(&self, table: TableId, round: u32) -> EntryCursor<'_> {
        EntryCursor::new(self, table, Side::Insert, ScanFilter::born_in(round))
    }

    pub fn contains(&self, table: TableId, row: &RowId, side: Side) -> Result<bool> {
        self.store
            .contains(side, &self.graph.table(table).name, &row.to_key())
    }

    pub fn count(&self, table: TableId, side: Side) -> Result<u64> {
        self.store
            .count(side, &self.graph.table(table).name, ScanFilter::all())
    }

    /// Total entries on a side
    pub fn total(&self, side: Side) -> Result<u64> {
        let mut total = 0;
        for name in self.store.tables(side)? {
            total += self.store.count(side, &name, ScanFilter::all())?;
        }
        Ok(total)
    }

    /// Tables holding at least one INSERT entry, in graph order
    pub fn touched_tables(&self) -> Result<Vec<TableId>> {
        self.touched_tables_on(Side::Insert)
    }

    pub fn touched_tables_on(&self, side: Side) -> Result<Vec<TableId>> {
        let names: AHashSet<String> = self
            .store
            .tables(side)?
            .into_iter()
            .map(|n| n.to_lowercase())
            .collect();
        Ok(self
            .graph
            .tables()
            .iter()
            .filter(|t| names.contains(&t.name.to_lowercase()))
            .map(|t| t.id)
            .collect())
    }

    /// Tables with entries on either side, in graph order. These are the
    /// tables an export plan has to cover.
    pub fn planned_tables(&self) -> Result<Vec<TableId>> {
        let insert = self.touched_tables_on(Side::Insert)?;
        let delete = self.touched_tables_on(Side::Delete)?;
        Ok(self
            .graph
            .tables()
            .iter()
            .map(|t| t.id)
            .filter(|id| insert.contains(id) || delete.contains(id))
            .collect())
    }

    /// Entry count per planned table, the larger of its two sides
    pub fn row_counts(&self) -> Result<AHashMap<TableId, u64>> {
        let mut counts = AHashMap::new();
        for table in self.planned_tables()? {
            let rows = self
                .count(table, Side::Insert)?
                .max(self.count(table, Side::Delete)?);
            counts.insert(table, rows);
        }
        Ok(counts)
    }

    /// Drop every entry of this run
    pub fn discard(&self) -> Result<()> {
        self.store.clear()
    }

    fn to_stored(&self, entry: &Entry) -> StoredEntry {
        StoredEntry {
            table: self.graph.table(entry.table).name.clone(),
            key: entry.row.to_key(),
            birthday: entry.birthday,
            parent: entry
                .parent
                .as_ref()
                .map(|(t, r)| (self.graph.table(*t).name.clone(), r.to_key())),
            association: entry
                .association
                .map(|a| self.graph.association(a).name.clone()),
        }
    }

    fn resolve(&self, stored: StoredEntry) -> Result<Entry> {
        let table = self.table_id(&stored.table)?;
        let parent = match stored.parent {
            Some((t, k)) => Some((self.table_id(&t)?, RowId::from_key(&k)?)),
            None => None,
        };
        let association = match stored.association {
            Some(name) => Some(
                self.graph
                    .association_by_name(&name)
                    .map(|a| a.id)
                    .ok_or_else(|| {
                        SubsetError::Store(format!("unknown association '{}' in working set", name))
                    })?,
            ),
            None => None,
        };
        Ok(Entry {
            table,
            row: RowId::from_key(&stored.key)?,
            birthday: stored.birthday,
            parent,
            association,
        })
    }

    fn table_id(&self, name: &str) -> Result<TableId> {
        self.graph
            .table_by_name(name)
            .map(|t| t.id)
            .ok_or_else(|| SubsetError::Store(format!("unknown table '{}' in working set", name)))
    }
}

/// Name the association and round a failing join query belonged to
fn in_expansion(err: SubsetError, association: &str, round: u32) -> SubsetError {
    match err {
        SubsetError::Query {
            table,
            predicate,
            message,
        } => SubsetError::Query {
            table,
            predicate,
            message: format!(
                "expanding association '{}' in round {}: {}",
                association, round, message
            ),
        },
        other => other,
    }
}

/// Keep the first entry per (table, key)
fn dedupe(entries: Vec<StoredEntry>) -> Vec<StoredEntry> {
    let mut seen = AHashSet::with_capacity(entries.len());
    entries
        .into_iter()
        .filter(|e| seen.insert((e.table.to_lowercase(), e.key.clone())))
        .collect()
}

/// Lazy cursor over one table's entries.
///
/// Each page is a fresh store query, so the cursor holds no store resources
/// between pages and can be restarted at any time.
pub struct EntryCursor<'g> {
    graph: &'g EntityGraph<'g>,
    table: String,
    side: Side,
    filter: ScanFilter,
    offset: u64,
    page_size: usize,
    buffer: VecDeque<Entry>,
    exhausted: bool,
}

impl<'g> EntryCursor<'g> {
    fn new(graph: &'g EntityGraph<'g>, table: TableId, side: Side, filter: ScanFilter) -> Self {
        Self {
            table: graph.graph.table(table).name.clone(),
            graph,
            side,
            filter,
            offset: 0,
            page_size: CURSOR_PAGE_SIZE,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Fetch the next page; an empty page means the cursor is exhausted
    pub fn next_page(&mut self) -> Result<Vec<Entry>> {
        if !self.buffer.is_empty() {
            return Ok(self.buffer.drain(..).collect());
        }
        if self.exhausted {
            return Ok(Vec::new());
        }

        let stored = self.graph.store.scan(
            self.side,
            &self.table,
            self.filter,
            self.offset,
            self.page_size,
        )?;
        self.offset += stored.len() as u64;
        if stored.len() < self.page_size {
            self.exhausted = true;
        }

        stored
            .into_iter()
            .map(|s| self.graph.resolve(s))
            .collect()
    }

    /// Rewind to the first entry
    pub fn restart(&mut self) {
        self.offset = 0;
        self.buffer.clear();
        self.exhausted = false;
    }
}

impl Iterator for EntryCursor<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            match self.next_page() {
                Ok(page) => self.buffer.extend(page),
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
