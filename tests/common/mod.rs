//! Shared fixtures for integration tests.

#![allow(dead_code)]

use sql_subsetter::config::SubsetConfig;
use sql_subsetter::dialect::SqlDialect;
use sql_subsetter::entity::{EntityGraph, MemoryStore};
use sql_subsetter::export::{literal, Batch, Phase, ScriptRenderer};
use sql_subsetter::schema::{parse_schema, AssociationGraph, Schema, Table};
use sql_subsetter::session::{DuckDbSession, Value};
use std::collections::BTreeMap;
use std::io;
use std::sync::Mutex;

/// In-memory DuckDB source plus the association graph of its DDL.
///
/// The DuckDB tables are created without foreign key constraints so cyclic
/// schemas can be loaded; the graph still sees every FK.
pub struct Fixture {
    pub graph: AssociationGraph,
    pub session: DuckDbSession,
    pub config: SubsetConfig,
}

impl Fixture {
    pub fn new(ddl: &str, data: &str) -> Self {
        Self::with_config(ddl, data, SubsetConfig::default())
    }

    pub fn with_config(ddl: &str, data: &str, config: SubsetConfig) -> Self {
        let schema = parse_schema(ddl);
        let session = DuckDbSession::open_in_memory().unwrap();
        session.execute_batch(&plain_tables(&schema)).unwrap();
        if !data.trim().is_empty() {
            session.execute_batch(data).unwrap();
        }
        let graph = AssociationGraph::load(&schema, &config).unwrap();
        Self {
            graph,
            session,
            config,
        }
    }

    /// Entity graph over a fresh in-process store
    pub fn entities(&self) -> EntityGraph<'_> {
        EntityGraph::new(
            &self.graph,
            &self.session,
            Box::new(MemoryStore::new()),
            &self.config,
        )
    }

    pub fn table(&self, name: &str) -> &Table {
        self.graph.table_by_name(name).unwrap()
    }
}

/// CREATE TABLE statements with columns and primary keys only
pub fn plain_tables(schema: &Schema) -> String {
    let mut sql = String::new();
    for table in schema.relations() {
        let cols: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, c.sql_type))
            .collect();
        let pk: Vec<String> = table.key.iter().map(|c| format!("\"{}\"", c)).collect();
        sql.push_str(&format!("CREATE TABLE \"{}\" ({}", table.name, cols.join(", ")));
        if !pk.is_empty() {
            sql.push_str(&format!(", PRIMARY KEY ({})", pk.join(", ")));
        }
        sql.push_str(");\n");
    }
    sql
}

/// Everything a renderer was asked to do, in call order
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    BeginScript,
    BeginTable(String, Phase),
    Batch(String, Phase, Batch),
    EndTable(String, Phase),
    Enhancement(String),
    EndScript,
}

/// Renderer that keeps every call; optionally fails on one table
#[derive(Default)]
pub struct RecordingRenderer {
    pub events: Mutex<Vec<Recorded>>,
    fail_on: Option<String>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(table: &str) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail_on: Some(table.to_string()),
        }
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn batches(&self) -> Vec<(String, Phase, Batch)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Batch(t, p, b) => Some((t, p, b)),
                _ => None,
            })
            .collect()
    }

    /// Tables in the order their first batch arrived
    pub fn table_order(&self, phase: Phase) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for (t, p, _) in self.batches() {
            if p == phase && !order.contains(&t) {
                order.push(t);
            }
        }
        order
    }

    fn push(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl ScriptRenderer for RecordingRenderer {
    fn begin_script(&self) -> io::Result<()> {
        self.push(Recorded::BeginScript);
        Ok(())
    }

    fn begin_table(&self, table: &Table, phase: Phase) -> io::Result<()> {
        self.push(Recorded::BeginTable(table.name.clone(), phase));
        Ok(())
    }

    fn write_batch(&self, table: &Table, phase: Phase, batch: &Batch) -> io::Result<()> {
        if self.fail_on.as_deref() == Some(table.name.as_str()) {
            return Err(io::Error::other("disk full"));
        }
        self.push(Recorded::Batch(table.name.clone(), phase, batch.clone()));
        Ok(())
    }

    fn end_table(&self, table: &Table, phase: Phase) -> io::Result<()> {
        self.push(Recorded::EndTable(table.name.clone(), phase));
        Ok(())
    }

    fn write_enhancement(&self, text: &str) -> io::Result<()> {
        self.push(Recorded::Enhancement(text.to_string()));
        Ok(())
    }

    fn end_script(&self) -> io::Result<()> {
        self.push(Recorded::EndScript);
        Ok(())
    }
}

type TargetRow = BTreeMap<String, String>;

/// In-memory target that enforces every foreign key of the graph on each
/// statement, the way a constrained database would.
pub struct ReplayTarget<'g> {
    graph: &'g AssociationGraph,
    pub rows: BTreeMap<String, Vec<TargetRow>>,
    pub violations: Vec<String>,
}

impl<'g> ReplayTarget<'g> {
    pub fn new(graph: &'g AssociationGraph) -> Self {
        Self {
            graph,
            rows: BTreeMap::new(),
            violations: Vec::new(),
        }
    }

    pub fn total_rows(&self) -> usize {
        self.rows.values().map(|r| r.len()).sum()
    }

    pub fn replay(&mut self, batches: &[(String, Phase, Batch)]) {
        for (table, phase, batch) in batches {
            for values in &batch.rows {
                let row: TargetRow = batch
                    .columns
                    .iter()
                    .zip(values)
                    .map(|(c, v)| (c.to_lowercase(), key_text(v)))
                    .collect();
                match phase {
                    Phase::Insert | Phase::Upsert => self.insert(table, row),
                    Phase::DeferredUpdate | Phase::DeferredReset => {
                        self.update(table, &batch.key_columns, row)
                    }
                    Phase::Delete => self.delete(table, &batch.key_columns, &row),
                }
            }
        }
    }

    fn insert(&mut self, table: &str, row: TargetRow) {
        self.check_outgoing(table, &row);
        self.rows.entry(table.to_string()).or_default().push(row);
    }

    fn update(&mut self, table: &str, keys: &[String], row: TargetRow) {
        self.check_outgoing(table, &row);
        let rows = self.rows.entry(table.to_string()).or_default();
        match rows.iter_mut().find(|r| matches_key(r, keys, &row)) {
            Some(existing) => {
                for (c, v) in row {
                    existing.insert(c, v);
                }
            }
            None => self
                .violations
                .push(format!("update of missing row in {}", table)),
        }
    }

    fn delete(&mut self, table: &str, keys: &[String], row: &TargetRow) {
        let pos = self
            .rows
            .get(table)
            .and_then(|rows| rows.iter().position(|r| matches_key(r, keys, row)));
        let Some(pos) = pos else {
            self.violations
                .push(format!("delete of missing row in {}", table));
            return;
        };
        let removed = self.rows.get_mut(table).unwrap().remove(pos);

        // Any remaining child still pointing at the removed row is a violation
        let graph = self.graph;
        let parent = graph.table_by_name(table).unwrap();
        for assoc in graph.associations() {
            if assoc.inverse || assoc.destination != parent.id {
                continue;
            }
            let child = &graph.table(assoc.source).name;
            let dangling = self.rows.get(child.as_str()).is_some_and(|rows| {
                rows.iter().any(|r| {
                    assoc.join.iter().all(|(c, p)| {
                        let v = r.get(&c.to_lowercase());
                        v.is_some_and(|v| v != "NULL") && v == removed.get(&p.to_lowercase())
                    })
                })
            });
            if dangling {
                self.violations.push(format!(
                    "delete from {} leaves rows in {} dangling ({})",
                    table, child, assoc.name
                ));
            }
        }
    }

    /// Every non-null FK value of `row` must reference an existing parent
    fn check_outgoing(&mut self, table: &str, row: &TargetRow) {
        let graph = self.graph;
        let child = graph.table_by_name(table).unwrap();
        for assoc in graph.associations() {
            if assoc.inverse || assoc.source != child.id {
                continue;
            }
            let fk: Vec<(&String, &String)> = assoc
                .join
                .iter()
                .filter_map(|(c, p)| row.get(&c.to_lowercase()).map(|v| (p, v)))
                .collect();
            if fk.len() != assoc.join.len() || fk.iter().any(|(_, v)| *v == "NULL") {
                continue;
            }
            let parent_name = &graph.table(assoc.destination).name;
            let found = self.rows.get(parent_name.as_str()).is_some_and(|rows| {
                rows.iter()
                    .any(|r| fk.iter().all(|(p, v)| r.get(&p.to_lowercase()) == Some(*v)))
            });
            // Self references may point at the row being inserted
            let self_ref = assoc.is_self_reference()
                && fk.iter().all(|(p, v)| row.get(&p.to_lowercase()) == Some(*v));
            if !found && !self_ref {
                self.violations.push(format!(
                    "{} row references missing {} row ({})",
                    table, parent_name, assoc.name
                ));
            }
        }
    }
}

fn matches_key(r: &TargetRow, keys: &[String], row: &TargetRow) -> bool {
    keys.iter()
        .all(|k| r.get(&k.to_lowercase()) == row.get(&k.to_lowercase()))
}

fn key_text(v: &Value) -> String {
    literal(v, SqlDialect::Postgres)
}
