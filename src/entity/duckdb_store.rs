//! DuckDB-backed working store.
//!
//! All runs share one working table layout keyed by
//! `(run_id, side, table_name, row_key)`. Placement depends on the scope:
//!
//! - GLOBAL: persistent table in the working schema; rows of a run are removed
//!   by [`WorkingStore::clear`], the table itself is kept
//! - SESSION_LOCAL: TEMP table on the session connection, dropped with the store
//! - LOCAL_DATABASE: separate DuckDB file in a temporary directory, removed
//!   with the store

use super::{ScanFilter, Side, StoredEntry, WorkingStore};
use crate::config::{SubsetConfig, WorkingTableScope};
use crate::error::{Result, SubsetError};
use ahash::AHashMap;
use duckdb::Connection;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;

/// Base name of the working table
pub const WORKING_TABLE: &str = "sql_subsetter_entity";

/// Rows per generated INSERT
const INSERT_CHUNK: usize = 500;

pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
    run_id: String,
    scope: WorkingTableScope,
    seq: AtomicU64,
    // Dropped after `conn`
    _temp_dir: Option<TempDir>,
}

impl DuckDbStore {
    /// Open a store for the configured scope on the session connection
    pub fn open(conn: Arc<Mutex<Connection>>, config: &SubsetConfig) -> Result<Self> {
        match config.scope {
            WorkingTableScope::Global => Self::global(conn, config.working_table_schema.as_deref()),
            WorkingTableScope::SessionLocal => Self::session_local(conn),
            WorkingTableScope::LocalDatabase => Self::local_database(),
        }
    }

    /// Persistent working table, optionally in a dedicated schema
    pub fn global(conn: Arc<Mutex<Connection>>, schema: Option<&str>) -> Result<Self> {
        let table = match schema {
            Some(s) => format!("\"{}\".\"{}\"", s, WORKING_TABLE),
            None => format!("\"{}\"", WORKING_TABLE),
        };
        let store = Self::new(conn, table, WorkingTableScope::Global, None);
        {
            let guard = store.lock()?;
            if let Some(s) = schema {
                guard
                    .execute_batch(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", s))
                    .map_err(store_err)?;
            }
            guard
                .execute_batch(&create_table_sql("", &store.table))
                .map_err(store_err)?;
        }
        Ok(store)
    }

    /// TEMP working table on the shared session connection
    pub fn session_local(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        let run_id = new_run_id();
        let table = format!("\"{}_{}\"", WORKING_TABLE, run_id);
        let store = Self::with_run_id(conn, table, WorkingTableScope::SessionLocal, None, run_id);
        store
            .lock()?
            .execute_batch(&create_table_sql("TEMP ", &store.table))
            .map_err(store_err)?;
        Ok(store)
    }

    /// Working table in a private DuckDB file
    pub fn local_database() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("sql-subsetter-")
            .tempdir()
            .map_err(|e| SubsetError::Store(format!("failed to create temp dir: {}", e)))?;
        let path = dir.path().join("working.duckdb");
        let conn = Connection::open(&path).map_err(store_err)?;
        let table = format!("\"{}\"", WORKING_TABLE);
        conn.execute_batch(&create_table_sql("", &table))
            .map_err(store_err)?;
        Ok(Self::new(
            Arc::new(Mutex::new(conn)),
            table,
            WorkingTableScope::LocalDatabase,
            Some(dir),
        ))
    }

    fn new(
        conn: Arc<Mutex<Connection>>,
        table: String,
        scope: WorkingTableScope,
        temp_dir: Option<TempDir>,
    ) -> Self {
        Self::with_run_id(conn, table, scope, temp_dir, new_run_id())
    }

    fn with_run_id(
        conn: Arc<Mutex<Connection>>,
        table: String,
        scope: WorkingTableScope,
        temp_dir: Option<TempDir>,
        run_id: String,
    ) -> Self {
        tracing::debug!(%scope, %run_id, table = %table, "working store opened");
        Self {
            conn,
            table,
            run_id,
            scope,
            seq: AtomicU64::new(0),
            _temp_dir: temp_dir,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn scope(&self) -> WorkingTableScope {
        self.scope
    }

    /// Qualified working table name
    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SubsetError::Store("working store connection poisoned".into()))
    }

    fn run_filter(&self, side: Side, table: &str) -> String {
        format!(
            "run_id = {} AND side = {} AND table_name = {}",
            lit(&self.run_id),
            lit(side.as_str()),
            lit(&table.to_lowercase())
        )
    }

    fn existing_keys(
        &self,
        conn: &Connection,
        side: Side,
        table: &str,
        keys: &[&str],
    ) -> Result<HashSet<String>> {
        let in_list: Vec<String> = keys.iter().map(|k| lit(k)).collect();
        let sql = format!(
            "SELECT row_key FROM {} WHERE {} AND row_key IN ({})",
            self.table,
            self.run_filter(side, table),
            in_list.join(", ")
        );
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        rows.collect::<std::result::Result<HashSet<_>, _>>()
            .map_err(store_err)
    }
}

impl WorkingStore for DuckDbStore {
    fn put_all(&self, side: Side, entries: &[StoredEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut grouped: AHashMap<String, Vec<&StoredEntry>> = AHashMap::new();
        for entry in entries {
            grouped
                .entry(entry.table.to_lowercase())
                .or_default()
                .push(entry);
        }

        // The lock spans check and insert, so concurrent callers cannot race
        let conn = self.lock()?;
        let mut added = 0u64;

        for (table, group) in grouped {
            for chunk in group.chunks(INSERT_CHUNK) {
                let keys: Vec<&str> = chunk.iter().map(|e| e.key.as_str()).collect();
                let existing = self.existing_keys(&conn, side, &table, &keys)?;

                let mut seen: HashSet<&str> = HashSet::new();
                let fresh: Vec<&&StoredEntry> = chunk
                    .iter()
                    .filter(|e| !existing.contains(&e.key) && seen.insert(e.key.as_str()))
                    .collect();
                if fresh.is_empty() {
                    continue;
                }

                let mut sql = format!("INSERT INTO {} VALUES\n", self.table);
                for (i, e) in fresh.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(",\n");
                    }
                    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                    let (parent_table, parent_key) = match &e.parent {
                        Some((t, k)) => (lit(&t.to_lowercase()), lit(k)),
                        None => ("NULL".to_string(), "NULL".to_string()),
                    };
                    sql.push_str(&format!(
                        "({}, {}, {}, {}, {}, {}, {}, {}, {})",
                        lit(&self.run_id),
                        lit(side.as_str()),
                        lit(&table),
                        lit(&e.key),
                        e.birthday,
                        seq,
                        parent_table,
                        parent_key,
                        e.association.as_deref().map(lit).unwrap_or_else(|| "NULL".into())
                    ));
                }

                conn.execute_batch(&sql).map_err(store_err)?;
                added += fresh.len() as u64;
            }
        }

        Ok(added)
    }

    fn contains(&self, side: Side, table: &str, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        Ok(!self.existing_keys(&conn, side, table, &[key])?.is_empty())
    }

    fn scan(
        &self,
        side: Side,
        table: &str,
        filter: ScanFilter,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<StoredEntry>> {
        let mut sql = format!(
            "SELECT table_name, row_key, birthday, parent_table, parent_key, association FROM {} WHERE {}",
            self.table,
            self.run_filter(side, table)
        );
        if let Some(b) = filter.birthday {
            sql.push_str(&format!(" AND birthday = {}", b));
        }
        sql.push_str(&format!(" ORDER BY seq LIMIT {} OFFSET {}", limit, offset));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| {
                let parent_table: Option<String> = row.get(3)?;
                let parent_key: Option<String> = row.get(4)?;
                Ok(StoredEntry {
                    table: row.get(0)?,
                    key: row.get(1)?,
                    birthday: row.get::<_, i32>(2)? as u32,
                    parent: parent_table.zip(parent_key),
                    association: row.get(5)?,
                })
            })
            .map_err(store_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)
    }

    fn count(&self, side: Side, table: &str, filter: ScanFilter) -> Result<u64> {
        let mut sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            self.table,
            self.run_filter(side, table)
        );
        if let Some(b) = filter.birthday {
            sql.push_str(&format!(" AND birthday = {}", b));
        }
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row(&sql, [], |row| row.get(0))
            .map_err(store_err)?;
        Ok(n as u64)
    }

    fn tables(&self, side: Side) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT table_name FROM {} WHERE run_id = {} AND side = {} ORDER BY table_name",
            self.table,
            lit(&self.run_id),
            lit(side.as_str())
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)
    }

    fn clear(&self) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE run_id = {}",
            self.table,
            lit(&self.run_id)
        );
        self.lock()?.execute_batch(&sql).map_err(store_err)
    }
}

impl Drop for DuckDbStore {
    fn drop(&mut self) {
        if self.scope == WorkingTableScope::SessionLocal {
            if let Ok(conn) = self.conn.lock() {
                let _ = conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", self.table));
            }
        }
    }
}

fn create_table_sql(modifier: &str, table: &str) -> String {
    format!(
        "CREATE {}TABLE IF NOT EXISTS {} (
            run_id VARCHAR NOT NULL,
            side VARCHAR NOT NULL,
            table_name VARCHAR NOT NULL,
            row_key VARCHAR NOT NULL,
            birthday INTEGER NOT NULL,
            seq BIGINT NOT NULL,
            parent_table VARCHAR,
            parent_key VARCHAR,
            association VARCHAR,
            PRIMARY KEY (run_id, side, table_name, row_key)
        )",
        modifier, table
    )
}

/// Random hex id separating independent runs in a shared working table
pub fn new_run_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

fn lit(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn store_err(e: duckdb::Error) -> SubsetError {
    SubsetError::Store(e.to_string())
}
