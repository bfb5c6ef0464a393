//! DuckDB session.

use super::{JoinSpec, Row, Session, Value, DESTINATION_ALIAS, SEED_ALIAS, SOURCE_ALIAS};
use crate::entity::{KeyValue, RowId};
use crate::error::{Result, SubsetError};
use crate::schema::{Table, ROWID_COLUMN};
use ahash::AHashMap;
use duckdb::types::ValueRef;
use duckdb::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Session over one DuckDB connection.
///
/// The connection is shared behind a mutex so export workers and the working
/// store (GLOBAL and SESSION_LOCAL scopes) can use it from several threads.
#[derive(Clone)]
pub struct DuckDbSession {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbSession {
    /// Open a database file
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            SubsetError::Store(format!("failed to open DuckDB database {}: {}", path.display(), e))
        })?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            SubsetError::Store(format!("failed to create in-memory DuckDB database: {}", e))
        })?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Shared handle to the underlying connection
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Run one or more statements that return nothing
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.lock()?
            .execute_batch(sql)
            .map_err(|e| SubsetError::Store(e.to_string()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SubsetError::Store("session connection poisoned".into()))
    }

    /// Run a query and collect every row as raw values
    fn query(&self, sql: &str) -> std::result::Result<Vec<Vec<Value>>, String> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| "session connection poisoned".to_string())?;
        let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
        let mut rows = stmt.query([]).map_err(|e| e.to_string())?;

        let mut out = Vec::new();
        let mut column_count = 0;
        while let Some(row) = rows.next().map_err(|e| e.to_string())? {
            if column_count == 0 {
                column_count = row.as_ref().column_count();
            }
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(convert_value(row.get_ref(i).map_err(|e| e.to_string())?));
            }
            out.push(values);
        }
        Ok(out)
    }
}

impl Session for DuckDbSession {
    fn select_identities(&self, table: &Table, predicate: &str) -> Result<Vec<RowId>> {
        let id_cols = qualified(SEED_ALIAS, &table.identity.columns());
        let predicate = if predicate.trim().is_empty() {
            "1=1"
        } else {
            predicate
        };
        let sql = format!(
            "SELECT DISTINCT {cols} FROM {table} {alias} WHERE ({predicate}) ORDER BY {cols}",
            cols = id_cols,
            table = quote(&table.name),
            alias = SEED_ALIAS,
            predicate = predicate,
        );
        tracing::trace!(sql = %sql, "select identities");

        let rows = self.query(&sql).map_err(|e| SubsetError::Query {
            table: table.name.clone(),
            predicate: predicate.to_string(),
            message: e,
        })?;
        Ok(rows.into_iter().map(|r| row_id(&r)).collect())
    }

    fn join_identities(&self, spec: &JoinSpec<'_>, sources: &[RowId]) -> Result<Vec<(RowId, RowId)>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }

        let src_cols = spec.source.identity.columns();
        let dst_cols = spec.destination.identity.columns();

        let mut on: Vec<String> = spec
            .on
            .iter()
            .map(|(s, d)| {
                format!(
                    "{}.{} = {}.{}",
                    SOURCE_ALIAS,
                    quote(s),
                    DESTINATION_ALIAS,
                    quote(d)
                )
            })
            .collect();
        if let Some(r) = spec.restriction {
            on.push(format!("({})", r));
        }

        let condition = on.join(" AND ");
        let sql = format!(
            "SELECT DISTINCT {src}, {dst} FROM {source} {a} JOIN {destination} {b} ON {on} WHERE {filter} ORDER BY {src}, {dst}",
            src = qualified(SOURCE_ALIAS, &src_cols),
            dst = qualified(DESTINATION_ALIAS, &dst_cols),
            source = quote(&spec.source.name),
            destination = quote(&spec.destination.name),
            a = SOURCE_ALIAS,
            b = DESTINATION_ALIAS,
            on = condition,
            filter = identity_filter(SOURCE_ALIAS, &src_cols, sources),
        );
        tracing::trace!(sql = %sql, "join identities");

        let rows = self.query(&sql).map_err(|e| SubsetError::Query {
            table: spec.destination.name.clone(),
            predicate: condition.clone(),
            message: e,
        })?;

        let n = src_cols.len();
        Ok(rows
            .into_iter()
            .map(|r| (row_id(&r[..n]), row_id(&r[n..])))
            .collect())
    }

    fn fetch_rows(&self, table: &Table, ids: &[RowId]) -> Result<Vec<Row>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let id_cols = table.identity.columns();
        let value_cols: Vec<&str> = table.column_names();
        let sql = format!(
            "SELECT {}, {} FROM {} {} WHERE {}",
            qualified(SEED_ALIAS, &id_cols),
            qualified(SEED_ALIAS, &value_cols),
            quote(&table.name),
            SEED_ALIAS,
            identity_filter(SEED_ALIAS, &id_cols, ids)
        );

        let rows = self.query(&sql).map_err(|e| SubsetError::Query {
            table: table.name.clone(),
            predicate: String::new(),
            message: e,
        })?;

        let n = id_cols.len();
        let mut by_id: AHashMap<RowId, Vec<Value>> = rows
            .into_iter()
            .map(|mut r| {
                let values = r.split_off(n);
                (row_id(&r), values)
            })
            .collect();

        Ok(ids
            .iter()
            .filter_map(|id| {
                by_id.remove(id).map(|values| Row {
                    id: id.clone(),
                    values,
                })
            })
            .collect())
    }

    fn begin_snapshot(&self) -> Result<()> {
        self.execute_batch("BEGIN TRANSACTION")
    }

    fn end_snapshot(&self) -> Result<()> {
        self.execute_batch("COMMIT")
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Qualified column reference; the `rowid` pseudo-column stays unquoted
fn column_ref(alias: &str, col: &str) -> String {
    if col == ROWID_COLUMN {
        format!("{}.{}", alias, ROWID_COLUMN)
    } else {
        format!("{}.{}", alias, quote(col))
    }
}

fn qualified(alias: &str, cols: &[&str]) -> String {
    cols.iter()
        .map(|c| column_ref(alias, c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// WHERE clause selecting the given identities
fn identity_filter(alias: &str, cols: &[&str], ids: &[RowId]) -> String {
    if cols.len() == 1 {
        let col = column_ref(alias, cols[0]);
        let literals: Vec<String> = ids
            .iter()
            .filter_map(|id| id.values().first())
            .filter(|v| **v != KeyValue::Null)
            .map(|v| v.to_sql_literal())
            .collect();
        let has_null = ids
            .iter()
            .any(|id| id.values().first() == Some(&KeyValue::Null));

        let mut terms = Vec::new();
        if !literals.is_empty() {
            terms.push(format!("{} IN ({})", col, literals.join(", ")));
        }
        if has_null {
            terms.push(format!("{} IS NULL", col));
        }
        if terms.is_empty() {
            return "1=0".to_string();
        }
        return terms.join(" OR ");
    }

    let terms: Vec<String> = ids
        .iter()
        .map(|id| {
            let parts: Vec<String> = cols
                .iter()
                .zip(id.values())
                .map(|(c, v)| match v {
                    KeyValue::Null => format!("{} IS NULL", column_ref(alias, c)),
                    other => format!("{} = {}", column_ref(alias, c), other.to_sql_literal()),
                })
                .collect();
            format!("({})", parts.join(" AND "))
        })
        .collect();
    if terms.is_empty() {
        "1=0".to_string()
    } else {
        terms.join(" OR ")
    }
}

fn row_id(values: &[Value]) -> RowId {
    RowId::new(values.iter().map(key_value))
}

fn key_value(value: &Value) -> KeyValue {
    match value {
        Value::Null => KeyValue::Null,
        Value::Bool(b) => KeyValue::Int(*b as i64),
        Value::Int(n) => KeyValue::Int(*n),
        Value::Float(f) => KeyValue::Text(f.to_string()),
        Value::Numeric(s) | Value::Text(s) => KeyValue::Text(s.clone()),
        Value::Blob(b) => KeyValue::Text(hex::encode(b)),
    }
}

fn convert_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(n) => Value::Int(n as i64),
        ValueRef::SmallInt(n) => Value::Int(n as i64),
        ValueRef::Int(n) => Value::Int(n as i64),
        ValueRef::BigInt(n) => Value::Int(n),
        ValueRef::HugeInt(n) => i64::try_from(n)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Numeric(n.to_string())),
        ValueRef::UTinyInt(n) => Value::Int(n as i64),
        ValueRef::USmallInt(n) => Value::Int(n as i64),
        ValueRef::UInt(n) => Value::Int(n as i64),
        ValueRef::UBigInt(n) => i64::try_from(n)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Numeric(n.to_string())),
        ValueRef::Float(f) => Value::Float(f as f64),
        ValueRef::Double(f) => Value::Float(f),
        ValueRef::Decimal(d) => Value::Numeric(d.to_string()),
        ValueRef::Text(s) => Value::Text(String::from_utf8_lossy(s).to_string()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        ValueRef::Timestamp(_, ts) => {
            // Microseconds since epoch
            let secs = ts.div_euclid(1_000_000);
            let nanos = (ts.rem_euclid(1_000_000) * 1000) as u32;
            match chrono::DateTime::from_timestamp(secs, nanos) {
                Some(dt) => Value::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
                None => Value::Int(ts),
            }
        }
        ValueRef::Date32(days) => {
            // 719163 = days from 0001-01-01 to 1970-01-01
            match chrono::NaiveDate::from_num_days_from_ce_opt(719163 + days) {
                Some(date) => Value::Text(date.format("%Y-%m-%d").to_string()),
                None => Value::Int(days as i64),
            }
        }
        ValueRef::Time64(_, micros) => {
            let secs = (micros / 1_000_000) as u32;
            let nanos = ((micros % 1_000_000) * 1000) as u32;
            match chrono::NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos) {
                Some(time) => Value::Text(time.format("%H:%M:%S%.f").to_string()),
                None => Value::Int(micros),
            }
        }
        other => Value::Text(format!("{:?}", other)),
    }
}
