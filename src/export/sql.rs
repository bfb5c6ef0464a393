//! SQL script renderer.

use super::renderer::{Batch, Phase, ScriptRenderer, ScriptType};
use crate::config::SubsetConfig;
use crate::dialect::SqlDialect;
use crate::schema::Table;
use crate::session::Value;
use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard};

/// Renders batches as SQL statements for one dialect.
///
/// Output goes through a mutex so that each call lands as one unit even when
/// several export workers write concurrently.
pub struct SqlRenderer<W: Write + Send> {
    out: Mutex<SqlOutput<W>>,
    dialect: SqlDialect,
    schema: Option<String>,
    script: ScriptType,
}

struct SqlOutput<W> {
    writer: W,
    statements: u64,
}

impl<W: Write + Send> SqlRenderer<W> {
    pub fn new(writer: W, config: &SubsetConfig, script: ScriptType) -> Self {
        Self {
            out: Mutex::new(SqlOutput {
                writer,
                statements: 0,
            }),
            dialect: config.dialect,
            schema: config.target_schema("").map(|s| s.to_string()),
            script,
        }
    }

    /// Number of statements written so far
    pub fn statements(&self) -> u64 {
        self.out.lock().map(|o| o.statements).unwrap_or(0)
    }

    /// Recover the writer
    pub fn into_inner(self) -> io::Result<W> {
        self.out
            .into_inner()
            .map(|o| o.writer)
            .map_err(|_| io::Error::other("renderer output poisoned"))
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, SqlOutput<W>>> {
        self.out
            .lock()
            .map_err(|_| io::Error::other("renderer output poisoned"))
    }

    fn table_name(&self, table: &Table) -> String {
        self.dialect
            .quote_qualified(self.schema.as_deref(), &table.name)
    }

    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.dialect.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn tuple(&self, row: &[Value]) -> String {
        let values: Vec<String> = row.iter().map(|v| literal(v, self.dialect)).collect();
        format!("({})", values.join(", "))
    }

    /// `key = value AND ...` for one row; NULL keys compare with IS NULL
    fn key_match(&self, batch: &Batch, row: &[Value], prefix: &str) -> String {
        batch
            .key_positions()
            .iter()
            .map(|&i| {
                let col = format!("{}{}", prefix, self.dialect.quote_ident(&batch.columns[i]));
                match &row[i] {
                    Value::Null => format!("{} IS NULL", col),
                    v => format!("{} = {}", col, literal(v, self.dialect)),
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// WHERE clause matching every row of the batch
    fn batch_filter(&self, batch: &Batch) -> String {
        let keys = batch.key_positions();
        if keys.len() == 1 && batch.rows.iter().all(|r| !r[keys[0]].is_null()) {
            let values: Vec<String> = batch
                .rows
                .iter()
                .map(|r| literal(&r[keys[0]], self.dialect))
                .collect();
            return format!(
                "{} IN ({})",
                self.dialect.quote_ident(&batch.columns[keys[0]]),
                values.join(", ")
            );
        }
        batch
            .rows
            .iter()
            .map(|r| format!("({})", self.key_match(batch, r, "")))
            .collect::<Vec<_>>()
            .join("\n   OR ")
    }

    fn render_insert(&self, table: &Table, batch: &Batch) -> String {
        let rows: Vec<String> = batch.rows.iter().map(|r| self.tuple(r)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES\n{};\n",
            self.table_name(table),
            self.column_list(&batch.columns),
            rows.join(",\n")
        )
    }

    fn render_upsert(&self, table: &Table, batch: &Batch) -> String {
        let name = self.table_name(table);
        let cols = self.column_list(&batch.columns);
        let rows: Vec<String> = batch.rows.iter().map(|r| self.tuple(r)).collect();
        let updates: Vec<&String> = batch
            .value_positions()
            .into_iter()
            .map(|i| &batch.columns[i])
            .collect();
        let q = |c: &str| self.dialect.quote_ident(c);

        match self.dialect {
            SqlDialect::MySql => {
                if updates.is_empty() {
                    format!("INSERT IGNORE INTO {} ({}) VALUES\n{};\n", name, cols, rows.join(",\n"))
                } else {
                    let set: Vec<String> = updates
                        .iter()
                        .map(|c| format!("{} = VALUES({})", q(c), q(c)))
                        .collect();
                    format!(
                        "INSERT INTO {} ({}) VALUES\n{}\nON DUPLICATE KEY UPDATE {};\n",
                        name,
                        cols,
                        rows.join(",\n"),
                        set.join(", ")
                    )
                }
            }
            SqlDialect::Postgres | SqlDialect::Sqlite => {
                let conflict = if updates.is_empty() {
                    "ON CONFLICT DO NOTHING".to_string()
                } else {
                    let set: Vec<String> = updates
                        .iter()
                        .map(|c| format!("{} = excluded.{}", q(c), q(c)))
                        .collect();
                    format!(
                        "ON CONFLICT ({}) DO UPDATE SET {}",
                        self.column_list(&batch.key_columns),
                        set.join(", ")
                    )
                };
                format!(
                    "INSERT INTO {} ({}) VALUES\n{}\n{};\n",
                    name,
                    cols,
                    rows.join(",\n"),
                    conflict
                )
            }
            SqlDialect::Mssql => {
                let on: Vec<String> = batch
                    .key_columns
                    .iter()
                    .map(|k| format!("T.{} = S.{}", q(k), q(k)))
                    .collect();
                let source_cols: Vec<String> =
                    batch.columns.iter().map(|c| format!("S.{}", q(c))).collect();
                let mut sql = format!(
                    "MERGE INTO {} AS T\nUSING (VALUES\n{}\n) AS S ({})\nON {}\n",
                    name,
                    rows.join(",\n"),
                    cols,
                    on.join(" AND ")
                );
                if !updates.is_empty() {
                    let set: Vec<String> = updates
                        .iter()
                        .map(|c| format!("T.{} = S.{}", q(c), q(c)))
                        .collect();
                    sql.push_str(&format!("WHEN MATCHED THEN UPDATE SET {}\n", set.join(", ")));
                }
                sql.push_str(&format!(
                    "WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});\n",
                    cols,
                    source_cols.join(", ")
                ));
                sql
            }
        }
    }

    fn render_delete(&self, table: &Table, batch: &Batch) -> String {
        format!(
            "DELETE FROM {} WHERE {};\n",
            self.table_name(table),
            self.batch_filter(batch)
        )
    }

    fn render_deferred_update(&self, table: &Table, batch: &Batch) -> String {
        let name = self.table_name(table);
        let mut sql = String::new();
        for row in &batch.rows {
            let set: Vec<String> = batch
                .value_positions()
                .into_iter()
                .map(|i| {
                    format!(
                        "{} = {}",
                        self.dialect.quote_ident(&batch.columns[i]),
                        literal(&row[i], self.dialect)
                    )
                })
                .collect();
            sql.push_str(&format!(
                "UPDATE {} SET {} WHERE {};\n",
                name,
                set.join(", "),
                self.key_match(batch, row, "")
            ));
        }
        sql
    }

    fn render_deferred_reset(&self, table: &Table, batch: &Batch) -> String {
        let set: Vec<String> = batch
            .value_positions()
            .into_iter()
            .map(|i| format!("{} = NULL", self.dialect.quote_ident(&batch.columns[i])))
            .collect();
        format!(
            "UPDATE {} SET {} WHERE {};\n",
            self.table_name(table),
            set.join(", "),
            self.batch_filter(batch)
        )
    }

    fn statement_count(phase: Phase, batch: &Batch) -> u64 {
        match phase {
            Phase::DeferredUpdate => batch.len() as u64,
            _ => 1,
        }
    }
}

impl<W: Write + Send> ScriptRenderer for SqlRenderer<W> {
    fn begin_script(&self) -> io::Result<()> {
        let mut out = self.lock()?;
        let w = &mut out.writer;
        writeln!(w, "-- Generated by sql-subsetter")?;
        writeln!(w, "-- Date: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(w, "-- Dialect: {}", self.dialect)?;
        writeln!(w, "-- Script: {}", self.script)?;
        writeln!(w)?;
        write_dialect_header(w, self.dialect)
    }

    fn begin_table(&self, table: &Table, phase: Phase) -> io::Result<()> {
        let mut out = self.lock()?;
        writeln!(out.writer, "\n-- {}: {}", phase, table.name)
    }

    fn write_batch(&self, table: &Table, phase: Phase, batch: &Batch) -> io::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let sql = match phase {
            Phase::Insert => self.render_insert(table, batch),
            Phase::Upsert => self.render_upsert(table, batch),
            Phase::Delete => self.render_delete(table, batch),
            Phase::DeferredUpdate => self.render_deferred_update(table, batch),
            Phase::DeferredReset => self.render_deferred_reset(table, batch),
        };
        let mut out = self.lock()?;
        out.writer.write_all(sql.as_bytes())?;
        out.statements += Self::statement_count(phase, batch);
        Ok(())
    }

    fn end_table(&self, _table: &Table, _phase: Phase) -> io::Result<()> {
        Ok(())
    }

    fn write_enhancement(&self, text: &str) -> io::Result<()> {
        let mut out = self.lock()?;
        out.writer.write_all(text.as_bytes())?;
        if !text.ends_with('\n') {
            out.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn end_script(&self) -> io::Result<()> {
        let mut out = self.lock()?;
        let statements = out.statements;
        writeln!(out.writer, "\n-- {} statement(s)", statements)?;
        out.writer.flush()
    }
}

/// Session settings for the target; referential checks stay enabled
fn write_dialect_header<W: Write>(writer: &mut W, dialect: SqlDialect) -> io::Result<()> {
    match dialect {
        SqlDialect::MySql => {
            writeln!(writer, "SET NAMES utf8mb4;")?;
        }
        SqlDialect::Postgres => {
            writeln!(writer, "SET client_encoding = 'UTF8';")?;
            writeln!(writer, "SET standard_conforming_strings = on;")?;
        }
        SqlDialect::Sqlite => {
            writeln!(writer, "PRAGMA foreign_keys = ON;")?;
        }
        SqlDialect::Mssql => {
            writeln!(writer, "SET ANSI_NULLS ON;")?;
            writeln!(writer, "SET QUOTED_IDENTIFIER ON;")?;
            writeln!(writer, "SET NOCOUNT ON;")?;
        }
    }
    Ok(())
}

/// Render a value as a SQL literal
pub fn literal(value: &Value, dialect: SqlDialect) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => match dialect {
            SqlDialect::Postgres => if *b { "TRUE" } else { "FALSE" }.to_string(),
            _ => if *b { "1" } else { "0" }.to_string(),
        },
        Value::Int(n) => n.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Float(_) => "NULL".to_string(),
        Value::Numeric(s) => s.clone(),
        Value::Text(s) => match dialect {
            SqlDialect::MySql => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            SqlDialect::Mssql if !s.is_ascii() => format!("N'{}'", s.replace('\'', "''")),
            _ => format!("'{}'", s.replace('\'', "''")),
        },
        Value::Blob(b) => match dialect {
            SqlDialect::MySql | SqlDialect::Sqlite => format!("X'{}'", hex::encode(b)),
            SqlDialect::Postgres => format!("'\\x{}'", hex::encode(b)),
            SqlDialect::Mssql => format!("0x{}", hex::encode(b)),
        },
    }
}
