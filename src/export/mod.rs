//! Export of a closed entity graph as ordered scripts.
//!
//! Tables are exported wave by wave in resolver order. Tables of one wave run
//! concurrently on a bounded rayon pool; a wave finishes before the next one
//! starts. Deferred FK columns are written as NULL on insert, patched after all
//! inserts, and reset before any delete.

mod enhancer;
mod renderer;
mod sql;

pub use enhancer::{FileScriptEnhancer, ScriptEnhancer};
pub use renderer::{Batch, Phase, ScriptRenderer, ScriptType};
pub use sql::{literal, SqlRenderer};

use crate::cancel::CancellationToken;
use crate::entity::{EntityGraph, Entry, RowId, Side};
use crate::error::{Result, SubsetError};
use crate::resolver::{DeferredColumn, DeferredPass, ExportPlan};
use crate::schema::{Identity, Table, TableId};
use crate::session::{Row, Value};
use ahash::AHashSet;
use rayon::prelude::*;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Where the scripts go
pub struct ExportTargets<'r> {
    pub insert: &'r dyn ScriptRenderer,
    pub delete: Option<&'r dyn ScriptRenderer>,
    pub enhancer: Option<&'r dyn ScriptEnhancer>,
}

impl<'r> ExportTargets<'r> {
    pub fn new(insert: &'r dyn ScriptRenderer) -> Self {
        Self {
            insert,
            delete: None,
            enhancer: None,
        }
    }

    pub fn with_delete(mut self, delete: &'r dyn ScriptRenderer) -> Self {
        self.delete = Some(delete);
        self
    }

    pub fn with_enhancer(mut self, enhancer: &'r dyn ScriptEnhancer) -> Self {
        self.enhancer = Some(enhancer);
        self
    }
}

/// Per-table, per-phase export statistics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TableExportStats {
    pub table: String,
    pub phase: String,
    pub rows: u64,
    pub batches: u64,
}

/// Result of an export
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ExportSummary {
    /// Tables with at least one inserted row
    pub tables_written: usize,
    /// Rows rendered as inserts or upserts
    pub rows_written: u64,
    /// Rows rendered as deletes
    pub rows_deleted: u64,
    /// Rows patched by deferred passes
    pub rows_deferred: u64,
    pub table_stats: Vec<TableExportStats>,
}

/// Reported after every written batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportProgress {
    pub table: String,
    pub phase: Phase,
    pub rows: u64,
}

type ProgressFn = Box<dyn Fn(&ExportProgress) + Send + Sync>;

/// Streams a closed entity graph to script renderers.
pub struct ExportCoordinator<'g> {
    entities: &'g EntityGraph<'g>,
    cancel: CancellationToken,
    progress_fn: Option<ProgressFn>,
    /// Raised once a failing worker has recorded its error
    abort: AtomicBool,
    first_error: Mutex<Option<SubsetError>>,
}

impl<'g> ExportCoordinator<'g> {
    pub fn new(entities: &'g EntityGraph<'g>) -> Self {
        Self {
            entities,
            cancel: CancellationToken::new(),
            progress_fn: None,
            abort: AtomicBool::new(false),
            first_error: Mutex::new(None),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress<F: Fn(&ExportProgress) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.progress_fn = Some(Box::new(f));
        self
    }

    /// Export the entity graph following `plan`.
    ///
    /// With `transactional` set, all reads happen inside one session snapshot
    /// on a single worker.
    pub fn export(&self, plan: &ExportPlan, targets: &ExportTargets<'_>) -> Result<ExportSummary> {
        let config = self.entities.config();
        let session = self.entities.session();

        if config.transactional {
            session.begin_snapshot()?;
        }
        let result = self.export_scripts(plan, targets);
        if config.transactional {
            let ended = session.end_snapshot();
            if result.is_ok() {
                ended?;
            }
        }
        result
    }

    fn export_scripts(&self, plan: &ExportPlan, targets: &ExportTargets<'_>) -> Result<ExportSummary> {
        let config = self.entities.config();
        let threads = config.effective_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("sql-subsetter-export-{}", i))
            .build()
            .map_err(|e| SubsetError::Config(format!("failed to build worker pool: {}", e)))?;

        let mut summary = ExportSummary::default();
        let insert_phase = if config.upsert_only {
            Phase::Upsert
        } else {
            Phase::Insert
        };

        tracing::info!(
            waves = plan.insert_waves.len(),
            threads,
            deferred = plan.cycle_plan.entries.len(),
            "export started"
        );

        self.check_coverage(&plan.insert_waves, Side::Insert)?;
        if targets.delete.is_some() {
            self.check_coverage(&plan.delete_waves, Side::Delete)?;
        }

        // Insert script
        let insert = targets.insert;
        insert.begin_script().map_err(script_error(ScriptType::Insert))?;
        self.enhance_script(targets, insert, ScriptType::Insert, true)?;

        for (i, wave) in plan.insert_waves.iter().enumerate() {
            tracing::debug!(wave = i, tables = wave.len(), "insert wave");
            let stats = self.run_wave(&pool, wave, |table| {
                let nulled = plan.cycle_plan.nulled_on_insert(table);
                self.export_table(table, Side::Insert, insert_phase, insert, targets, &nulled)
            })?;
            for s in stats.into_iter().filter(|s| s.rows > 0) {
                summary.tables_written += 1;
                summary.rows_written += s.rows;
                summary.table_stats.push(s);
            }
        }

        for deferred in plan.cycle_plan.pass(DeferredPass::UpdateAfterInsert) {
            let s = self.export_deferred(deferred, Side::Insert, Phase::DeferredUpdate, insert)?;
            summary.rows_deferred += s.rows;
            if s.rows > 0 {
                summary.table_stats.push(s);
            }
        }

        self.enhance_script(targets, insert, ScriptType::Insert, false)?;
        insert.end_script().map_err(script_error(ScriptType::Insert))?;

        // Delete script
        if let Some(delete) = targets.delete {
            if self.entities.total(Side::Delete)? > 0 {
                delete.begin_script().map_err(script_error(ScriptType::Delete))?;
                self.enhance_script(targets, delete, ScriptType::Delete, true)?;

                for deferred in plan.cycle_plan.pass(DeferredPass::ResetBeforeDelete) {
                    let s = self.export_deferred(deferred, Side::Delete, Phase::DeferredReset, delete)?;
                    if s.rows > 0 {
                        summary.table_stats.push(s);
                    }
                }

                for (i, wave) in plan.delete_waves.iter().enumerate() {
                    tracing::debug!(wave = i, tables = wave.len(), "delete wave");
                    let stats = self.run_wave(&pool, wave, |table| {
                        self.export_table(table, Side::Delete, Phase::Delete, delete, targets, &[])
                    })?;
                    for s in stats.into_iter().filter(|s| s.rows > 0) {
                        summary.rows_deleted += s.rows;
                        summary.table_stats.push(s);
                    }
                }

                self.enhance_script(targets, delete, ScriptType::Delete, false)?;
                delete.end_script().map_err(script_error(ScriptType::Delete))?;
            }
        }

        tracing::info!(
            tables = summary.tables_written,
            rows = summary.rows_written,
            deleted = summary.rows_deleted,
            "export finished"
        );
        Ok(summary)
    }

    /// Export every table of a wave; the first failure stops the others at
    /// their next batch and is returned once the wave has drained
    fn run_wave<F>(
        &self,
        pool: &rayon::ThreadPool,
        wave: &[TableId],
        export: F,
    ) -> Result<Vec<TableExportStats>>
    where
        F: Fn(TableId) -> Result<TableExportStats> + Send + Sync,
    {
        if self.cancel.is_cancelled() {
            return Err(SubsetError::Cancelled {
                stage: "export".to_string(),
            });
        }

        self.abort.store(false, Ordering::SeqCst);
        let stats: Vec<Option<TableExportStats>> = pool.install(|| {
            wave.par_iter()
                .map(|&table| {
                    if self.abort.load(Ordering::SeqCst) {
                        return None;
                    }
                    match export(table) {
                        Ok(s) => Some(s),
                        Err(e) => {
                            self.fail(e);
                            None
                        }
                    }
                })
                .collect()
        });

        let failed = self
            .first_error
            .lock()
            .map_err(|_| SubsetError::Store("export error slot poisoned".into()))?
            .take();
        if let Some(err) = failed {
            return Err(err);
        }
        Ok(stats.into_iter().flatten().collect())
    }

    /// Record the first failure, then stop the other workers.
    ///
    /// The error is stored before `abort` is raised, so a worker that stops
    /// because of the abort always finds the slot taken. A cancellation in the
    /// slot still gives way to a real failure.
    fn fail(&self, err: SubsetError) {
        if let Ok(mut slot) = self.first_error.lock() {
            match *slot {
                None => *slot = Some(err),
                Some(SubsetError::Cancelled { .. })
                    if !matches!(err, SubsetError::Cancelled { .. }) =>
                {
                    *slot = Some(err)
                }
                Some(_) => {}
            }
        }
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Every table holding entries on `side` must appear in `waves`
    fn check_coverage(&self, waves: &[Vec<TableId>], side: Side) -> Result<()> {
        let planned: AHashSet<TableId> = waves.iter().flatten().copied().collect();
        let missing = self
            .entities
            .touched_tables_on(side)?
            .into_iter()
            .find(|t| !planned.contains(t));
        match missing {
            Some(table) => Err(SubsetError::Write {
                table: self.entities.graph().table(table).name.clone(),
                row: None,
                message: format!(
                    "table has {} entries but no place in the export plan",
                    side.as_str()
                ),
            }),
            None => Ok(()),
        }
    }

    fn check_cancelled(&self, table: &Table) -> Result<()> {
        if self.cancel.is_cancelled() || self.abort.load(Ordering::SeqCst) {
            return Err(SubsetError::Cancelled {
                stage: format!("export of table '{}'", table.name),
            });
        }
        Ok(())
    }

    fn export_table(
        &self,
        table_id: TableId,
        side: Side,
        phase: Phase,
        renderer: &dyn ScriptRenderer,
        targets: &ExportTargets<'_>,
        nulled: &[&str],
    ) -> Result<TableExportStats> {
        let graph = self.entities.graph();
        let table = graph.table(table_id);
        let mut stats = TableExportStats {
            table: table.name.clone(),
            phase: phase.to_string(),
            rows: 0,
            batches: 0,
        };

        if self.entities.count(table_id, side)? == 0 {
            return Ok(stats);
        }

        let script = match side {
            Side::Insert => ScriptType::Insert,
            Side::Delete => ScriptType::Delete,
        };
        let write_err = |row: Option<&RowId>, e: io::Error| SubsetError::Write {
            table: table.name.clone(),
            row: row.map(|r| r.to_string()),
            message: e.to_string(),
        };

        if let Some(enhancer) = targets.enhancer {
            if let Some(text) = enhancer.prolog(script, Some(table)).map_err(|e| write_err(None, e))? {
                renderer.write_enhancement(&text).map_err(|e| write_err(None, e))?;
            }
        }
        renderer
            .begin_table(table, phase)
            .map_err(|e| write_err(None, e))?;

        let batch_size = self.entities.config().entities_per_statement;
        let mut cursor = self
            .entities
            .entries_of(table_id, side)
            .with_page_size(batch_size);

        loop {
            self.check_cancelled(table)?;
            let page = cursor.next_page()?;
            if page.is_empty() {
                break;
            }

            let batch = match phase {
                Phase::Delete => self.key_batch(table, &page)?,
                _ => self.row_batch(table, &page, nulled)?,
            };
            renderer
                .write_batch(table, phase, &batch)
                .map_err(|e| write_err(page.first().map(|p| &p.row), e))?;

            stats.rows += batch.len() as u64;
            stats.batches += 1;
            tracing::trace!(table = %table.name, %phase, rows = batch.len(), "batch written");
            self.report(table, phase, stats.rows);
        }

        renderer
            .end_table(table, phase)
            .map_err(|e| write_err(None, e))?;
        if let Some(enhancer) = targets.enhancer {
            if let Some(text) = enhancer.epilog(script, Some(table)).map_err(|e| write_err(None, e))? {
                renderer.write_enhancement(&text).map_err(|e| write_err(None, e))?;
            }
        }

        tracing::debug!(table = %table.name, %phase, rows = stats.rows, "table exported");
        Ok(stats)
    }

    /// Patch or reset the deferred columns of one table
    fn export_deferred(
        &self,
        deferred: &DeferredColumn,
        side: Side,
        phase: Phase,
        renderer: &dyn ScriptRenderer,
    ) -> Result<TableExportStats> {
        let table = self.entities.graph().table(deferred.table);
        let mut stats = TableExportStats {
            table: table.name.clone(),
            phase: phase.to_string(),
            rows: 0,
            batches: 0,
        };
        if self.entities.count(deferred.table, side)? == 0 {
            return Ok(stats);
        }

        let write_err = |row: Option<&RowId>, e: io::Error| SubsetError::Write {
            table: table.name.clone(),
            row: row.map(|r| r.to_string()),
            message: e.to_string(),
        };

        let deferred_cols: Vec<&str> = deferred.columns.iter().map(|c| c.as_str()).collect();
        // Deferred columns hold NULL in the target until patched, so they
        // cannot identify the row
        let key_columns: Vec<String> = table
            .script_key_columns()
            .into_iter()
            .filter(|k| !deferred_cols.iter().any(|d| d.eq_ignore_ascii_case(k)))
            .map(|k| k.to_string())
            .collect();

        let mut columns = key_columns.clone();
        columns.extend(deferred.columns.iter().cloned());

        renderer
            .begin_table(table, phase)
            .map_err(|e| write_err(None, e))?;

        let mut cursor = self
            .entities
            .entries_of(deferred.table, side)
            .with_page_size(self.entities.config().entities_per_statement);

        loop {
            self.check_cancelled(table)?;
            let page = cursor.next_page()?;
            if page.is_empty() {
                break;
            }

            let rows = self.fetch(table, &page)?;
            let positions: Vec<Option<usize>> = columns
                .iter()
                .map(|c| table.columns.iter().position(|tc| tc.name.eq_ignore_ascii_case(c)))
                .collect();
            let keys = key_columns.len();
            let values: Vec<Vec<Value>> = rows
                .iter()
                .map(|r| {
                    positions
                        .iter()
                        .enumerate()
                        .map(|(n, p)| match p {
                            Some(i) if n < keys || phase == Phase::DeferredUpdate => {
                                r.values[*i].clone()
                            }
                            _ => Value::Null,
                        })
                        .collect::<Vec<_>>()
                })
                // Nothing to patch when every deferred value is NULL
                .filter(|v: &Vec<Value>| {
                    phase == Phase::DeferredReset || v[keys..].iter().any(|x| !x.is_null())
                })
                .collect();
            if values.is_empty() {
                continue;
            }

            let batch = Batch {
                columns: columns.clone(),
                key_columns: key_columns.clone(),
                rows: values,
            };
            renderer
                .write_batch(table, phase, &batch)
                .map_err(|e| write_err(page.first().map(|p| &p.row), e))?;
            stats.rows += batch.len() as u64;
            stats.batches += 1;
            self.report(table, phase, stats.rows);
        }

        renderer
            .end_table(table, phase)
            .map_err(|e| write_err(None, e))?;
        Ok(stats)
    }

    /// Full rows in entry order, with deferred columns nulled
    fn row_batch(&self, table: &Table, page: &[Entry], nulled: &[&str]) -> Result<Batch> {
        let rows = self.fetch(table, page)?;
        let nulled_positions: Vec<usize> = table
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| nulled.iter().any(|n| n.eq_ignore_ascii_case(&c.name)))
            .map(|(i, _)| i)
            .collect();

        Ok(Batch {
            columns: table.columns.iter().map(|c| c.name.clone()).collect(),
            key_columns: table
                .script_key_columns()
                .into_iter()
                .map(|c| c.to_string())
                .collect(),
            rows: rows
                .into_iter()
                .map(|mut r| {
                    for &i in &nulled_positions {
                        r.values[i] = Value::Null;
                    }
                    r.values
                })
                .collect(),
        })
    }

    /// Key-only batch for deletes; primary keys come straight from the row
    /// identities, `rowid` tables need their full rows
    fn key_batch(&self, table: &Table, page: &[Entry]) -> Result<Batch> {
        match &table.identity {
            Identity::PrimaryKey(cols) => Ok(Batch {
                columns: cols.clone(),
                key_columns: cols.clone(),
                rows: page
                    .iter()
                    .map(|e| e.row.values().iter().map(Value::from).collect())
                    .collect(),
            }),
            Identity::RowId => {
                let mut batch = self.row_batch(table, page, &[])?;
                batch.key_columns = batch.columns.clone();
                Ok(batch)
            }
        }
    }

    fn fetch(&self, table: &Table, page: &[Entry]) -> Result<Vec<Row>> {
        let ids: Vec<RowId> = page.iter().map(|e| e.row.clone()).collect();
        self.entities.session().fetch_rows(table, &ids)
    }

    fn enhance_script(
        &self,
        targets: &ExportTargets<'_>,
        renderer: &dyn ScriptRenderer,
        script: ScriptType,
        prolog: bool,
    ) -> Result<()> {
        let Some(enhancer) = targets.enhancer else {
            return Ok(());
        };
        let text = if prolog {
            enhancer.prolog(script, None)
        } else {
            enhancer.epilog(script, None)
        }
        .map_err(script_error(script))?;
        if let Some(text) = text {
            renderer.write_enhancement(&text).map_err(script_error(script))?;
        }
        Ok(())
    }

    fn report(&self, table: &Table, phase: Phase, rows: u64) {
        if let Some(ref f) = self.progress_fn {
            f(&ExportProgress {
                table: table.name.clone(),
                phase,
                rows,
            });
        }
    }
}

/// Failure outside any table, attributed to the script being written
fn script_error(script: ScriptType) -> impl Fn(io::Error) -> SubsetError {
    move |e| SubsetError::Write {
        table: format!("<{} script>", script),
        row: None,
        message: e.to_string(),
    }
}
