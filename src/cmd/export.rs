//! Export command CLI handler.

use crate::cancel::CancellationToken;
use crate::config::{SubsetConfig, WorkingTableScope};
use crate::dialect::SqlDialect;
use crate::entity::{DuckDbStore, EntityGraph, Side};
use crate::export::{
    ExportCoordinator, ExportTargets, FileScriptEnhancer, ScriptEnhancer, ScriptRenderer,
    ScriptType, SqlRenderer,
};
use crate::logging::{self, Profile};
use crate::resolver::DependencyResolver;
use crate::schema::{parse_schema, AssociationGraph};
use crate::session::DuckDbSession;
use crate::traversal::TraversalEngine;
use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

/// Export command options
pub struct ExportOptions {
    pub db: PathBuf,
    pub schema: PathBuf,
    pub table: String,
    pub condition: String,
    pub config: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub delete: Option<PathBuf>,
    pub enhancer_dir: Option<PathBuf>,
    pub threads: Option<usize>,
    pub batch_size: Option<usize>,
    pub dialect: Option<String>,
    pub upsert: bool,
    pub no_sorting: bool,
    pub transactional: bool,
    pub scope: Option<String>,
    pub params: Vec<String>,
    pub progress: bool,
    pub verbose: bool,
    pub dry_run: bool,
    pub json_logs: bool,
}

pub fn run(opts: ExportOptions) -> anyhow::Result<()> {
    let profile = if opts.json_logs {
        Profile::Production
    } else {
        Profile::Development
    };
    logging::init(profile, opts.verbose);

    if !opts.db.exists() {
        bail!("database file does not exist: {}", opts.db.display());
    }

    let config = build_config(&opts)?;
    let start = Instant::now();

    let ddl = fs::read_to_string(&opts.schema)
        .with_context(|| format!("failed to read schema file {}", opts.schema.display()))?;
    let schema = parse_schema(&ddl);
    if schema.is_empty() {
        bail!("no CREATE TABLE statements found in {}", opts.schema.display());
    }
    let graph = AssociationGraph::load(&schema, &config).context("failed to load associations")?;

    let session = DuckDbSession::open(&opts.db)
        .with_context(|| format!("failed to open database {}", opts.db.display()))?;
    let store = DuckDbStore::open(session.connection(), &config)
        .context("failed to create working table")?;
    if opts.verbose {
        eprintln!(
            "Working table: {} (scope: {}, run {})",
            store.table_name(),
            store.scope(),
            store.run_id()
        );
    }

    let entities = EntityGraph::new(&graph, &session, Box::new(store), &config);

    // The working rows belong to this run; only a Global table outlives it.
    let outcome = subset(&opts, &config, &entities, start);
    if let Err(e) = entities.discard() {
        if outcome.is_ok() {
            return Err(e).context("failed to discard working rows");
        }
        tracing::warn!(error = %e, "failed to discard working rows");
    }
    outcome
}

fn subset(
    opts: &ExportOptions,
    config: &SubsetConfig,
    entities: &EntityGraph<'_>,
    start: Instant,
) -> anyhow::Result<()> {
    let graph = entities.graph();
    let cancel = CancellationToken::new();

    // Seed and traverse
    let seeds = entities
        .add_seed_by_name(&opts.table, &opts.condition)
        .context("failed to seed subset")?;
    if seeds == 0 {
        eprintln!(
            "Warning: seed condition matched no rows in '{}'",
            opts.table
        );
    }

    let spinner = if opts.progress {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap(),
        );
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb.set_message("Collecting rows...");
        Some(pb)
    } else {
        None
    };

    let mut engine = TraversalEngine::new(entities).with_cancellation(cancel.clone());
    if let Some(ref pb) = spinner {
        let pb = pb.clone();
        engine = engine.with_progress(move |p| {
            pb.set_message(format!(
                "Round {}: +{} rows ({} total)",
                p.round, p.added, p.total
            ));
        });
    }
    let stats = engine.run().context("traversal failed")?;

    if opts.delete.is_some() {
        entities
            .mark_subset_for_deletion()
            .context("failed to tag subset for deletion")?;
    }

    // Plan
    let touched = entities.planned_tables()?;
    let row_counts = entities.row_counts()?;
    let plan = DependencyResolver::new(graph, config)
        .order(&touched, &row_counts)
        .context("failed to order tables")?;

    if opts.dry_run {
        if let Some(pb) = spinner {
            pb.finish_and_clear();
        }
        eprintln!(
            "Subset: {} rows in {} tables after {} rounds",
            stats.total_entries,
            touched.len(),
            stats.rounds
        );
        eprintln!("\nInsert order:");
        for (i, wave) in plan.insert_waves.iter().enumerate() {
            let names: Vec<String> = wave
                .iter()
                .map(|t| {
                    format!(
                        "{} ({})",
                        graph.table(*t).name,
                        row_counts.get(t).copied().unwrap_or(0)
                    )
                })
                .collect();
            eprintln!("  wave {}: {}", i + 1, names.join(", "));
        }
        for entry in &plan.cycle_plan.entries {
            eprintln!(
                "  deferred: {}.{} via {} ({})",
                graph.table(entry.table).name,
                entry.columns.join(","),
                graph.association(entry.association).name,
                entry.pass
            );
        }
        eprintln!("\nDry run - no scripts written.");
        return Ok(());
    }

    // Export
    let insert_out: Box<dyn Write + Send> = match opts.output {
        Some(ref path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };
    let insert = SqlRenderer::new(insert_out, config, ScriptType::Insert);
    let delete = match opts.delete {
        Some(ref path) => Some(SqlRenderer::new(
            BufWriter::new(
                File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?,
            ),
            config,
            ScriptType::Delete,
        )),
        None => None,
    };
    let enhancer = opts.enhancer_dir.clone().map(FileScriptEnhancer::new);

    let mut targets = ExportTargets::new(&insert);
    if let Some(ref d) = delete {
        targets = targets.with_delete(d as &dyn ScriptRenderer);
    }
    if let Some(ref e) = enhancer {
        targets = targets.with_enhancer(e as &dyn ScriptEnhancer);
    }

    let mut coordinator = ExportCoordinator::new(entities).with_cancellation(cancel);
    if let Some(ref pb) = spinner {
        let pb = pb.clone();
        coordinator = coordinator.with_progress(move |p| {
            pb.set_message(format!("{} {}: {} rows", p.phase, p.table, p.rows));
        });
    }
    let summary = coordinator
        .export(&plan, &targets)
        .context("export failed")?;

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    let elapsed = start.elapsed();
    eprintln!(
        "Exported {} rows from {} tables in {:.3?} ({} statements)",
        summary.rows_written,
        summary.tables_written,
        elapsed,
        insert.statements()
    );
    if opts.delete.is_some() {
        eprintln!(
            "Delete script: {} rows ({} tagged)",
            summary.rows_deleted,
            entities.total(Side::Delete)?
        );
    }
    if summary.rows_deferred > 0 {
        eprintln!(
            "Deferred {} foreign key values to break dependency cycles",
            summary.rows_deferred
        );
    }
    if opts.verbose {
        for s in &summary.table_stats {
            eprintln!("  {:<30} {:<16} {:>8} rows", s.table, s.phase, s.rows);
        }
    }

    Ok(())
}

fn build_config(opts: &ExportOptions) -> anyhow::Result<SubsetConfig> {
    let mut config = match opts.config {
        Some(ref path) => SubsetConfig::load(path).context("failed to load config")?,
        None => SubsetConfig::default(),
    };

    if let Some(t) = opts.threads {
        config.threads = t;
    }
    if let Some(b) = opts.batch_size {
        config.entities_per_statement = b;
    }
    if let Some(ref d) = opts.dialect {
        config.dialect = d
            .parse::<SqlDialect>()
            .map_err(|e| anyhow::anyhow!("{}", e))?;
    }
    if let Some(ref s) = opts.scope {
        config.scope = s
            .parse::<WorkingTableScope>()
            .map_err(|e| anyhow::anyhow!("{}", e))?;
    }
    config.upsert_only |= opts.upsert;
    config.no_sorting |= opts.no_sorting;
    config.transactional |= opts.transactional;

    for param in &opts.params {
        let (name, value) = param
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid parameter '{}', expected NAME=VALUE", param))?;
        config
            .parameters
            .insert(name.trim().to_string(), value.to_string());
    }

    config.validate()?;
    Ok(config)
}
