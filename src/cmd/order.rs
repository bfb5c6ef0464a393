//! Order command - print the export order for every table of a schema.

use crate::config::SubsetConfig;
use crate::logging::{self, Profile};
use crate::resolver::{DependencyResolver, ExportPlan};
use crate::schema::{parse_schema, AssociationGraph, TableId};
use ahash::AHashMap;
use anyhow::{bail, Context, Result};
use serde_json::json;
use std::fs;
use std::path::PathBuf;

/// Run the order command
pub fn run(schema: PathBuf, config: Option<PathBuf>, json: bool, verbose: bool) -> Result<()> {
    logging::init(Profile::Development, verbose);

    if !schema.exists() {
        bail!("schema file does not exist: {}", schema.display());
    }

    let config = match config {
        Some(ref path) => SubsetConfig::load(path).context("failed to load config")?,
        None => SubsetConfig::default(),
    };

    let ddl = fs::read_to_string(&schema)
        .with_context(|| format!("failed to read schema file {}", schema.display()))?;
    let parsed = parse_schema(&ddl);
    if parsed.is_empty() {
        eprintln!("No tables found in the file.");
        return Ok(());
    }

    let graph = AssociationGraph::load(&parsed, &config).context("failed to load associations")?;
    let all: Vec<TableId> = graph.tables().iter().map(|t| t.id).collect();
    let plan = DependencyResolver::new(&graph, &config)
        .order(&all, &AHashMap::new())
        .context("failed to order tables")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan_json(&graph, &plan))?);
        return Ok(());
    }

    let names = |ids: &[TableId]| -> Vec<String> {
        ids.iter().map(|t| graph.table(*t).name.clone()).collect()
    };

    println!("Insert order ({} tables):", plan.insert_order.len());
    for (i, name) in names(&plan.insert_order).iter().enumerate() {
        println!("  {}. {}", i + 1, name);
    }

    println!("\nInsert waves:");
    for (i, wave) in plan.insert_waves.iter().enumerate() {
        println!("  {}: {}", i + 1, names(wave).join(", "));
    }

    println!("\nDelete order:");
    for (i, name) in names(&plan.delete_order).iter().enumerate() {
        println!("  {}. {}", i + 1, name);
    }

    if plan.cycle_plan.is_empty() {
        println!("\nNo dependency cycles.");
    } else {
        println!("\nDeferred foreign keys:");
        for entry in &plan.cycle_plan.entries {
            println!(
                "  {}({}) via {} [{}]",
                graph.table(entry.table).name,
                entry.columns.join(", "),
                graph.association(entry.association).name,
                entry.pass
            );
        }
    }

    Ok(())
}

fn plan_json(graph: &AssociationGraph, plan: &ExportPlan) -> serde_json::Value {
    let names = |ids: &[TableId]| -> Vec<&str> {
        ids.iter().map(|t| graph.table(*t).name.as_str()).collect()
    };

    json!({
        "insert_order": names(&plan.insert_order),
        "delete_order": names(&plan.delete_order),
        "insert_waves": plan.insert_waves.iter().map(|w| names(w)).collect::<Vec<_>>(),
        "delete_waves": plan.delete_waves.iter().map(|w| names(w)).collect::<Vec<_>>(),
        "deferred": plan.cycle_plan.entries.iter().map(|e| json!({
            "table": graph.table(e.table).name,
            "columns": e.columns,
            "association": graph.association(e.association).name,
            "pass": e.pass.to_string(),
        })).collect::<Vec<_>>(),
    })
}
