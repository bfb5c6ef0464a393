mod export;
mod order;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sql-subsetter")]
#[command(author = "Helge Sverre <helge.sverre@gmail.com>")]
#[command(version)]
#[command(about = "Extract referentially consistent row subsets as ordered SQL scripts", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Export the rows reachable from a seed condition as an insert script
    Export {
        /// Source DuckDB database file
        #[arg(long)]
        db: PathBuf,

        /// DDL file with CREATE TABLE / ALTER TABLE statements of the source
        #[arg(short, long)]
        schema: PathBuf,

        /// Seed table
        #[arg(short, long)]
        table: String,

        /// Seed condition, using alias T for the seed table
        #[arg(short, long = "where", default_value = "1=1")]
        condition: String,

        /// YAML config file (CLI flags override its values)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output file for the insert script (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write a delete script for the subset to this file
        #[arg(long)]
        delete: Option<PathBuf>,

        /// Directory with prolog/epilog enhancement files
        #[arg(long)]
        enhancer_dir: Option<PathBuf>,

        /// Number of export workers
        #[arg(long)]
        threads: Option<usize>,

        /// Rows per generated statement
        #[arg(long)]
        batch_size: Option<usize>,

        /// Target dialect: mysql, postgres, sqlite, mssql
        #[arg(short, long)]
        dialect: Option<String>,

        /// Render inserts as upserts
        #[arg(long)]
        upsert: bool,

        /// Ignore dependencies when ordering tables
        #[arg(long)]
        no_sorting: bool,

        /// Read all rows inside one snapshot on a single worker
        #[arg(long)]
        transactional: bool,

        /// Working table scope: global, session_local, local_database
        #[arg(long)]
        scope: Option<String>,

        /// Parameter for ${name} placeholders, as name=value (repeatable)
        #[arg(short = 'P', long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,

        /// Show progress during traversal and export
        #[arg(short, long)]
        progress: bool,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Run the traversal and print the plan without writing scripts
        #[arg(long)]
        dry_run: bool,

        /// Emit JSON log lines instead of human-readable ones
        #[arg(long)]
        json_logs: bool,
    },

    /// Print insert/delete order, waves and cycle plan for a schema
    Order {
        /// DDL file with CREATE TABLE / ALTER TABLE statements
        schema: PathBuf,

        /// YAML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Export {
            db,
            schema,
            table,
            condition,
            config,
            output,
            delete,
            enhancer_dir,
            threads,
            batch_size,
            dialect,
            upsert,
            no_sorting,
            transactional,
            scope,
            params,
            progress,
            verbose,
            dry_run,
            json_logs,
        } => export::run(export::ExportOptions {
            db,
            schema,
            table,
            condition,
            config,
            output,
            delete,
            enhancer_dir,
            threads,
            batch_size,
            dialect,
            upsert,
            no_sorting,
            transactional,
            scope,
            params,
            progress,
            verbose,
            dry_run,
            json_logs,
        }),
        Commands::Order {
            schema,
            config,
            json,
            verbose,
        } => order::run(schema, config, json, verbose),
        Commands::Completions { shell } => {
            generate(
                shell,
                &mut Cli::command(),
                "sql-subsetter",
                &mut io::stdout(),
            );
            Ok(())
        }
    }
}
