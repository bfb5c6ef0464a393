// Allow dead code for items that are part of the public API but only used in tests
#![allow(dead_code)]

mod cancel;
mod cmd;
mod config;
mod dialect;
mod entity;
mod error;
mod export;
mod logging;
mod resolver;
mod schema;
mod session;
mod traversal;

use clap::Parser;
use cmd::Cli;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cmd::run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
