mod diff;
use diff::run_diff;
mod dump_result;
use dump_result::dump_result;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Structural diff two binary-export artifacts, or inspect a saved result.
#[derive(Clone, Debug, Parser)]
struct Args {
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, Subcommand)]
enum Operation {
    /// Diff two JSON-encoded binary-export artifacts and persist the result.
    Diff(DiffArgs),
    /// Print a human-readable summary of a saved result database.
    DumpResult(DumpResultArgs),
}

#[derive(Clone, Debug, Parser)]
pub struct DiffArgs {
    /// primary (older) artifact, JSON-encoded `BinExport2`
    pub primary: PathBuf,
    /// secondary (newer) artifact, JSON-encoded `BinExport2`
    pub secondary: PathBuf,
    /// result database to create or overwrite
    #[arg(short, long)]
    pub database: PathBuf,
    /// free-text description stored in `metadata.description`
    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Parser)]
pub struct DumpResultArgs {
    /// result database written by `diff`
    pub database: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match &args.operation {
        Operation::Diff(diff_args) => run_diff(diff_args.clone()),
        Operation::DumpResult(dump_args) => dump_result(dump_args.clone()),
    }
}
