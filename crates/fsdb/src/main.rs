//! fsdb CLI - filesystem document database.
//!
//! Provides commands for:
//! - `db list|create|destroy`: Manage databases
//! - `get`, `put`, `delete`: Read and edit documents
//! - `changes`: List documents with their winning revisions
//! - `security`: Read or replace the security document
//! - `compact`: Prune revision history and sweep orphaned files

mod commands;
mod context;
mod error;
mod output;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{
    ChangesArgs, CompactArgs, DbCommand, DeleteArgs, GetArgs, PutArgs, SecurityArgs,
};
use context::Context;
use error::CliError;
use output::Output;

/// fsdb - Filesystem document database.
#[derive(Parser)]
#[command(name = "fsdb", version, about)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command.
#[derive(Args)]
pub(crate) struct GlobalArgs {
    /// Path to configuration file (default: auto-discover fsdb.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage root directory (overrides config).
    #[arg(short, long, global = true, env = "FSDB_ROOT")]
    root: Option<PathBuf>,

    /// Revision file format: json, yaml or yml (overrides config).
    #[arg(short, long, global = true)]
    format: Option<String>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Database management commands.
    #[command(subcommand)]
    Db(DbCommand),
    /// Fetch a document.
    Get(GetArgs),
    /// Store a new revision of a document.
    Put(PutArgs),
    /// Delete a document.
    Delete(DeleteArgs),
    /// List documents with their current revisions.
    Changes(ChangesArgs),
    /// Show or replace the security document.
    Security(SecurityArgs),
    /// Compact a database.
    Compact(CompactArgs),
}

fn main() {
    let cli = Cli::parse();
    let output = Output::new();

    // --verbose enables INFO level, otherwise use RUST_LOG or default to WARN
    let filter = if cli.global.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(cli, &output) {
        output.error(&format!("Error: {err}"));
        std::process::exit(1);
    }
}

fn run(cli: Cli, output: &Output) -> Result<(), CliError> {
    let ctx = Context::load(&cli.global)?;
    match cli.command {
        Commands::Db(cmd) => cmd.execute(&ctx, output),
        Commands::Get(args) => args.execute(&ctx, output),
        Commands::Put(args) => args.execute(&ctx, output),
        Commands::Delete(args) => args.execute(&ctx, output),
        Commands::Changes(args) => args.execute(&ctx, output),
        Commands::Security(args) => args.execute(&ctx, output),
        Commands::Compact(args) => args.execute(&ctx, output),
    }
}
