//! Database dump shuttle
//!
//! Provides the CLI for exporting, importing and serving database dumps

// dbshuttle/src/main.rs
mod backup;
mod restore;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dbshuttle::config::{AppConfig, ProcessEnv};
use dbshuttle::logging::init_logging;
use dbshuttle::server::{self, ServerState};
use dbshuttle::utils::crypto::KeyPair;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;

use backup::ExportArgs;
use restore::{ImportArgs, ImportOutcome};

#[derive(Parser)]
#[command(name = "dbshuttle")]
#[command(about = "Create, move and restore database dumps with provenance metadata")]
#[command(version)]
#[command(long_about = "
dbshuttle - database dumps between environments

Dumps are written by the native client tools (mysqldump / pg_dump) and end
with two trailer lines recording the dump options and where the dump came
from. Imports wipe the target database first and refuse to touch production
unless explicitly allowed.

EXAMPLES:
  dbshuttle export --no-data
  dbshuttle import --latest
  dbshuttle import --remote --flush --force
  dbshuttle serve --bind 0.0.0.0:8080
")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dump a connection into the base directory
    Export(ExportArgs),
    /// Restore a dump into a connection
    Import(ImportArgs),
    /// Serve fresh dumps to remote clients
    Serve(ServeArgs),
    /// Print a new key pair for encrypted transfers
    Keygen,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8080", help = "Address to listen on")]
    bind: SocketAddr,

    #[arg(long, help = "Connection to dump (defaults to the default connection)")]
    connection: Option<String>,
}

#[derive(Args)]
struct GlobalArgs {
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv)"
    )]
    verbose: u8,

    #[arg(short, long, global = true, help = "Suppress all output except errors")]
    quiet: bool,

    #[arg(
        long,
        global = true,
        env = "DBSHUTTLE_CONFIG",
        default_value = "config.json",
        help = "Path to config.json"
    )]
    config: PathBuf,
}

/// Main entry point for the dump tool
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    dotenv::dotenv().ok();
    init_logging(cli.global.verbose, cli.global.quiet)?;
    let config_path = &cli.global.config;

    match cli.command {
        Command::Export(args) => {
            let app_config = load_config(config_path)?;
            let path = backup::run_export_flow(app_config, &args)
                .await
                .context("Export failed")?;
            println!("✅ Dump written to {}", path.display());
        }
        Command::Import(args) => {
            let app_config = load_config(config_path)?;
            match restore::run_import_flow(app_config, &args)
                .await
                .context("Import failed")?
            {
                ImportOutcome::Imported(path) => {
                    println!("✅ Imported {}", path.display());
                }
                ImportOutcome::Cancelled => {
                    println!("ℹ️ Import cancelled, nothing was changed.");
                }
            }
        }
        Command::Serve(args) => {
            let state = ServerState {
                config: Arc::new(load_config(config_path)?),
                secrets: Arc::new(ProcessEnv),
                connection: args.connection,
            };
            server::serve(args.bind, state)
                .await
                .context("Dump server stopped")?;
        }
        Command::Keygen => print_key_pair(),
    }
    Ok(())
}

fn load_config(config_path: &Path) -> Result<AppConfig> {
    let app_config = AppConfig::load_from_json(config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;
    debug!("Environment: {}", app_config.environment);
    Ok(app_config)
}

fn print_key_pair() {
    let keys = KeyPair::generate();
    println!("# Client side (.env of the machine importing dumps)");
    println!("PROTECTOR_PRIVATE_KEY={}", keys.private_key_base64());
    println!();
    println!("# Server side (.env of the machine serving dumps)");
    println!("PROTECTOR_SERVER_PUBLIC_KEY={}", keys.public_key_base64());
}
