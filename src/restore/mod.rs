// dbshuttle/src/restore/mod.rs
use anyhow::{Context, Result, bail};
use clap::Args;
use dbshuttle::config::{AppConfig, ProcessEnv};
use dbshuttle::engine::{CandidateFile, FileSelectionResolver, Selection};
use dbshuttle::{DumpLifecycleEngine, ImportOptions, ProtectorError};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Select};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args)]
pub struct ImportArgs {
    #[arg(long, conflicts_with_all = ["file", "remote", "latest"], help = "Dump file name inside the base directory")]
    pub dump: Option<String>,

    #[arg(long, conflicts_with_all = ["remote", "latest"], help = "Path to a dump file anywhere on disk")]
    pub file: Option<PathBuf>,

    #[arg(long, conflicts_with = "latest", help = "Fetch the dump from the configured server first")]
    pub remote: bool,

    #[arg(long, help = "Connection to import into (defaults to the default connection)")]
    pub connection: Option<String>,

    #[arg(long, help = "Allow importing while the environment is production")]
    pub allow_production: bool,

    #[arg(long, help = "Skip the confirmation prompt (needs --dump, --file or --remote)")]
    pub force: bool,

    #[arg(long, help = "Offer dumps taken from any connection, or from none")]
    pub ignore_connection_filter: bool,

    #[arg(long, requires = "remote", help = "Empty the base directory before fetching")]
    pub flush: bool,

    #[arg(long, help = "Use the newest file in the base directory")]
    pub latest: bool,

    #[arg(long, help = "Run the configured migration command after importing")]
    pub migrate: bool,
}

pub enum ImportOutcome {
    Imported(PathBuf),
    Cancelled,
}

/// Public entry point for the import process.
pub async fn run_import_flow(app_config: AppConfig, args: &ImportArgs) -> Result<ImportOutcome> {
    if args.force && args.dump.is_none() && args.file.is_none() && !args.remote {
        bail!("--force requires one of --dump, --file or --remote");
    }
    // Refuse before anything is fetched, listed or prompted for.
    if app_config.is_production() && !args.allow_production {
        return Err(ProtectorError::InvalidEnvironment(app_config.environment.clone()).into());
    }

    let mut engine = DumpLifecycleEngine::new(app_config, Arc::new(ProcessEnv));
    let conn = engine.configure(args.connection.as_deref())?.clone();

    let source = if args.remote {
        if args.flush {
            engine.flush(None)?;
        }
        println!("🔄 Fetching remote dump...");
        engine.get_remote_dump().await?
    } else if let Some(file) = &args.file {
        file.clone()
    } else if let Some(name) = &args.dump {
        engine.dump_path(name)?
    } else if args.latest {
        engine.get_latest_dump_name()?
    } else {
        let candidates = engine.list_candidates()?;
        let total = candidates.len();
        let resolver = FileSelectionResolver::new(conn.name.clone())
            .ignore_connection_filter(args.ignore_connection_filter);
        match resolver.resolve(candidates) {
            Selection::Single(candidate) => candidate.path,
            Selection::Choose(candidates) => match choose(&candidates)? {
                Some(path) => path,
                None => return Ok(ImportOutcome::Cancelled),
            },
            Selection::Empty if total > 0 => bail!(
                "{} file(s) in the base directory, none dumped from connection '{}'. Use --ignore-connection-filter to see them.",
                total,
                conn.name
            ),
            Selection::Empty => {
                return Err(ProtectorError::EmptyBaseDirectory(engine.dump_path("")?).into());
            }
        }
    };

    if !args.force && !confirm(&conn.name, &conn.database, &source)? {
        return Ok(ImportOutcome::Cancelled);
    }

    info!("Importing {} into connection '{}'", source.display(), conn.name);
    let options = ImportOptions {
        allow_production: args.allow_production,
        run_migrations: args.migrate,
    };
    engine.import_dump(&source, &options).await?;
    Ok(ImportOutcome::Imported(source))
}

fn describe(candidate: &CandidateFile) -> String {
    let dumped_at = candidate
        .metadata
        .as_ref()
        .and_then(|m| m.dumped_at())
        .unwrap_or("unknown date");
    let connection = candidate.connection().unwrap_or("no metadata");
    format!(
        "{}  ({}, {}, {})",
        candidate.file_name(),
        format_file_size(candidate.size),
        connection,
        dumped_at
    )
}

fn choose(candidates: &[CandidateFile]) -> Result<Option<PathBuf>> {
    let items: Vec<String> = candidates.iter().map(describe).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Choose the dump to import")
        .items(&items)
        .default(0)
        .interact_opt()
        .context("Failed to read the dump selection")?;
    Ok(selection.map(|i| candidates[i].path.clone()))
}

fn confirm(connection: &str, database: &str, source: &std::path::Path) -> Result<bool> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Wipe database '{}' (connection '{}') and import {}?",
            database,
            connection,
            source.display()
        ))
        .default(false)
        .interact()
        .context("Failed to get user confirmation")
}

fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
