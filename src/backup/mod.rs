// dbshuttle/src/backup/mod.rs
use anyhow::Result;
use clap::Args;
use dbshuttle::config::{AppConfig, ProcessEnv};
use dbshuttle::DumpLifecycleEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args)]
pub struct ExportArgs {
    #[arg(long, help = "File name inside the base directory (generated when omitted)")]
    pub file: Option<String>,

    #[arg(long, help = "Connection to dump (defaults to the default connection)")]
    pub connection: Option<String>,

    #[arg(long, help = "Dump the schema only")]
    pub no_data: bool,
}

/// Public entry point for the export process.
pub async fn run_export_flow(app_config: AppConfig, args: &ExportArgs) -> Result<PathBuf> {
    let mut engine = DumpLifecycleEngine::new(app_config, Arc::new(ProcessEnv));
    let conn = engine.configure(args.connection.as_deref())?;
    info!("🚀 Exporting connection '{}' ({})", conn.name, conn.database);

    let options = engine.default_options().with_data(!args.no_data);
    let path = engine.create_dump(args.file.as_deref(), &options).await?;

    // Served from the cache the dump just filled.
    let meta = engine.metadata(&options, false).await?;
    let providers: Vec<&str> = meta.keys().map(String::as_str).collect();
    info!("Recorded metadata from providers: {}", providers.join(", "));
    if let Some(dumped_at) = meta.get("default").and_then(|d| d.get("dumpedAtDate")) {
        info!("Dumped at {}", dumped_at);
    }
    Ok(path)
}
