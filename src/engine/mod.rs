//! The dump lifecycle: create, list, import, flush and fetch dumps for one
//! configured connection.

pub mod selection;

pub use selection::{CandidateFile, ConnectionBuckets, FileSelectionResolver, Selection};

use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ConnectionConfig, SecretSource};
use crate::driver::{self, DumpCommandBuilder, DumpOptions, ToolPaths};
use crate::errors::{ProtectorError, Result};
use crate::metadata::{DumpMetadata, MetadataCodec, ProviderContext, ProviderRegistry};
use crate::remote::RemoteFetcher;
use crate::storage::LocalDisk;
use crate::utils::{CommandSpec, ShellGuard, SubprocessRunner, looks_like_url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unconfigured,
    Configured,
    Dumping,
    Importing,
    Fetching,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Lets an import run although the environment is production.
    pub allow_production: bool,
    /// Runs the configured migration command after a successful load.
    pub run_migrations: bool,
}

/// Orchestrates dumps and restores for one connection at a time.
///
/// Operations take `&mut self`, so an engine only ever has one of them in
/// flight.
pub struct DumpLifecycleEngine {
    config: AppConfig,
    secrets: Arc<dyn SecretSource>,
    registry: ProviderRegistry,
    codec: MetadataCodec,
    runner: SubprocessRunner,
    tools: ToolPaths,
    connection: Option<ConnectionConfig>,
    state: EngineState,
    shell_verified: bool,
    metadata_cache: Option<Map<String, Value>>,
}

impl DumpLifecycleEngine {
    pub fn new(config: AppConfig, secrets: Arc<dyn SecretSource>) -> Self {
        let runner = SubprocessRunner::new(config.protector.shell_timeout);
        let tools = ToolPaths::new(config.protector.tool_paths.clone());
        DumpLifecycleEngine {
            config,
            secrets,
            registry: ProviderRegistry::with_builtins(),
            codec: MetadataCodec::default(),
            runner,
            tools,
            connection: None,
            state: EngineState::Unconfigured,
            shell_verified: false,
            metadata_cache: None,
        }
    }

    /// Replaces the provider registry, e.g. to add application providers.
    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_codec(mut self, codec: MetadataCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn connection(&self) -> Option<&ConnectionConfig> {
        self.connection.as_ref()
    }

    /// Resolves the named connection, or the default one.
    ///
    /// On failure the engine drops back to `Unconfigured` and every later
    /// operation that needs a connection fails with `InvalidConnection`.
    pub fn configure(&mut self, name: Option<&str>) -> Result<&ConnectionConfig> {
        self.metadata_cache = None;
        match self.config.connection(name) {
            Some(conn) => {
                debug!("Configured connection {:?}", conn);
                self.state = EngineState::Configured;
                Ok(self.connection.insert(conn))
            }
            None => {
                self.connection = None;
                self.state = EngineState::Unconfigured;
                let requested = name
                    .map(str::to_string)
                    .or_else(|| self.config.default_connection.clone())
                    .unwrap_or_else(|| "<default>".to_string());
                Err(ProtectorError::InvalidConnection(format!(
                    "Connection '{}' is not configured",
                    requested
                )))
            }
        }
    }

    /// Default dump options with the configured packet limit applied.
    pub fn default_options(&self) -> DumpOptions {
        DumpOptions::default().with_max_packet_length(self.config.protector.max_packet_length)
    }

    pub fn disk(&self) -> LocalDisk {
        self.config.disk()
    }

    /// Base directory relative to the disk, resolved at every call.
    pub fn base_directory(&self) -> String {
        self.config.protector.base_directory.resolve()
    }

    /// Absolute path of `name` inside the base directory.
    pub fn dump_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.disk().path(Path::new(&self.base_directory()).join(name))?)
    }

    fn require_connection(&self) -> Result<ConnectionConfig> {
        self.connection.clone().ok_or_else(|| {
            ProtectorError::InvalidConnection("No connection has been configured".into())
        })
    }

    async fn command_builder(&mut self, conn: &ConnectionConfig) -> Result<Box<dyn DumpCommandBuilder>> {
        let builder = driver::builder_for(conn, &self.tools, &self.runner).await;
        if !self.shell_verified {
            ShellGuard::verify(&self.runner, &builder.tool_binaries()).await?;
            self.shell_verified = true;
        }
        Ok(builder)
    }

    /// Metadata for a dump of the configured connection with `options`.
    ///
    /// Computed on first access and cached for the life of the engine;
    /// `refresh` forces recomputation.
    pub async fn metadata(&mut self, options: &DumpOptions, refresh: bool) -> Result<Map<String, Value>> {
        if let (false, Some(cached)) = (refresh, &self.metadata_cache) {
            return Ok(cached.clone());
        }
        let conn = self.require_connection()?;
        let builder = driver::builder_for(&conn, &self.tools, &self.runner).await;
        let collected = self.collect_metadata(&conn, options, builder.as_ref(), Utc::now())?;
        self.metadata_cache = Some(collected.clone());
        Ok(collected)
    }

    fn collect_metadata(
        &self,
        conn: &ConnectionConfig,
        options: &DumpOptions,
        builder: &dyn DumpCommandBuilder,
        dumped_at: DateTime<Utc>,
    ) -> Result<Map<String, Value>> {
        let collector = self
            .registry
            .resolve(&self.config.protector.metadata_providers, &self.config)?;
        let ctx = ProviderContext {
            connection: conn,
            options,
            config: &self.config,
            builder,
            secrets: self.secrets.as_ref(),
            dumped_at,
        };
        collector.collect(&ctx)
    }

    /// Creates the base directory if needed and returns its absolute path.
    fn destination_directory(&self) -> Result<PathBuf> {
        let base = self.base_directory();
        let failed = |reason: String| ProtectorError::FailedCreatingDestinationPath {
            path: base.clone(),
            reason,
        };
        if looks_like_url(&base) {
            return Err(failed("not a filesystem path".into()));
        }
        let dir = self.disk().path(&base).map_err(|e| failed(e.to_string()))?;
        if dir.exists() && !dir.is_dir() {
            return Err(failed("exists and is not a directory".into()));
        }
        std::fs::create_dir_all(&dir).map_err(|e| failed(e.to_string()))?;
        Ok(dir)
    }

    /// Dumps the configured connection into the base directory.
    pub async fn create_dump(&mut self, file_name: Option<&str>, options: &DumpOptions) -> Result<PathBuf> {
        let conn = self.require_connection()?;
        self.state = EngineState::Dumping;
        let result = self.run_dump(&conn, file_name, options).await;
        self.state = EngineState::Configured;
        result
    }

    async fn run_dump(
        &mut self,
        conn: &ConnectionConfig,
        file_name: Option<&str>,
        options: &DumpOptions,
    ) -> Result<PathBuf> {
        let dir = self.destination_directory()?;
        let name = match file_name {
            Some(name) => name.to_string(),
            None => self.generate_file_name(conn, &dir, Local::now()),
        };
        let destination = dir.join(&name);
        let builder = self.command_builder(conn).await?;

        // Provider setup problems surface before the dump tool runs.
        self.registry
            .resolve(&self.config.protector.metadata_providers, &self.config)?;

        info!(
            "Dumping {} database '{}' to {}",
            builder.driver().as_str(),
            conn.database,
            destination.display()
        );
        let spec = builder.dump_command(conn, options, &destination);
        let output = self.runner.run(&spec).await?;
        if !output.success {
            remove_quietly(&destination);
            return Err(ProtectorError::FailedDumpGeneration(output.failure_summary()));
        }

        let finish = || -> Result<Map<String, Value>> {
            builder.post_process(options, &destination)?;
            let meta = self.collect_metadata(conn, options, builder.as_ref(), Utc::now())?;
            MetadataCodec::append(&destination, &serde_json::to_value(options)?, &Value::Object(meta.clone()))?;
            Ok(meta)
        };
        match finish() {
            Ok(meta) => {
                self.metadata_cache = Some(meta);
                info!("Dump written to {}", destination.display());
                Ok(destination)
            }
            Err(e) => {
                remove_quietly(&destination);
                Err(ProtectorError::FailedDumpGeneration(e.to_string()))
            }
        }
    }

    /// File name from the configured template, disambiguated with `_N`
    /// when the name is already taken in `dir`.
    fn generate_file_name(&self, conn: &ConnectionConfig, dir: &Path, now: DateTime<Local>) -> String {
        let template = &self.config.protector.file_name_template;
        let mut params = vec![
            self.config.app_host(),
            conn.database.clone(),
            conn.name.clone(),
            format!("{:04}", now.year()),
            format!("{:02}", now.month()),
            format!("{:02}", now.day()),
            format!("{:02}", now.hour()),
            format!("{:02}", now.minute()),
            String::new(),
        ];
        let mut attempt = 0u32;
        loop {
            let name = format_template(template, &params);
            if !dir.join(&name).exists() {
                return name;
            }
            attempt += 1;
            params[8] = format!("_{}", attempt);
        }
    }

    /// Replaces the configured database with the contents of `source`.
    ///
    /// The production guard runs before anything else is looked at.
    pub async fn import_dump(&mut self, source: &Path, options: &ImportOptions) -> Result<()> {
        if self.config.is_production() && !options.allow_production {
            return Err(ProtectorError::InvalidEnvironment(self.config.environment.clone()));
        }
        if !source.is_file() {
            return Err(ProtectorError::FileNotFound(source.display().to_string()));
        }
        let conn = self.require_connection()?;

        self.state = EngineState::Importing;
        let result = self.run_import(&conn, source, options).await;
        self.state = EngineState::Configured;
        result
    }

    async fn run_import(&mut self, conn: &ConnectionConfig, source: &Path, options: &ImportOptions) -> Result<()> {
        if let Some(meta) = self.codec.decode(source) {
            match meta.connection() {
                Some(origin) if origin != conn.name => warn!(
                    "{} was dumped from connection '{}', importing into '{}'",
                    source.display(),
                    origin,
                    conn.name
                ),
                _ => {}
            }
        } else {
            debug!("{} carries no dump metadata", source.display());
        }

        let builder = self.command_builder(conn).await?;
        let retargeted = driver::retarget_dump(builder.as_ref(), source)
            .map_err(|e| ProtectorError::FailedImport(e.to_string()))?;

        info!("Wiping database '{}'", conn.database);
        let wipe = builder.wipe_command(conn);
        self.run_step(&wipe, ProtectorError::FailedWipe).await?;

        info!("Importing {} into '{}'", source.display(), conn.database);
        let load = builder.load_command(conn, retargeted.path());
        self.run_step(&load, ProtectorError::FailedImport).await?;

        if options.run_migrations {
            self.run_migrations().await?;
        }
        info!("Import of {} finished", source.display());
        Ok(())
    }

    async fn run_migrations(&self) -> Result<()> {
        let mut parts = self.config.protector.migration_command.iter();
        let Some(program) = parts.next() else {
            return Err(ProtectorError::FailedMigration(
                "No migration command configured".into(),
            ));
        };
        let spec = parts.fold(CommandSpec::new(program), |spec, arg| spec.arg(arg));
        info!("Running migrations: {}", spec.display());
        self.run_step(&spec, ProtectorError::FailedMigration).await
    }

    async fn run_step(&self, spec: &CommandSpec, kind: fn(String) -> ProtectorError) -> Result<()> {
        match self.runner.run(spec).await {
            Ok(output) if output.success => Ok(()),
            Ok(output) => Err(kind(output.failure_summary())),
            Err(e) => Err(kind(e.to_string())),
        }
    }

    /// Newest file in the base directory.
    pub fn get_latest_dump_name(&self) -> Result<PathBuf> {
        let base = self.base_directory();
        let dir = self.disk().path(&base)?;
        if !dir.is_dir() {
            return Err(ProtectorError::FileNotFound(dir.display().to_string()));
        }
        self.disk()
            .files(&base)?
            .into_iter()
            .max_by(|a, b| a.modified.cmp(&b.modified).then_with(|| b.path.cmp(&a.path)))
            .map(|f| f.path)
            .ok_or(ProtectorError::EmptyBaseDirectory(dir))
    }

    /// Deletes every file in the base directory except `exclude`.
    /// Returns how many files were removed.
    pub fn flush(&self, exclude: Option<&Path>) -> Result<usize> {
        let base = self.base_directory();
        if !self.disk().is_directory(&base) {
            return Ok(0);
        }
        let keep = exclude.map(std::path::absolute).transpose()?;
        let mut removed = 0;
        for file in self.disk().files(&base)? {
            if keep.as_deref() == Some(file.path.as_path()) {
                continue;
            }
            std::fs::remove_file(&file.path)?;
            debug!("Removed {}", file.path.display());
            removed += 1;
        }
        info!("Flushed {} file(s) from {}", removed, base);
        Ok(removed)
    }

    pub fn get_dump_metadata(&self, path: &Path) -> Option<DumpMetadata> {
        self.codec.decode(path)
    }

    /// Every file in the base directory along with its decoded trailer.
    pub fn list_candidates(&self) -> Result<Vec<CandidateFile>> {
        let base = self.base_directory();
        if !self.disk().is_directory(&base) {
            return Ok(Vec::new());
        }
        Ok(self
            .disk()
            .files(&base)?
            .into_iter()
            .map(|f| CandidateFile {
                metadata: self.codec.decode(&f.path),
                path: f.path,
                size: f.size,
                modified: f.modified,
            })
            .collect())
    }

    /// Downloads the dump offered by the configured server into the base directory.
    pub async fn get_remote_dump(&mut self) -> Result<PathBuf> {
        let previous = self.state;
        self.state = EngineState::Fetching;
        let base = self.base_directory();
        let disk = self.disk();
        let result = async {
            RemoteFetcher::new(&self.config, self.secrets.as_ref())?
                .fetch(&disk, &base)
                .await
        }
        .await;
        self.state = previous;
        result
    }
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}

/// printf-style formatting restricted to string conversions: `%s` takes the
/// next parameter, `%N$s` the N-th (1-based), `%%` is a literal percent.
/// Missing parameters format as empty strings.
pub fn format_template(template: &str, params: &[String]) -> String {
    let mut out = String::with_capacity(template.len() + 64);
    let mut next = 0usize;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some('s') => {
                chars.next();
                out.push_str(params.get(next).map(String::as_str).unwrap_or_default());
                next += 1;
            }
            Some(d) if d.is_ascii_digit() => {
                let mut lookahead = chars.clone();
                let mut digits = String::new();
                while let Some(d) = lookahead.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(*d);
                    lookahead.next();
                }
                if lookahead.next() == Some('$') && lookahead.next() == Some('s') {
                    let index = digits.parse::<usize>().unwrap_or(0);
                    if let Some(value) = index.checked_sub(1).and_then(|i| params.get(i)) {
                        out.push_str(value);
                    }
                    chars = lookahead;
                } else {
                    out.push('%');
                }
            }
            _ => out.push('%'),
        }
    }
    out
}
