//! Pluggable metadata providers and the registry that resolves them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{AppConfig, ConnectionConfig, SecretSource};
use crate::driver::{DumpCommandBuilder, DumpOptions};
use crate::errors::{ProtectorError, Result};

/// Providers used when the configuration does not list any.
pub const DEFAULT_PROVIDERS: &[&str] = &["default", "database", "git", "env", "file"];

/// Everything a provider may look at while producing its block.
pub struct ProviderContext<'a> {
    pub connection: &'a ConnectionConfig,
    pub options: &'a DumpOptions,
    pub config: &'a AppConfig,
    pub builder: &'a dyn DumpCommandBuilder,
    pub secrets: &'a dyn SecretSource,
    pub dumped_at: DateTime<Utc>,
}

/// Contributes one named block to the `-- meta:` trailer.
pub trait MetadataProvider: Send + Sync {
    /// Top-level key the block is stored under.
    fn key(&self) -> &str;

    fn should_append(&self, _ctx: &ProviderContext<'_>) -> bool {
        true
    }

    fn metadata(&self, ctx: &ProviderContext<'_>) -> Result<Value>;
}

/// Builds a provider from the application configuration.
pub type ProviderFactory =
    Arc<dyn Fn(&AppConfig) -> Result<Box<dyn MetadataProvider>> + Send + Sync>;

pub struct DefaultProvider;

impl MetadataProvider for DefaultProvider {
    fn key(&self) -> &str {
        "default"
    }

    fn metadata(&self, ctx: &ProviderContext<'_>) -> Result<Value> {
        Ok(json!({
            "database": ctx.connection.database,
            "connection": ctx.connection.name,
            "maxPacketLength": ctx.options.max_packet_length,
            "dumpedAtDate": ctx.dumped_at.to_rfc3339_opts(SecondsFormat::Secs, false),
            "dumpData": ctx.options.include_data,
        }))
    }
}

pub struct DatabaseProvider;

impl MetadataProvider for DatabaseProvider {
    fn key(&self) -> &str {
        "database"
    }

    fn metadata(&self, ctx: &ProviderContext<'_>) -> Result<Value> {
        Ok(json!({
            "driver": ctx.builder.driver().as_str(),
            "toolVersion": ctx.builder.tool_version().unwrap_or_default(),
        }))
    }
}

/// Revision of the deployed code. Empty strings outside a git checkout.
pub struct GitProvider {
    work_dir: Option<PathBuf>,
}

impl GitProvider {
    pub fn new(work_dir: Option<PathBuf>) -> Self {
        GitProvider { work_dir }
    }

    fn git(&self, args: &[&str]) -> String {
        let mut cmd = Command::new("git");
        cmd.args(args);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        match cmd.output() {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            }
            Ok(_) => String::new(),
            Err(e) => {
                debug!("git {:?} could not be run: {}", args, e);
                String::new()
            }
        }
    }
}

impl MetadataProvider for GitProvider {
    fn key(&self) -> &str {
        "git"
    }

    fn metadata(&self, _ctx: &ProviderContext<'_>) -> Result<Value> {
        Ok(json!({
            "revision": self.git(&["rev-parse", "HEAD"]),
            "branch": self.git(&["rev-parse", "--abbrev-ref", "HEAD"]),
            "revisionDate": self.git(&["log", "-1", "--format=%cI"]),
        }))
    }
}

/// Free text handed in through an environment variable, stored as a plain string.
pub struct EnvProvider {
    variable: String,
}

impl EnvProvider {
    pub fn new(variable: impl Into<String>) -> Self {
        EnvProvider {
            variable: variable.into(),
        }
    }
}

impl MetadataProvider for EnvProvider {
    fn key(&self) -> &str {
        "env"
    }

    fn should_append(&self, ctx: &ProviderContext<'_>) -> bool {
        !self.variable.is_empty() && ctx.secrets.secret(&self.variable).is_some()
    }

    fn metadata(&self, ctx: &ProviderContext<'_>) -> Result<Value> {
        Ok(Value::String(
            ctx.secrets.secret(&self.variable).unwrap_or_default(),
        ))
    }
}

/// Contents of an external JSON file, e.g. a build manifest written by CI.
pub struct JsonFileProvider {
    path: Option<PathBuf>,
}

impl JsonFileProvider {
    pub fn new(path: Option<PathBuf>) -> Self {
        JsonFileProvider { path }
    }
}

impl MetadataProvider for JsonFileProvider {
    fn key(&self) -> &str {
        "file"
    }

    fn should_append(&self, _ctx: &ProviderContext<'_>) -> bool {
        self.path.as_ref().is_some_and(|p| p.is_file())
    }

    fn metadata(&self, _ctx: &ProviderContext<'_>) -> Result<Value> {
        let Some(path) = &self.path else {
            return Ok(Value::Null);
        };
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Maps configured provider identifiers to factories.
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        ProviderRegistry {
            factories: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("default", |_| Ok(Box::new(DefaultProvider)));
        registry.register("database", |_| Ok(Box::new(DatabaseProvider)));
        registry.register("git", |_| Ok(Box::new(GitProvider::new(None))));
        registry.register("env", |config| {
            Ok(Box::new(EnvProvider::new(
                config.protector.env_metadata_key.clone(),
            )))
        });
        registry.register("file", |config| {
            Ok(Box::new(JsonFileProvider::new(
                config.protector.json_metadata_file.clone(),
            )))
        });
        registry
    }

    /// Registers (or replaces) the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&AppConfig) -> Result<Box<dyn MetadataProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Instantiates the providers named in `names`, in order.
    ///
    /// Unknown names, failing factories and providers without a key are
    /// rejected here rather than skipped later.
    pub fn resolve(&self, names: &[String], config: &AppConfig) -> Result<MetadataCollector> {
        let mut providers = Vec::with_capacity(names.len());
        for name in names {
            let factory = self
                .factories
                .get(name)
                .ok_or_else(|| ProtectorError::InvalidMetadataProvider(name.clone()))?;
            let provider = factory(config).map_err(|e| {
                ProtectorError::InvalidMetadataProvider(format!("{}: {}", name, e))
            })?;
            if provider.key().trim().is_empty() {
                return Err(ProtectorError::InvalidMetadataProvider(format!(
                    "{}: empty metadata key",
                    name
                )));
            }
            providers.push(provider);
        }
        Ok(MetadataCollector { providers })
    }
}

/// Resolved, ordered provider list.
pub struct MetadataCollector {
    providers: Vec<Box<dyn MetadataProvider>>,
}

impl MetadataCollector {
    pub fn keys(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.key()).collect()
    }

    /// Runs every provider that wants to append and merges the blocks.
    ///
    /// A later provider writing an already present key merges into it field
    /// by field (later fields win); non-object values are replaced.
    pub fn collect(&self, ctx: &ProviderContext<'_>) -> Result<Map<String, Value>> {
        let mut merged = Map::new();
        for provider in &self.providers {
            if !provider.should_append(ctx) {
                debug!("Metadata provider '{}' skipped", provider.key());
                continue;
            }
            let block = provider.metadata(ctx)?;
            merge_block(&mut merged, provider.key(), block);
        }
        Ok(merged)
    }
}

fn merge_block(merged: &mut Map<String, Value>, key: &str, block: Value) {
    match (merged.get_mut(key), block) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            if !incoming.is_empty() {
                warn!("Metadata key '{}' written by more than one provider", key);
            }
            for (field, value) in incoming {
                existing.insert(field, value);
            }
        }
        (_, block) => {
            merged.insert(key.to_string(), block);
        }
    }
}
