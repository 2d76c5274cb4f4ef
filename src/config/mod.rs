// dbshuttle/src/config/mod.rs
mod value;

pub use value::ConfigValue;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::storage::LocalDisk;

pub const DEFAULT_MAX_PACKET_LENGTH: u64 = 16 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_FILE_NAME_TEMPLATE: &str = "%s_%s_%s_%s-%s-%s_%s-%s%s.sql";
pub const DEFAULT_AUTH_TOKEN_KEY: &str = "PROTECTOR_AUTH_TOKEN";
pub const DEFAULT_PRIVATE_KEY_KEY: &str = "PROTECTOR_PRIVATE_KEY";
pub const DEFAULT_SERVER_TOKEN_KEY: &str = "PROTECTOR_SERVER_TOKEN";
pub const DEFAULT_SERVER_PUBLIC_KEY_KEY: &str = "PROTECTOR_SERVER_PUBLIC_KEY";
pub const DEFAULT_ENV_METADATA_KEY: &str = "PROTECTOR_METADATA";
/// Route middleware entry that switches remote dumps to bearer tokens with encryption.
pub const TOKEN_MIDDLEWARE: &str = "auth:token";

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonConnectionConfig {
    pub driver: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonProtectorConfig {
    pub base_directory: Option<String>,
    pub disk: Option<String>,
    pub max_packet_length: Option<u64>,
    pub server_url: Option<String>,
    pub htaccess_login: Option<String>,
    pub route_middleware: Option<Vec<String>>,
    pub chunk_size: Option<usize>,
    pub metadata_providers: Option<Vec<String>>,
    pub file_name: Option<String>,
    pub env_metadata_key: Option<String>,
    pub json_metadata_file: Option<PathBuf>,
    pub auth_token_key: Option<String>,
    pub private_key_key: Option<String>,
    pub migration_command: Option<Vec<String>>,
    pub shell_timeout_secs: Option<u64>,
    pub http_timeout_secs: Option<u64>,
    pub server_token_key: Option<String>,
    pub server_public_key_key: Option<String>,
    pub tool_paths: Option<HashMap<String, PathBuf>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub environment: Option<String>,
    pub app_url: Option<String>,
    pub default_connection: Option<String>,
    #[serde(default)]
    pub connections: HashMap<String, JsonConnectionConfig>,
    #[serde(default)]
    pub disks: HashMap<String, PathBuf>,
    pub protector: Option<JsonProtectorConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Mysql,
    Mariadb,
    Postgres,
}

impl Driver {
    pub fn is_mysql_family(self) -> bool {
        matches!(self, Driver::Mysql | Driver::Mariadb)
    }

    pub fn default_port(self) -> u16 {
        match self {
            Driver::Mysql | Driver::Mariadb => 3306,
            Driver::Postgres => 5432,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Driver::Mysql => "mysql",
            Driver::Mariadb => "mariadb",
            Driver::Postgres => "pgsql",
        }
    }
}

impl FromStr for Driver {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(Driver::Mysql),
            "mariadb" => Ok(Driver::Mariadb),
            "pgsql" | "postgres" | "postgresql" => Ok(Driver::Postgres),
            other => Err(anyhow::anyhow!(
                "Unsupported database driver '{}'. Expected mysql, mariadb or pgsql.",
                other
            )),
        }
    }
}

/// Snapshot of one named database connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub name: String,
    pub driver: Driver,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

// Keeps the password out of logs and error chains.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"****")
            .field("database", &self.database)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ProtectorConfig {
    pub base_directory: ConfigValue<String>,
    pub disk: String,
    pub max_packet_length: u64,
    pub server_url: String,
    pub htaccess_login: Option<String>,
    pub route_middleware: Vec<String>,
    pub chunk_size: usize,
    pub metadata_providers: Vec<String>,
    pub file_name_template: String,
    pub env_metadata_key: String,
    pub json_metadata_file: Option<PathBuf>,
    pub auth_token_key: String,
    pub private_key_key: String,
    pub migration_command: Vec<String>,
    pub shell_timeout: Duration,
    pub http_timeout: Duration,
    pub server_token_key: String,
    pub server_public_key_key: String,
    pub tool_paths: HashMap<String, PathBuf>,
}

impl ProtectorConfig {
    /// Token mode means bearer tokens on the request and an encrypted body.
    pub fn uses_token_auth(&self) -> bool {
        self.route_middleware.iter().any(|m| m == TOKEN_MIDDLEWARE)
    }

    pub fn uses_htaccess_auth(&self) -> bool {
        self.htaccess_login.as_deref().is_some_and(|l| !l.is_empty())
    }
}

impl Default for ProtectorConfig {
    fn default() -> Self {
        ProtectorConfig {
            base_directory: ConfigValue::Value("protector".to_string()),
            disk: "local".to_string(),
            max_packet_length: DEFAULT_MAX_PACKET_LENGTH,
            server_url: String::new(),
            htaccess_login: None,
            route_middleware: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            metadata_providers: crate::metadata::providers::DEFAULT_PROVIDERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            file_name_template: DEFAULT_FILE_NAME_TEMPLATE.to_string(),
            env_metadata_key: DEFAULT_ENV_METADATA_KEY.to_string(),
            json_metadata_file: None,
            auth_token_key: DEFAULT_AUTH_TOKEN_KEY.to_string(),
            private_key_key: DEFAULT_PRIVATE_KEY_KEY.to_string(),
            migration_command: Vec::new(),
            shell_timeout: Duration::from_secs(3600),
            http_timeout: Duration::from_secs(600),
            server_token_key: DEFAULT_SERVER_TOKEN_KEY.to_string(),
            server_public_key_key: DEFAULT_SERVER_PUBLIC_KEY_KEY.to_string(),
            tool_paths: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: String,
    pub app_url: String,
    pub default_connection: Option<String>,
    pub connections: HashMap<String, ConnectionConfig>,
    pub disks: HashMap<String, PathBuf>,
    pub protector: ProtectorConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig =
            serde_json::from_str(&config_content).with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let mut connections = HashMap::new();
        for (name, conn) in raw.connections {
            let driver: Driver = conn
                .driver
                .parse()
                .with_context(|| format!("Invalid driver for connection '{}'", name))?;
            if conn.database.trim().is_empty() {
                anyhow::bail!("Connection '{}' has an empty database name.", name);
            }
            connections.insert(
                name.clone(),
                ConnectionConfig {
                    name,
                    driver,
                    host: conn.host.unwrap_or_else(|| "127.0.0.1".to_string()),
                    port: conn.port.unwrap_or_else(|| driver.default_port()),
                    username: conn.username.unwrap_or_default(),
                    password: conn.password.unwrap_or_default(),
                    database: conn.database,
                },
            );
        }

        let defaults = ProtectorConfig::default();
        let p = raw.protector.unwrap_or_default();
        let protector = ProtectorConfig {
            base_directory: p
                .base_directory
                .map(ConfigValue::Value)
                .unwrap_or(defaults.base_directory),
            disk: p.disk.unwrap_or(defaults.disk),
            max_packet_length: p.max_packet_length.unwrap_or(defaults.max_packet_length),
            server_url: p.server_url.unwrap_or_default(),
            htaccess_login: p.htaccess_login.filter(|s| !s.is_empty()),
            route_middleware: p.route_middleware.unwrap_or_default(),
            chunk_size: p.chunk_size.filter(|c| *c > 0).unwrap_or(defaults.chunk_size),
            metadata_providers: p.metadata_providers.unwrap_or(defaults.metadata_providers),
            file_name_template: p.file_name.unwrap_or(defaults.file_name_template),
            env_metadata_key: p.env_metadata_key.unwrap_or(defaults.env_metadata_key),
            json_metadata_file: p.json_metadata_file,
            auth_token_key: p.auth_token_key.unwrap_or(defaults.auth_token_key),
            private_key_key: p.private_key_key.unwrap_or(defaults.private_key_key),
            migration_command: p.migration_command.unwrap_or_default(),
            shell_timeout: p
                .shell_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.shell_timeout),
            http_timeout: p
                .http_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            server_token_key: p.server_token_key.unwrap_or(defaults.server_token_key),
            server_public_key_key: p
                .server_public_key_key
                .unwrap_or(defaults.server_public_key_key),
            tool_paths: p.tool_paths.unwrap_or_default(),
        };

        Ok(AppConfig {
            environment: raw.environment.unwrap_or_else(|| "production".to_string()),
            app_url: raw.app_url.unwrap_or_else(|| "http://localhost".to_string()),
            default_connection: raw.default_connection,
            connections,
            disks: raw.disks,
            protector,
        })
    }

    /// Looks up the named connection, or the default one when no name is given.
    pub fn connection(&self, name: Option<&str>) -> Option<ConnectionConfig> {
        let name = name.or(self.default_connection.as_deref())?;
        self.connections.get(name).cloned()
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Host part of `app_url`, used in generated dump file names.
    pub fn app_host(&self) -> String {
        url::Url::parse(&self.app_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.app_url.clone())
    }

    /// Root of the configured storage disk.
    pub fn disk(&self) -> LocalDisk {
        let root = self
            .disks
            .get(&self.protector.disk)
            .cloned()
            .unwrap_or_else(|| PathBuf::from("storage").join("app"));
        LocalDisk::new(root)
    }
}

/// Lookup for secrets that must never live in `config.json`.
pub trait SecretSource: Send + Sync {
    fn secret(&self, key: &str) -> Option<String>;
}

/// Reads secrets from the process environment (and whatever `.env` loaded into it).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl SecretSource for ProcessEnv {
    fn secret(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl SecretSource for HashMap<String, String> {
    fn secret(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> anyhow::Result<RawJsonConfig> {
        Ok(serde_json::from_value(value)?)
    }

    #[test]
    fn test_connections_are_resolved_with_driver_defaults() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(json!({
            "environment": "local",
            "default_connection": "mysql",
            "connections": {
                "mysql": { "driver": "mysql", "database": "shop", "username": "root" },
                "pgsql": { "driver": "postgres", "host": "db", "database": "shop" }
            }
        }))?)?;

        let mysql = config.connection(None).expect("default connection");
        assert_eq!(mysql.name, "mysql");
        assert_eq!(mysql.port, 3306);
        assert_eq!(mysql.host, "127.0.0.1");

        let pgsql = config.connection(Some("pgsql")).expect("named connection");
        assert_eq!(pgsql.driver, Driver::Postgres);
        assert_eq!(pgsql.port, 5432);
        Ok(())
    }

    #[test]
    fn test_unknown_connection_resolves_to_none() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(json!({ "environment": "local" }))?)?;
        assert!(config.connection(None).is_none());
        assert!(config.connection(Some("missing")).is_none());
        Ok(())
    }

    #[test]
    fn test_unsupported_driver_is_rejected() -> anyhow::Result<()> {
        let result = AppConfig::from_raw(raw(json!({
            "connections": { "lite": { "driver": "sqlite", "database": "x" } }
        }))?);
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_environment_defaults_to_production() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(json!({}))?)?;
        assert!(config.is_production());
        Ok(())
    }

    #[test]
    fn test_protector_defaults_and_auth_modes() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(json!({
            "app_url": "https://shop.example.com",
            "protector": {
                "route_middleware": ["auth:token"],
                "chunk_size": 0,
                "htaccess_login": ""
            }
        }))?)?;

        assert_eq!(config.app_host(), "shop.example.com");
        assert_eq!(config.protector.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.protector.uses_token_auth());
        assert!(!config.protector.uses_htaccess_auth());
        assert_eq!(config.protector.base_directory.resolve(), "protector");
        Ok(())
    }

    #[test]
    fn test_password_is_redacted_in_debug_output() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(json!({
            "connections": {
                "mysql": { "driver": "mysql", "database": "shop", "password": "hunter2" }
            }
        }))?)?;
        let conn = config.connection(Some("mysql")).expect("connection");
        assert!(!format!("{:?}", conn).contains("hunter2"));
        Ok(())
    }

    #[test]
    fn test_secret_sources() {
        let mut map = HashMap::new();
        map.insert("TOKEN".to_string(), "abc".to_string());
        map.insert("EMPTY".to_string(), String::new());
        assert_eq!(map.secret("TOKEN").as_deref(), Some("abc"));
        assert_eq!(map.secret("EMPTY"), None);
        assert_eq!(map.secret("MISSING"), None);
    }
}
