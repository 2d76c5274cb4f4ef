// dbshuttle/src/driver/mysql.rs
use regex::bytes::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use super::{DumpCommandBuilder, DumpOptions, ToolPaths};
use crate::config::{ConnectionConfig, Driver};
use crate::errors::{ProtectorError, Result};
use crate::utils::CommandSpec;

/// `mysqldump` / `mysql` invocations for MySQL and MariaDB servers.
#[derive(Debug, Clone)]
pub struct MySqlCommandBuilder {
    dump_tool: String,
    client_tool: String,
    is_mariadb: bool,
    version: Option<String>,
}

impl MySqlCommandBuilder {
    pub fn new(tools: &ToolPaths, is_mariadb: bool, version: Option<String>) -> Self {
        MySqlCommandBuilder {
            dump_tool: tools.resolve("mysqldump"),
            client_tool: tools.resolve("mysql"),
            is_mariadb,
            version,
        }
    }

    pub fn is_mariadb(&self) -> bool {
        self.is_mariadb
    }

    fn with_credentials(spec: CommandSpec, conn: &ConnectionConfig) -> CommandSpec {
        spec.arg(format!("--host={}", conn.host))
            .arg(format!("--port={}", conn.port))
            .arg(format!("--user={}", conn.username))
            .env("MYSQL_PWD", conn.password.clone())
    }
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

impl DumpCommandBuilder for MySqlCommandBuilder {
    fn driver(&self) -> Driver {
        if self.is_mariadb {
            Driver::Mariadb
        } else {
            Driver::Mysql
        }
    }

    fn tool_binaries(&self) -> Vec<&str> {
        vec![self.dump_tool.as_str(), self.client_tool.as_str()]
    }

    fn dump_command(
        &self,
        conn: &ConnectionConfig,
        options: &DumpOptions,
        destination: &Path,
    ) -> CommandSpec {
        let mut spec = Self::with_credentials(CommandSpec::new(&self.dump_tool), conn)
            .arg("--lock-tables")
            .arg("--routines")
            .arg("--tz-utc");
        // MariaDB's mysqldump does not know this option.
        if !self.is_mariadb {
            spec = spec.arg("--column-statistics=0");
        }
        spec = spec
            .arg(format!("--max-allowed-packet={}", options.max_packet_length))
            .arg(format!("--result-file={}", destination.display()));

        let conditional = [
            (!self.is_mariadb, "--set-gtid-purged=OFF"),
            (!options.include_create_db, "--no-create-db"),
            (!options.include_comments, "--skip-comments"),
            (!options.include_charsets, "--skip-set-charset"),
            (!options.include_data, "--no-data"),
            (!options.include_tablespaces, "--no-tablespaces"),
        ];
        for (enabled, flag) in conditional {
            if enabled {
                spec = spec.arg(flag);
            }
        }

        if options.include_create_db {
            spec = spec.arg("--databases");
        }
        spec.arg(&conn.database)
    }

    fn wipe_command(&self, conn: &ConnectionConfig) -> CommandSpec {
        let db = quote_identifier(&conn.database);
        Self::with_credentials(CommandSpec::new(&self.client_tool), conn).arg(format!(
            "--execute=DROP DATABASE IF EXISTS {db}; CREATE DATABASE {db};"
        ))
    }

    fn load_command(&self, conn: &ConnectionConfig, source: &Path) -> CommandSpec {
        Self::with_credentials(CommandSpec::new(&self.client_tool), conn)
            .arg(&conn.database)
            .stdin_from(source)
    }

    fn post_process(&self, options: &DumpOptions, destination: &Path) -> Result<()> {
        if options.remove_auto_increment_state {
            strip_auto_increment_state(destination)?;
        }
        Ok(())
    }

    // `--databases` makes mysqldump name the source database in a
    // `CREATE DATABASE` and a `USE` statement.
    fn is_database_statement(&self, line: &[u8]) -> bool {
        [&b"CREATE DATABASE "[..], b"USE ", b"/*!40000 DROP DATABASE "]
            .iter()
            .any(|prefix| line.starts_with(prefix))
    }

    fn tool_version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

/// Removes ` AUTO_INCREMENT=<n>` table options so restored tables start counting fresh.
///
/// Works on raw bytes line by line; the dump is never loaded whole.
pub fn strip_auto_increment_state(path: &Path) -> Result<()> {
    let pattern = Regex::new(r" AUTO_INCREMENT=\d+")
        .map_err(|e| ProtectorError::FailedDumpGeneration(e.to_string()))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut reader = BufReader::new(File::open(path)?);
    let tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if line.starts_with(b")") {
                writer.write_all(&pattern.replace_all(&line, &b""[..]))?;
            } else {
                writer.write_all(&line)?;
            }
        }
        writer.flush()?;
    }
    tmp.persist(path).map_err(|e| ProtectorError::Io(e.error))?;
    Ok(())
}
