//! Backend-specific command construction for dumping and restoring.

mod mysql;
mod options;
mod postgres;

pub use mysql::MySqlCommandBuilder;
pub use options::DumpOptions;
pub use postgres::PostgresCommandBuilder;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::{ConnectionConfig, Driver};
use crate::errors::Result;
use crate::utils::{CommandSpec, SubprocessRunner};

/// Turns a connection snapshot and dump options into the exact external
/// invocations for one backend.
pub trait DumpCommandBuilder: Send + Sync {
    fn driver(&self) -> Driver;

    /// Tools that must be on `PATH` before dumping or restoring.
    fn tool_binaries(&self) -> Vec<&str>;

    fn dump_command(
        &self,
        conn: &ConnectionConfig,
        options: &DumpOptions,
        destination: &Path,
    ) -> CommandSpec;

    /// First restore step: leaves an empty database behind.
    fn wipe_command(&self, conn: &ConnectionConfig) -> CommandSpec;

    /// Second restore step: loads `source` into the wiped database.
    fn load_command(&self, conn: &ConnectionConfig, source: &Path) -> CommandSpec;

    /// Rewrites the freshly written dump before the trailer is appended.
    fn post_process(&self, _options: &DumpOptions, _destination: &Path) -> Result<()> {
        Ok(())
    }

    /// Whether `line` creates, drops or switches to a database by name.
    /// Such lines are left out when loading, so a dump always lands in the
    /// connection's own database whatever the source database was called.
    fn is_database_statement(&self, _line: &[u8]) -> bool {
        false
    }

    /// Version string of the dump tool, recorded in metadata.
    fn tool_version(&self) -> Option<&str> {
        None
    }
}

/// Program names or absolute paths for the external tools.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    overrides: HashMap<String, PathBuf>,
}

impl ToolPaths {
    pub fn new(overrides: HashMap<String, PathBuf>) -> Self {
        ToolPaths { overrides }
    }

    pub fn resolve(&self, tool: &str) -> String {
        self.overrides
            .get(tool)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| tool.to_string())
    }
}

/// Picks the builder for `conn`.
///
/// The MariaDB flag decides which `mysqldump` options are passed, and those
/// are options of the local client tool, so the tool's own `--version` wins.
/// The configured driver is used when the tool does not answer.
pub async fn builder_for(
    conn: &ConnectionConfig,
    tools: &ToolPaths,
    runner: &SubprocessRunner,
) -> Box<dyn DumpCommandBuilder> {
    match conn.driver {
        Driver::Mysql | Driver::Mariadb => {
            let dump_tool = tools.resolve("mysqldump");
            let version = tool_version(runner, &dump_tool).await;
            let is_mariadb = match version.as_deref() {
                Some(v) => v.to_ascii_lowercase().contains("mariadb"),
                None => conn.driver == Driver::Mariadb,
            };
            debug!("Dump tool version: {:?} (MariaDB: {})", version, is_mariadb);
            Box::new(MySqlCommandBuilder::new(tools, is_mariadb, version))
        }
        Driver::Postgres => {
            let version = tool_version(runner, &tools.resolve("pg_dump")).await;
            Box::new(PostgresCommandBuilder::new(tools, version))
        }
    }
}

/// Copy of `source` without the lines `builder` flags as database statements.
///
/// The copy is removed when the returned handle is dropped.
pub fn retarget_dump(builder: &dyn DumpCommandBuilder, source: &Path) -> Result<NamedTempFile> {
    let mut reader = BufReader::new(File::open(source)?);
    let tmp = NamedTempFile::new()?;
    let mut skipped = 0usize;
    let mut in_copy_data = false;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            // Rows of a `COPY ... FROM stdin` block are data, never statements.
            if in_copy_data {
                in_copy_data = line.trim_ascii_end() != b"\\.";
                writer.write_all(&line)?;
                continue;
            }
            if line.starts_with(b"COPY ") && line.trim_ascii_end().ends_with(b"FROM stdin;") {
                in_copy_data = true;
            } else if builder.is_database_statement(&line) {
                skipped += 1;
                continue;
            }
            writer.write_all(&line)?;
        }
        writer.flush()?;
    }
    debug!("Left {} database statement(s) of {} out of the load", skipped, source.display());
    Ok(tmp)
}

async fn tool_version(runner: &SubprocessRunner, program: &str) -> Option<String> {
    let output = runner
        .run(&CommandSpec::new(program).arg("--version"))
        .await
        .ok()?;
    output
        .success
        .then(|| output.stdout.trim().to_string())
        .filter(|v| !v.is_empty())
}
