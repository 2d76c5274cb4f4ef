// dbshuttle/src/driver/postgres.rs
use std::path::Path;

use super::{DumpCommandBuilder, DumpOptions, ToolPaths};
use crate::config::{ConnectionConfig, Driver};
use crate::utils::CommandSpec;

/// `pg_dump` / `psql` invocations. Dumps are plain SQL so the trailer stays a
/// valid comment and `psql` can replay the file.
#[derive(Debug, Clone)]
pub struct PostgresCommandBuilder {
    dump_tool: String,
    client_tool: String,
    version: Option<String>,
}

impl PostgresCommandBuilder {
    pub fn new(tools: &ToolPaths, version: Option<String>) -> Self {
        PostgresCommandBuilder {
            dump_tool: tools.resolve("pg_dump"),
            client_tool: tools.resolve("psql"),
            version,
        }
    }

    fn with_credentials(spec: CommandSpec, conn: &ConnectionConfig) -> CommandSpec {
        spec.arg(format!("--host={}", conn.host))
            .arg(format!("--port={}", conn.port))
            .arg(format!("--username={}", conn.username))
            .arg(format!("--dbname={}", conn.database))
            .env("PGPASSWORD", conn.password.clone())
    }

    fn client(&self, conn: &ConnectionConfig) -> CommandSpec {
        Self::with_credentials(CommandSpec::new(&self.client_tool), conn)
            .arg("-X") // Do not read psqlrc
            .arg("-q")
            .arg("-v")
            .arg("ON_ERROR_STOP=1")
    }
}

impl DumpCommandBuilder for PostgresCommandBuilder {
    fn driver(&self) -> Driver {
        Driver::Postgres
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
        let mut spec = CommandSpec::new(&self.dump_tool)
            .arg("--no-owner")
            .arg("--no-acl");
        spec = Self::with_credentials(spec, conn).arg(format!("--file={}", destination.display()));

        let conditional = [
            (options.include_create_db, "--create"),
            (options.drops_database(), "--clean"),
            (!options.include_comments, "--no-comments"),
            (!options.include_data, "--schema-only"),
            (!options.include_tablespaces, "--no-tablespaces"),
        ];
        for (enabled, flag) in conditional {
            if enabled {
                spec = spec.arg(flag);
            }
        }
        spec
    }

    fn wipe_command(&self, conn: &ConnectionConfig) -> CommandSpec {
        self.client(conn)
            .arg("--command=DROP SCHEMA IF EXISTS public CASCADE; CREATE SCHEMA public;")
    }

    fn load_command(&self, conn: &ConnectionConfig, source: &Path) -> CommandSpec {
        self.client(conn).arg(format!("--file={}", source.display()))
    }

    // `--create` output drops, creates and reconnects to the source database
    // by name before any object is restored.
    fn is_database_statement(&self, line: &[u8]) -> bool {
        [
            &b"CREATE DATABASE "[..],
            b"DROP DATABASE ",
            b"ALTER DATABASE ",
            b"COMMENT ON DATABASE ",
            b"\\connect ",
        ]
        .iter()
        .any(|prefix| line.starts_with(prefix))
    }

    fn tool_version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn conn() -> ConnectionConfig {
        ConnectionConfig {
            name: "pgsql".into(),
            driver: Driver::Postgres,
            host: "db".into(),
            port: 5432,
            username: "app".into(),
            password: "secret".into(),
            database: "shop".into(),
        }
    }

    fn builder() -> PostgresCommandBuilder {
        PostgresCommandBuilder::new(&ToolPaths::default(), None)
    }

    #[test]
    fn test_default_dump_arguments() {
        let spec = builder().dump_command(&conn(), &DumpOptions::default(), &PathBuf::from("/d/a.sql"));
        assert_eq!(spec.program, "pg_dump");
        assert_eq!(
            spec.args,
            vec![
                "--no-owner",
                "--no-acl",
                "--host=db",
                "--port=5432",
                "--username=app",
                "--dbname=shop",
                "--file=/d/a.sql",
                "--create",
            ]
        );
        assert_eq!(spec.env, vec![("PGPASSWORD".to_string(), "secret".to_string())]);
    }

    #[test]
    fn test_clean_only_with_create() {
        let b = builder();
        let path = PathBuf::from("a.sql");

        let drop_without_create = DumpOptions::default().with_create_db(false).with_drop_db(true);
        let spec = b.dump_command(&conn(), &drop_without_create, &path);
        assert!(!spec.args.contains(&"--clean".to_string()));
        assert!(!spec.args.contains(&"--create".to_string()));

        let drop_with_create = DumpOptions::default().with_drop_db(true);
        let spec = b.dump_command(&conn(), &drop_with_create, &path);
        assert_eq!(&spec.args[7..], &["--create", "--clean"]);
    }

    #[test]
    fn test_schema_only_and_suppressions() {
        let options = DumpOptions::default()
            .with_create_db(false)
            .with_data(false)
            .with_comments(false)
            .with_tablespaces(false)
            .with_charsets(false);
        let spec = builder().dump_command(&conn(), &options, &PathBuf::from("a.sql"));
        assert_eq!(&spec.args[7..], &["--no-comments", "--schema-only", "--no-tablespaces"]);
    }

    #[test]
    fn test_database_statements_of_a_create_dump() {
        let b = builder();
        for line in [
            "DROP DATABASE shop;\n",
            "CREATE DATABASE shop WITH TEMPLATE = template0 ENCODING = 'UTF8' LOCALE_PROVIDER = libc LOCALE = 'C.UTF-8';\n",
            "ALTER DATABASE shop SET search_path TO 'public';\n",
            "\\connect shop\n",
            "\\connect -reuse-previous=on \"dbname='shop-prod'\"\n",
        ] {
            assert!(b.is_database_statement(line.as_bytes()), "{}", line);
        }
        for line in [
            "CREATE TABLE public.users (\n",
            "SET statement_timeout = 0;\n",
            "COPY public.users (id) FROM stdin;\n",
        ] {
            assert!(!b.is_database_statement(line.as_bytes()), "{}", line);
        }
    }

    #[test]
    fn test_wipe_and_load_use_psql() {
        let wipe = builder().wipe_command(&conn());
        assert_eq!(wipe.program, "psql");
        assert!(wipe.args.contains(&"ON_ERROR_STOP=1".to_string()));
        assert_eq!(
            wipe.args.last().unwrap(),
            "--command=DROP SCHEMA IF EXISTS public CASCADE; CREATE SCHEMA public;"
        );

        let load = builder().load_command(&conn(), &PathBuf::from("/d/a.sql"));
        assert_eq!(load.args.last().unwrap(), "--file=/d/a.sql");
        assert!(load.stdin_file.is_none());
    }
}
