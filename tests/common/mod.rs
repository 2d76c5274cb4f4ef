#![allow(dead_code)]

use dbshuttle::config::RawJsonConfig;
use dbshuttle::AppConfig;
use serde_json::{Value, json};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Exit codes the fake tools answer with. Zero everywhere by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exits {
    /// `mysqldump`, after it wrote part of its output.
    pub dump: i32,
    /// `mysql --execute=...`, the wipe step.
    pub wipe: i32,
    /// `mysql <db>` reading a dump from stdin, after it consumed the input.
    pub load: i32,
}

/// Stand-ins for `mysqldump` and `mysql` that record what they were asked to do.
pub struct FakeTools {
    pub dump: PathBuf,
    pub client: PathBuf,
    pub log: PathBuf,
}

impl FakeTools {
    pub fn install(dir: &Path, exits: Exits) -> anyhow::Result<Self> {
        let log = dir.join("tools.log");
        let dump = dir.join("mysqldump");
        let client = dir.join("mysql");

        write_script(
            &dump,
            &format!(
                r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "mysqldump  Ver 8.0.36 for Linux on x86_64 (MySQL Community Server - GPL)"
  exit 0
fi
echo "DUMP $* PWD=$MYSQL_PWD" >> "{log}"
for arg in "$@"; do
  case "$arg" in
    --result-file=*) out="${{arg#--result-file=}}" ;;
  esac
done
printf '%s\n' '-- MySQL dump 10.13' > "$out"
case " $* " in
  *" --databases "*)
    for db in "$@"; do :; done
    printf '%s\n' "CREATE DATABASE /*!32312 IF NOT EXISTS*/ \`$db\` /*!40100 DEFAULT CHARACTER SET utf8mb4 */;" '' "USE \`$db\`;" >> "$out"
    ;;
esac
if [ {dump_exit} -ne 0 ]; then
  exit {dump_exit}
fi
i=0
while [ $i -lt 40 ]; do
  printf '%s %s\n' '-- filler line' "$i" >> "$out"
  i=$((i + 1))
done
printf '%s\n' '-- Dump completed' >> "$out"
"#,
                log = log.display(),
                dump_exit = exits.dump
            ),
        )?;

        write_script(
            &client,
            &format!(
                r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "mysql  Ver 8.0.36 for Linux on x86_64"
  exit 0
fi
echo "CLIENT $*" >> "{log}"
case "$*" in
  *--execute=*) exit {wipe_exit} ;;
esac
cat >> "{log}"
exit {load_exit}
"#,
                log = log.display(),
                wipe_exit = exits.wipe,
                load_exit = exits.load
            ),
        )?;

        Ok(FakeTools { dump, client, log })
    }

    pub fn log(&self) -> String {
        std::fs::read_to_string(&self.log).unwrap_or_default()
    }
}

fn write_script(path: &Path, body: &str) -> anyhow::Result<()> {
    std::fs::write(path, body)?;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

/// Local configuration backed by the fake tools. `mysql` points at database
/// `shop`, `local` at `shop_local` on the same server.
pub fn config(storage: &Path, tools: &FakeTools, protector: Value) -> anyhow::Result<AppConfig> {
    let mut protector = protector;
    protector["tool_paths"] = json!({ "mysqldump": tools.dump, "mysql": tools.client });
    let raw: RawJsonConfig = serde_json::from_value(json!({
        "environment": "local",
        "app_url": "https://shop.example.com",
        "default_connection": "mysql",
        "connections": {
            "mysql": { "driver": "mysql", "database": "shop", "username": "app", "password": "hunter2" },
            "local": { "driver": "mysql", "database": "shop_local", "username": "app", "password": "hunter2" }
        },
        "disks": { "local": storage },
        "protector": protector,
    }))?;
    Ok(AppConfig::from_raw(raw)?)
}
