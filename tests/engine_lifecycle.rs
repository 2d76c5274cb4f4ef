#![cfg(unix)]

mod common;

use chrono::{DateTime, Utc};
use common::{Exits, FakeTools};
use dbshuttle::engine::{FileSelectionResolver, Selection};
use dbshuttle::metadata::MetadataShape;
use dbshuttle::{DumpLifecycleEngine, EngineState, ImportOptions, ProtectorError};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn engine(config: dbshuttle::AppConfig) -> DumpLifecycleEngine {
    DumpLifecycleEngine::new(config, Arc::new(HashMap::<String, String>::new()))
}

#[tokio::test]
async fn test_schema_only_dump_records_options_and_timestamp() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tools = FakeTools::install(tmp.path(), Exits::default())?;
    let mut engine = engine(common::config(&tmp.path().join("storage"), &tools, json!({}))?);
    engine.configure(None)?;

    // The trailer stores whole seconds.
    let before = Utc::now() - chrono::Duration::seconds(1);
    let options = engine.default_options().with_data(false);
    let path = engine.create_dump(None, &options).await?;
    let after = Utc::now() + chrono::Duration::seconds(1);
    assert_eq!(engine.state(), EngineState::Configured);

    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("shop.example.com_shop_mysql_"), "{}", name);
    assert!(name.ends_with(".sql"));

    let meta = engine.get_dump_metadata(&path).expect("dump carries a trailer");
    assert_eq!(meta.shape, MetadataShape::ProviderKeyed);
    assert_eq!(meta.connection(), Some("mysql"));
    assert_eq!(meta.meta["default"]["dumpData"], false);
    assert_eq!(meta.options["includeData"], false);

    let dumped_at: DateTime<Utc> = meta.dumped_at().expect("timestamp").parse()?;
    assert!(dumped_at >= before && dumped_at <= after, "{} outside window", dumped_at);

    let log = tools.log();
    assert!(log.contains("--no-data"));
    assert!(log.contains("PWD=hunter2"));
    assert!(!log.lines().any(|l| l.starts_with("DUMP") && l.contains("hunter2 ")));
    Ok(())
}

#[tokio::test]
async fn test_second_dump_in_same_minute_gets_suffix() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tools = FakeTools::install(tmp.path(), Exits::default())?;
    let mut engine = engine(common::config(
        &tmp.path().join("storage"),
        &tools,
        json!({ "file_name": "%3$s-%2$s%9$s.sql" }),
    )?);
    engine.configure(None)?;

    let options = engine.default_options();
    let first = engine.create_dump(None, &options).await?;
    let second = engine.create_dump(None, &options).await?;
    assert_eq!(first.file_name().unwrap(), "mysql-shop.sql");
    assert_eq!(second.file_name().unwrap(), "mysql-shop_1.sql");
    Ok(())
}

#[tokio::test]
async fn test_import_wipes_then_loads_then_migrates() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tools = FakeTools::install(tmp.path(), Exits::default())?;
    let marker = tmp.path().join("migrated");
    let mut engine = engine(common::config(
        &tmp.path().join("storage"),
        &tools,
        json!({ "migration_command": ["sh", "-c", format!("touch {}", marker.display())] }),
    )?);
    engine.configure(None)?;

    let source = tmp.path().join("incoming.sql");
    std::fs::write(&source, "INSERT INTO users VALUES (1);\n")?;
    let options = ImportOptions {
        run_migrations: true,
        ..ImportOptions::default()
    };
    engine.import_dump(&source, &options).await?;

    let log = tools.log();
    let wipe = log.find("--execute=DROP DATABASE IF EXISTS `shop`; CREATE DATABASE `shop`;").expect("wipe ran");
    let load = log.find("INSERT INTO users VALUES (1);").expect("load ran");
    assert!(wipe < load);
    assert!(marker.exists());
    Ok(())
}

#[tokio::test]
async fn test_failed_wipe_is_reported_and_load_is_skipped() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tools = FakeTools::install(
        tmp.path(),
        Exits {
            wipe: 1,
            ..Exits::default()
        },
    )?;
    let mut engine = engine(common::config(&tmp.path().join("storage"), &tools, json!({}))?);
    engine.configure(None)?;

    let source = tmp.path().join("incoming.sql");
    std::fs::write(&source, "INSERT INTO users VALUES (1);\n")?;
    let result = engine.import_dump(&source, &ImportOptions::default()).await;

    assert!(matches!(result, Err(ProtectorError::FailedWipe(_))));
    assert!(!tools.log().contains("INSERT INTO users"));
    Ok(())
}

#[tokio::test]
async fn test_dump_lands_in_target_database_not_source() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tools = FakeTools::install(tmp.path(), Exits::default())?;
    let mut engine = engine(common::config(&tmp.path().join("storage"), &tools, json!({}))?);

    engine.configure(Some("mysql"))?;
    let options = engine.default_options();
    let dump = engine.create_dump(Some("prod.sql"), &options).await?;
    let written = std::fs::read_to_string(&dump)?;
    assert!(written.contains("USE `shop`;"));

    engine.configure(Some("local"))?;
    engine.import_dump(&dump, &ImportOptions::default()).await?;

    let log = tools.log();
    let load = &log[log.find("CLIENT").expect("client ran")..];
    assert!(load.contains("CREATE DATABASE `shop_local`;"));
    assert!(load.lines().any(|l| l.starts_with("CLIENT") && l.ends_with(" shop_local")));
    assert!(load.contains("-- filler line 39"));
    assert!(!load.contains("USE `shop`"));
    assert!(!load.contains("IF NOT EXISTS*/ `shop`"));
    assert_eq!(std::fs::read_to_string(&dump)?, written);
    Ok(())
}

#[tokio::test]
async fn test_failed_dump_tool_removes_partial_file() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tools = FakeTools::install(
        tmp.path(),
        Exits {
            dump: 2,
            ..Exits::default()
        },
    )?;
    let mut engine = engine(common::config(&tmp.path().join("storage"), &tools, json!({}))?);
    engine.configure(None)?;

    let options = engine.default_options();
    let result = engine.create_dump(Some("broken.sql"), &options).await;

    assert!(matches!(result, Err(ProtectorError::FailedDumpGeneration(_))), "{:?}", result);
    assert!(tools.log().contains("DUMP"));
    assert!(!tmp.path().join("storage/protector/broken.sql").exists());
    assert_eq!(engine.state(), EngineState::Configured);
    Ok(())
}

#[tokio::test]
async fn test_failed_load_is_reported_after_wipe() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tools = FakeTools::install(
        tmp.path(),
        Exits {
            load: 1,
            ..Exits::default()
        },
    )?;
    let mut engine = engine(common::config(&tmp.path().join("storage"), &tools, json!({}))?);
    engine.configure(None)?;

    let source = tmp.path().join("incoming.sql");
    std::fs::write(&source, "INSERT INTO users VALUES (1);\n")?;
    let result = engine.import_dump(&source, &ImportOptions::default()).await;

    assert!(matches!(result, Err(ProtectorError::FailedImport(_))), "{:?}", result);
    let log = tools.log();
    assert!(log.contains("--execute=DROP DATABASE"));
    assert!(log.contains("INSERT INTO users VALUES (1);"));
    Ok(())
}

#[tokio::test]
async fn test_failed_migration_keeps_imported_data() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tools = FakeTools::install(tmp.path(), Exits::default())?;
    let mut engine = engine(common::config(
        &tmp.path().join("storage"),
        &tools,
        json!({ "migration_command": ["sh", "-c", "exit 4"] }),
    )?);
    engine.configure(None)?;

    let source = tmp.path().join("incoming.sql");
    std::fs::write(&source, "INSERT INTO users VALUES (1);\n")?;
    let options = ImportOptions {
        run_migrations: true,
        ..ImportOptions::default()
    };
    let result = engine.import_dump(&source, &options).await;

    assert!(matches!(result, Err(ProtectorError::FailedMigration(_))), "{:?}", result);
    let log = tools.log();
    assert_eq!(log.matches("--execute=DROP DATABASE").count(), 1);
    let wipe = log.find("--execute=DROP DATABASE").unwrap_or_default();
    let load = log.find("INSERT INTO users VALUES (1);").expect("load ran");
    assert!(wipe < load);
    assert!(!log[load..].contains("--execute="));
    Ok(())
}

#[tokio::test]
async fn test_production_refusal_comes_before_missing_file() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tools = FakeTools::install(tmp.path(), Exits::default())?;
    let mut config = common::config(&tmp.path().join("storage"), &tools, json!({}))?;
    config.environment = "production".into();
    let mut engine = engine(config);
    engine.configure(None)?;

    let result = engine
        .import_dump(&tmp.path().join("missing.sql"), &ImportOptions::default())
        .await;
    assert!(matches!(result, Err(ProtectorError::InvalidEnvironment(_))));
    assert!(tools.log().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unknown_metadata_provider_stops_dump_before_tool_runs() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tools = FakeTools::install(tmp.path(), Exits::default())?;
    let mut engine = engine(common::config(
        &tmp.path().join("storage"),
        &tools,
        json!({ "metadata_providers": ["default", "App\\Metadata\\Missing"] }),
    )?);
    engine.configure(None)?;

    let options = engine.default_options();
    let result = engine.create_dump(None, &options).await;
    assert!(matches!(result, Err(ProtectorError::InvalidMetadataProvider(_))));
    assert!(!tools.log().contains("DUMP"));
    Ok(())
}

#[tokio::test]
async fn test_selection_offers_only_dumps_of_the_configured_connection() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let tools = FakeTools::install(tmp.path(), Exits::default())?;
    let storage = tmp.path().join("storage");
    let mut engine = engine(common::config(&storage, &tools, json!({}))?);
    engine.configure(None)?;

    let options = engine.default_options();
    let ours = engine.create_dump(Some("ours.sql"), &options).await?;
    std::fs::write(storage.join("protector/foreign.sql"), "-- someone else's dump\n")?;

    let connection = engine.connection().map(|c| c.name.clone()).unwrap_or_default();
    match FileSelectionResolver::new(&connection).resolve(engine.list_candidates()?) {
        Selection::Single(candidate) => assert_eq!(candidate.path, ours),
        other => panic!("expected only our dump, got {:?}", other),
    }
    match FileSelectionResolver::new(&connection)
        .ignore_connection_filter(true)
        .resolve(engine.list_candidates()?)
    {
        Selection::Choose(candidates) => assert_eq!(candidates.len(), 2),
        other => panic!("expected both files, got {:?}", other),
    }

    assert_eq!(engine.flush(Some(ours.as_path()))?, 1);
    assert_eq!(engine.get_latest_dump_name()?, ours);
    Ok(())
}
