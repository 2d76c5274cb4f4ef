//! Database dump lifecycle: create dumps with provenance metadata, move them
//! between environments and restore them safely.

pub mod config;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod metadata;
pub mod remote;
pub mod server;
pub mod storage;
pub mod utils;

pub use config::AppConfig;
pub use engine::{DumpLifecycleEngine, EngineState, ImportOptions};
pub use errors::{ProtectorError, Result};
