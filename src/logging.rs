//! Logging setup for the command line.

use tracing_subscriber::EnvFilter;

use crate::errors::{ProtectorError, Result};

/// Maps `-v`/`-q` to a level name.
pub fn level_for(verbose: u8, quiet: bool) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the flags when set.
pub fn init_logging(verbose: u8, quiet: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dbshuttle={}", level_for(verbose, quiet))));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| {
            ProtectorError::InvalidConfiguration(format!("Failed to initialize logging: {}", e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global subscriber can only be installed once per process, so only
    // the flag mapping is checked here.
    #[test]
    fn test_level_mapping() {
        assert_eq!(level_for(0, false), "info");
        assert_eq!(level_for(1, false), "debug");
        assert_eq!(level_for(3, false), "trace");
        assert_eq!(level_for(2, true), "error");
    }
}
