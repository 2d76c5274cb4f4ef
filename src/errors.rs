use std::path::PathBuf;
use thiserror::Error;

/// Every failure the dump lifecycle can surface to its caller.
///
/// Nothing in the library retries on these; re-running the command is the
/// operator's call.
#[derive(Error, Debug)]
pub enum ProtectorError {
    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Refusing to run in the '{0}' environment. Pass the allow-production override to continue.")]
    InvalidEnvironment(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Base directory {0} does not contain any files")]
    EmptyBaseDirectory(PathBuf),

    #[error("Failed creating destination path {path}: {reason}")]
    FailedCreatingDestinationPath { path: String, reason: String },

    #[error("Dump generation failed: {0}")]
    FailedDumpGeneration(String),

    #[error("Wiping the target database failed, its state is unknown: {0}")]
    FailedWipe(String),

    #[error("Import failed after the database was wiped: {0}")]
    FailedImport(String),

    #[error("Migrations failed after import: {0}")]
    FailedMigration(String),

    #[error("Fetching the remote database failed: {0}")]
    FailedRemoteDatabaseFetching(String),

    #[error("Decrypting the remote dump failed: {0}")]
    FailedDecryption(String),

    #[error("Chunk encryption failed: {0}")]
    FailedEncryption(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid metadata provider '{0}'")]
    InvalidMetadataProvider(String),

    #[error("Shell access denied: {0}")]
    ShellAccessDenied(String),

    #[error("Command execution failed: {0}")]
    FailedShellCommand(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl ProtectorError {
    /// HTTP status the server route answers with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ProtectorError::Unauthorized(_) => 401,
            ProtectorError::InvalidEnvironment(_) => 403,
            ProtectorError::FileNotFound(_) | ProtectorError::EmptyBaseDirectory(_) => 404,
            ProtectorError::FailedRemoteDatabaseFetching(_) => 502,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ProtectorError::Unauthorized("x".into()).http_status(), 401);
        assert_eq!(ProtectorError::FileNotFound("x".into()).http_status(), 404);
        assert_eq!(
            ProtectorError::FailedRemoteDatabaseFetching("x".into()).http_status(),
            502
        );
        assert_eq!(ProtectorError::FailedWipe("x".into()).http_status(), 500);
    }
}
