//! Pulls a dump from a remote dbshuttle server over HTTP.

use bytes::BytesMut;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_DISPOSITION, HeaderMap};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::{AppConfig, SecretSource};
use crate::errors::{ProtectorError, Result};
use crate::storage::LocalDisk;
use crate::utils::crypto::{self, KeyPair};
use crate::utils::redact_url;

pub const CHUNK_SIZE_HEADER: &str = "chunk-size";
pub const ENCRYPTED_HEADER: &str = "dump-encrypted";
pub const FALLBACK_FILE_NAME: &str = "remote_dump.sql";
/// Largest `Chunk-Size` a server may announce. One chunk is buffered in memory.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// How the request proves who it is. Exactly one mode is ever active.
pub enum RemoteAuth {
    /// Bearer token; the body comes back encrypted for `keys`.
    Token { token: String, keys: KeyPair },
    /// Basic credentials from `htaccess_login` (`user:password`).
    Basic { username: String, password: String },
}

impl std::fmt::Debug for RemoteAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteAuth::Token { keys, .. } => f
                .debug_struct("Token")
                .field("public_key", &keys.public_key_base64())
                .finish_non_exhaustive(),
            RemoteAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

impl RemoteAuth {
    /// Derives the auth mode from configuration, rejecting contradictory or
    /// incomplete setups before any request goes out.
    pub fn from_config(config: &AppConfig, secrets: &dyn SecretSource) -> Result<Self> {
        let protector = &config.protector;
        match (protector.uses_token_auth(), protector.uses_htaccess_auth()) {
            (true, true) => Err(ProtectorError::InvalidConfiguration(
                "Both token authentication and htaccess credentials are configured. Pick one."
                    .into(),
            )),
            (false, false) => Err(ProtectorError::InvalidConfiguration(
                "No authentication configured for the remote server.".into(),
            )),
            (true, false) => {
                if protector.private_key_key.trim().is_empty() {
                    return Err(ProtectorError::InvalidConfiguration(
                        "Token authentication requires the private key variable name.".into(),
                    ));
                }
                let token = secrets.secret(&protector.auth_token_key).ok_or_else(|| {
                    ProtectorError::InvalidConfiguration(format!(
                        "{} is not set",
                        protector.auth_token_key
                    ))
                })?;
                let private_key = secrets.secret(&protector.private_key_key).ok_or_else(|| {
                    ProtectorError::InvalidConfiguration(format!(
                        "{} is not set",
                        protector.private_key_key
                    ))
                })?;
                Ok(RemoteAuth::Token {
                    token,
                    keys: KeyPair::from_base64(&private_key)?,
                })
            }
            (false, true) => {
                let login = protector.htaccess_login.as_deref().unwrap_or_default();
                let (username, password) = login.split_once(':').unwrap_or((login, ""));
                Ok(RemoteAuth::Basic {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
        }
    }
}

/// Client side of the dump route.
pub struct RemoteFetcher<'a> {
    config: &'a AppConfig,
    secrets: &'a dyn SecretSource,
    client: reqwest::Client,
}

impl<'a> RemoteFetcher<'a> {
    pub fn new(config: &'a AppConfig, secrets: &'a dyn SecretSource) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.protector.http_timeout)
            .build()
            .map_err(|e| ProtectorError::FailedRemoteDatabaseFetching(e.to_string()))?;
        Ok(RemoteFetcher {
            config,
            secrets,
            client,
        })
    }

    /// Downloads the remote dump into `directory` on `disk` and returns its path.
    pub async fn fetch(&self, disk: &LocalDisk, directory: &str) -> Result<PathBuf> {
        if self.config.is_production() {
            return Err(ProtectorError::InvalidEnvironment(self.config.environment.clone()));
        }
        let server_url = self.config.protector.server_url.trim();
        if server_url.is_empty() {
            return Err(ProtectorError::InvalidConfiguration(
                "No server URL configured for remote dumps.".into(),
            ));
        }
        let auth = RemoteAuth::from_config(self.config, self.secrets)?;

        info!("Requesting remote dump from {}", redact_url(server_url));
        let request = self
            .client
            .get(server_url)
            .header(ACCEPT, "application/json");
        let request = match &auth {
            RemoteAuth::Token { token, .. } => request.bearer_auth(token),
            RemoteAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        };

        let response = request.send().await.map_err(|e| {
            ProtectorError::FailedRemoteDatabaseFetching(e.without_url().to_string())
        })?;
        check_status(response.status().as_u16(), server_url)?;

        let headers = response.headers().clone();
        let chunk_size = chunk_size(&headers, self.config.protector.chunk_size)?;
        let keys = match (is_encrypted(&headers), &auth) {
            (false, _) => None,
            (true, RemoteAuth::Token { keys, .. }) => Some(keys),
            (true, RemoteAuth::Basic { .. }) => {
                return Err(ProtectorError::FailedDecryption(
                    "The server sent an encrypted dump but no private key is configured.".into(),
                ));
            }
        };

        let dir = disk.make_directory(directory).map_err(|e| {
            ProtectorError::FailedCreatingDestinationPath {
                path: directory.to_string(),
                reason: e.to_string(),
            }
        })?;
        let destination = dir.join(file_name_from_headers(&headers));
        debug!(
            "Writing remote dump to {} (chunk size {}, encrypted: {})",
            destination.display(),
            chunk_size,
            keys.is_some()
        );

        // The destination is only replaced once the whole dump arrived, so a
        // failed fetch never clobbers an earlier download of the same name.
        let partial = NamedTempFile::new_in(&dir)?;
        let mut body = response.bytes_stream();
        let written: u64 = {
            let mut file = File::from_std(partial.as_file().try_clone()?);
            let mut writer = ChunkWriter::new(chunk_size, keys)?;
            while let Some(bytes) = body.next().await {
                let bytes = bytes.map_err(|e| {
                    ProtectorError::FailedRemoteDatabaseFetching(e.without_url().to_string())
                })?;
                writer.feed(&bytes, &mut file).await?;
            }
            let written = writer.finish(&mut file).await?;
            file.flush().await?;
            written
        };
        if written == 0 {
            return Err(ProtectorError::FailedRemoteDatabaseFetching(
                "The server returned an empty dump.".into(),
            ));
        }

        partial
            .persist(&destination)
            .map_err(|e| ProtectorError::Io(e.error))?;
        info!("Downloaded {} bytes to {}", written, destination.display());
        Ok(destination)
    }
}

/// Turns the streamed body into plaintext on disk, one sealed chunk at a time.
struct ChunkWriter<'k> {
    keys: Option<&'k KeyPair>,
    sealed_size: usize,
    pending: BytesMut,
    written: u64,
}

impl<'k> ChunkWriter<'k> {
    fn new(chunk_size: usize, keys: Option<&'k KeyPair>) -> Result<Self> {
        let sealed_size = match keys {
            Some(keys) => {
                let overhead = crypto::determine_encryption_overhead(chunk_size, &keys.public_key)?;
                chunk_size.checked_add(overhead).ok_or_else(|| {
                    ProtectorError::FailedRemoteDatabaseFetching(format!(
                        "Chunk size {} is too large",
                        chunk_size
                    ))
                })?
            }
            None => chunk_size,
        };
        Ok(ChunkWriter {
            keys,
            sealed_size,
            pending: BytesMut::new(),
            written: 0,
        })
    }

    async fn feed(&mut self, bytes: &[u8], file: &mut File) -> Result<()> {
        let Some(keys) = self.keys else {
            file.write_all(bytes).await?;
            self.written += bytes.len() as u64;
            return Ok(());
        };
        self.pending.extend_from_slice(bytes);
        while self.pending.len() >= self.sealed_size {
            let sealed = self.pending.split_to(self.sealed_size);
            let plain = crypto::decrypt_chunk(&sealed, keys)?;
            file.write_all(&plain).await?;
            self.written += plain.len() as u64;
        }
        Ok(())
    }

    /// Flushes the trailing short chunk, if any. Returns the plaintext byte count.
    async fn finish(mut self, file: &mut File) -> Result<u64> {
        if let Some(keys) = self.keys {
            if !self.pending.is_empty() {
                let plain = crypto::decrypt_chunk(&self.pending, keys)?;
                file.write_all(&plain).await?;
                self.written += plain.len() as u64;
            }
        }
        Ok(self.written)
    }
}

fn check_status(status: u16, server_url: &str) -> Result<()> {
    match status {
        200..=299 => Ok(()),
        401 | 403 => Err(ProtectorError::Unauthorized(format!(
            "{} answered {}",
            redact_url(server_url),
            status
        ))),
        404 => Err(ProtectorError::FileNotFound(format!(
            "No dump available at {}",
            redact_url(server_url)
        ))),
        other => Err(ProtectorError::FailedRemoteDatabaseFetching(format!(
            "{} answered {}",
            redact_url(server_url),
            other
        ))),
    }
}

fn chunk_size(headers: &HeaderMap, fallback: usize) -> Result<usize> {
    let Some(value) = headers.get(CHUNK_SIZE_HEADER) else {
        return Ok(fallback);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|size| (1..=MAX_CHUNK_SIZE).contains(size))
        .ok_or_else(|| {
            ProtectorError::FailedRemoteDatabaseFetching(format!(
                "Invalid {} header {:?}, expected 1 to {} bytes",
                CHUNK_SIZE_HEADER, value, MAX_CHUNK_SIZE
            ))
        })
}

fn is_encrypted(headers: &HeaderMap) -> bool {
    headers
        .get(ENCRYPTED_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// File name from `Content-Disposition`, reduced to its last path component.
pub fn file_name_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(disposition_file_name)
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

fn disposition_file_name(header: &str) -> Option<String> {
    let raw = header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))?;
    let unquoted = raw.trim_matches('"');
    let name = Path::new(unquoted).file_name()?.to_string_lossy().into_owned();
    (!name.is_empty() && name != "..").then_some(name)
}
