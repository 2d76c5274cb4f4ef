//! Server side of remote dumps: one route that creates a fresh dump and
//! streams it to an authenticated client.

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde_json::json;
use futures::StreamExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, SecretSource};
use crate::engine::DumpLifecycleEngine;
use crate::errors::{ProtectorError, Result};
use crate::remote::{CHUNK_SIZE_HEADER, ENCRYPTED_HEADER};
use crate::utils::crypto::{self, KEY_LEN};

pub const DUMP_ROUTE: &str = "/protector/dump";

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<AppConfig>,
    pub secrets: Arc<dyn SecretSource>,
    /// Connection to dump; the default connection when `None`.
    pub connection: Option<String>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route(DUMP_ROUTE, get(dump_handler))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: ServerState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving dumps on http://{}{}", listener.local_addr()?, DUMP_ROUTE);
    axum::serve(listener, router(state)).await
}

impl IntoResponse for ProtectorError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("Dump request failed: {}", self);
        } else {
            warn!("Dump request rejected: {}", self);
        }
        let body = axum::Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

/// Checks the request against the configured middleware. Returns the public
/// key to encrypt for when token mode is active.
fn authenticate(
    config: &AppConfig,
    secrets: &dyn SecretSource,
    headers: &HeaderMap,
) -> Result<Option<[u8; KEY_LEN]>> {
    let protector = &config.protector;
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match (protector.uses_token_auth(), protector.uses_htaccess_auth()) {
        (true, false) => {
            let expected = secrets.secret(&protector.server_token_key).ok_or_else(|| {
                ProtectorError::InvalidConfiguration(format!(
                    "{} is not set",
                    protector.server_token_key
                ))
            })?;
            if presented.strip_prefix("Bearer ") != Some(expected.as_str()) {
                return Err(ProtectorError::Unauthorized("invalid bearer token".into()));
            }
            let public_key = secrets
                .secret(&protector.server_public_key_key)
                .ok_or_else(|| {
                    ProtectorError::InvalidConfiguration(format!(
                        "{} is not set",
                        protector.server_public_key_key
                    ))
                })?;
            Ok(Some(crypto::decode_public_key(&public_key)?))
        }
        (false, true) => {
            let expected = protector.htaccess_login.as_deref().unwrap_or_default();
            let decoded = presented
                .strip_prefix("Basic ")
                .and_then(|b| STANDARD.decode(b.trim()).ok())
                .and_then(|b| String::from_utf8(b).ok());
            if decoded.as_deref() != Some(expected) {
                return Err(ProtectorError::Unauthorized("invalid credentials".into()));
            }
            Ok(None)
        }
        _ => Err(ProtectorError::InvalidConfiguration(
            "Exactly one of token authentication or htaccess credentials must be configured."
                .into(),
        )),
    }
}

async fn dump_handler(State(state): State<ServerState>, headers: HeaderMap) -> Result<Response> {
    let recipient = authenticate(&state.config, state.secrets.as_ref(), &headers)?;

    let mut engine = DumpLifecycleEngine::new((*state.config).clone(), Arc::clone(&state.secrets));
    engine.configure(state.connection.as_deref())?;
    let options = engine.default_options();
    let path = engine.create_dump(None, &options).await?;
    let served = ServedDump(path.clone());

    let chunk_size = state.config.protector.chunk_size;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file = File::open(&path).await?;
    info!(
        "Streaming {} (chunk size {}, encrypted: {})",
        path.display(),
        chunk_size,
        recipient.is_some()
    );

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name))
            .map_err(|e| ProtectorError::FailedDumpGeneration(e.to_string()))?,
    );
    response_headers.insert(CHUNK_SIZE_HEADER, HeaderValue::from(chunk_size));

    let body = match recipient {
        Some(public_key) => {
            response_headers.insert(ENCRYPTED_HEADER, HeaderValue::from_static("true"));
            Body::from_stream(served.attach(sealed_chunks(file, chunk_size, public_key)))
        }
        None => Body::from_stream(served.attach(ReaderStream::with_capacity(file, chunk_size))),
    };
    Ok((StatusCode::OK, response_headers, body).into_response())
}

/// A dump created for one response. The file is removed when the response
/// body is dropped, whether the client read it all or went away early.
struct ServedDump(PathBuf);

impl ServedDump {
    fn attach<S>(self, stream: S) -> impl futures::Stream<Item = S::Item> + Send + 'static
    where
        S: futures::Stream + Send + 'static,
    {
        stream.map(move |item| {
            let _ = &self;
            item
        })
    }
}

impl Drop for ServedDump {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => debug!("Removed served dump {}", self.0.display()),
            Err(e) => warn!("Could not remove served dump {}: {}", self.0.display(), e),
        }
    }
}

/// Reads `file` in exact `chunk_size` pieces (the last one may be shorter)
/// and seals each for `public_key`.
fn sealed_chunks(
    file: File,
    chunk_size: usize,
    public_key: [u8; KEY_LEN],
) -> impl futures::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures::stream::try_unfold(file, move |mut file| async move {
        let mut buf = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        let sealed = crypto::encrypt_chunk(&buf, &public_key).map_err(std::io::Error::other)?;
        Ok::<_, std::io::Error>(Some((Bytes::from(sealed), file)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawJsonConfig;
    use crate::utils::crypto::KeyPair;
    use futures::TryStreamExt;
    use std::collections::HashMap;

    fn config(protector: serde_json::Value) -> anyhow::Result<AppConfig> {
        let raw: RawJsonConfig = serde_json::from_value(json!({ "protector": protector }))?;
        Ok(AppConfig::from_raw(raw)?)
    }

    fn headers(authorization: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(authorization).unwrap());
        headers
    }

    #[test]
    fn test_token_auth_returns_recipient_key() -> anyhow::Result<()> {
        let keys = KeyPair::generate();
        let config = config(json!({ "route_middleware": ["auth:token"] }))?;
        let mut secrets = HashMap::new();
        secrets.insert("PROTECTOR_SERVER_TOKEN".to_string(), "t0ken".to_string());
        secrets.insert("PROTECTOR_SERVER_PUBLIC_KEY".to_string(), keys.public_key_base64());

        let recipient = authenticate(&config, &secrets, &headers("Bearer t0ken"))?;
        assert_eq!(recipient, Some(keys.public_key));

        let rejected = authenticate(&config, &secrets, &headers("Bearer nope"));
        assert!(matches!(rejected, Err(ProtectorError::Unauthorized(_))));
        Ok(())
    }

    #[test]
    fn test_basic_auth() -> anyhow::Result<()> {
        let config = config(json!({ "htaccess_login": "ops:s3cret" }))?;
        let secrets = HashMap::new();
        assert_eq!(authenticate(&config, &secrets, &headers("Basic b3BzOnMzY3JldA=="))?, None);
        assert!(matches!(
            authenticate(&config, &secrets, &headers("Basic b3BzOndyb25n")),
            Err(ProtectorError::Unauthorized(_))
        ));
        assert!(matches!(
            authenticate(&config, &secrets, &HeaderMap::new()),
            Err(ProtectorError::Unauthorized(_))
        ));
        Ok(())
    }

    #[test]
    fn test_ambiguous_auth_is_a_configuration_error() -> anyhow::Result<()> {
        let secrets = HashMap::new();
        for protector in [
            json!({}),
            json!({ "route_middleware": ["auth:token"], "htaccess_login": "a:b" }),
        ] {
            let result = authenticate(&config(protector)?, &secrets, &HeaderMap::new());
            assert!(matches!(result, Err(ProtectorError::InvalidConfiguration(_))));
        }
        Ok(())
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (ProtectorError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (ProtectorError::InvalidEnvironment("production".into()), StatusCode::FORBIDDEN),
            (ProtectorError::FileNotFound("x".into()), StatusCode::NOT_FOUND),
            (ProtectorError::FailedRemoteDatabaseFetching("x".into()), StatusCode::BAD_GATEWAY),
            (ProtectorError::FailedDumpGeneration("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_sealed_chunks_split_on_chunk_size() -> anyhow::Result<()> {
        let keys = KeyPair::generate();
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("dump.sql");
        std::fs::write(&path, b"0123456789abc")?;

        let chunks: Vec<Bytes> = sealed_chunks(File::open(&path).await?, 5, keys.public_key)
            .try_collect()
            .await?;
        assert_eq!(chunks.len(), 3);
        let plain: Vec<u8> = chunks
            .iter()
            .map(|c| crypto::decrypt_chunk(c, &keys))
            .collect::<Result<Vec<_>>>()?
            .concat();
        assert_eq!(plain, b"0123456789abc");
        Ok(())
    }
}
