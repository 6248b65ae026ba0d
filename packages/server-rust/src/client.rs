//! Client for a running `pkgsvc` service.
//!
//! TCP targets go through `reqwest`. Unix socket targets speak HTTP/1 over a
//! fresh `UnixStream` per call.

use std::io;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use pkgsvc_core::{
    BuildRequest, CodecError, EventCodec, OperationEvent, ResolveRequest, RpcStatus,
};
use serde::Serialize;
use tokio::net::UnixStream;
use tokio_util::codec::Decoder;
use tracing::debug;

use crate::network::ServiceTarget;

const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cannot connect to {}: {source}", .path.display())]
    Connect { path: PathBuf, source: io::Error },
    #[error("connection failed: {0}")]
    Transport(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
    #[error("service answered with HTTP {0}")]
    UnexpectedStatus(StatusCode),
    #[error("failed to encode request: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("invalid health report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid event stream: {0}")]
    Codec(#[from] CodecError),
    #[error("event stream ended without a status")]
    MissingStatus,
}

#[derive(Debug, Clone)]
enum Transport {
    Tcp {
        http: reqwest::Client,
        base_url: String,
    },
    Unix {
        path: PathBuf,
    },
}

/// Response body of an operation call, read chunk by chunk.
enum EventBody {
    Tcp(reqwest::Response),
    Unix(Incoming),
}

impl EventBody {
    async fn chunk(&mut self) -> Result<Option<Bytes>, ClientError> {
        match self {
            Self::Tcp(response) => Ok(response.chunk().await?),
            Self::Unix(body) => {
                while let Some(frame) = body.frame().await {
                    if let Ok(data) = frame?.into_data() {
                        return Ok(Some(data));
                    }
                }
                Ok(None)
            }
        }
    }
}

/// Sends operations to a service and relays their progress lines.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    transport: Transport,
}

impl ServiceClient {
    #[must_use]
    pub fn new(target: &ServiceTarget) -> Self {
        let transport = match target {
            ServiceTarget::HostPort { .. } => Transport::Tcp {
                http: reqwest::Client::new(),
                base_url: target.to_string(),
            },
            ServiceTarget::UnixSocket(path) => Transport::Unix { path: path.clone() },
        };
        Self { transport }
    }

    /// Resolves the package at `package_path`, calling `on_log` for every
    /// progress line, and returns the terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the call fails at the transport level.
    /// Operation failures are reported in the returned status.
    pub async fn resolve(
        &self,
        package_path: &str,
        on_log: impl FnMut(&str),
    ) -> Result<RpcStatus, ClientError> {
        let request = ResolveRequest {
            package_path: package_path.to_string(),
        };
        self.call("resolve", &request, on_log).await
    }

    /// Builds the package at `package_path`. See [`resolve`](Self::resolve).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the call fails at the transport level.
    pub async fn build(
        &self,
        package_path: &str,
        on_log: impl FnMut(&str),
    ) -> Result<RpcStatus, ClientError> {
        let request = BuildRequest {
            package_path: package_path.to_string(),
        };
        self.call("build", &request, on_log).await
    }

    /// Fetches the service's health report.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the service cannot be reached.
    pub async fn health(&self) -> Result<serde_json::Value, ClientError> {
        match &self.transport {
            Transport::Tcp { http, base_url } => {
                let response = http
                    .get(format!("{base_url}/health"))
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(response.json().await?)
            }
            Transport::Unix { path } => {
                let request = Request::builder()
                    .method(Method::GET)
                    .uri("/health")
                    .header(header::HOST, "localhost")
                    .body(Full::new(Bytes::new()))?;
                let response = send_unix(path, request).await?;
                let body = response.into_body().collect().await?.to_bytes();
                Ok(serde_json::from_slice(&body)?)
            }
        }
    }

    async fn call<T: Serialize>(
        &self,
        route: &str,
        request: &T,
        mut on_log: impl FnMut(&str),
    ) -> Result<RpcStatus, ClientError> {
        let payload = rmp_serde::to_vec_named(request)?;
        let mut body = match &self.transport {
            Transport::Tcp { http, base_url } => {
                let response = http
                    .post(format!("{base_url}/{route}"))
                    .header(header::CONTENT_TYPE, MSGPACK_CONTENT_TYPE)
                    .body(payload)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(ClientError::UnexpectedStatus(response.status()));
                }
                EventBody::Tcp(response)
            }
            Transport::Unix { path } => {
                let request = Request::builder()
                    .method(Method::POST)
                    .uri(format!("/{route}"))
                    .header(header::HOST, "localhost")
                    .header(header::CONTENT_TYPE, MSGPACK_CONTENT_TYPE)
                    .body(Full::new(Bytes::from(payload)))?;
                EventBody::Unix(send_unix(path, request).await?.into_body())
            }
        };

        let mut codec = EventCodec::new();
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.chunk().await? {
            buf.extend_from_slice(&chunk);
            while let Some(event) = codec.decode(&mut buf)? {
                match event {
                    OperationEvent::Log { log } => on_log(&log),
                    OperationEvent::Status { status } => {
                        debug!(route, %status, "operation finished");
                        return Ok(status);
                    }
                }
            }
        }
        Err(ClientError::MissingStatus)
    }
}

/// Sends one request over a new connection to the socket at `path`.
async fn send_unix(
    path: &Path,
    request: Request<Full<Bytes>>,
) -> Result<Response<Incoming>, ClientError> {
    let stream = UnixStream::connect(path)
        .await
        .map_err(|source| ClientError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "unix connection closed with an error");
        }
    });

    let response = sender.send_request(request).await?;
    if !response.status().is_success() {
        return Err(ClientError::UnexpectedStatus(response.status()));
    }
    Ok(response)
}
