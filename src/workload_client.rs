// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Client side of the Workload API.
//!
//! Dials the agent socket, performs `GET /svid/x509` over HTTP/1.1, and
//! validates the response against the protocol invariants before handing
//! identity material to the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes};
use hyper::{Method, Request, StatusCode, header};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::error::{Error, Result};
use crate::wire::{
    FetchedSvid, MAX_ERROR_PREVIEW_BYTES, MAX_RESPONSE_BYTES, SVID_ENDPOINT, SvidResponse,
};

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Strips the `unix://` scheme prefixes agents are commonly configured
/// with, leaving a plain filesystem (or `@`-abstract) path.
#[must_use]
pub fn normalize_socket_path(address: &str) -> &str {
    address
        .strip_prefix("unix://")
        .or_else(|| address.strip_prefix("unix:"))
        .unwrap_or(address)
}

/// HTTP-over-UDS client for the local Workload API.
#[derive(Clone, Debug)]
pub struct WorkloadApiClient {
    socket_path: PathBuf,
    request_timeout: Duration,
}

impl WorkloadApiClient {
    /// Builds a client for the agent socket at `address`.
    ///
    /// `unix://` prefixes are normalized away; the remaining path must be
    /// absolute, or an `@`-prefixed abstract name on Linux.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSocketPath`] for empty, relative, or otherwise
    /// unusable paths.
    pub fn new(address: impl AsRef<str>) -> Result<Self> {
        let path = normalize_socket_path(address.as_ref());
        validate_socket_path(path)?;
        Ok(Self { socket_path: PathBuf::from(path), request_timeout: DEFAULT_REQUEST_TIMEOUT })
    }

    /// Overrides the per-request deadline (default 10 s).
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// The socket path requests are sent to.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Fetches and validates the caller's X.509 SVID.
    ///
    /// # Errors
    ///
    /// [`Error::WorkloadApiUnavailable`] when the socket cannot be dialled,
    /// [`Error::FetchFailed`] for transport failures mid-request,
    /// [`Error::ServerError`] for non-200 statuses (body preview capped at
    /// 4 KiB), [`Error::InvalidResponse`] for protocol violations, and
    /// [`Error::Cancelled`] when the request deadline elapses.
    pub async fn fetch_x509_svid(&self) -> Result<FetchedSvid> {
        tokio::time::timeout(self.request_timeout, self.fetch_inner())
            .await
            .map_err(|_| Error::Cancelled)?
    }

    async fn fetch_inner(&self) -> Result<FetchedSvid> {
        let stream = self.connect().await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::FetchFailed(format!("HTTP handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "workload API connection closed with error");
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri(SVID_ENDPOINT)
            .header(header::HOST, "localhost")
            .header(header::ACCEPT, "application/json")
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::FetchFailed(format!("request build failed: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::FetchFailed(format!("request failed: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            let (preview, _) = read_capped(response.into_body(), MAX_ERROR_PREVIEW_BYTES).await?;
            return Err(Error::ServerError {
                status: status.as_u16(),
                preview: String::from_utf8_lossy(&preview).into_owned(),
            });
        }

        let (body, truncated) = read_capped(response.into_body(), MAX_RESPONSE_BYTES).await?;
        if truncated {
            return Err(Error::invalid_response("response body exceeds 1 MiB"));
        }
        let decoded: SvidResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::invalid_response(format!("JSON decode failed: {e}")))?;
        decoded.validate()
    }

    async fn connect(&self) -> Result<UnixStream> {
        connect_uds(&self.socket_path).await.map_err(|source| Error::WorkloadApiUnavailable {
            socket: self.socket_path.display().to_string(),
            source,
        })
    }
}

fn validate_socket_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidSocketPath("path is empty".into()));
    }
    if path.starts_with('@') {
        if path.len() == 1 {
            return Err(Error::InvalidSocketPath("abstract socket name is empty".into()));
        }
        return Ok(());
    }
    if !path.starts_with('/') {
        return Err(Error::InvalidSocketPath(format!("{path}: must be absolute or @-abstract")));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
async fn connect_uds(path: &Path) -> std::io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;

    let Some(name) = path.to_str().and_then(|p| p.strip_prefix('@')) else {
        return UnixStream::connect(path).await;
    };
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    std_stream.set_nonblocking(true)?;
    UnixStream::from_std(std_stream)
}

#[cfg(not(target_os = "linux"))]
async fn connect_uds(path: &Path) -> std::io::Result<UnixStream> {
    UnixStream::connect(path).await
}

/// Reads a body up to `cap` bytes. Returns the collected prefix and
/// whether anything beyond the cap was discarded.
async fn read_capped<B>(mut body: B, cap: usize) -> Result<(Vec<u8>, bool)>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut buf = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| Error::FetchFailed(format!("body read failed: {e}")))?;
        if let Some(data) = frame.data_ref() {
            if buf.len() + data.len() > cap {
                buf.extend_from_slice(&data[..cap - buf.len()]);
                return Ok((buf, true));
            }
            buf.extend_from_slice(data);
        }
    }
    Ok((buf, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_agent_address_prefixes() {
        assert_eq!(normalize_socket_path("unix:///tmp/agent.sock"), "/tmp/agent.sock");
        assert_eq!(normalize_socket_path("unix:/tmp/agent.sock"), "/tmp/agent.sock");
        assert_eq!(normalize_socket_path("/tmp/agent.sock"), "/tmp/agent.sock");
    }

    #[test]
    fn rejects_unusable_paths() {
        assert!(matches!(WorkloadApiClient::new(""), Err(Error::InvalidSocketPath(_))));
        assert!(matches!(
            WorkloadApiClient::new("relative/agent.sock"),
            Err(Error::InvalidSocketPath(_))
        ));
        assert!(matches!(WorkloadApiClient::new("@"), Err(Error::InvalidSocketPath(_))));
        assert!(WorkloadApiClient::new("@dev-agent").is_ok());
        assert!(WorkloadApiClient::new("unix:///run/agent.sock").is_ok());
    }

    #[tokio::test]
    async fn missing_socket_is_unavailable() {
        let client = WorkloadApiClient::new("/nonexistent/api.sock").unwrap();
        let err = client.fetch_x509_svid().await.unwrap_err();
        assert!(matches!(err, Error::WorkloadApiUnavailable { .. }));
    }
}
