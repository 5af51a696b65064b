// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Server side of the Workload API: the local attestation service.
//!
//! Listens on a Unix domain socket and answers `GET /svid/x509`. Peer
//! credentials are extracted from the kernel on accept, before any payload
//! is read, and travel with the connection; requests on a connection that
//! carries no credentials fail closed. Attestation and lookup failures
//! answer a generic 500 — which selector missed goes to the audit log
//! only, never to the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, header};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::attest::{PeerCredentials, peer_credentials};
use crate::error::{Error, Result};
use crate::issuer::CaIssuer;
use crate::registry::IdentityLookup;
use crate::selector::{Selector, SelectorSet};
use crate::wire::{MAX_RESPONSE_BYTES, SVID_ENDPOINT, SvidResponse};

const AUDIT: &str = "workload_api::audit";
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a [`WorkloadApiServer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, not yet bound.
    Idle,
    /// Accepting connections.
    Listening,
    /// Draining in-flight requests.
    ShuttingDown,
    /// Fully stopped; the socket has been unlinked.
    Stopped,
}

/// Tunables for the Workload API listener.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Permission bits applied to the socket file. Default `0o700`.
    pub socket_mode: u32,
    /// How long shutdown waits for in-flight requests before closing
    /// connections forcibly. Default 5 s.
    pub drain_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self { socket_mode: 0o700, drain_timeout: Duration::from_secs(5) }
    }
}

impl ServerOptions {
    fn validate(&self) -> Result<()> {
        if self.socket_mode & 0o002 != 0 {
            return Err(Error::invalid_config(format!(
                "socket mode {:o} is world-writable",
                self.socket_mode
            )));
        }
        Ok(())
    }
}

struct Inner {
    registry: Arc<dyn IdentityLookup>,
    issuer: Arc<CaIssuer>,
    options: ServerOptions,
    state: watch::Sender<ServerState>,
    shutdown: watch::Sender<bool>,
}

/// HTTP-over-UDS Workload API server backed by a sealed registry and a CA.
pub struct WorkloadApiServer {
    inner: Arc<Inner>,
    socket_path: std::sync::Mutex<Option<PathBuf>>,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkloadApiServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadApiServer").field("state", &self.state()).finish_non_exhaustive()
    }
}

impl WorkloadApiServer {
    /// A server in the [`ServerState::Idle`] state.
    #[must_use]
    pub fn new(
        registry: Arc<dyn IdentityLookup>,
        issuer: Arc<CaIssuer>,
        options: ServerOptions,
    ) -> Self {
        let (state, _) = watch::channel(ServerState::Idle);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner { registry, issuer, options, state, shutdown }),
            socket_path: std::sync::Mutex::new(None),
            accept_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.inner.state.borrow()
    }

    /// Binds the socket and starts accepting connections.
    ///
    /// A stale socket file at `path` is removed first; the fresh socket
    /// gets the configured permission bits before the first accept.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyStarted`] unless the server is idle,
    /// [`Error::InvalidConfig`] for a world-writable socket mode, and I/O
    /// errors from binding.
    pub async fn bind(&self, path: impl AsRef<Path>) -> Result<()> {
        self.inner.options.validate()?;
        if self.state() != ServerState::Idle {
            return Err(Error::AlreadyStarted);
        }
        let path = path.as_ref().to_path_buf();
        let listener = bind_socket(&path, self.inner.options.socket_mode)?;
        tracing::info!(socket = %path.display(), "workload API listening");

        *self.socket_path.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            Some(path);
        self.inner.state.send_replace(ServerState::Listening);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(accept_loop(inner, listener));
        *self.accept_task.lock().await = Some(task);
        Ok(())
    }

    /// Stops the server: drains in-flight requests up to the configured
    /// deadline, closes what remains, and unlinks the socket.
    ///
    /// Idempotent and safe to call from any task.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered while releasing resources.
    pub async fn shutdown(&self) -> Result<()> {
        match self.state() {
            ServerState::Idle => {
                self.inner.state.send_replace(ServerState::Stopped);
                return Ok(());
            }
            ServerState::Stopped => return Ok(()),
            ServerState::Listening | ServerState::ShuttingDown => {}
        }
        self.inner.state.send_replace(ServerState::ShuttingDown);
        self.inner.shutdown.send_replace(true);

        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "workload API accept loop ended abnormally");
            }
        }

        let mut first_error = None;
        let path = self
            .socket_path
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(path) = path {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    first_error = Some(Error::Io(e));
                }
            }
        }
        self.inner.state.send_replace(ServerState::Stopped);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn bind_socket(path: &Path, mode: u32) -> Result<UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(listener)
}

async fn accept_loop(inner: Arc<Inner>, listener: UnixListener) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let inner = Arc::clone(&inner);
                    connections.spawn(serve_connection(inner, stream));
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);

    // Bounded drain, then forcible close.
    let deadline = tokio::time::sleep(inner.options.drain_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                let open = connections.len();
                if open > 0 {
                    tracing::warn!(open, "drain deadline elapsed, closing connections");
                }
                connections.abort_all();
                break;
            }
            joined = connections.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
        }
    }
}

async fn serve_connection(inner: Arc<Inner>, stream: UnixStream) {
    // Credentials come from the kernel before any payload is read. A
    // failure here closes the connection without an HTTP reply.
    let credentials = match peer_credentials(&stream).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(target: AUDIT, error = %e, "closing connection: attestation failed");
            return;
        }
    };

    let conn_credentials = Some(credentials);
    let service = service_fn(move |req| {
        let inner = Arc::clone(&inner);
        let credentials = conn_credentials.clone();
        async move { Ok::<_, std::convert::Infallible>(handle_request(&inner, credentials.as_ref(), &req)) }
    });

    let result = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .serve_connection(TokioIo::new(stream), service)
        .await;
    if let Err(e) = result {
        tracing::debug!(error = %e, "workload API connection ended with error");
    }
}

fn handle_request(
    inner: &Inner,
    credentials: Option<&PeerCredentials>,
    request: &Request<Incoming>,
) -> Response<Full<Bytes>> {
    // Fail closed: a request whose connection was not wrapped with peer
    // credentials never falls back to header-based identity.
    let Some(credentials) = credentials else {
        tracing::error!(target: AUDIT, "request on unwrapped connection");
        return internal_error();
    };
    if request.method() != Method::GET {
        return plain_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    if request.uri().path() != SVID_ENDPOINT {
        return plain_response(StatusCode::NOT_FOUND, "not found");
    }

    let discovered: SelectorSet = [
        Selector::unix_uid(credentials.uid),
        Selector::unix_gid(credentials.gid),
        Selector::unix_path(credentials.path.to_string_lossy()),
    ]
    .into_iter()
    .collect();

    let Some(mapper) = inner.registry.find_by_selectors(&discovered) else {
        tracing::warn!(target: AUDIT, peer = %credentials, "no mapper matched");
        return internal_error();
    };

    let svid = match inner.issuer.issue(mapper.spiffe_id()) {
        Ok(svid) => svid,
        Err(e) => {
            tracing::error!(target: AUDIT, peer = %credentials, error = %e, "issuance failed");
            return internal_error();
        }
    };
    let bundle = inner.issuer.bundle().ok();

    tracing::info!(
        target: AUDIT,
        peer = %credentials,
        spiffe_id = %svid.spiffe_id(),
        expires_at = svid.expires_at(),
        "issued SVID"
    );

    let body = SvidResponse::from_issued(&svid, bundle.as_ref());
    match serde_json::to_vec(&body) {
        Ok(mut encoded) => {
            if encoded.len() > MAX_RESPONSE_BYTES {
                tracing::warn!(len = encoded.len(), "response exceeds bound, truncating");
                encoded.truncate(MAX_RESPONSE_BYTES);
            }
            json_response(StatusCode::OK, encoded)
        }
        Err(e) => {
            tracing::error!(target: AUDIT, error = %e, "response encoding failed");
            internal_error()
        }
    }
}

fn internal_error() -> Response<Full<Bytes>> {
    plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8");
    if status == StatusCode::METHOD_NOT_ALLOWED {
        builder = builder.header(header::ALLOW, "GET");
    }
    builder
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}
