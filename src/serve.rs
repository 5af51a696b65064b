// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! High-level façade: one call from a config file to a running mTLS
//! server or client.
//!
//! [`start`] wires loader → identity source → TLS config → HTTPS listener
//! and returns an idempotent [`ServerHandle`]. [`client`] is symmetric
//! and returns an [`HttpClient`] whose certificates rotate transparently
//! across requests. Both handles release the identity source on shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, Uri};
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::pki_types::ServerName;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::{Config, HttpTimeouts};
use crate::error::{Error, Result};
use crate::peer::peer_from_stream;
use crate::source::{IdentitySource, SourceOptions};
use crate::tls_config::{client_tls_config, server_tls_config};
use crate::workload_client::WorkloadApiClient;

/// Loads the config at `config_path` and starts the mTLS HTTPS server.
///
/// `handler` runs for every accepted request, with the verified
/// [`crate::Peer`] already attached to the request extensions.
/// Construction blocks until the identity source holds an initial SVID.
/// When binding the listener fails, the source is released before the
/// bind error is returned.
///
/// # Errors
///
/// Configuration, identity-source, and bind failures.
pub async fn start<H, Fut>(config_path: impl AsRef<Path>, handler: H) -> Result<ServerHandle>
where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let config = Config::load(config_path)?;
    start_with_config(&config, handler).await
}

/// [`start`] for an already-loaded [`Config`].
///
/// # Errors
///
/// Same as [`start`].
pub async fn start_with_config<H, Fut>(config: &Config, handler: H) -> Result<ServerHandle>
where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let settings = config.server.as_ref().ok_or(Error::MissingRequiredField("server"))?;
    if !settings.enabled {
        return Err(Error::invalid_config("server is disabled by configuration"));
    }

    let source = connect_source(config).await?;
    let tls = match server_tls_config(&source, settings.authorizer.clone()) {
        Ok(tls) => tls,
        Err(e) => {
            source.close();
            return Err(e);
        }
    };

    let listener = match TcpListener::bind(normalize_listen_addr(&settings.listen_addr)).await {
        Ok(listener) => listener,
        Err(e) => {
            source.close();
            return Err(Error::Io(e));
        }
    };
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "mTLS server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let acceptor = TlsAcceptor::from(tls);
    let accept_task = tokio::spawn(accept_loop(
        listener,
        acceptor,
        handler,
        config.timeouts.clone(),
        shutdown_rx,
    ));

    Ok(ServerHandle {
        local_addr,
        source,
        shutdown: shutdown_tx,
        accept_task: tokio::sync::Mutex::new(Some(accept_task)),
        done: AtomicBool::new(false),
    })
}

/// Running server; dropping it does not stop the listener, call
/// [`ServerHandle::shutdown`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    source: IdentitySource,
    shutdown: watch::Sender<bool>,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    done: AtomicBool,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle").field("local_addr", &self.local_addr).finish_non_exhaustive()
    }
}

impl ServerHandle {
    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The identity source backing the server's certificates.
    #[must_use]
    pub fn identity_source(&self) -> &IdentitySource {
        &self.source
    }

    /// Stops accepting, drains in-flight connections up to the configured
    /// deadline, then closes the identity source.
    ///
    /// Idempotent; repeated calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// The first error encountered while releasing resources.
    pub async fn shutdown(&self) -> Result<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);
        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "accept loop ended abnormally");
            }
        }
        self.source.close();
        Ok(())
    }
}

async fn accept_loop<H, Fut>(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handler: H,
    timeouts: HttpTimeouts,
    mut shutdown: watch::Receiver<bool>,
) where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let acceptor = acceptor.clone();
                    let handler = handler.clone();
                    let read_header = timeouts.read_header;
                    connections.spawn(async move {
                        serve_tls_connection(acceptor, stream, remote, handler, read_header).await;
                    });
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);

    let deadline = tokio::time::sleep(timeouts.drain);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
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

async fn serve_tls_connection<H, Fut>(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    remote: SocketAddr,
    handler: H,
    read_header: Duration,
) where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    // Verification failures abort here with a TLS alert; handlers never
    // see the connection.
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            tracing::debug!(%remote, error = %e, "TLS handshake failed");
            return;
        }
    };

    // One Peer per TLS session, attached to every request on it.
    let peer = peer_from_stream(&tls_stream);
    let service = service_fn(move |mut request: Request<Incoming>| {
        if let Some(peer) = peer.clone() {
            request.extensions_mut().insert(peer);
        }
        let handler = handler.clone();
        async move { Ok::<_, std::convert::Infallible>(handler(request).await) }
    });

    let served = hyper::server::conn::http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(read_header)
        .serve_connection(TokioIo::new(tls_stream), service)
        .await;
    if let Err(e) = served {
        tracing::debug!(%remote, error = %e, "connection ended with error");
    }
}

/// Loads the config at `config_path` and builds the mTLS HTTP client.
///
/// # Errors
///
/// Configuration and identity-source failures.
pub async fn client(config_path: impl AsRef<Path>) -> Result<(HttpClient, ClientHandle)> {
    let config = Config::load(config_path)?;
    client_with_config(&config).await
}

/// [`client`] for an already-loaded [`Config`].
///
/// # Errors
///
/// Same as [`client`].
pub async fn client_with_config(config: &Config) -> Result<(HttpClient, ClientHandle)> {
    let settings = config.client.as_ref().ok_or(Error::MissingRequiredField("client"))?;
    let source = connect_source(config).await?;
    let tls = match client_tls_config(&source, settings.authorizer.clone()) {
        Ok(tls) => tls,
        Err(e) => {
            source.close();
            return Err(e);
        }
    };
    let http_client = HttpClient { tls };
    let handle = ClientHandle { source, done: AtomicBool::new(false) };
    Ok((http_client, handle))
}

async fn connect_source(config: &Config) -> Result<IdentitySource> {
    let workload_client = WorkloadApiClient::new(&config.spire.workload_socket)?;
    IdentitySource::connect(
        workload_client,
        SourceOptions { initial_fetch_timeout: config.spire.initial_fetch_timeout },
    )
    .await
}

/// mTLS HTTP/1.1 client. Certificate material is resolved per handshake,
/// so SVID rotation needs no rebuild.
#[derive(Clone)]
pub struct HttpClient {
    tls: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient").finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Sends `request` over a fresh mTLS connection.
    ///
    /// The request URI must be absolute (`https://host:port/path`).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for unusable URIs, I/O and TLS failures
    /// from connecting, [`Error::FetchFailed`] for HTTP-level failures.
    pub async fn request(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        let (host, port) = host_port(request.uri())?;
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| Error::invalid_config(format!("invalid host {host:?}")))?;

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        let connector = TlsConnector::from(Arc::clone(&self.tls));
        let tls_stream = connector.connect(server_name, tcp).await?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls_stream))
            .await
            .map_err(|e| Error::FetchFailed(format!("HTTP handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "client connection closed with error");
            }
        });
        sender
            .send_request(request)
            .await
            .map_err(|e| Error::FetchFailed(format!("request failed: {e}")))
    }

    /// `GET` convenience wrapper around [`HttpClient::request`].
    ///
    /// # Errors
    ///
    /// Same as [`HttpClient::request`].
    pub async fn get(&self, uri: &str) -> Result<Response<Incoming>> {
        let uri: Uri = uri
            .parse()
            .map_err(|e| Error::invalid_config(format!("invalid URI {uri:?}: {e}")))?;
        let request = Request::builder()
            .method(hyper::Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| Error::FetchFailed(format!("request build failed: {e}")))?;
        self.request(request).await
    }
}

/// Releases the client's identity source.
pub struct ClientHandle {
    source: IdentitySource,
    done: AtomicBool,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle").finish_non_exhaustive()
    }
}

impl ClientHandle {
    /// The identity source backing the client's certificates.
    #[must_use]
    pub fn identity_source(&self) -> &IdentitySource {
        &self.source
    }

    /// Closes the identity source. Idempotent.
    pub fn shutdown(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.source.close();
    }
}

fn host_port(uri: &Uri) -> Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| Error::invalid_config(format!("URI {uri} has no host")))?
        .to_owned();
    let port = uri.port_u16().unwrap_or(443);
    Ok((host, port))
}

/// Accepts the `":8443"` shorthand for all-interfaces binds.
fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_shorthand_expands() {
        assert_eq!(normalize_listen_addr(":8443"), "0.0.0.0:8443");
        assert_eq!(normalize_listen_addr("127.0.0.1:8443"), "127.0.0.1:8443");
    }

    #[test]
    fn host_port_defaults_to_https() {
        let uri: Uri = "https://server.example:8443/path".parse().unwrap();
        assert_eq!(host_port(&uri).unwrap(), ("server.example".to_owned(), 8443));
        let uri: Uri = "https://server.example/path".parse().unwrap();
        assert_eq!(host_port(&uri).unwrap(), ("server.example".to_owned(), 443));
    }
}
