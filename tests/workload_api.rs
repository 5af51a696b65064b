//! End-to-end Workload API tests over a real Unix domain socket: a
//! registered caller fetches an SVID, an unregistered caller gets a
//! generic 500, and non-GET methods are refused.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tempfile::TempDir;

use spiffe_mtls::{
    CaIssuer, Error, IdentityMapper, RegistryBuilder, Selector, ServerOptions, ServerState,
    SpiffeId, TrustDomain, WorkloadApiClient, WorkloadApiServer,
};

fn own_uid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").unwrap().uid()
}

struct Harness {
    _dir: TempDir,
    socket: PathBuf,
    server: WorkloadApiServer,
}

async fn start_server(registered_uid: u32, spiffe_id: &str) -> Harness {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("wapi.sock");

    let mapper = IdentityMapper::new(
        SpiffeId::parse(spiffe_id).unwrap(),
        [Selector::unix_uid(registered_uid)].into_iter().collect(),
    )
    .unwrap();
    let mut builder = RegistryBuilder::new();
    builder.seed(mapper).unwrap();
    let registry = builder.seal();

    let issuer = CaIssuer::empty(TrustDomain::new("example.org").unwrap());
    issuer.init_self_signed().unwrap();

    let server = WorkloadApiServer::new(registry, Arc::new(issuer), ServerOptions::default());
    server.bind(&socket).await.unwrap();
    assert_eq!(server.state(), ServerState::Listening);

    Harness { _dir: dir, socket, server }
}

#[tokio::test(flavor = "multi_thread")]
async fn registered_uid_fetches_svid() {
    let harness = start_server(own_uid(), "spiffe://example.org/server").await;

    let client = WorkloadApiClient::new(harness.socket.to_str().unwrap()).unwrap();
    let fetched = client.fetch_x509_svid().await.unwrap();

    assert_eq!(fetched.svid.spiffe_id().to_string(), "spiffe://example.org/server");
    let bundle = fetched.bundle.expect("dev backend sends its bundle");
    assert_eq!(bundle.trust_domain().name(), "example.org");

    // Default TTL is 24 h; allow generous slack for slow CI.
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    let expected = now + 24 * 3600;
    assert!((fetched.svid.expires_at() - expected).abs() < 300);

    harness.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_uid_is_rejected_without_detail() {
    // Register a uid that is not ours.
    let harness = start_server(own_uid().wrapping_add(4242), "spiffe://example.org/server").await;

    let client = WorkloadApiClient::new(harness.socket.to_str().unwrap()).unwrap();
    let err = client.fetch_x509_svid().await.unwrap_err();
    match err {
        Error::ServerError { status, preview } => {
            assert_eq!(status, 500);
            // No selector or identity detail leaks to the caller.
            assert!(!preview.contains("spiffe://"));
            assert!(!preview.contains("uid"));
        }
        other => panic!("expected ServerError, got {other:?}"),
    }

    harness.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn non_get_methods_are_refused() {
    let harness = start_server(own_uid(), "spiffe://example.org/server").await;

    let response = raw_request(&harness.socket, Method::POST, "/svid/x509").await;
    assert_eq!(response, StatusCode::METHOD_NOT_ALLOWED);

    let response = raw_request(&harness.socket, Method::DELETE, "/svid/x509").await;
    assert_eq!(response, StatusCode::METHOD_NOT_ALLOWED);

    harness.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_paths_are_not_found() {
    let harness = start_server(own_uid(), "spiffe://example.org/server").await;
    let response = raw_request(&harness.socket, Method::GET, "/other").await;
    assert_eq!(response, StatusCode::NOT_FOUND);
    harness.server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_idempotent_and_unlinks_the_socket() {
    let harness = start_server(own_uid(), "spiffe://example.org/server").await;
    assert!(harness.socket.exists());

    harness.server.shutdown().await.unwrap();
    assert_eq!(harness.server.state(), ServerState::Stopped);
    assert!(!harness.socket.exists());

    // Second shutdown is a no-op with the same result.
    harness.server.shutdown().await.unwrap();
    assert_eq!(harness.server.state(), ServerState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn socket_permissions_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let harness = start_server(own_uid(), "spiffe://example.org/server").await;
    let mode = std::fs::metadata(&harness.socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o700);
    harness.server.shutdown().await.unwrap();
}

async fn raw_request(socket: &Path, method: Method, path: &str) -> StatusCode {
    let stream = tokio::net::UnixStream::connect(socket).await.unwrap();
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .method(method)
        .uri(path)
        .header(hyper::header::HOST, "localhost")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let _ = response.into_body().collect().await;
    status
}
