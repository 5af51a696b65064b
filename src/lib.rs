// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Workload-identity mTLS built on [`rustls`], with a companion local
//! Workload API over a Unix domain socket.
//!
//! Three subsystems cooperate:
//!
//! * [`IdentitySource`] — a live, thread-safe holder of the current
//!   X509-SVID and trust bundle, refreshed by a background task.
//! * [`server_tls_config`] / [`client_tls_config`] — TLS configurations
//!   that resolve certificate material per handshake from the source and
//!   verify peers with SPIFFE [`Authorizer`] policies.
//! * [`WorkloadApiServer`] / [`WorkloadApiClient`] — an HTTP-over-UDS
//!   protocol issuing SVIDs to local workloads, attested by kernel peer
//!   credentials rather than anything the caller asserts.
//!
//! The [`start`] and [`client`] façade turns a small YAML config into a
//! running mTLS server or client with transparent SVID rotation.

#![forbid(rust_2018_idioms)]
#![forbid(missing_docs, unsafe_code)]
#![deny(
    clippy::all,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::dbg_macro,
    clippy::todo
)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod attest;
mod authorizer;
mod config;
mod error;
mod id;
mod issuer;
mod peer;
mod registry;
mod resolver;
mod selector;
mod serve;
mod source;
mod svid;
mod tls_config;
mod verify;
mod wire;
mod workload_client;
mod workload_server;

pub use attest::{PeerCredentials, peer_credentials};
pub use authorizer::Authorizer;
pub use config::{
    ClientSettings, Config, HttpTimeouts, ServerSettings, SpireSettings, parse_duration,
};
pub use error::{Error, Result};
pub use id::{SpiffeId, TrustDomain};
pub use issuer::{CaIssuer, DEFAULT_SVID_TTL};
pub use peer::{Peer, peer_from_stream, peer_identity};
pub use registry::{IdentityLookup, IdentityRegistry, RegistryBuilder};
pub use selector::{IdentityMapper, Selector, SelectorSet};
pub use serve::{
    ClientHandle, HttpClient, ServerHandle, client, client_with_config, start, start_with_config,
};
pub use source::{DEFAULT_INITIAL_FETCH_TIMEOUT, IdentitySource, SourceOptions};
pub use svid::{LeafInfo, TrustBundle, X509Svid, parse_leaf};
pub use tls_config::{client_tls_config, server_tls_config};
pub use wire::{FetchedSvid, SvidResponse};
pub use workload_client::WorkloadApiClient;
pub use workload_server::{ServerOptions, ServerState, WorkloadApiServer};
