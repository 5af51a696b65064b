// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! mTLS configuration builders.
//!
//! Both configurations resolve their certificate material dynamically —
//! every handshake reads the current SVID out of the identity source —
//! and verify the peer with a SPIFFE [`Authorizer`] after the standard
//! chain build. TLS 1.3 only.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, ServerConfig};

use crate::authorizer::Authorizer;
use crate::error::Result;
use crate::resolver::SvidCertResolver;
use crate::source::IdentitySource;
use crate::verify::{SpiffeClientVerifier, SpiffeServerVerifier};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Builds a server configuration that presents the source's SVID and
/// requires-and-verifies client certificates against the source's trust
/// bundle, applying `authorizer` to the client's SPIFFE ID.
///
/// # Errors
///
/// [`crate::Error::SourceClosed`] when the source is closed, or a TLS
/// error if the configuration cannot be assembled.
pub fn server_tls_config(source: &IdentitySource, authorizer: Authorizer) -> Result<Arc<ServerConfig>> {
    let provider = provider();
    let trust_domain = source.current_svid()?.spiffe_id().trust_domain().clone();
    let verifier = Arc::new(SpiffeClientVerifier::new(
        source.clone(),
        trust_domain,
        authorizer,
        Arc::clone(&provider),
    ));
    let resolver = Arc::new(SvidCertResolver::new(source.clone(), Arc::clone(&provider)));

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Builds a client configuration that presents the source's SVID and
/// verifies the server against the source's trust bundle, applying
/// `authorizer` to the server's SPIFFE ID.
///
/// # Errors
///
/// Same failure modes as [`server_tls_config`].
pub fn client_tls_config(source: &IdentitySource, authorizer: Authorizer) -> Result<Arc<ClientConfig>> {
    let provider = provider();
    let trust_domain = source.current_svid()?.spiffe_id().trust_domain().clone();
    let verifier = Arc::new(SpiffeServerVerifier::new(
        source.clone(),
        trust_domain,
        authorizer,
        Arc::clone(&provider),
    ));
    let resolver = Arc::new(SvidCertResolver::new(source.clone(), Arc::clone(&provider)));

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
