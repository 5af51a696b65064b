// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Certificate verification with SPIFFE authorization.
//!
//! Both verifiers run in two stages: standard chain verification against
//! the identity source's *current* trust bundle, then extraction of the
//! peer's URI SAN and application of the configured [`Authorizer`]. An
//! authorization failure aborts the handshake with the authorizer's
//! reason; nothing leaks to the HTTP layer.
//!
//! Hostname verification is intentionally absent on the client side:
//! SPIFFE peers are named by URI SAN, not DNS, and the authorizer is the
//! replacement check.

use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{
    DigitallySignedStruct, DistinguishedName, Error as TlsError, PeerIncompatible, RootCertStore,
    SignatureScheme,
};

use crate::authorizer::Authorizer;
use crate::id::{SpiffeId, TrustDomain};
use crate::source::IdentitySource;
use crate::svid::parse_leaf;

fn general(msg: impl std::fmt::Display) -> TlsError {
    TlsError::General(msg.to_string())
}

fn peer_id(end_entity: &CertificateDer<'_>) -> Result<SpiffeId, TlsError> {
    parse_leaf(end_entity.as_ref())
        .map(|info| info.spiffe_id)
        .map_err(|e| general(format!("peer certificate has no usable SPIFFE ID: {e}")))
}

fn authorize(authorizer: &Authorizer, peer: &SpiffeId) -> Result<(), TlsError> {
    if authorizer.permits(peer) {
        Ok(())
    } else {
        Err(general(format!("peer {peer} rejected by authorizer {authorizer}")))
    }
}

/// Server-side verifier: WebPKI chain build against the current bundle,
/// then the authorizer predicate on the client's SPIFFE ID.
pub(crate) struct SpiffeClientVerifier {
    source: IdentitySource,
    trust_domain: TrustDomain,
    authorizer: Authorizer,
    provider: Arc<CryptoProvider>,
    // WebPKI delegate rebuilt whenever the bundle generation moves.
    delegate: Mutex<Option<(u64, Arc<dyn ClientCertVerifier>)>>,
}

impl std::fmt::Debug for SpiffeClientVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpiffeClientVerifier")
            .field("authorizer", &self.authorizer)
            .finish_non_exhaustive()
    }
}

impl SpiffeClientVerifier {
    pub(crate) fn new(
        source: IdentitySource,
        trust_domain: TrustDomain,
        authorizer: Authorizer,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self { source, trust_domain, authorizer, provider, delegate: Mutex::new(None) }
    }

    fn current_delegate(&self) -> Result<Arc<dyn ClientCertVerifier>, TlsError> {
        let snapshot = self.source.snapshot().map_err(general)?;
        let mut cached = self.delegate.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((generation, delegate)) = cached.as_ref() {
            if *generation == snapshot.generation {
                return Ok(Arc::clone(delegate));
            }
        }
        let bundle = snapshot
            .bundle
            .as_ref()
            .filter(|b| b.trust_domain() == &self.trust_domain)
            .ok_or_else(|| general(format!("no trust bundle for {}", self.trust_domain)))?;
        let delegate = WebPkiClientVerifier::builder_with_provider(
            Arc::new(bundle.root_store()),
            Arc::clone(&self.provider),
        )
        .build()
        .map_err(|e| general(format!("client verifier build failed: {e}")))?;
        *cached = Some((snapshot.generation, Arc::clone(&delegate)));
        Ok(delegate)
    }
}

impl ClientCertVerifier for SpiffeClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        self.current_delegate()?.verify_client_cert(end_entity, intermediates, now)?;
        let peer = peer_id(end_entity)?;
        authorize(&self.authorizer, &peer)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Err(TlsError::PeerIncompatible(PeerIncompatible::ServerDoesNotSupportTls12Or13))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Client-side verifier: chain build to the current bundle's anchors,
/// then the authorizer predicate on the server's SPIFFE ID. No DNS name
/// check.
pub(crate) struct SpiffeServerVerifier {
    source: IdentitySource,
    trust_domain: TrustDomain,
    authorizer: Authorizer,
    provider: Arc<CryptoProvider>,
    roots: Mutex<Option<(u64, Arc<RootCertStore>)>>,
}

impl std::fmt::Debug for SpiffeServerVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpiffeServerVerifier")
            .field("authorizer", &self.authorizer)
            .finish_non_exhaustive()
    }
}

impl SpiffeServerVerifier {
    pub(crate) fn new(
        source: IdentitySource,
        trust_domain: TrustDomain,
        authorizer: Authorizer,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self { source, trust_domain, authorizer, provider, roots: Mutex::new(None) }
    }

    fn current_roots(&self) -> Result<Arc<RootCertStore>, TlsError> {
        let snapshot = self.source.snapshot().map_err(general)?;
        let mut cached = self.roots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((generation, roots)) = cached.as_ref() {
            if *generation == snapshot.generation {
                return Ok(Arc::clone(roots));
            }
        }
        let bundle = snapshot
            .bundle
            .as_ref()
            .filter(|b| b.trust_domain() == &self.trust_domain)
            .ok_or_else(|| general(format!("no trust bundle for {}", self.trust_domain)))?;
        let roots = Arc::new(bundle.root_store());
        *cached = Some((snapshot.generation, Arc::clone(&roots)));
        Ok(roots)
    }
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let roots = self.current_roots()?;
        let parsed = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        let peer = peer_id(end_entity)?;
        authorize(&self.authorizer, &peer)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Err(TlsError::PeerIncompatible(PeerIncompatible::ServerDoesNotSupportTls12Or13))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
