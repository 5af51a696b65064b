// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Dynamic certificate resolution.
//!
//! rustls asks for the certificate on every handshake; the resolver
//! answers with signing material built from the identity source's current
//! snapshot, so rotation needs no config rebuild. The built
//! [`CertifiedKey`] is cached per snapshot generation.

use std::sync::{Arc, Mutex};

use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;

use crate::source::IdentitySource;

pub(crate) struct SvidCertResolver {
    source: IdentitySource,
    provider: Arc<CryptoProvider>,
    cache: Mutex<Option<(u64, Arc<CertifiedKey>)>>,
}

impl std::fmt::Debug for SvidCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvidCertResolver").finish_non_exhaustive()
    }
}

impl SvidCertResolver {
    pub(crate) fn new(source: IdentitySource, provider: Arc<CryptoProvider>) -> Self {
        Self { source, provider, cache: Mutex::new(None) }
    }

    fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        let snapshot = match self.source.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "no certificate available for handshake");
                return None;
            }
        };
        let mut cache = self.cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((generation, key)) = cache.as_ref() {
            if *generation == snapshot.generation {
                return Some(Arc::clone(key));
            }
        }
        let signing_key = self
            .provider
            .key_provider
            .load_private_key(snapshot.svid.private_key().clone_key())
            .inspect_err(|e| tracing::error!(error = %e, "SVID private key rejected"))
            .ok()?;
        let key = Arc::new(CertifiedKey::new(snapshot.svid.cert_chain(), signing_key));
        *cache = Some((snapshot.generation, Arc::clone(&key)));
        Some(key)
    }
}

impl ResolvesServerCert for SvidCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }
}

impl ResolvesClientCert for SvidCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }

    fn has_certs(&self) -> bool {
        true
    }
}
