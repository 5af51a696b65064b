// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Verified peer identity, extracted once per TLS session.
//!
//! The façade's middleware reads the leaf certificate out of the
//! connection state after the handshake and attaches a [`Peer`] to every
//! request on that connection. Handlers read it through
//! [`peer_identity`]; they never parse certificates themselves.

use hyper::Request;
use rustls::pki_types::CertificateDer;
use tokio_rustls::server::TlsStream;

use crate::error::Result;
use crate::id::{SpiffeId, TrustDomain};
use crate::svid::parse_leaf;

/// Identity of the peer on an established mTLS connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// SPIFFE ID from the verified leaf's URI SAN.
    pub id: SpiffeId,
    /// Trust domain of that id.
    pub trust_domain: TrustDomain,
    /// Leaf `notAfter` as unix seconds.
    pub expires_at: i64,
}

impl Peer {
    /// Parses a peer out of a DER-encoded leaf certificate.
    ///
    /// # Errors
    ///
    /// Propagates [`parse_leaf`] failures for certificates without a
    /// usable SPIFFE URI SAN.
    pub fn from_leaf(leaf: &CertificateDer<'_>) -> Result<Self> {
        let info = parse_leaf(leaf.as_ref())?;
        let trust_domain = info.spiffe_id.trust_domain().clone();
        Ok(Self { id: info.spiffe_id, trust_domain, expires_at: info.not_after })
    }
}

/// Extracts the peer from an accepted server-side TLS stream.
///
/// Returns `None` when the peer presented no certificate, which cannot
/// happen on configurations built by this crate (client auth is
/// require-and-verify).
#[must_use]
pub fn peer_from_stream<IO>(stream: &TlsStream<IO>) -> Option<Peer> {
    let (_, connection) = stream.get_ref();
    let leaf = connection.peer_certificates()?.first()?;
    Peer::from_leaf(leaf).ok()
}

/// The verified peer attached to `request`, if middleware put one there.
#[must_use]
pub fn peer_identity<B>(request: &Request<B>) -> Option<&Peer> {
    request.extensions().get::<Peer>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::CaIssuer;

    #[test]
    fn peer_parses_from_issued_leaf() {
        let issuer = CaIssuer::empty(TrustDomain::new("example.org").unwrap());
        issuer.init_self_signed().unwrap();
        let id = SpiffeId::parse("spiffe://example.org/client").unwrap();
        let svid = issuer.issue(&id).unwrap();

        let peer = Peer::from_leaf(svid.leaf()).unwrap();
        assert_eq!(peer.id, id);
        assert_eq!(peer.trust_domain.name(), "example.org");
        assert_eq!(peer.expires_at, svid.expires_at());
    }

    #[test]
    fn request_extension_round_trip() {
        let issuer = CaIssuer::empty(TrustDomain::new("example.org").unwrap());
        issuer.init_self_signed().unwrap();
        let id = SpiffeId::parse("spiffe://example.org/client").unwrap();
        let svid = issuer.issue(&id).unwrap();
        let peer = Peer::from_leaf(svid.leaf()).unwrap();

        let mut request = Request::new(());
        assert!(peer_identity(&request).is_none());
        request.extensions_mut().insert(peer.clone());
        assert_eq!(peer_identity(&request), Some(&peer));
    }
}
