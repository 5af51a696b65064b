// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! X.509 SVID and trust bundle material.
//!
//! An [`X509Svid`] is the owned bundle a workload presents during TLS:
//! leaf certificate, optional intermediate chain, and private key, plus
//! the SPIFFE ID and expiry parsed from the leaf at construction time.
//! The URI SAN of the leaf always equals the recorded SPIFFE ID. Readers
//! hold shared immutable snapshots; nothing here is mutated after
//! construction.

use std::fmt;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::error::{Error, Result};
use crate::id::{SpiffeId, TrustDomain};

const CERT_TAG: &str = "CERTIFICATE";
const KEY_TAG: &str = "PRIVATE KEY";

/// Facts parsed out of a leaf certificate.
#[derive(Clone, Debug)]
pub struct LeafInfo {
    /// SPIFFE ID carried in the first `spiffe`-scheme URI SAN.
    pub spiffe_id: SpiffeId,
    /// `notBefore` as unix seconds.
    pub not_before: i64,
    /// `notAfter` as unix seconds.
    pub not_after: i64,
}

/// Parses the SPIFFE-relevant facts out of a DER-encoded leaf certificate.
///
/// # Errors
///
/// [`Error::InvalidCertificate`] if the bytes do not parse or no
/// `spiffe://` URI SAN is present; [`Error::InvalidSpiffeId`] if the SAN
/// does not parse as a SPIFFE ID.
pub fn parse_leaf(der: &[u8]) -> Result<LeafInfo> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::InvalidCertificate(format!("leaf does not parse: {e}")))?;
    let san = cert
        .subject_alternative_name()
        .map_err(|e| Error::InvalidCertificate(format!("malformed SAN extension: {e}")))?
        .ok_or_else(|| Error::InvalidCertificate("leaf has no SAN extension".into()))?;
    let uri = san
        .value
        .general_names
        .iter()
        .find_map(|gn| match gn {
            GeneralName::URI(uri) if uri.starts_with("spiffe://") => Some(*uri),
            _ => None,
        })
        .ok_or_else(|| Error::InvalidCertificate("leaf has no spiffe URI SAN".into()))?;
    Ok(LeafInfo {
        spiffe_id: SpiffeId::parse(uri)?,
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
    })
}

/// Owned (leaf, chain, key) bundle for one workload identity.
pub struct X509Svid {
    spiffe_id: SpiffeId,
    leaf: CertificateDer<'static>,
    intermediates: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    expires_at: i64,
}

impl X509Svid {
    /// Assembles an SVID from DER parts, parsing the SPIFFE ID and expiry
    /// out of the leaf.
    ///
    /// # Errors
    ///
    /// Propagates [`parse_leaf`] failures.
    pub fn from_der(
        leaf: CertificateDer<'static>,
        intermediates: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let info = parse_leaf(&leaf)?;
        Ok(Self {
            spiffe_id: info.spiffe_id,
            leaf,
            intermediates,
            key,
            expires_at: info.not_after,
        })
    }

    /// Parses an SVID from PEM material: one leaf certificate block,
    /// optionally followed by intermediates, plus a PKCS#8 key block.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCertificate`] for unparseable or empty PEM input.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let mut certs = parse_cert_pem(cert_pem)?;
        if certs.is_empty() {
            return Err(Error::InvalidCertificate("no CERTIFICATE block in PEM".into()));
        }
        let leaf = certs.remove(0);
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| Error::InvalidCertificate(format!("key PEM does not parse: {e}")))?
            .ok_or_else(|| Error::InvalidCertificate("no private key block in PEM".into()))?;
        Self::from_der(leaf, certs, key)
    }

    /// The SPIFFE ID encoded in the leaf's URI SAN.
    #[must_use]
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// The DER-encoded leaf certificate.
    #[must_use]
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.leaf
    }

    /// Intermediate chain, leaf excluded. May be empty.
    #[must_use]
    pub fn intermediates(&self) -> &[CertificateDer<'static>] {
        &self.intermediates
    }

    /// Leaf followed by intermediates, the order TLS wants them presented.
    #[must_use]
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        let mut chain = Vec::with_capacity(1 + self.intermediates.len());
        chain.push(self.leaf.clone());
        chain.extend(self.intermediates.iter().cloned());
        chain
    }

    /// The private key matching the leaf.
    #[must_use]
    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    /// Leaf `notAfter` as unix seconds.
    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Leaf and intermediates as concatenated PEM `CERTIFICATE` blocks.
    #[must_use]
    pub fn cert_chain_pem(&self) -> String {
        let mut out = encode_pem(CERT_TAG, &self.leaf);
        for cert in &self.intermediates {
            out.push_str(&encode_pem(CERT_TAG, cert));
        }
        out
    }

    /// The private key as a PKCS#8 PEM block.
    #[must_use]
    pub fn key_pem(&self) -> String {
        encode_pem(KEY_TAG, self.key.secret_der())
    }
}

impl Clone for X509Svid {
    fn clone(&self) -> Self {
        Self {
            spiffe_id: self.spiffe_id.clone(),
            leaf: self.leaf.clone(),
            intermediates: self.intermediates.clone(),
            key: self.key.clone_key(),
            expires_at: self.expires_at,
        }
    }
}

impl fmt::Debug for X509Svid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of debug output.
        f.debug_struct("X509Svid")
            .field("spiffe_id", &self.spiffe_id)
            .field("intermediates", &self.intermediates.len())
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// CA certificates trusted for one trust domain.
#[derive(Clone, Debug)]
pub struct TrustBundle {
    trust_domain: TrustDomain,
    authorities: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    /// Wraps validated CA certificates for `trust_domain`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCertificate`] if the set is empty or any certificate
    /// fails to parse or is not a CA certificate with basic constraints.
    pub fn new(trust_domain: TrustDomain, authorities: Vec<CertificateDer<'static>>) -> Result<Self> {
        if authorities.is_empty() {
            return Err(Error::InvalidCertificate(format!(
                "trust bundle for {trust_domain} is empty"
            )));
        }
        for der in &authorities {
            let (_, cert) = X509Certificate::from_der(der)
                .map_err(|e| Error::InvalidCertificate(format!("bundle cert does not parse: {e}")))?;
            let is_ca = cert
                .basic_constraints()
                .map_err(|e| {
                    Error::InvalidCertificate(format!("malformed basic constraints: {e}"))
                })?
                .is_some_and(|bc| bc.value.ca);
            if !is_ca {
                return Err(Error::InvalidCertificate(
                    "bundle certificate is not a CA certificate".into(),
                ));
            }
        }
        Ok(Self { trust_domain, authorities })
    }

    /// Parses a bundle from concatenated PEM `CERTIFICATE` blocks.
    ///
    /// # Errors
    ///
    /// Propagates [`TrustBundle::new`] validation failures.
    pub fn from_pem(trust_domain: TrustDomain, pem: &str) -> Result<Self> {
        Self::new(trust_domain, parse_cert_pem(pem)?)
    }

    /// The trust domain these authorities vouch for.
    #[must_use]
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The DER-encoded CA certificates.
    #[must_use]
    pub fn authorities(&self) -> &[CertificateDer<'static>] {
        &self.authorities
    }

    /// Serializes the bundle as concatenated PEM blocks.
    #[must_use]
    pub fn to_pem(&self) -> String {
        self.authorities.iter().map(|der| encode_pem(CERT_TAG, der)).collect()
    }

    /// Builds a [`RootCertStore`] holding every authority in the bundle.
    #[must_use]
    pub fn root_store(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        let (added, ignored) =
            roots.add_parsable_certificates(self.authorities.iter().cloned());
        tracing::debug!(trust_domain = %self.trust_domain, added, ignored, "built root store");
        roots
    }
}

fn parse_cert_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::InvalidCertificate(format!("certificate PEM does not parse: {e}")))
}

fn encode_pem(tag: &str, der: &[u8]) -> String {
    pem::encode(&pem::Pem::new(tag.to_string(), der.to_vec()))
}

/// Counts the PEM blocks of any tag in `input`. The wire protocol requires
/// exactly one `CERTIFICATE` block per SVID response.
#[must_use]
pub fn pem_block_count(input: &str) -> usize {
    input.matches("-----BEGIN ").count()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::issuer::CaIssuer;

    fn issuer() -> CaIssuer {
        let issuer = CaIssuer::empty(TrustDomain::new("example.org").unwrap());
        issuer.init_self_signed().unwrap();
        issuer
    }

    #[test]
    fn pem_round_trip_preserves_der() {
        let issuer = issuer();
        let id = SpiffeId::parse("spiffe://example.org/workload").unwrap();
        let svid = issuer.issue(&id).unwrap();

        let reparsed = X509Svid::from_pem(&svid.cert_chain_pem(), &svid.key_pem()).unwrap();
        assert_eq!(reparsed.leaf().as_ref(), svid.leaf().as_ref());
        assert_eq!(reparsed.spiffe_id(), &id);
        assert_eq!(reparsed.expires_at(), svid.expires_at());
    }

    #[test]
    fn parse_leaf_extracts_id_and_validity() {
        let issuer = issuer();
        let id = SpiffeId::parse("spiffe://example.org/w").unwrap();
        let svid = issuer.issue(&id).unwrap();
        let info = parse_leaf(svid.leaf()).unwrap();
        assert_eq!(info.spiffe_id, id);
        assert!(info.not_after > info.not_before);
    }

    #[test]
    fn bundle_requires_ca_certificates() {
        let issuer = issuer();
        let td = TrustDomain::new("example.org").unwrap();
        let id = SpiffeId::parse("spiffe://example.org/w").unwrap();
        let leaf = issuer.issue(&id).unwrap();

        // A leaf is not acceptable bundle material.
        let err = TrustBundle::new(td.clone(), vec![leaf.leaf().clone()]).unwrap_err();
        assert!(matches!(err, Error::InvalidCertificate(_)));

        // The CA certificate is.
        let bundle = issuer.bundle().unwrap();
        assert_eq!(bundle.authorities().len(), 1);
        let round = TrustBundle::from_pem(td, &bundle.to_pem()).unwrap();
        assert_eq!(round.authorities()[0].as_ref(), bundle.authorities()[0].as_ref());
    }

    #[test]
    fn empty_bundle_is_rejected() {
        let td = TrustDomain::new("example.org").unwrap();
        assert!(TrustBundle::new(td, Vec::new()).is_err());
    }
}
