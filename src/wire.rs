// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Workload API wire protocol: HTTP/1.1 over a Unix domain socket.
//!
//! One endpoint, `GET /svid/x509`, answering JSON. The response carries
//! the leaf certificate and its key as PEM, mirroring the field naming of
//! SPIRE's X509-SVID payload, plus the issuing trust bundle so a single
//! fetch fully provisions an identity source.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::SpiffeId;
use crate::svid::{TrustBundle, X509Svid, parse_leaf, pem_block_count};

/// The only resource the Workload API serves.
pub const SVID_ENDPOINT: &str = "/svid/x509";

/// Hard cap on response bodies, applied on both ends of the wire.
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Cap on the error-body preview retained for diagnostics.
pub const MAX_ERROR_PREVIEW_BYTES: usize = 4096;

/// Tolerated divergence between `expires_at` and the leaf's `notAfter`.
pub const EXPIRY_SKEW_TOLERANCE_SECS: i64 = 5 * 60;

/// JSON body of a successful `GET /svid/x509`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SvidResponse {
    /// SPIFFE ID the SVID was issued for.
    pub spiffe_id: String,
    /// Leaf certificate, exactly one PEM `CERTIFICATE` block.
    pub x509_svid: String,
    /// Private key matching the leaf, one PEM PKCS#8 block.
    pub x509_svid_key: String,
    /// Leaf `notAfter` as unix seconds.
    pub expires_at: i64,
    /// Trust bundle of the issuing domain, concatenated PEM blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
}

/// A validated response: parsed SVID plus the bundle when one was sent.
#[derive(Clone, Debug)]
pub struct FetchedSvid {
    /// The workload's identity material.
    pub svid: X509Svid,
    /// Trust bundle for the SVID's own trust domain, if the server sent one.
    pub bundle: Option<TrustBundle>,
}

impl SvidResponse {
    /// Checks every protocol invariant and parses the identity material.
    ///
    /// Invariants: `spiffe_id` parses; `x509_svid` is a single PEM
    /// `CERTIFICATE` block that parses to X.509; the leaf's first
    /// `spiffe` URI SAN equals `spiffe_id`; `expires_at` is strictly
    /// positive and within ±5 minutes of the leaf's `notAfter`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidResponse`] naming the violated invariant.
    pub fn validate(&self) -> Result<FetchedSvid> {
        let id = SpiffeId::parse(&self.spiffe_id)
            .map_err(|e| Error::invalid_response(format!("spiffe_id: {e}")))?;

        if pem_block_count(&self.x509_svid) != 1 {
            return Err(Error::invalid_response(
                "x509_svid must contain exactly one PEM block",
            ));
        }
        let svid = X509Svid::from_pem(&self.x509_svid, &self.x509_svid_key)
            .map_err(|e| Error::invalid_response(e.to_string()))?;

        let leaf = parse_leaf(svid.leaf()).map_err(|e| Error::invalid_response(e.to_string()))?;
        if leaf.spiffe_id != id {
            return Err(Error::invalid_response(format!(
                "leaf URI SAN {} does not match spiffe_id {id}",
                leaf.spiffe_id
            )));
        }
        if self.expires_at <= 0 {
            return Err(Error::invalid_response("expires_at must be positive"));
        }
        if (self.expires_at - leaf.not_after).abs() > EXPIRY_SKEW_TOLERANCE_SECS {
            return Err(Error::invalid_response(format!(
                "expires_at {} diverges from leaf notAfter {} by more than {}s",
                self.expires_at, leaf.not_after, EXPIRY_SKEW_TOLERANCE_SECS
            )));
        }

        let bundle = match &self.bundle {
            Some(pem) => Some(
                TrustBundle::from_pem(id.trust_domain().clone(), pem)
                    .map_err(|e| Error::invalid_response(format!("bundle: {e}")))?,
            ),
            None => None,
        };
        Ok(FetchedSvid { svid, bundle })
    }

    /// Builds the response for an issued SVID, bundle included.
    #[must_use]
    pub fn from_issued(svid: &X509Svid, bundle: Option<&TrustBundle>) -> Self {
        Self {
            spiffe_id: svid.spiffe_id().to_string(),
            x509_svid: svid.cert_chain_pem(),
            x509_svid_key: svid.key_pem(),
            expires_at: svid.expires_at(),
            bundle: bundle.map(TrustBundle::to_pem),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TrustDomain;
    use crate::issuer::CaIssuer;

    fn issued() -> (X509Svid, TrustBundle) {
        let issuer = CaIssuer::empty(TrustDomain::new("example.org").unwrap());
        issuer.init_self_signed().unwrap();
        let id = SpiffeId::parse("spiffe://example.org/server").unwrap();
        (issuer.issue(&id).unwrap(), issuer.bundle().unwrap())
    }

    #[test]
    fn valid_response_round_trips_through_json() {
        let (svid, bundle) = issued();
        let body = SvidResponse::from_issued(&svid, Some(&bundle));
        let json = serde_json::to_string(&body).unwrap();
        let parsed: SvidResponse = serde_json::from_str(&json).unwrap();
        let fetched = parsed.validate().unwrap();
        assert_eq!(fetched.svid.spiffe_id(), svid.spiffe_id());
        assert_eq!(fetched.svid.leaf().as_ref(), svid.leaf().as_ref());
        assert!(fetched.bundle.is_some());
    }

    #[test]
    fn mismatched_spiffe_id_is_rejected() {
        let (svid, _) = issued();
        let mut body = SvidResponse::from_issued(&svid, None);
        body.spiffe_id = "spiffe://example.org/impostor".into();
        let err = body.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[test]
    fn expires_at_must_track_not_after() {
        let (svid, _) = issued();
        let mut body = SvidResponse::from_issued(&svid, None);
        body.expires_at += EXPIRY_SKEW_TOLERANCE_SECS + 1;
        assert!(matches!(body.validate(), Err(Error::InvalidResponse(_))));

        let mut body = SvidResponse::from_issued(&svid, None);
        body.expires_at = 0;
        assert!(matches!(body.validate(), Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn multi_block_svid_field_is_rejected() {
        let (svid, bundle) = issued();
        let mut body = SvidResponse::from_issued(&svid, None);
        body.x509_svid.push_str(&bundle.to_pem());
        assert!(matches!(body.validate(), Err(Error::InvalidResponse(_))));
    }
}
