// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Crate-wide error type.

use crate::id::TrustDomain;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure surfaced by this crate.
///
/// Variants are grouped the way callers encounter them: configuration,
/// identity source lifecycle, the Workload API wire protocol, identity
/// material, attestation, issuance, and component lifecycle. Transient
/// causes (Workload API fetch backoff, `/proc` races) are retried
/// internally and never reach this enum.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The configuration is syntactically valid but violates a constraint.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A required configuration field is absent.
    #[error("missing required configuration field: {0}")]
    MissingRequiredField(&'static str),

    /// The Workload API endpoint could not be reached.
    #[error("workload API unavailable at {socket}")]
    WorkloadApiUnavailable {
        /// Socket path the connection was attempted against.
        socket: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The initial SVID fetch did not complete within the configured window.
    #[error("initial SVID fetch timed out after {0:?}")]
    InitialFetchTimeout(std::time::Duration),

    /// The identity source has been closed.
    #[error("identity source is closed")]
    SourceClosed,

    /// The source holds no trust bundle for the requested trust domain.
    #[error("no trust bundle available for trust domain {0}")]
    BundleUnavailable(TrustDomain),

    /// The Workload API socket path is empty, relative, or otherwise unusable.
    #[error("invalid workload API socket path: {0}")]
    InvalidSocketPath(String),

    /// A Workload API request failed before a response was read.
    #[error("workload API fetch failed: {0}")]
    FetchFailed(String),

    /// The Workload API answered with a non-success status.
    #[error("workload API returned status {status}: {preview}")]
    ServerError {
        /// HTTP status code of the response.
        status: u16,
        /// Response body preview, capped at 4 KiB.
        preview: String,
    },

    /// The Workload API response violated a protocol invariant.
    #[error("invalid workload API response: {0}")]
    InvalidResponse(String),

    /// A SPIFFE ID string failed to parse.
    #[error("invalid SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    /// A trust domain name violates SPIFFE / DNS-label rules.
    #[error("invalid trust domain: {0}")]
    InvalidTrustDomain(String),

    /// A SPIFFE ID path violates the allowed segment grammar.
    #[error("invalid SPIFFE ID path: {0}")]
    InvalidPath(String),

    /// Certificate bytes failed to parse or violated SVID constraints.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// An identity belongs to a different trust domain than required.
    #[error("trust domain mismatch: got {got}, want {want}")]
    TrustDomainMismatch {
        /// Trust domain carried by the offending identity.
        got: TrustDomain,
        /// Trust domain the operation required.
        want: TrustDomain,
    },

    /// A certificate is outside its validity window.
    #[error("certificate expired or not yet valid")]
    ExpiredOrNotYetValid,

    /// Peer credentials could not be resolved for a connected socket.
    #[error("attestation failed: {0}")]
    AttestationFailed(String),

    /// Kernel peer-credential attestation is not available on this platform.
    ///
    /// Callers must treat this as a fatal build-configuration error, never
    /// as grounds for a fallback identity mechanism.
    #[error("peer credential attestation is unsupported on this platform")]
    AttestationUnsupported,

    /// No registered mapper matched the discovered selectors.
    #[error("no identity mapper matched the discovered selectors")]
    NoMatchingMapper,

    /// The issuer holds no CA material yet.
    #[error("certificate authority is not initialized")]
    CaNotInitialized,

    /// Certificate issuance failed inside the signing backend.
    #[error("certificate issuance failed: {0}")]
    IssueFailed(#[from] rcgen::Error),

    /// The registry is sealed; seeding is a bootstrap-only operation.
    #[error("identity registry is sealed")]
    RegistrySealed,

    /// The component was already started.
    #[error("already started")]
    AlreadyStarted,

    /// The operation was cancelled or its deadline elapsed.
    #[error("operation cancelled")]
    Cancelled,

    /// TLS configuration could not be built.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    /// An I/O failure outside the wire-protocol paths.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub(crate) fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }
}
