// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! SPIFFE peer authorization policies.
//!
//! An authorizer is the predicate applied to a peer's SPIFFE ID after
//! chain verification has already succeeded. It decides *who* may talk,
//! not whether their certificate is genuine.

use std::fmt;

use crate::error::{Error, Result};
use crate::id::{SpiffeId, TrustDomain};

/// Tagged peer-authorization policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Authorizer {
    /// Peer must present exactly this SPIFFE ID.
    Specific(SpiffeId),
    /// Peer must be a member of this trust domain.
    MemberOf(TrustDomain),
    /// Peer must present one of these SPIFFE IDs.
    OneOf(Vec<SpiffeId>),
    /// Any peer that passed chain verification. Development only.
    #[cfg(feature = "insecure-dev")]
    Any,
}

impl Authorizer {
    /// Policy accepting exactly `id`.
    #[must_use]
    pub fn specific(id: SpiffeId) -> Self {
        Self::Specific(id)
    }

    /// Policy accepting any member of `trust_domain`.
    #[must_use]
    pub fn member_of(trust_domain: TrustDomain) -> Self {
        Self::MemberOf(trust_domain)
    }

    /// Policy accepting any of `ids`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] when `ids` is empty.
    pub fn one_of(ids: Vec<SpiffeId>) -> Result<Self> {
        if ids.is_empty() {
            return Err(Error::invalid_config("one-of policy needs at least one SPIFFE ID"));
        }
        Ok(Self::OneOf(ids))
    }

    /// Policy accepting every verified peer. Development only.
    #[cfg(feature = "insecure-dev")]
    #[must_use]
    pub fn any() -> Self {
        Self::Any
    }

    /// Whether `peer` satisfies this policy.
    #[must_use]
    pub fn permits(&self, peer: &SpiffeId) -> bool {
        match self {
            Self::Specific(id) => peer == id,
            Self::MemberOf(td) => peer.is_member_of(td),
            Self::OneOf(ids) => ids.contains(peer),
            #[cfg(feature = "insecure-dev")]
            Self::Any => true,
        }
    }
}

impl fmt::Display for Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Specific(id) => write!(f, "specific-id({id})"),
            Self::MemberOf(td) => write!(f, "trust-domain({td})"),
            Self::OneOf(ids) => {
                write!(f, "one-of(")?;
                for (i, id) in ids.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{id}")?;
                }
                f.write_str(")")
            }
            #[cfg(feature = "insecure-dev")]
            Self::Any => f.write_str("any"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SpiffeId {
        SpiffeId::parse(s).unwrap()
    }

    #[test]
    fn specific_requires_exact_match() {
        let authorizer = Authorizer::specific(id("spiffe://example.org/server"));
        assert!(authorizer.permits(&id("spiffe://example.org/server")));
        assert!(!authorizer.permits(&id("spiffe://example.org/other")));
    }

    #[test]
    fn member_of_accepts_any_path_in_domain() {
        let authorizer = Authorizer::member_of(TrustDomain::new("example.org").unwrap());
        assert!(authorizer.permits(&id("spiffe://example.org/anything")));
        assert!(authorizer.permits(&id("spiffe://example.org/deep/path")));
        assert!(!authorizer.permits(&id("spiffe://other.org/x")));
    }

    #[test]
    fn one_of_accepts_listed_ids_only() {
        let authorizer = Authorizer::one_of(vec![
            id("spiffe://example.org/a"),
            id("spiffe://example.org/b"),
        ])
        .unwrap();
        assert!(authorizer.permits(&id("spiffe://example.org/a")));
        assert!(!authorizer.permits(&id("spiffe://example.org/c")));
        assert!(Authorizer::one_of(Vec::new()).is_err());
    }

    #[cfg(feature = "insecure-dev")]
    #[test]
    fn any_accepts_everything_verified() {
        assert!(Authorizer::any().permits(&id("spiffe://whatever.test/x")));
    }
}
