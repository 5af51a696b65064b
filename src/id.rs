// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! SPIFFE ID and trust domain value types.
//!
//! A SPIFFE ID has the canonical string form `spiffe://<trust-domain><path>`.
//! Trust domains are DNS-label-constrained and lowercase per the SPIFFE
//! specification; paths consist of slash-separated segments drawn from
//! `[A-Za-z0-9._-]`. Both types are immutable values with structural
//! equality.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

const SCHEME: &str = "spiffe://";
const MAX_TRUST_DOMAIN_LEN: usize = 255;
const MAX_DNS_LABEL_LEN: usize = 63;

/// Administrative namespace for workload identities, roughly a DNS name.
///
/// Two trust domains are equal iff their names match byte-for-byte; names
/// containing uppercase characters are rejected at construction, so stored
/// names are always lowercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrustDomain {
    name: String,
}

impl TrustDomain {
    /// Validates `name` as a lowercase DNS name and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTrustDomain`] if the name is empty, contains
    /// uppercase characters, or violates DNS-label rules.
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(Error::InvalidTrustDomain("name is empty".into()));
        }
        if name.len() > MAX_TRUST_DOMAIN_LEN {
            return Err(Error::InvalidTrustDomain(format!(
                "name exceeds {MAX_TRUST_DOMAIN_LEN} characters"
            )));
        }
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(Error::InvalidTrustDomain(format!(
                "{name}: uppercase characters are not allowed"
            )));
        }
        for label in name.split('.') {
            validate_dns_label(name, label)?;
        }
        Ok(Self { name: name.to_owned() })
    }

    /// The trust domain name, e.g. `example.org`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The SPIFFE ID of the trust domain itself, `spiffe://<name>`.
    #[must_use]
    pub fn id(&self) -> SpiffeId {
        SpiffeId { trust_domain: self.clone(), path: "/".to_owned() }
    }
}

fn validate_dns_label(name: &str, label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(Error::InvalidTrustDomain(format!("{name}: empty DNS label")));
    }
    if label.len() > MAX_DNS_LABEL_LEN {
        return Err(Error::InvalidTrustDomain(format!(
            "{name}: DNS label exceeds {MAX_DNS_LABEL_LEN} characters"
        )));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(Error::InvalidTrustDomain(format!(
            "{name}: DNS label must not begin or end with a hyphen"
        )));
    }
    if let Some(c) = label.chars().find(|c| !matches!(c, 'a'..='z' | '0'..='9' | '-')) {
        return Err(Error::InvalidTrustDomain(format!(
            "{name}: character {c:?} is not allowed in a DNS label"
        )));
    }
    Ok(())
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for TrustDomain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl Serialize for TrustDomain {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for TrustDomain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// URI identifying a workload: `spiffe://<trust-domain><path>`.
///
/// The empty path is stored as `/` and rendered without a trailing slash,
/// so `parse(format(id)) == id` for every valid id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: String,
}

impl SpiffeId {
    /// Builds an id from an already-validated trust domain and a path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] if the path contains `.` or `..`
    /// segments, empty segments, or characters outside `[A-Za-z0-9._-]`.
    pub fn new(trust_domain: TrustDomain, path: impl AsRef<str>) -> Result<Self> {
        let path = normalize_path(path.as_ref())?;
        Ok(Self { trust_domain, path })
    }

    /// Parses the canonical `spiffe://<td><path>` string form.
    ///
    /// Any other scheme, or a missing authority, is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSpiffeId`], [`Error::InvalidTrustDomain`], or
    /// [`Error::InvalidPath`] depending on which part is malformed.
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::InvalidSpiffeId(format!("{s}: scheme must be spiffe://")))?;
        if rest.is_empty() {
            return Err(Error::InvalidSpiffeId(format!("{s}: missing trust domain authority")));
        }
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(Error::InvalidSpiffeId(format!("{s}: missing trust domain authority")));
        }
        let trust_domain = TrustDomain::new(authority)?;
        Self::new(trust_domain, path)
    }

    /// The trust domain component.
    #[must_use]
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The path component. Always begins with `/`; `/` alone means the id
    /// names the trust domain itself.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this id belongs to `trust_domain`.
    #[must_use]
    pub fn is_member_of(&self, trust_domain: &TrustDomain) -> bool {
        self.trust_domain == *trust_domain
    }
}

fn normalize_path(path: &str) -> Result<String> {
    if path.is_empty() || path == "/" {
        return Ok("/".to_owned());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| Error::InvalidPath(format!("{path}: must begin with '/'")))?;
    for segment in rest.split('/') {
        if segment.is_empty() {
            return Err(Error::InvalidPath(format!("{path}: empty segment")));
        }
        if segment == "." || segment == ".." {
            return Err(Error::InvalidPath(format!("{path}: relative segment {segment:?}")));
        }
        if let Some(c) = segment
            .chars()
            .find(|c| !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-'))
        {
            return Err(Error::InvalidPath(format!("{path}: character {c:?} is not allowed")));
        }
    }
    Ok(path.to_owned())
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path == "/" {
            write!(f, "{SCHEME}{}", self.trust_domain)
        } else {
            write!(f, "{SCHEME}{}{}", self.trust_domain, self.path)
        }
    }
}

impl FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for SpiffeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SpiffeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_form() {
        let id = SpiffeId::parse("spiffe://example.org/service/web").unwrap();
        assert_eq!(id.trust_domain().name(), "example.org");
        assert_eq!(id.path(), "/service/web");
        assert_eq!(id.to_string(), "spiffe://example.org/service/web");
    }

    #[test]
    fn empty_path_is_root() {
        let id = SpiffeId::parse("spiffe://example.org").unwrap();
        assert_eq!(id.path(), "/");
        assert_eq!(id.to_string(), "spiffe://example.org");
        assert_eq!(SpiffeId::parse("spiffe://example.org/").unwrap(), id);
    }

    #[test]
    fn round_trips() {
        for s in [
            "spiffe://example.org",
            "spiffe://example.org/server",
            "spiffe://td.example.org/ns/default/sa/web-1",
            "spiffe://a.b.c/x_y/z.0",
        ] {
            let id = SpiffeId::parse(s).unwrap();
            assert_eq!(SpiffeId::parse(id.to_string()).unwrap(), id);
        }
    }

    #[test]
    fn rejects_foreign_schemes_and_missing_authority() {
        assert!(matches!(
            SpiffeId::parse("https://example.org/x"),
            Err(Error::InvalidSpiffeId(_))
        ));
        assert!(matches!(SpiffeId::parse("spiffe://"), Err(Error::InvalidSpiffeId(_))));
        assert!(matches!(SpiffeId::parse("spiffe:///x"), Err(Error::InvalidSpiffeId(_))));
        assert!(matches!(SpiffeId::parse("example.org/x"), Err(Error::InvalidSpiffeId(_))));
    }

    #[test]
    fn rejects_bad_trust_domains() {
        assert!(matches!(TrustDomain::new(""), Err(Error::InvalidTrustDomain(_))));
        assert!(matches!(TrustDomain::new("Example.org"), Err(Error::InvalidTrustDomain(_))));
        assert!(matches!(TrustDomain::new("exa mple.org"), Err(Error::InvalidTrustDomain(_))));
        assert!(matches!(TrustDomain::new("example..org"), Err(Error::InvalidTrustDomain(_))));
        assert!(matches!(TrustDomain::new("-example.org"), Err(Error::InvalidTrustDomain(_))));
        assert!(matches!(TrustDomain::new("example.org-"), Err(Error::InvalidTrustDomain(_))));
    }

    #[test]
    fn rejects_bad_paths() {
        let td = TrustDomain::new("example.org").unwrap();
        assert!(matches!(
            SpiffeId::new(td.clone(), "/a/../b"),
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(SpiffeId::new(td.clone(), "/a//b"), Err(Error::InvalidPath(_))));
        assert!(matches!(SpiffeId::new(td.clone(), "/a/./b"), Err(Error::InvalidPath(_))));
        assert!(matches!(SpiffeId::new(td.clone(), "/café"), Err(Error::InvalidPath(_))));
        assert!(matches!(SpiffeId::new(td, "no-slash"), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn trust_domain_equality_is_structural() {
        let a = TrustDomain::new("example.org").unwrap();
        let b = TrustDomain::new("example.org").unwrap();
        let c = TrustDomain::new("other.org").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let id = SpiffeId::new(a.clone(), "/w").unwrap();
        assert!(id.is_member_of(&b));
        assert!(!id.is_member_of(&c));
    }
}
