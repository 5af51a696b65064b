// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Workload selectors and identity mappers.
//!
//! A selector is a typed key/value predicate about a workload, with the
//! string form `type:key:value` (`unix:uid:1001`, `k8s:ns:default`). An
//! identity mapper binds a SPIFFE ID to a set of selectors; it matches a
//! discovered selector set iff every one of its selectors appears there.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::id::SpiffeId;

/// A typed key/value predicate about a workload.
///
/// The `type` and `key` segments must be non-empty and colon-free; the
/// value may contain colons.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Selector {
    kind: String,
    key: String,
    value: String,
}

impl Selector {
    /// Builds a selector from its three segments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `kind` or `key` is empty or
    /// contains a colon.
    pub fn new(
        kind: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self> {
        let (kind, key, value) = (kind.into(), key.into(), value.into());
        for (name, segment) in [("type", &kind), ("key", &key)] {
            if segment.is_empty() {
                return Err(Error::invalid_config(format!("selector {name} is empty")));
            }
            if segment.contains(':') {
                return Err(Error::invalid_config(format!(
                    "selector {name} {segment:?} must not contain ':'"
                )));
            }
        }
        Ok(Self { kind, key, value })
    }

    /// `unix:uid:<uid>` — the numeric user id of the calling process.
    #[must_use]
    pub fn unix_uid(uid: u32) -> Self {
        Self { kind: "unix".into(), key: "uid".into(), value: uid.to_string() }
    }

    /// `unix:gid:<gid>` — the numeric group id of the calling process.
    #[must_use]
    pub fn unix_gid(gid: u32) -> Self {
        Self { kind: "unix".into(), key: "gid".into(), value: gid.to_string() }
    }

    /// `unix:path:<exe>` — the resolved executable path of the caller.
    #[must_use]
    pub fn unix_path(path: impl Into<String>) -> Self {
        Self { kind: "unix".into(), key: "path".into(), value: path.into() }
    }

    /// The selector type segment (`workload`, `unix`, `k8s`, ...).
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The key segment.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The value segment.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.key, self.value)
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(key), Some(value)) => Self::new(kind, key, value),
            _ => Err(Error::invalid_config(format!(
                "selector {s:?} is not of the form type:key:value"
            ))),
        }
    }
}

/// Unordered set of selectors with O(1) membership.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectorSet {
    inner: HashSet<Selector>,
}

impl SelectorSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a selector; duplicates are ignored.
    pub fn insert(&mut self, selector: Selector) {
        self.inner.insert(selector);
    }

    /// Whether `selector` is an element of this set.
    #[must_use]
    pub fn contains(&self, selector: &Selector) -> bool {
        self.inner.contains(selector)
    }

    /// Number of selectors in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates the selectors in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Selector> {
        self.inner.iter()
    }
}

impl FromIterator<Selector> for SelectorSet {
    fn from_iter<I: IntoIterator<Item = Selector>>(iter: I) -> Self {
        Self { inner: iter.into_iter().collect() }
    }
}

/// Immutable binding of a SPIFFE ID to a non-empty selector set.
#[derive(Clone, Debug)]
pub struct IdentityMapper {
    spiffe_id: SpiffeId,
    selectors: SelectorSet,
}

impl IdentityMapper {
    /// Binds `spiffe_id` to `selectors`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the selector set is empty.
    pub fn new(spiffe_id: SpiffeId, selectors: SelectorSet) -> Result<Self> {
        if selectors.is_empty() {
            return Err(Error::invalid_config(format!(
                "mapper for {spiffe_id} has no selectors"
            )));
        }
        Ok(Self { spiffe_id, selectors })
    }

    /// The bound SPIFFE ID.
    #[must_use]
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// The selectors a workload must all present to receive this identity.
    #[must_use]
    pub fn selectors(&self) -> &SelectorSet {
        &self.selectors
    }

    /// Whether every mapper selector is an element of `discovered`.
    ///
    /// The discovered set may be a strict superset.
    #[must_use]
    pub fn matches(&self, discovered: &SelectorSet) -> bool {
        self.selectors.iter().all(|s| discovered.contains(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SpiffeId {
        SpiffeId::parse(s).unwrap()
    }

    #[test]
    fn selector_string_form_round_trips() {
        let s: Selector = "unix:uid:1001".parse().unwrap();
        assert_eq!(s, Selector::unix_uid(1001));
        assert_eq!(s.to_string(), "unix:uid:1001");
    }

    #[test]
    fn selector_value_may_contain_colons() {
        let s: Selector = "workload:label:env:prod".parse().unwrap();
        assert_eq!(s.value(), "env:prod");
        assert_eq!(s.to_string(), "workload:label:env:prod");
    }

    #[test]
    fn selector_type_and_key_may_not_contain_colons() {
        assert!(Selector::new("un:ix", "uid", "1").is_err());
        assert!(Selector::new("unix", "u:id", "1").is_err());
        assert!("uidonly".parse::<Selector>().is_err());
    }

    #[test]
    fn mapper_matches_iff_subset() {
        let mapper = IdentityMapper::new(
            id("spiffe://example.org/server"),
            [Selector::unix_uid(1001), Selector::unix_gid(1001)].into_iter().collect(),
        )
        .unwrap();

        let mut discovered: SelectorSet =
            [Selector::unix_uid(1001), Selector::unix_gid(1001)].into_iter().collect();
        discovered.insert(Selector::unix_path("/usr/bin/server"));
        assert!(mapper.matches(&discovered));

        let partial: SelectorSet = [Selector::unix_uid(1001)].into_iter().collect();
        assert!(!mapper.matches(&partial));
    }

    #[test]
    fn mapper_requires_selectors() {
        assert!(IdentityMapper::new(id("spiffe://example.org/x"), SelectorSet::new()).is_err());
    }
}
