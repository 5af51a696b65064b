// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! In-memory identity registry.
//!
//! Seeding is a bootstrap capability on [`RegistryBuilder`]; runtime code
//! depends only on the read-only [`IdentityLookup`] port. Sealing is
//! one-way: once [`RegistryBuilder::seal`] has produced the registry, any
//! further seed attempt fails with [`Error::RegistrySealed`]. The sealed
//! registry is immutable and requires no synchronization beyond
//! publication.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::id::SpiffeId;
use crate::selector::{IdentityMapper, SelectorSet};

/// Read-only lookup port served to runtime components.
pub trait IdentityLookup: Send + Sync {
    /// Returns the first-seeded mapper whose selectors are all contained in
    /// `discovered`, if any.
    fn find_by_selectors(&self, discovered: &SelectorSet) -> Option<&IdentityMapper>;

    /// Iterates all mappers in seed order.
    fn list(&self) -> Box<dyn Iterator<Item = &IdentityMapper> + '_>;
}

/// Bootstrap-time builder for an [`IdentityRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    mappers: Vec<IdentityMapper>,
    sealed: Option<Arc<IdentityRegistry>>,
}

impl RegistryBuilder {
    /// An empty, unsealed builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds one mapper. Rejects duplicates of an already-seeded SPIFFE ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegistrySealed`] after [`Self::seal`] has been
    /// called, or [`Error::InvalidConfig`] for a duplicate id.
    pub fn seed(&mut self, mapper: IdentityMapper) -> Result<&mut Self> {
        if self.sealed.is_some() {
            return Err(Error::RegistrySealed);
        }
        if self.mappers.iter().any(|m| m.spiffe_id() == mapper.spiffe_id()) {
            return Err(Error::invalid_config(format!(
                "mapper for {} already seeded",
                mapper.spiffe_id()
            )));
        }
        self.mappers.push(mapper);
        Ok(self)
    }

    /// Seals the registry. Repeated calls return the same instance.
    pub fn seal(&mut self) -> Arc<IdentityRegistry> {
        if let Some(registry) = &self.sealed {
            return Arc::clone(registry);
        }
        let by_id = self
            .mappers
            .iter()
            .enumerate()
            .map(|(idx, m)| (m.spiffe_id().clone(), idx))
            .collect();
        let registry = Arc::new(IdentityRegistry { mappers: std::mem::take(&mut self.mappers), by_id });
        self.sealed = Some(Arc::clone(&registry));
        registry
    }
}

/// Sealed selector → SPIFFE ID mapping with a reverse index by id.
///
/// No deletion, no mutation: the registry is constructed empty, seeded
/// during bootstrap, sealed, and read-only forever after.
#[derive(Debug)]
pub struct IdentityRegistry {
    mappers: Vec<IdentityMapper>,
    by_id: HashMap<SpiffeId, usize>,
}

impl IdentityRegistry {
    /// Looks up the mapper registered for a specific SPIFFE ID.
    #[must_use]
    pub fn find_by_spiffe_id(&self, id: &SpiffeId) -> Option<&IdentityMapper> {
        self.by_id.get(id).map(|&idx| &self.mappers[idx])
    }

    /// Number of seeded mappers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    /// Whether the registry holds no mappers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}

impl IdentityLookup for IdentityRegistry {
    fn find_by_selectors(&self, discovered: &SelectorSet) -> Option<&IdentityMapper> {
        // First seeded wins when several mappers match.
        self.mappers.iter().find(|m| m.matches(discovered))
    }

    fn list(&self) -> Box<dyn Iterator<Item = &IdentityMapper> + '_> {
        Box::new(self.mappers.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Selector;

    fn mapper(id: &str, selectors: &[Selector]) -> IdentityMapper {
        IdentityMapper::new(
            SpiffeId::parse(id).unwrap(),
            selectors.iter().cloned().collect(),
        )
        .unwrap()
    }

    #[test]
    fn first_seeded_mapper_wins_ties() {
        let mut builder = RegistryBuilder::new();
        builder.seed(mapper("spiffe://example.org/a", &[Selector::unix_uid(1)])).unwrap();
        builder.seed(mapper("spiffe://example.org/b", &[Selector::unix_uid(1)])).unwrap();
        let registry = builder.seal();

        let discovered: SelectorSet = [Selector::unix_uid(1)].into_iter().collect();
        let found = registry.find_by_selectors(&discovered).unwrap();
        assert_eq!(found.spiffe_id().to_string(), "spiffe://example.org/a");
    }

    #[test]
    fn seal_is_one_way() {
        let mut builder = RegistryBuilder::new();
        builder.seed(mapper("spiffe://example.org/a", &[Selector::unix_uid(1)])).unwrap();
        let sealed = builder.seal();
        assert_eq!(sealed.len(), 1);

        let err = builder
            .seed(mapper("spiffe://example.org/b", &[Selector::unix_uid(2)]))
            .unwrap_err();
        assert!(matches!(err, Error::RegistrySealed));

        // Repeated seal returns the same registry.
        assert!(Arc::ptr_eq(&sealed, &builder.seal()));
    }

    #[test]
    fn no_match_returns_none() {
        let mut builder = RegistryBuilder::new();
        builder.seed(mapper("spiffe://example.org/a", &[Selector::unix_uid(1)])).unwrap();
        let registry = builder.seal();

        let discovered: SelectorSet = [Selector::unix_uid(9999)].into_iter().collect();
        assert!(registry.find_by_selectors(&discovered).is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut builder = RegistryBuilder::new();
        builder.seed(mapper("spiffe://example.org/a", &[Selector::unix_uid(1)])).unwrap();
        assert!(builder.seed(mapper("spiffe://example.org/a", &[Selector::unix_uid(2)])).is_err());
    }

    #[test]
    fn reverse_index_finds_mapper_by_id() {
        let mut builder = RegistryBuilder::new();
        builder.seed(mapper("spiffe://example.org/a", &[Selector::unix_uid(1)])).unwrap();
        let registry = builder.seal();
        let id = SpiffeId::parse("spiffe://example.org/a").unwrap();
        assert!(registry.find_by_spiffe_id(&id).is_some());
        assert_eq!(registry.list().count(), 1);
    }
}
