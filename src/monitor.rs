//! Component-monitor registry.
//!
//! Caches register the ids their signature depends on; the world consults
//! the registry when tables are created, deleted, or filled to decide
//! whether the structural change is one any cache could care about, and
//! bumps the monitor generation only then. Registration is refcounted so
//! multiple caches can monitor the same id independently.
//!
//! The registry uses lock-free reads via `DashMap`; registration takes a
//! single shard lock.

use dashmap::DashMap;
use log::warn;

use crate::{id::Id, storage::Spec};

/// Refcounted registry of monitored ids.
#[derive(Debug, Default)]
pub struct Registry {
    /// Monitored ids and their registration counts.
    monitors: DashMap<Id, u32>,
}

impl Registry {
    /// Create an empty monitor registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a monitor for the given id.
    pub fn register(&self, id: Id) {
        *self.monitors.entry(id).or_insert(0) += 1;
    }

    /// Unregister a monitor for the given id.
    pub fn unregister(&self, id: Id) {
        match self.monitors.entry(id) {
            dashmap::Entry::Occupied(mut occupied) => {
                if *occupied.get() <= 1 {
                    occupied.remove();
                } else {
                    *occupied.get_mut() -= 1;
                }
            }
            dashmap::Entry::Vacant(_) => {
                warn!("unregistering monitor for id {id:?} that was never registered");
            }
        }
    }

    /// Whether the exact id is monitored.
    #[inline]
    pub fn is_monitored(&self, id: Id) -> bool {
        self.monitors.contains_key(&id)
    }

    /// Whether a type signature touches any monitored id.
    ///
    /// Monitored ids may carry wildcards, e.g. `(ChildOf, *)` registered for
    /// an up-traversal term matches every `ChildOf` pair in the signature.
    pub fn matches_spec(&self, spec: &Spec) -> bool {
        self.monitors
            .iter()
            .any(|entry| spec.search(*entry.key()).next().is_some())
    }

    /// The number of distinct monitored ids.
    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    /// Whether no monitors are registered.
    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    #[test]
    fn register_is_refcounted() {
        // Given
        let registry = Registry::new();
        let id = Id::entity(Entity::new(40));

        // When - registered twice, unregistered once
        registry.register(id);
        registry.register(id);
        registry.unregister(id);

        // Then - still monitored
        assert!(registry.is_monitored(id));

        // When - unregistered the second time
        registry.unregister(id);

        // Then - gone
        assert!(!registry.is_monitored(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn matches_spec_is_wildcard_aware() {
        // Given - a monitor on every ChildOf pair
        let registry = Registry::new();
        registry.register(Id::pair(Entity::CHILD_OF, Entity::WILDCARD));

        let parented = Spec::new(vec![Id::pair(Entity::CHILD_OF, Entity::new(50))]);
        let plain = Spec::new(vec![Id::entity(Entity::new(40))]);

        // Then
        assert!(registry.matches_spec(&parented));
        assert!(!registry.matches_spec(&plain));
    }
}
