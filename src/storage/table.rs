//! The archetype table as the cache sees it.
//!
//! The cache never touches column data; a table here is its identity, its
//! type signature, the entities it currently holds, and a bloom filter over
//! the signature used to cheaply reject tables on creation events.

use crate::{entity::Entity, storage::spec::Spec};

/// A table identifier, unique within a world for the world's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u32);

impl Id {
    /// Construct a new table id from a raw u32 value.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the index of this table if it were to live in indexable storage.
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// A descriptor naming a specific column within a specific table.
///
/// Match records carry one of these per query field; for up-traversed fields
/// the named table is an ancestor, not the iterated table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRecord {
    /// The table providing the field's data.
    pub table: Id,
    /// The column within that table.
    pub column: usize,
}

/// An archetype table: a storage region holding all entities sharing the
/// same type signature.
#[derive(Debug)]
pub struct Table {
    /// The unique identifier of this table.
    id: Id,

    /// The type signature of this table.
    spec: Spec,

    /// The entities currently stored in this table.
    entities: Vec<Entity>,

    /// Bloom signature over the spec, fixed at creation.
    filter: u64,
}

impl Table {
    /// Create a table for the given signature.
    pub(crate) fn new(id: Id, spec: Spec) -> Self {
        let filter = spec.filter();
        Self {
            id,
            spec,
            entities: Vec::new(),
            filter,
        }
    }

    /// Get the id of this table.
    #[inline]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Get the type signature of this table.
    #[inline]
    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    /// The number of entities currently stored in this table.
    #[inline]
    pub fn count(&self) -> usize {
        self.entities.len()
    }

    /// The entities currently stored in this table.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Bloom signature over the type, for pre-filtering creation events.
    #[inline]
    pub fn filter(&self) -> u64 {
        self.filter
    }

    pub(crate) fn push_entity(&mut self, entity: Entity) {
        self.entities.push(entity);
    }

    pub(crate) fn remove_entity(&mut self, entity: Entity) {
        if let Some(position) = self.entities.iter().position(|e| *e == entity) {
            self.entities.swap_remove(position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id as ComponentId;

    #[test]
    fn table_filter_matches_spec() {
        let id = ComponentId::entity(Entity::new(40));
        let table = Table::new(Id::new(0), Spec::new(vec![id]));

        assert_eq!(table.filter(), table.spec().filter());
        assert_eq!(table.count(), 0);
    }
}
