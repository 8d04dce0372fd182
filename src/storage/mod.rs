//! Table storage for the cache core.
//!
//! The storage layer owns every [`Table`] in a world, keyed both by id and
//! by type signature, plus the entity-location index mapping each entity to
//! the table it lives in. Table ids stay stable across deletions: deleted
//! slots go vacant rather than shifting later tables down, so cached table
//! references never dangle onto a different table.
//!
//! Structural notifications (creation/deletion events, monitor generation
//! bumps) are the [`World`](crate::world::World)'s responsibility; storage
//! itself is a passive registry.

use std::collections::HashMap;

pub use spec::Spec;
pub use table::{Table, TableRecord};

use crate::entity::Entity;

pub mod spec;
pub mod table;

/// A collection of tables, each storing entities with a specific type
/// signature.
#[derive(Debug, Default)]
pub struct Storage {
    /// The known tables; deleted slots stay vacant to keep ids stable.
    tables: Vec<Option<Table>>,

    /// A map from type signature to table.
    by_spec: HashMap<Spec, table::Id>,

    /// Entity locations: which table each entity currently lives in.
    locations: HashMap<Entity, table::Id>,
}

impl Storage {
    /// Create a new empty storage.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new table for the given signature.
    ///
    /// Does not check for an existing table with the same signature; the
    /// caller is responsible for uniqueness (handled in the world).
    pub(crate) fn create(&mut self, spec: Spec) -> table::Id {
        // Grab the index the table will be stored at.
        let id = table::Id::new(self.tables.len() as u32);
        // Add the table to the map (requires one clone for HashMap key)
        self.by_spec.insert(spec.clone(), id);
        // Create the table from the signature (moves spec)
        self.tables.push(Some(Table::new(id, spec)));
        id
    }

    /// Delete a table, vacating its slot and forgetting its entities.
    pub(crate) fn delete(&mut self, id: table::Id) -> Option<Table> {
        let table = self.tables.get_mut(id.index())?.take()?;
        self.by_spec.remove(table.spec());
        for entity in table.entities() {
            self.locations.remove(entity);
        }
        Some(table)
    }

    /// Get an existing table by id, if it exists.
    #[inline]
    pub fn get(&self, id: table::Id) -> Option<&Table> {
        self.tables.get(id.index()).and_then(Option::as_ref)
    }

    /// Get an existing table by its type signature, if it exists.
    #[inline]
    pub fn get_by_spec(&self, spec: &Spec) -> Option<&Table> {
        self.by_spec.get(spec).and_then(|id| self.get(*id))
    }

    /// Iterate the live tables in id (creation) order.
    pub fn iter(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter_map(Option::as_ref)
    }

    /// The number of live tables.
    pub fn table_count(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
    }

    /// Place an entity into a table and record its location.
    pub(crate) fn add_entity(&mut self, id: table::Id, entity: Entity) {
        let table = self
            .tables
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .expect("add_entity on a deleted table");
        table.push_entity(entity);
        self.locations.insert(entity, id);
    }

    /// Move an entity between tables, updating its location.
    pub(crate) fn move_entity(&mut self, entity: Entity, to: table::Id) {
        if let Some(from) = self.locations.get(&entity).copied()
            && let Some(table) = self.tables.get_mut(from.index()).and_then(Option::as_mut)
        {
            table.remove_entity(entity);
        }
        self.add_entity(to, entity);
    }

    /// The table an entity currently lives in, if any.
    #[inline]
    pub fn location(&self, entity: Entity) -> Option<table::Id> {
        self.locations.get(&entity).copied()
    }
}
