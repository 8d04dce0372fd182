//! The world: storage, monitors, events, and structural-change tracking.
//!
//! The world is the single owner of everything the cache collaborates with:
//! the table [`Storage`], the component-[`monitor`] registry, the table
//! event [`Bus`](observer::Bus), and the world-wide monitor generation — a
//! coarse counter bumped on every structural change that touches a
//! monitored id. Caches compare their last-observed generation against the
//! world's and run a full rematch when behind, which amortizes bursts of
//! structural changes into one sweep.

use log::trace;

use crate::{
    entity::{self, Entity},
    id::Id,
    monitor, observer,
    storage::{self, Spec, table},
};

/// Upper bound on relationship-walk depth; breaks cycles in malformed
/// hierarchies.
const MAX_TRAVERSAL_DEPTH: usize = 64;

/// The ECS world, reduced to the surface the query cache consumes.
#[derive(Debug, Default)]
pub struct World {
    /// Table storage.
    storage: storage::Storage,

    /// Monitored component ids.
    monitors: monitor::Registry,

    /// Table lifecycle event bus.
    bus: observer::Bus,

    /// Entity allocation.
    entities: entity::Allocator,

    /// Bumped on every structural change relevant to queries.
    monitor_generation: u32,

    /// Set once teardown begins; cache construction fails afterwards.
    shutting_down: bool,
}

impl World {
    /// Create an empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the table storage.
    #[inline]
    pub fn storage(&self) -> &storage::Storage {
        &self.storage
    }

    /// Get the component-monitor registry.
    #[inline]
    pub fn monitors(&self) -> &monitor::Registry {
        &self.monitors
    }

    /// The current monitor generation.
    #[inline]
    pub fn monitor_generation(&self) -> u32 {
        self.monitor_generation
    }

    /// Whether teardown has begun.
    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Begin world teardown. Cache construction fails from here on.
    pub fn begin_teardown(&mut self) {
        self.shutting_down = true;
    }

    /// Subscribe to table lifecycle events.
    pub fn subscribe_tables(&mut self) -> crossbeam::channel::Receiver<observer::TableEvent> {
        self.bus.subscribe()
    }

    /// Allocate a fresh entity.
    pub fn alloc_entity(&mut self) -> Entity {
        self.entities.alloc()
    }

    /// Get the table for the given signature, creating it if needed.
    ///
    /// Creation publishes a [`TableEventKind::Create`](observer::TableEventKind)
    /// event and advances the monitor generation when the signature touches
    /// a monitored id.
    pub fn create_table(&mut self, spec: Spec) -> table::Id {
        if let Some(table) = self.storage.get_by_spec(&spec) {
            return table.id();
        }
        let id = self.storage.create(spec);
        self.mark_structural(id);
        self.bus.publish(observer::TableEventKind::Create, id);
        trace!("created table {id:?}");
        id
    }

    /// Delete a table, publishing the deletion before the table is gone.
    pub fn delete_table(&mut self, id: table::Id) {
        if self.storage.get(id).is_none() {
            trace!("delete for unknown table {id:?} ignored");
            return;
        }
        self.mark_structural(id);
        self.bus.publish(observer::TableEventKind::Delete, id);
        self.storage.delete(id);
    }

    /// Spawn a new entity into the given table.
    ///
    /// A table's first entity is a structural change for caches that filter
    /// out empty tables, so filling an empty table advances the generation.
    pub fn spawn(&mut self, table: table::Id) -> Entity {
        let was_empty = self.storage.get(table).is_none_or(|t| t.count() == 0);
        let entity = self.entities.alloc();
        self.storage.add_entity(table, entity);
        if was_empty {
            self.mark_structural(table);
        }
        entity
    }

    /// Migrate an entity to a different table (component add/remove).
    ///
    /// Both the vacated and the receiving table count as structurally
    /// changed: queries resolving data through the entity must re-evaluate.
    pub fn move_entity(&mut self, entity: Entity, to: table::Id) {
        let from = self.storage.location(entity);
        self.storage.move_entity(entity, to);
        if let Some(from) = from {
            self.mark_structural(from);
        }
        self.mark_structural(to);
    }

    /// Force a structural-change notification without a table mutation.
    ///
    /// For callers whose grouping or matching state lives outside the world
    /// (e.g. a custom group-by callback over external data).
    pub fn bump_monitor_generation(&mut self) {
        self.monitor_generation += 1;
    }

    /// The depth of a table along a traversal relationship: the number of
    /// `(relation, parent)` edges between the table and the root of its
    /// hierarchy.
    pub fn depth(&self, relation: Entity, table: table::Id) -> i32 {
        let pattern = Id::pair(relation, Entity::WILDCARD);
        let mut depth = 0;
        let mut current = table;
        for _ in 0..MAX_TRAVERSAL_DEPTH {
            let Some(table) = self.storage.get(current) else {
                break;
            };
            let Some((_, edge)) = table.spec().search(pattern).next() else {
                break;
            };
            depth += 1;
            let parent = edge.second().expect("pair pattern matched a plain id");
            match self.storage.location(parent) {
                Some(parent_table) => current = parent_table,
                // Parent without a table of its own terminates the walk.
                None => break,
            }
        }
        depth
    }

    /// Advance the monitor generation if the table's signature intersects a
    /// monitored id.
    fn mark_structural(&mut self, table: table::Id) {
        let Some(table) = self.storage.get(table) else {
            return;
        };
        if self.monitors.matches_spec(table.spec()) {
            self.monitor_generation += 1;
        }
    }
}
