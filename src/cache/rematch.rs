//! Event handling and the rematch engine.
//!
//! Two paths keep a cache current:
//!
//! - **Table events.** Creation events are probed against the query's bloom
//!   mask and, on a hit, evaluated with the table bound as `$this`;
//!   deletion events free the table's bucket. Events carry a delivery
//!   stamp; the cache ignores repeated delivery of the same stamp, since
//!   the bus may fan one event through multiple paths.
//!
//! - **Rematch.** When the world's monitor generation is ahead of the
//!   cache's, something structural changed that events alone cannot
//!   describe (an up-traversal source moved, a grouping input changed, an
//!   empty table filled). The engine re-runs the uncached query across all
//!   tables and reconciles the cache in place: existing records are reused
//!   cursor-wise so a burst of structural changes does not churn
//!   allocations for tables that still match in the same shape.

use log::{debug, trace};

use crate::{
    cache::{Layout, QueryCache, arena::Key},
    observer::{TableEvent, TableEventKind},
    query::{QueryIter, QueryMatch},
    storage::table,
    world::World,
};

impl QueryCache {
    /// Bring the cache up to date: drain pending table events, then
    /// rematch if the world's monitor generation advanced.
    ///
    /// Call once per frame, serialized with all other cache mutation.
    pub fn sync(&mut self, world: &World) {
        let events: Vec<TableEvent> = self.events.try_iter().collect();
        for event in events {
            self.on_event(world, event);
        }
        if world.monitor_generation() > self.monitor_generation {
            self.rematch(world);
        }
    }

    /// Handle one table event. Compatible with direct observer delivery;
    /// repeated delivery of the same `event_id` is ignored.
    pub fn on_event(&mut self, world: &World, event: TableEvent) {
        if self.last_event_id == Some(event.event_id) {
            trace!("duplicate event {} ignored", event.event_id);
            return;
        }
        self.last_event_id = Some(event.event_id);
        match event.kind {
            TableEventKind::Create => self.on_table_create(world, event.table),
            TableEventKind::Delete => {
                // An event for an untracked table is silently ignored.
                if self.tables.contains_key(&event.table) {
                    self.free_bucket(world, event.table);
                }
            }
        }
    }

    /// Evaluate a newly created table and cache its matches.
    fn on_table_create(&mut self, world: &World, table: table::Id) {
        let Some(t) = world.storage().get(table) else {
            trace!("create event for missing table {table:?} ignored");
            return;
        };
        if !self.match_empty && t.count() == 0 {
            return;
        }

        let probe = t.filter() & self.filter.bloom() == self.filter.bloom();
        // The probe is authoritative in release builds; debug builds run
        // the full evaluation and cross-check a positive outcome instead.
        #[cfg(not(debug_assertions))]
        if !probe {
            return;
        }

        let matches: Vec<QueryMatch> = QueryIter::bound(world, &self.filter, table).collect();
        #[cfg(debug_assertions)]
        if !matches.is_empty() {
            debug_assert!(probe, "type filter rejected a matching table");
        }
        for m in &matches {
            self.insert_from(world, m);
        }
    }

    /// Reconcile the cache against current world state.
    ///
    /// Existing match records are reused in place; only tables whose
    /// wildcard expansion grew allocate, and only tables that stopped
    /// matching (stale buckets, shrunk expansion tails) free.
    pub fn rematch(&mut self, world: &World) {
        if self.layout == Layout::Trivial {
            // Trivial caches have no refs, wildcards, or grouping; table
            // events alone keep them correct.
            self.monitor_generation = world.monitor_generation();
            return;
        }
        self.rematch_count += 1;
        debug!("rematch {} begins", self.rematch_count);

        let matches: Vec<QueryMatch> = QueryIter::new(world, &self.filter).collect();
        let mut prev_table: Option<table::Id> = None;
        let mut cursor: Option<Key> = None;
        let mut cursor_prev: Option<Key> = None;

        for m in &matches {
            if !self.match_empty
                && world
                    .storage()
                    .get(m.table)
                    .is_none_or(|t| t.count() == 0)
            {
                continue;
            }

            if prev_table != Some(m.table) {
                self.finalize_table(world, prev_table, cursor, cursor_prev);
                prev_table = Some(m.table);
                cursor_prev = None;
                cursor = match self.tables.get_mut(&m.table) {
                    Some(bucket) => {
                        bucket.rematch_count = self.rematch_count;
                        bucket.first
                    }
                    // No bucket yet; the first yield appends one.
                    None => None,
                };
            }

            let key = match cursor {
                Some(key) => {
                    cursor = self.records[key].next_match;
                    cursor_prev = Some(key);
                    key
                }
                None => {
                    let key = self.append_record(world, m.table);
                    cursor_prev = Some(key);
                    key
                }
            };
            self.populate_record(key, m);

            // Re-establish list order when the group key moved.
            if self.groups.is_some()
                && let Some(t) = world.storage().get(m.table)
            {
                let group_id = self
                    .groups
                    .as_ref()
                    .expect("grouping checked above")
                    .compute(world, t);
                if group_id != self.records[key].group_id {
                    self.remove_from_list(world, key);
                    self.records[key].group_id = group_id;
                    self.insert_into_list(world, key);
                    self.match_count += 1;
                }
            }
        }
        self.finalize_table(world, prev_table, cursor, cursor_prev);

        // Buckets the sweep never stamped have no remaining matches.
        let stale: Vec<table::Id> = self
            .tables
            .iter()
            .filter(|(_, bucket)| bucket.rematch_count != self.rematch_count)
            .map(|(table, _)| *table)
            .collect();
        for table in stale {
            debug!("rematch {} drops table {table:?}", self.rematch_count);
            self.free_bucket(world, table);
        }

        self.monitor_generation = world.monitor_generation();
    }

    /// Finish a table's rematch: free the tail of match records the cursor
    /// never consumed (wildcard expansions that no longer apply).
    fn finalize_table(
        &mut self,
        world: &World,
        table: Option<table::Id>,
        tail: Option<Key>,
        tail_prev: Option<Key>,
    ) {
        let (Some(table), Some(tail)) = (table, tail) else {
            return;
        };
        // A tail implies the cursor consumed at least one record: buckets
        // are only entered through a yield, which consumes or appends.
        let kept = tail_prev.expect("rematch tail with no consumed record");
        self.records[kept].next_match = None;
        if let Some(bucket) = self.tables.get_mut(&table) {
            bucket.last = Some(kept);
        }
        let mut cursor = Some(tail);
        while let Some(key) = cursor {
            cursor = self.records[key].next_match;
            self.remove_record(world, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap, rc::Rc};

    use super::*;
    use crate::{
        cache::{MatchRecord, QueryDesc, testing::check_invariants},
        entity::Entity,
        id::Id,
        query::Term,
        storage::Spec,
    };

    fn comp(raw: u32) -> Entity {
        Entity::new(raw)
    }

    fn id(raw: u32) -> Id {
        Id::entity(comp(raw))
    }

    fn tables_of(cache: &QueryCache) -> Vec<table::Id> {
        cache.iter().map(MatchRecord::table).collect()
    }

    #[test]
    fn cascade_ascending_is_breadth_first() {
        // Given - root, two children, one grandchild
        let mut world = World::new();
        let tag = id(40);
        let root_table = world.create_table(Spec::new(vec![tag]));
        let root = world.spawn(root_table);
        let child_a = world.create_table(Spec::new(vec![
            tag,
            Id::pair(Entity::CHILD_OF, root),
        ]));
        let first_child = world.spawn(child_a);
        let child_b = world.create_table(Spec::new(vec![
            tag,
            id(41),
            Id::pair(Entity::CHILD_OF, root),
        ]));
        world.spawn(child_b);
        let grandchild = world.create_table(Spec::new(vec![
            tag,
            Id::pair(Entity::CHILD_OF, first_child),
        ]));

        // When - cascading over the optional ChildOf pair
        let cache = QueryCache::init(
            &mut world,
            QueryDesc::new()
                .with_term(Term::new(comp(40)))
                .with_term(Term::pair(Entity::CHILD_OF, Entity::WILDCARD).optional().cascade()),
        )
        .unwrap();

        // Then - depth 0, both depth-1 tables in insertion order, depth 2
        assert_eq!(
            tables_of(&cache),
            vec![root_table, child_a, child_b, grandchild]
        );
        assert_eq!(cache.group(0).unwrap().table_count, 1);
        assert_eq!(cache.group(1).unwrap().table_count, 2);
        assert_eq!(cache.group(2).unwrap().table_count, 1);
        check_invariants(&cache);
        cache.fini(&mut world);
    }

    #[test]
    fn cascade_descending_puts_deep_tables_first() {
        // Given - a chain of depth 0..=3
        let mut world = World::new();
        let tag = id(40);
        let mut tables = Vec::new();
        let mut parent: Option<Entity> = None;
        for _ in 0..4 {
            let mut ids = vec![tag];
            if let Some(parent) = parent {
                ids.push(Id::pair(Entity::CHILD_OF, parent));
            }
            let table = world.create_table(Spec::new(ids));
            parent = Some(world.spawn(table));
            tables.push(table);
        }

        // When
        let cache = QueryCache::init(
            &mut world,
            QueryDesc::new()
                .with_term(Term::new(comp(40)))
                .with_term(
                    Term::pair(Entity::CHILD_OF, Entity::WILDCARD)
                        .optional()
                        .cascade_desc(),
                ),
        )
        .unwrap();

        // Then - depth 3 leads, depth 0 trails
        let expected: Vec<_> = tables.iter().rev().copied().collect();
        assert_eq!(tables_of(&cache), expected);
        check_invariants(&cache);
        cache.fini(&mut world);
    }

    #[test]
    fn table_delete_event_shrinks_the_cache() {
        // Given - {A} matching T1 and T2
        let mut world = World::new();
        let t1 = world.create_table(Spec::new(vec![id(40)]));
        let t2 = world.create_table(Spec::new(vec![id(40), id(41)]));
        let mut cache = QueryCache::init(
            &mut world,
            QueryDesc::new().with_term(Term::new(comp(40))),
        )
        .unwrap();
        assert_eq!(cache.table_count(), 2);
        let stamp_before = cache.match_count();

        // When
        world.delete_table(t2);
        cache.sync(&world);

        // Then
        assert_eq!(cache.table_count(), 1);
        assert_eq!(tables_of(&cache), vec![t1]);
        assert!(cache.match_count() >= stamp_before + 2);
        check_invariants(&cache);
        cache.fini(&mut world);
    }

    #[test]
    fn table_create_event_appends() {
        // Given
        let mut world = World::new();
        let t1 = world.create_table(Spec::new(vec![id(40)]));
        let mut cache = QueryCache::init(
            &mut world,
            QueryDesc::new().with_term(Term::new(comp(40))),
        )
        .unwrap();

        // When - one matching and one non-matching table appear
        let t2 = world.create_table(Spec::new(vec![id(40), id(41)]));
        let _t3 = world.create_table(Spec::new(vec![id(42)]));
        cache.sync(&world);

        // Then
        assert_eq!(tables_of(&cache), vec![t1, t2]);
        check_invariants(&cache);
        cache.fini(&mut world);
    }

    #[test]
    fn duplicate_event_delivery_is_ignored() {
        // Given
        let mut world = World::new();
        let t1 = world.create_table(Spec::new(vec![id(40)]));
        let mut cache = QueryCache::init(
            &mut world,
            QueryDesc::new().with_term(Term::new(comp(40))),
        )
        .unwrap();
        let stamp = cache.match_count();

        // When - the same deletion is delivered twice
        let event = TableEvent {
            kind: TableEventKind::Delete,
            table: t1,
            event_id: 77,
        };
        cache.on_event(&world, event);
        let after_first = cache.match_count();
        cache.on_event(&world, event);

        // Then - the second delivery changed nothing
        assert!(after_first > stamp);
        assert_eq!(cache.match_count(), after_first);
        assert_eq!(cache.table_count(), 0);
        cache.fini(&mut world);
    }

    #[test]
    fn rematch_without_changes_preserves_records() {
        // Given - a grouped cache (full layout, so rematch runs)
        let mut world = World::new();
        let rel = comp(60);
        world.create_table(Spec::new(vec![id(40), Id::pair(rel, comp(90))]));
        world.create_table(Spec::new(vec![id(40), Id::pair(rel, comp(100))]));
        let mut cache = QueryCache::init(
            &mut world,
            QueryDesc::new().with_term(Term::new(comp(40))).group_by(rel),
        )
        .unwrap();

        let order_before = tables_of(&cache);
        let records_before = cache.records.len();
        let firsts_before: Vec<_> = order_before
            .iter()
            .map(|t| cache.get_table(*t).unwrap().first)
            .collect();

        // When - a rematch fires with no world changes
        world.bump_monitor_generation();
        cache.sync(&world);

        // Then - same records, same order, no churn
        assert_eq!(tables_of(&cache), order_before);
        assert_eq!(cache.records.len(), records_before);
        let firsts_after: Vec<_> = order_before
            .iter()
            .map(|t| cache.get_table(*t).unwrap().first)
            .collect();
        assert_eq!(firsts_after, firsts_before);
        check_invariants(&cache);
        cache.fini(&mut world);
    }

    #[test]
    fn rematch_moves_records_between_groups() {
        // Given - grouping through an external side table
        let mut world = World::new();
        let t1 = world.create_table(Spec::new(vec![id(40)]));
        let t2 = world.create_table(Spec::new(vec![id(40), id(41)]));
        let t3 = world.create_table(Spec::new(vec![id(40), id(42)]));

        let keys: Rc<RefCell<HashMap<table::Id, u64>>> =
            Rc::new(RefCell::new(HashMap::from([(t1, 1), (t2, 1), (t3, 2)])));
        let keys_in = Rc::clone(&keys);

        let mut cache = QueryCache::init(
            &mut world,
            QueryDesc::new()
                .with_term(Term::new(comp(40)))
                .group_by_fn(Entity::NULL, move |_, table, _| {
                    keys_in.borrow().get(&table.id()).copied().unwrap_or(0)
                }),
        )
        .unwrap();
        assert_eq!(tables_of(&cache), vec![t1, t2, t3]);

        // When - T2's key changes and the cache rematches
        keys.borrow_mut().insert(t2, 2);
        world.bump_monitor_generation();
        cache.sync(&world);

        // Then - T2 moved behind T3 into group 2; endpoints follow
        assert_eq!(tables_of(&cache), vec![t1, t3, t2]);
        assert_eq!(cache.group(1).unwrap().table_count, 1);
        assert_eq!(cache.group(2).unwrap().table_count, 2);
        check_invariants(&cache);

        // When - T1's key changes too, emptying group 1
        keys.borrow_mut().insert(t1, 2);
        world.bump_monitor_generation();
        cache.sync(&world);

        // Then
        assert!(cache.group(1).is_none());
        assert_eq!(cache.group(2).unwrap().table_count, 3);
        check_invariants(&cache);
        cache.fini(&mut world);
    }

    #[test]
    fn rematch_frees_shrunk_wildcard_tails() {
        // Given - a child resolving a wildcard on its parent via traversal
        let mut world = World::new();
        let rel = comp(60);
        let rich_parent = world.create_table(Spec::new(vec![
            Id::pair(rel, comp(100)),
            Id::pair(rel, comp(101)),
        ]));
        let poor_parent = world.create_table(Spec::new(vec![Id::pair(rel, comp(100))]));
        let parent = world.spawn(rich_parent);

        let child_table = world.create_table(Spec::new(vec![
            id(40),
            Id::pair(Entity::CHILD_OF, parent),
        ]));
        world.spawn(child_table);

        let mut cache = QueryCache::init(
            &mut world,
            QueryDesc::new()
                .with_term(Term::new(comp(40)))
                .with_term(Term::pair(rel, Entity::WILDCARD).up(Entity::CHILD_OF)),
        )
        .unwrap();

        // Two wildcard resolutions through the rich parent.
        assert_eq!(cache.table_matches(child_table).count(), 2);
        let records_before = cache.records.len();

        // When - the parent migrates to a table with a single pair
        world.move_entity(parent, poor_parent);
        cache.sync(&world);

        // Then - the tail record was freed, the head reused
        assert_eq!(cache.table_matches(child_table).count(), 1);
        assert_eq!(cache.records.len(), records_before - 1);
        check_invariants(&cache);
        cache.fini(&mut world);
    }

    #[test]
    fn rematch_drops_tables_that_stopped_matching() {
        // Given - a child matching only through its parent
        let mut world = World::new();
        let provider = world.create_table(Spec::new(vec![id(41)]));
        let bare = world.create_table(Spec::new(vec![id(42)]));
        let parent = world.spawn(provider);

        let child_table = world.create_table(Spec::new(vec![
            id(40),
            Id::pair(Entity::CHILD_OF, parent),
        ]));
        world.spawn(child_table);

        let mut cache = QueryCache::init(
            &mut world,
            QueryDesc::new()
                .with_term(Term::new(comp(40)))
                .with_term(Term::new(comp(41)).up(Entity::CHILD_OF)),
        )
        .unwrap();
        assert_eq!(cache.table_count(), 1);

        // When - the parent loses the provided component
        world.move_entity(parent, bare);
        cache.sync(&world);

        // Then - the child's whole bucket is reclaimed
        assert_eq!(cache.table_count(), 0);
        assert_eq!(cache.iter().count(), 0);
        assert!(cache.records.is_empty());
        check_invariants(&cache);
        cache.fini(&mut world);
    }

    #[test]
    fn trivial_caches_skip_rematch() {
        // Given
        let mut world = World::new();
        world.create_table(Spec::new(vec![id(40)]));
        let mut cache = QueryCache::init(
            &mut world,
            QueryDesc::new().with_term(Term::new(comp(40))),
        )
        .unwrap();
        let rematches_before = cache.rematch_count;

        // When
        world.bump_monitor_generation();
        cache.sync(&world);

        // Then - the generation advanced without a sweep
        assert_eq!(cache.rematch_count, rematches_before);
        assert_eq!(cache.monitor_generation, world.monitor_generation());
        cache.fini(&mut world);
    }
}
