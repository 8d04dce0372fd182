//! The query cache: a materialized index of matched tables.
//!
//! For every table whose contents satisfy a query, the cache holds one or
//! more [`MatchRecord`]s (one per wildcard resolution) in a per-table
//! bucket, and links every record into a single doubly-linked iteration
//! list. Iterating a cached query walks that list; the uncached evaluator
//! only runs at construction, on table-creation events, and during
//! rematches.
//!
//! # Grouping
//!
//! When grouping is enabled the list is partitioned into contiguous runs,
//! one per 64-bit group key, concatenated in key order. Groups are an
//! overlay: records carry their group key, the group map only tracks run
//! endpoints. Cascade grouping keys tables by their depth along a traversal
//! relationship, which yields breadth-first iteration over hierarchies.
//!
//! # Layouts
//!
//! A cache is classified at construction as trivial or full. Trivial caches
//! (self-sourced, wildcard-free, ungrouped, unordered, no change detection)
//! store bare record headers; everything else stores full records. The two
//! layouts never coexist in one cache.
//!
//! # Concurrency
//!
//! Single-writer cooperative: construction, [`sync`](QueryCache::sync),
//! [`on_event`](QueryCache::on_event), and [`fini`](QueryCache::fini) must
//! be serialized by the embedding runtime. Iteration is read-only.

use std::collections::HashMap;

use crossbeam::channel::Receiver;
use log::debug;

use crate::{
    entity::Entity,
    error::Error,
    id::Id,
    observer::TableEvent,
    query::{Filter, Oper, QueryIter, QueryMatch, Ref, Term},
    storage::{Table, table},
    world::World,
};

pub(crate) mod arena;
mod group;
mod record;
mod rematch;

pub use group::{Group, GroupByFn, GroupCreateFn, GroupDeleteFn, GroupInfo};
pub use record::{FieldIds, FieldSources, Layout, MatchRecord, RecordExt, TableBucket};

use arena::{Arena, Key};
use group::GroupIndex;

/// A query-cache descriptor: the signature plus caching configuration.
#[derive(Default)]
pub struct QueryDesc {
    terms: Vec<Term>,
    group_by: Option<Entity>,
    group_by_callback: Option<GroupByFn>,
    group_by_descending: bool,
    on_group_create: Option<GroupCreateFn>,
    on_group_delete: Option<GroupDeleteFn>,
    order_by: Option<Entity>,
    detect_changes: bool,
    skip_empty_tables: bool,
    uncacheable: bool,
    grouping_set_twice: bool,
}

impl QueryDesc {
    /// An empty descriptor: no terms, no grouping, empty tables matched.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a term to the signature.
    pub fn with_term(mut self, term: Term) -> Self {
        self.terms.push(term);
        self
    }

    /// Group matched tables by the target of their `(relationship, *)` pair.
    pub fn group_by(mut self, relationship: Entity) -> Self {
        if self.group_by.is_some() || self.group_by_callback.is_some() {
            self.grouping_set_twice = true;
        }
        self.group_by = Some(relationship);
        self
    }

    /// Group matched tables by a custom key function. The relationship is
    /// passed through to the callback.
    pub fn group_by_fn(
        mut self,
        relationship: Entity,
        callback: impl Fn(&World, &Table, Entity) -> u64 + 'static,
    ) -> Self {
        if self.group_by.is_some() || self.group_by_callback.is_some() {
            self.grouping_set_twice = true;
        }
        self.group_by = Some(relationship);
        self.group_by_callback = Some(Box::new(callback));
        self
    }

    /// Concatenate groups in descending key order.
    pub fn descending(mut self) -> Self {
        self.group_by_descending = true;
        self
    }

    /// Install a hook invoked when a group is created; its return value is
    /// kept as the group's context.
    pub fn on_group_create(
        mut self,
        hook: impl Fn(&World, u64) -> Option<Box<dyn std::any::Any>> + 'static,
    ) -> Self {
        self.on_group_create = Some(Box::new(hook));
        self
    }

    /// Install a hook invoked when a group is destroyed, receiving the
    /// group's context back.
    pub fn on_group_delete(
        mut self,
        hook: impl Fn(&World, u64, Option<Box<dyn std::any::Any>>) + 'static,
    ) -> Self {
        self.on_group_delete = Some(Box::new(hook));
        self
    }

    /// Sort matched tables by a component. The sort itself is external to
    /// the cache; requesting it forces the full layout and disables
    /// empty-table matching.
    pub fn order_by(mut self, component: Entity) -> Self {
        self.order_by = Some(component);
        self
    }

    /// Track per-field change counters on every record.
    pub fn detect_changes(mut self) -> Self {
        self.detect_changes = true;
        self
    }

    /// Keep empty tables out of the iteration list. They enter the cache
    /// on the first rematch after gaining entities.
    pub fn skip_empty_tables(mut self) -> Self {
        self.skip_empty_tables = true;
        self
    }

    /// Mark the query as not declared cacheable; disables the trivial
    /// storage layout.
    pub fn uncacheable(mut self) -> Self {
        self.uncacheable = true;
        self
    }
}

/// The global iteration list: endpoints plus totals.
#[derive(Debug, Default)]
pub(crate) struct ListInfo {
    /// First record in iteration order.
    pub(crate) first: Option<Key>,
    /// Last record in iteration order.
    pub(crate) last: Option<Key>,
    /// Records currently linked (one per matched table expansion).
    pub(crate) table_count: u32,
}

/// A materialized query cache.
///
/// Constructed with [`QueryCache::init`], kept current by feeding it table
/// events and rematch triggers through [`QueryCache::sync`] (or
/// [`QueryCache::on_event`] directly), and torn down with
/// [`QueryCache::fini`].
#[derive(Debug)]
pub struct QueryCache {
    /// The validated uncached query.
    filter: Filter,

    /// Record storage layout, fixed for the cache's lifetime.
    layout: Layout,

    /// Match record storage.
    records: Arena<MatchRecord>,

    /// Per-table buckets.
    tables: HashMap<table::Id, TableBucket>,

    /// The global iteration list.
    list: ListInfo,

    /// Group overlay, present when grouping was requested.
    groups: Option<GroupIndex>,

    /// 1-based index of the cascade term, zero when none.
    cascade_by: usize,

    /// Ordering component; the sort itself is external to the cache.
    order_by: Option<Entity>,

    /// Allocate per-field change counters on records.
    detect_changes: bool,

    /// Whether empty tables are stored in the iteration list.
    match_empty: bool,

    /// The query's declared ids; shared by every record whose resolved ids
    /// agree with the declaration.
    declared_ids: Box<[Id]>,

    /// Monitors registered on init, unregistered symmetrically on fini.
    monitored: Vec<Id>,

    /// Last observed world monitor generation.
    monitor_generation: u32,

    /// Local rematch generation, stamped onto buckets.
    rematch_count: u32,

    /// Monotonic change stamp, bumped on every insert and remove.
    match_count: u64,

    /// De-duplication guard for observer event delivery.
    last_event_id: Option<u64>,

    /// Table event subscription.
    events: Receiver<TableEvent>,
}

impl QueryCache {
    /// Build a cache from a descriptor and populate it with every
    /// currently-matching table.
    ///
    /// # Errors
    /// - [`Error::WorldShuttingDown`] during world teardown
    /// - [`Error::UnsupportedTerm`] for term shapes the cache cannot hold
    /// - [`Error::InvalidGrouping`] for conflicting grouping requests
    /// - [`Error::OrderByNotQueried`] when the ordering component is not a
    ///   required term
    pub fn init(world: &mut World, desc: QueryDesc) -> Result<Self, Error> {
        if world.is_shutting_down() {
            return Err(Error::WorldShuttingDown);
        }

        let QueryDesc {
            terms,
            group_by,
            group_by_callback,
            group_by_descending,
            on_group_create,
            on_group_delete,
            order_by,
            detect_changes,
            skip_empty_tables,
            uncacheable,
            grouping_set_twice,
        } = desc;

        let filter = Filter::new(terms)?;
        let cascade_by = filter.cascade_by();

        if grouping_set_twice {
            return Err(Error::InvalidGrouping("grouping configured twice"));
        }
        if cascade_by != 0 && group_by.is_some() {
            return Err(Error::InvalidGrouping(
                "cascade cannot be combined with group_by",
            ));
        }
        if let Some(component) = order_by {
            let queried = filter.terms().iter().any(|term| {
                term.oper == Oper::And
                    && term.src == Ref::This
                    && term.declared_id() == Some(Id::entity(component))
            });
            if !queried {
                return Err(Error::OrderByNotQueried);
            }
        }

        // Ordering is incompatible with matching empty tables.
        let match_empty = !skip_empty_tables && order_by.is_none();

        let grouping = cascade_by != 0 || group_by.is_some();
        // Empty-table filtering is reconciled through rematch, which
        // trivial caches never run, so skipping empty tables needs the
        // full layout too.
        let trivial = !uncacheable
            && !filter.has_refs()
            && !filter.ids().iter().any(Id::is_wildcard)
            && !grouping
            && order_by.is_none()
            && !detect_changes
            && match_empty;

        let monitored = filter.monitor_ids();
        for id in &monitored {
            world.monitors().register(*id);
        }

        let groups = grouping.then(|| GroupIndex {
            groups: std::collections::BTreeMap::new(),
            group_by: group_by.unwrap_or(Entity::NULL),
            callback: group_by_callback,
            on_create: on_group_create,
            on_delete: on_group_delete,
            cascade: (cascade_by != 0).then(|| filter.terms()[cascade_by - 1].cascade_rel()),
            descending: group_by_descending
                || (cascade_by != 0 && filter.terms()[cascade_by - 1].desc),
        });

        let declared_ids: Box<[Id]> = filter.ids().into();
        let events = world.subscribe_tables();

        let mut cache = Self {
            filter,
            layout: if trivial { Layout::Trivial } else { Layout::Full },
            records: Arena::new(),
            tables: HashMap::new(),
            list: ListInfo::default(),
            groups,
            cascade_by,
            order_by,
            detect_changes,
            match_empty,
            declared_ids,
            monitored,
            monitor_generation: world.monitor_generation(),
            rematch_count: 0,
            match_count: 0,
            last_event_id: None,
            events,
        };

        let matches: Vec<QueryMatch> = QueryIter::new(world, &cache.filter).collect();
        for m in &matches {
            cache.insert_from(world, m);
        }
        debug!(
            "query cache initialized: {} tables, {} records, {:?} layout",
            cache.tables.len(),
            cache.records.len(),
            cache.layout
        );
        Ok(cache)
    }

    /// Tear the cache down: destroy every group (firing the delete hook),
    /// free all buckets and records, and unregister the monitors.
    pub fn fini(mut self, world: &mut World) {
        let tables: Vec<_> = self.tables.keys().copied().collect();
        for table in tables {
            self.free_bucket(world, table);
        }
        debug_assert!(self.records.is_empty());
        debug_assert!(self.list.first.is_none() && self.list.last.is_none());
        debug_assert!(self.groups.as_ref().is_none_or(|g| g.groups.is_empty()));
        for id in &self.monitored {
            world.monitors().unregister(*id);
        }
    }

    /// The number of per-table buckets.
    #[inline]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// The sum of entity counts across all matched tables.
    pub fn entity_count(&self, world: &World) -> usize {
        self.tables
            .keys()
            .filter_map(|table| world.storage().get(*table))
            .map(Table::count)
            .sum()
    }

    /// Monotonic change stamp: advances on every insert and remove, so
    /// consumers can cheaply detect that the matched set changed.
    #[inline]
    pub fn match_count(&self) -> u64 {
        self.match_count
    }

    /// The storage layout of this cache.
    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// The validated query this cache materializes.
    #[inline]
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// 1-based index of the cascade term, zero when none.
    #[inline]
    pub fn cascade_by(&self) -> usize {
        self.cascade_by
    }

    /// The ordering component, when ordering was requested.
    #[inline]
    pub fn order_by(&self) -> Option<Entity> {
        self.order_by
    }

    /// The bucket for a table, if the table is matched.
    #[inline]
    pub fn get_table(&self, table: table::Id) -> Option<&TableBucket> {
        self.tables.get(&table)
    }

    /// The state of a group, if it currently has members.
    pub fn group(&self, group_id: u64) -> Option<&GroupInfo> {
        self.groups
            .as_ref()
            .and_then(|index| index.groups.get(&group_id))
            .map(Group::info)
    }

    /// Iterate the match records of one table's bucket, in `next_match`
    /// chain order.
    pub fn table_matches(&self, table: table::Id) -> impl Iterator<Item = &MatchRecord> {
        let mut cursor = self.tables.get(&table).and_then(|bucket| bucket.first);
        std::iter::from_fn(move || {
            let key = cursor?;
            let record = self.records.get(key);
            cursor = record.next_match;
            Some(record)
        })
    }

    /// A fresh cursor over the iteration list.
    pub fn iter(&self) -> CacheIter<'_> {
        CacheIter {
            cache: self,
            next: self.list.first,
            end: None,
            started: false,
        }
    }

    /// The query's declared ids; record id vectors fall back to these.
    #[inline]
    pub fn declared_ids(&self) -> &[Id] {
        &self.declared_ids
    }

    // ---- record store ----------------------------------------------------

    /// Insert one evaluator yield: ensure a bucket, append a record, fill
    /// it. Empty tables are filtered here when the cache excludes them.
    pub(crate) fn insert_from(&mut self, world: &World, m: &QueryMatch) {
        if !self.match_empty
            && world
                .storage()
                .get(m.table)
                .is_none_or(|table| table.count() == 0)
        {
            return;
        }
        let key = self.append_record(world, m.table);
        self.populate_record(key, m);
    }

    /// Append a fresh match record for a table: allocate it, chain it onto
    /// the table's bucket, and link it into the iteration list.
    pub(crate) fn append_record(&mut self, world: &World, table: table::Id) -> Key {
        let group_id = match (&self.groups, world.storage().get(table)) {
            (Some(groups), Some(t)) => groups.compute(world, t),
            _ => 0,
        };
        let key = self.records.alloc(MatchRecord::new(
            table,
            self.filter.field_count(),
            self.layout,
            group_id,
        ));

        let rematch_count = self.rematch_count;
        let bucket = self.tables.entry(table).or_insert_with(|| TableBucket {
            first: None,
            last: None,
            rematch_count,
        });
        let chain_prev = bucket.last;
        if bucket.first.is_none() {
            bucket.first = Some(key);
        }
        bucket.last = Some(key);
        if let Some(prev) = chain_prev {
            self.records[prev].next_match = Some(key);
        }

        self.insert_into_list(world, key);
        self.match_count += 1;
        key
    }

    /// Fill a record from an evaluator yield.
    pub(crate) fn populate_record(&mut self, key: Key, m: &QueryMatch) {
        let detect_changes = self.detect_changes;
        let declared = &self.declared_ids;
        self.records.get_mut(key).populate(m, declared, detect_changes);
    }

    /// Unlink a record from the iteration list (and its group) and free it.
    /// The caller owns the bucket chain.
    pub(crate) fn remove_record(&mut self, world: &World, key: Key) {
        self.remove_from_list(world, key);
        self.records.free(key);
        self.match_count += 1;
    }

    /// Remove a table's bucket, freeing every record on its chain.
    pub(crate) fn free_bucket(&mut self, world: &World, table: table::Id) {
        let Some(bucket) = self.tables.remove(&table) else {
            return;
        };
        let mut cursor = bucket.first;
        while let Some(key) = cursor {
            cursor = self.records[key].next_match;
            self.remove_record(world, key);
        }
        // The bucket going away is itself a visible change.
        self.match_count += 1;
    }

    // ---- iteration list --------------------------------------------------

    /// Link a record into the iteration list at its group's position, or at
    /// the tail when grouping is disabled.
    pub(crate) fn insert_into_list(&mut self, world: &World, key: Key) {
        self.list.table_count += 1;
        if self.groups.is_none() {
            self.push_back(key);
            return;
        }
        let group_id = self.records[key].group_id;

        // Existing group: append to its tail.
        let existing = {
            let groups = self.groups.as_mut().expect("grouping checked above");
            match groups.groups.get_mut(&group_id) {
                Some(g) => {
                    let after = g.last;
                    g.last = key;
                    g.info.table_count += 1;
                    g.info.match_count += 1;
                    Some(after)
                }
                None => None,
            }
        };
        if let Some(after) = existing {
            self.splice_after(after, key);
            return;
        }

        // New group: splice after the neighbouring group in key order, or
        // at the global head when there is no neighbour on that side.
        let (anchor, ctx) = {
            let groups = self.groups.as_ref().expect("grouping checked above");
            let anchor = groups.anchor(group_id);
            let ctx = groups
                .on_create
                .as_ref()
                .and_then(|hook| hook(world, group_id));
            (anchor, ctx)
        };
        match anchor {
            Some(after) => self.splice_after(after, key),
            None => self.push_front(key),
        }
        self.groups.as_mut().expect("grouping checked above").groups.insert(
            group_id,
            group::Group {
                first: key,
                last: key,
                info: GroupInfo {
                    table_count: 1,
                    match_count: 1,
                    ctx,
                },
            },
        );
    }

    /// Unlink a record from the iteration list, updating its group's
    /// endpoints and destroying the group when it empties.
    pub(crate) fn remove_from_list(&mut self, world: &World, key: Key) {
        let (prev, next, group_id) = {
            let record = &self.records[key];
            (record.prev, record.next, record.group_id)
        };
        match prev {
            Some(p) => self.records[p].next = next,
            None => self.list.first = next,
        }
        match next {
            Some(n) => self.records[n].prev = prev,
            None => self.list.last = prev,
        }
        {
            let record = &mut self.records[key];
            record.prev = None;
            record.next = None;
        }
        self.list.table_count -= 1;

        let next_group = next.map(|n| self.records[n].group_id);
        let prev_group = prev.map(|p| self.records[p].group_id);
        let Some(groups) = self.groups.as_mut() else {
            return;
        };
        let empty = {
            let g = groups
                .groups
                .get_mut(&group_id)
                .expect("record belongs to an unknown group");
            g.info.match_count += 1;
            if g.first == key && g.last == key {
                true
            } else {
                g.info.table_count -= 1;
                if g.first == key {
                    // Group contiguity: the successor shares the group.
                    debug_assert_eq!(next_group, Some(group_id));
                    g.first = next.expect("group head with no successor");
                } else if g.last == key {
                    debug_assert_eq!(prev_group, Some(group_id));
                    g.last = prev.expect("group tail with no predecessor");
                }
                false
            }
        };
        if empty {
            let g = groups.groups.remove(&group_id).expect("group vanished");
            if let Some(hook) = &groups.on_delete {
                hook(world, group_id, g.info.ctx);
            }
        }
    }

    /// Splice a record immediately after another.
    fn splice_after(&mut self, after: Key, key: Key) {
        let after_next = self.records[after].next;
        {
            let record = &mut self.records[key];
            record.prev = Some(after);
            record.next = after_next;
        }
        self.records[after].next = Some(key);
        match after_next {
            Some(n) => self.records[n].prev = Some(key),
            None => self.list.last = Some(key),
        }
    }

    /// Splice a record at the head of the list.
    fn push_front(&mut self, key: Key) {
        let first = self.list.first;
        {
            let record = &mut self.records[key];
            record.prev = None;
            record.next = first;
        }
        match first {
            Some(f) => self.records[f].prev = Some(key),
            None => self.list.last = Some(key),
        }
        self.list.first = Some(key);
    }

    /// Splice a record at the tail of the list.
    fn push_back(&mut self, key: Key) {
        match self.list.last {
            Some(last) => self.splice_after(last, key),
            None => {
                self.records[key].prev = None;
                self.records[key].next = None;
                self.list.first = Some(key);
                self.list.last = Some(key);
            }
        }
    }
}

/// A cursor over a cache's iteration list.
///
/// Yields every record in list order by default; [`set_group`] narrows a
/// fresh cursor to one group's window.
///
/// [`set_group`]: CacheIter::set_group
pub struct CacheIter<'a> {
    cache: &'a QueryCache,
    next: Option<Key>,
    end: Option<Key>,
    started: bool,
}

impl CacheIter<'_> {
    /// Narrow the cursor to a single group's `first..last` window. On a
    /// missing group the cursor yields nothing.
    ///
    /// # Errors
    /// - [`Error::InvalidIteratorState`] if the cursor already yielded.
    pub fn set_group(&mut self, group_id: u64) -> Result<(), Error> {
        if self.started {
            return Err(Error::InvalidIteratorState);
        }
        match self
            .cache
            .groups
            .as_ref()
            .and_then(|index| index.groups.get(&group_id))
        {
            Some(g) => {
                self.next = Some(g.first);
                self.end = Some(g.last);
            }
            None => {
                self.next = None;
                self.end = None;
            }
        }
        Ok(())
    }
}

impl<'a> Iterator for CacheIter<'a> {
    type Item = &'a MatchRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.next?;
        self.started = true;
        let cache = self.cache;
        self.next = if Some(key) == self.end {
            None
        } else {
            cache.records[key].next
        };
        Some(cache.records.get(key))
    }
}
