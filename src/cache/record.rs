//! Match records and per-table buckets.
//!
//! A match record is the atom of the cache: one way a table satisfies the
//! query. Tables matched through a wildcard produce one record per
//! resolution, chained through `next_match`; every record is also linked
//! into the cache-wide iteration list through `prev`/`next`.
//!
//! Records come in two layouts, fixed per cache at construction. The
//! trivial layout is the bare header; the full layout carries a
//! [`RecordExt`] with resolved ids, sources, source tables, field masks,
//! and change-detection counters. Queries that are self-sourced,
//! wildcard-free, ungrouped, unordered, and change-detection-free provably
//! never populate the extension, so the trivial layout omits it.

use fixedbitset::FixedBitSet;

use crate::{
    cache::arena::Key,
    entity::Entity,
    id::Id,
    query::QueryMatch,
    storage::{TableRecord, table},
};

/// The storage layout of a cache's records, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Header-only records.
    Trivial,
    /// Records carrying the full [`RecordExt`].
    Full,
}

/// Per-field resolved ids: shared with the cache when every field matched
/// the query's declared id, privately owned otherwise.
///
/// The shared state is a unit variant, so the cache's default vector can
/// never be freed through a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldIds {
    /// Every field matched the declared id; read them from the cache.
    Declared,
    /// At least one field resolved differently (wildcard expansion).
    Resolved(Box<[Id]>),
}

/// Per-field source entities: the iterated entity for every field, or a
/// privately owned vector naming the resolved sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSources {
    /// Every field is matched on the iterated entity.
    SelfSourced,
    /// At least one field resolved on another entity (up-traversal or a
    /// fixed source).
    Resolved(Box<[Entity]>),
}

/// The extended attributes of a full-layout record.
#[derive(Debug)]
pub struct RecordExt {
    /// Per-field resolved ids.
    pub ids: FieldIds,
    /// Per-field source entities.
    pub sources: FieldSources,
    /// Per-field source tables; populated only when at least one field has
    /// a resolved source.
    pub tables: Option<Box<[table::Id]>>,
    /// Which fields are set.
    pub set_fields: FixedBitSet,
    /// Which fields were resolved via up-traversal.
    pub up_fields: FixedBitSet,
    /// Per-field change-detection counters, allocated on demand.
    pub monitor: Option<Box<[u32]>>,
}

impl RecordExt {
    fn new(field_count: usize) -> Self {
        Self {
            ids: FieldIds::Declared,
            sources: FieldSources::SelfSourced,
            tables: None,
            set_fields: FixedBitSet::with_capacity(field_count),
            up_fields: FixedBitSet::with_capacity(field_count),
            monitor: None,
        }
    }
}

/// One cached way a table satisfies the query.
#[derive(Debug)]
pub struct MatchRecord {
    /// The table this record describes.
    pub(crate) table: table::Id,

    /// Per-field column descriptor; `None` for unset fields.
    pub(crate) trs: Box<[Option<TableRecord>]>,

    /// Iteration list links.
    pub(crate) prev: Option<Key>,
    pub(crate) next: Option<Key>,

    /// Next record for the same table (wildcard expansion chain).
    pub(crate) next_match: Option<Key>,

    /// The group this record belongs to; zero when grouping is disabled.
    pub(crate) group_id: u64,

    /// Extended attributes; `None` for every record of a trivial cache.
    pub(crate) ext: Option<Box<RecordExt>>,
}

impl MatchRecord {
    pub(crate) fn new(table: table::Id, field_count: usize, layout: Layout, group_id: u64) -> Self {
        Self {
            table,
            trs: vec![None; field_count].into_boxed_slice(),
            prev: None,
            next: None,
            next_match: None,
            group_id,
            ext: match layout {
                Layout::Trivial => None,
                Layout::Full => Some(Box::new(RecordExt::new(field_count))),
            },
        }
    }

    /// The table this record describes.
    #[inline]
    pub fn table(&self) -> table::Id {
        self.table
    }

    /// Per-field column descriptors.
    #[inline]
    pub fn trs(&self) -> &[Option<TableRecord>] {
        &self.trs
    }

    /// The group this record belongs to; zero when grouping is disabled.
    #[inline]
    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    /// Whether this record uses the trivial layout.
    #[inline]
    pub fn is_trivial(&self) -> bool {
        self.ext.is_none()
    }

    /// The extended attributes of a full-layout record.
    #[inline]
    pub fn ext(&self) -> Option<&RecordExt> {
        self.ext.as_deref()
    }

    /// Per-field resolved ids, falling back to the cache's declared ids
    /// when the record shares them.
    pub fn ids<'a>(&'a self, declared: &'a [Id]) -> &'a [Id] {
        match self.ext.as_deref() {
            Some(RecordExt {
                ids: FieldIds::Resolved(ids),
                ..
            }) => ids,
            _ => declared,
        }
    }

    /// Per-field source entities, when any field has a resolved source.
    pub fn sources(&self) -> Option<&[Entity]> {
        match self.ext.as_deref() {
            Some(RecordExt {
                sources: FieldSources::Resolved(sources),
                ..
            }) => Some(sources),
            _ => None,
        }
    }

    /// Fill the record from an evaluator yield.
    ///
    /// Full-layout records share the cache's declared-id vector and
    /// self-source sentinel whenever the yield agrees with them, and keep
    /// their private allocations across repopulation when it does not.
    pub(crate) fn populate(&mut self, m: &QueryMatch, declared: &[Id], detect_changes: bool) {
        debug_assert_eq!(self.table, m.table);
        self.trs.copy_from_slice(&m.trs);

        let Some(ext) = self.ext.as_deref_mut() else {
            debug_assert!(
                m.sources.iter().all(Entity::is_null),
                "trivial cache populated with a non-self source"
            );
            return;
        };

        if m.ids[..] == declared[..] {
            ext.ids = FieldIds::Declared;
        } else {
            match &mut ext.ids {
                FieldIds::Resolved(ids) if ids.len() == m.ids.len() => {
                    ids.copy_from_slice(&m.ids);
                }
                _ => ext.ids = FieldIds::Resolved(m.ids.clone()),
            }
        }

        if m.sources.iter().all(Entity::is_null) {
            ext.sources = FieldSources::SelfSourced;
            ext.tables = None;
        } else {
            match &mut ext.sources {
                FieldSources::Resolved(sources) if sources.len() == m.sources.len() => {
                    sources.copy_from_slice(&m.sources);
                }
                _ => ext.sources = FieldSources::Resolved(m.sources.clone()),
            }
            // Source tables are the providing tables of each field; unset
            // fields fall back to the iterated table.
            let tables: Box<[table::Id]> = m
                .trs
                .iter()
                .map(|tr| tr.map(|tr| tr.table).unwrap_or(m.table))
                .collect();
            ext.tables = Some(tables);
        }

        ext.set_fields.clone_from(&m.set_fields);
        ext.up_fields.clone_from(&m.up_fields);

        if detect_changes && ext.monitor.is_none() {
            ext.monitor = Some(vec![0; declared.len()].into_boxed_slice());
        }
    }
}

/// The cache's view of one matched table: the head and tail of its
/// `next_match` chain, and the rematch generation that last confirmed it.
#[derive(Debug, Default)]
pub struct TableBucket {
    /// First match record for the table.
    pub(crate) first: Option<Key>,
    /// Last match record for the table.
    pub(crate) last: Option<Key>,
    /// Generation stamp of the most recent successful rematch.
    pub(crate) rematch_count: u32,
}

impl TableBucket {
    /// Generation stamp of the most recent successful rematch.
    #[inline]
    pub fn rematch_count(&self) -> u32 {
        self.rematch_count
    }
}
