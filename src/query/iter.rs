//! The uncached query evaluator.
//!
//! Walks tables sequentially and resolves every term of a [`Filter`]
//! against each table's type signature. A table where every required term
//! resolves produces one [`QueryMatch`] per combination of wildcard column
//! hits; terms that resolve on an ancestor (up-traversal) or on a fixed
//! source entity record the resolved source and the providing table.
//!
//! The evaluator matches empty tables; filtering them out is the cache's
//! decision, not the evaluator's.

use std::collections::VecDeque;

use fixedbitset::FixedBitSet;

use crate::{
    entity::Entity,
    id::Id,
    query::{
        filter::Filter,
        term::{Oper, Ref},
    },
    storage::{Table, TableRecord, table},
    world::World,
};

/// Upper bound on up-traversal walk depth; breaks relationship cycles.
const MAX_UP_DEPTH: usize = 64;

/// One evaluation result: how a single table satisfies the query, for one
/// wildcard resolution.
#[derive(Debug, Clone)]
pub struct QueryMatch {
    /// The matched table.
    pub table: table::Id,
    /// Per-field column descriptor; `None` for unset fields.
    pub trs: Box<[Option<TableRecord>]>,
    /// Per-field resolved id (the concrete id a wildcard matched).
    pub ids: Box<[Id]>,
    /// Per-field resolved source entity; `Entity::NULL` for `$this`.
    pub sources: Box<[Entity]>,
    /// Which fields are set.
    pub set_fields: FixedBitSet,
    /// Which fields were resolved via up-traversal.
    pub up_fields: FixedBitSet,
}

/// How a single term resolved against a table, for one candidate column.
#[derive(Debug, Clone, Copy)]
struct FieldHit {
    tr: Option<TableRecord>,
    id: Id,
    source: Entity,
    set: bool,
    up: bool,
}

/// An iterator over the matches of an uncached query.
pub struct QueryIter<'w> {
    world: &'w World,
    filter: &'w Filter,
    tables: std::vec::IntoIter<table::Id>,
    pending: VecDeque<QueryMatch>,
}

impl<'w> QueryIter<'w> {
    /// Evaluate the filter against every table in the world, in table
    /// creation order.
    pub fn new(world: &'w World, filter: &'w Filter) -> Self {
        let tables: Vec<_> = world.storage().iter().map(Table::id).collect();
        Self {
            world,
            filter,
            tables: tables.into_iter(),
            pending: VecDeque::new(),
        }
    }

    /// Evaluate the filter against a single table bound as `$this`.
    pub fn bound(world: &'w World, filter: &'w Filter, table: table::Id) -> Self {
        Self {
            world,
            filter,
            tables: vec![table].into_iter(),
            pending: VecDeque::new(),
        }
    }

    /// Resolve every term against a table; empty when the table does not
    /// match, one entry of candidate hits per field otherwise.
    fn resolve_fields(&self, table: &Table) -> Option<Vec<Vec<FieldHit>>> {
        let mut fields = Vec::with_capacity(self.filter.field_count());
        for (term, declared) in self.filter.terms().iter().zip(self.filter.ids()) {
            let hits = match &term.src {
                Ref::This => {
                    let mut hits: Vec<_> = table
                        .spec()
                        .search(*declared)
                        .map(|(column, id)| FieldHit {
                            tr: Some(TableRecord {
                                table: table.id(),
                                column,
                            }),
                            id,
                            source: Entity::NULL,
                            set: true,
                            up: false,
                        })
                        .collect();
                    if hits.is_empty() && let Some(rel) = term.up {
                        hits = self.resolve_up(table, rel, *declared);
                    }
                    hits
                }
                Ref::Entity(source) => self.resolve_entity(*source, *declared),
                // Rejected by filter validation.
                Ref::Var(_) => unreachable!("variable source survived validation"),
            };

            match term.oper {
                Oper::And => {
                    if hits.is_empty() {
                        return None;
                    }
                    fields.push(hits);
                }
                Oper::Optional => {
                    if hits.is_empty() {
                        fields.push(vec![FieldHit {
                            tr: None,
                            id: *declared,
                            source: Entity::NULL,
                            set: false,
                            up: false,
                        }]);
                    } else {
                        fields.push(hits);
                    }
                }
                Oper::Not => {
                    if !hits.is_empty() {
                        return None;
                    }
                    fields.push(vec![FieldHit {
                        tr: None,
                        id: *declared,
                        source: Entity::NULL,
                        set: false,
                        up: false,
                    }]);
                }
            }
        }
        Some(fields)
    }

    /// Walk the traversal relationship upward until an ancestor's table
    /// provides the id.
    fn resolve_up(&self, table: &Table, rel: Entity, declared: Id) -> Vec<FieldHit> {
        let edge_pattern = Id::pair(rel, Entity::WILDCARD);
        let mut current = table;
        for _ in 0..MAX_UP_DEPTH {
            let Some((_, edge)) = current.spec().search(edge_pattern).next() else {
                return Vec::new();
            };
            let parent = edge.second().expect("pair pattern matched a plain id");
            let Some(parent_table) = self
                .world
                .storage()
                .location(parent)
                .and_then(|id| self.world.storage().get(id))
            else {
                return Vec::new();
            };
            let hits: Vec<_> = parent_table
                .spec()
                .search(declared)
                .map(|(column, id)| FieldHit {
                    tr: Some(TableRecord {
                        table: parent_table.id(),
                        column,
                    }),
                    id,
                    source: parent,
                    set: true,
                    up: true,
                })
                .collect();
            if !hits.is_empty() {
                return hits;
            }
            current = parent_table;
        }
        Vec::new()
    }

    /// Resolve a term against a fixed source entity's table.
    fn resolve_entity(&self, source: Entity, declared: Id) -> Vec<FieldHit> {
        let Some(table) = self
            .world
            .storage()
            .location(source)
            .and_then(|id| self.world.storage().get(id))
        else {
            return Vec::new();
        };
        table
            .spec()
            .search(declared)
            .map(|(column, id)| FieldHit {
                tr: Some(TableRecord {
                    table: table.id(),
                    column,
                }),
                id,
                source,
                set: true,
                up: false,
            })
            .collect()
    }

    /// Expand per-field candidate hits into the cartesian product of
    /// matches, later fields varying fastest so a wildcard term's
    /// expansions appear in column order.
    fn expand(&mut self, table: table::Id, fields: Vec<Vec<FieldHit>>) {
        let field_count = fields.len();
        let mut cursor = vec![0usize; field_count];
        loop {
            let mut trs = Vec::with_capacity(field_count);
            let mut ids = Vec::with_capacity(field_count);
            let mut sources = Vec::with_capacity(field_count);
            let mut set_fields = FixedBitSet::with_capacity(field_count);
            let mut up_fields = FixedBitSet::with_capacity(field_count);
            for (index, (hits, chosen)) in fields.iter().zip(&cursor).enumerate() {
                let hit = hits[*chosen];
                trs.push(hit.tr);
                ids.push(hit.id);
                sources.push(hit.source);
                if hit.set {
                    set_fields.insert(index);
                }
                if hit.up {
                    up_fields.insert(index);
                }
            }
            self.pending.push_back(QueryMatch {
                table,
                trs: trs.into_boxed_slice(),
                ids: ids.into_boxed_slice(),
                sources: sources.into_boxed_slice(),
                set_fields,
                up_fields,
            });

            // Odometer increment, last field first.
            let mut index = field_count;
            loop {
                if index == 0 {
                    return;
                }
                index -= 1;
                cursor[index] += 1;
                if cursor[index] < fields[index].len() {
                    break;
                }
                cursor[index] = 0;
            }
        }
    }
}

impl Iterator for QueryIter<'_> {
    type Item = QueryMatch;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(m) = self.pending.pop_front() {
                return Some(m);
            }
            let table_id = self.tables.next()?;
            let Some(table) = self.world.storage().get(table_id) else {
                continue;
            };
            if let Some(fields) = self.resolve_fields(table) {
                self.expand(table_id, fields);
            }
        }
    }
}
