//! The validated, uncached query.
//!
//! A [`Filter`] is a term list that has passed the cache's support
//! predicate. Validation happens once, at construction: a cache never has
//! to re-check term shapes on the hot path, and an unsupported signature
//! never produces a half-built cache.

use crate::{
    entity::Entity,
    error::Error,
    id::Id,
    query::term::{InOut, Oper, Ref, Term},
    storage::spec::bloom_bit,
};

/// A validated query signature.
#[derive(Debug)]
pub struct Filter {
    /// The validated terms.
    terms: Vec<Term>,

    /// Declared id per field, in term order.
    ids: Box<[Id]>,

    /// Whether any term resolves data from something other than the
    /// iterated entity (up-traversal or a fixed source).
    has_refs: bool,

    /// Bloom mask over the required self-matched ids, probed against table
    /// filters before evaluation.
    bloom: u64,

    /// 1-based index of the cascade term, zero when none.
    cascade_by: usize,
}

impl Filter {
    /// Validate a term list into a filter.
    ///
    /// Rejects named variables anywhere, variable predicates/objects,
    /// filter-only access declarations, and multiple cascade terms.
    pub fn new(terms: Vec<Term>) -> Result<Self, Error> {
        if terms.is_empty() {
            return Err(Error::UnsupportedTerm {
                term: 0,
                reason: "query has no terms",
            });
        }

        let mut cascade_by = 0usize;
        for (index, term) in terms.iter().enumerate() {
            let unsupported = |reason| Error::UnsupportedTerm {
                term: index,
                reason,
            };
            match &term.src {
                Ref::This | Ref::Entity(_) => {}
                Ref::Var(_) => return Err(unsupported("named source variable")),
            }
            match &term.first {
                Ref::Entity(_) => {}
                Ref::This | Ref::Var(_) => {
                    return Err(unsupported("predicate must be an id or wildcard"));
                }
            }
            match &term.second {
                None | Some(Ref::Entity(_)) => {}
                Some(Ref::This) | Some(Ref::Var(_)) => {
                    return Err(unsupported("object must be an id or wildcard"));
                }
            }
            if term.inout == InOut::Filter {
                return Err(unsupported("filter-only terms cannot be cached"));
            }
            if term.cascade {
                if cascade_by != 0 {
                    return Err(Error::InvalidGrouping("more than one cascade term"));
                }
                cascade_by = index + 1;
            }
        }

        let ids: Box<[Id]> = terms
            .iter()
            .map(|t| t.declared_id().expect("validated term without an id"))
            .collect();

        let has_refs = terms
            .iter()
            .any(|t| t.up.is_some() || matches!(t.src, Ref::Entity(_)));

        let mut bloom = 0u64;
        for (term, id) in terms.iter().zip(&ids) {
            let required_self =
                term.oper == Oper::And && term.src == Ref::This && term.up.is_none();
            if required_self && *id != Id::entity(Entity::WILDCARD) {
                bloom |= bloom_bit(*id);
            }
        }

        Ok(Self {
            terms,
            ids,
            has_refs,
            bloom,
            cascade_by,
        })
    }

    /// Get the terms of this filter.
    #[inline]
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// The declared id of each field.
    #[inline]
    pub fn ids(&self) -> &[Id] {
        &self.ids
    }

    /// The number of fields (one per term).
    #[inline]
    pub fn field_count(&self) -> usize {
        self.terms.len()
    }

    /// Whether any term resolves data away from the iterated entity.
    #[inline]
    pub fn has_refs(&self) -> bool {
        self.has_refs
    }

    /// Bloom mask over the required self-matched ids.
    #[inline]
    pub fn bloom(&self) -> u64 {
        self.bloom
    }

    /// 1-based index of the cascade term, zero when none.
    #[inline]
    pub fn cascade_by(&self) -> usize {
        self.cascade_by
    }

    /// The ids a cache built on this filter must monitor: every declared
    /// id, plus the traversal edges of up-terms, plus the inheritance edge
    /// when the traversal is not the inheritance relationship itself.
    pub fn monitor_ids(&self) -> Vec<Id> {
        let mut ids = Vec::with_capacity(self.terms.len());
        for (term, id) in self.terms.iter().zip(&self.ids) {
            ids.push(*id);
            if let Some(rel) = term.up {
                ids.push(Id::pair(rel, Entity::WILDCARD));
                if rel != Entity::IS_A {
                    ids.push(Id::pair(Entity::IS_A, Entity::WILDCARD));
                }
            }
        }
        ids.sort();
        ids.dedup();
        ids
    }
}
