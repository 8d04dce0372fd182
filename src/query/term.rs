//! Query terms: one clause of a query signature.

use crate::{entity::Entity, id::Id};

/// A term reference: the source, predicate, or object of a term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    /// The iterated entity (`$this`). Only valid as a term source.
    This,
    /// A fixed entity (a component, a relationship, or a concrete source).
    /// [`Entity::WILDCARD`] makes the reference a wildcard.
    Entity(Entity),
    /// A named query variable. Not supported by the cache; rejected at
    /// construction.
    Var(String),
}

impl Ref {
    /// The referenced entity, when the reference is fixed.
    pub fn entity(&self) -> Option<Entity> {
        match self {
            Ref::Entity(entity) => Some(*entity),
            _ => None,
        }
    }
}

impl Default for Ref {
    fn default() -> Self {
        Ref::This
    }
}

/// The operator of a term.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Oper {
    /// The term must match (the default).
    #[default]
    And,
    /// The term may match; an unmatched field is left unset.
    Optional,
    /// The term must not match; the field is always unset.
    Not,
}

/// Access declaration of a term.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum InOut {
    /// Read-write, derived from usage (the default).
    #[default]
    Default,
    /// Read-only.
    In,
    /// Write-only.
    Out,
    /// Filter-only: matched but never accessed. Not supported by the cache.
    Filter,
}

/// One clause of a query signature.
#[derive(Debug, Clone)]
pub struct Term {
    /// The source the term is matched against; defaults to `$this`.
    pub src: Ref,
    /// The predicate: the component, or the relationship of a pair.
    pub first: Ref,
    /// The object of a pair, if the term declares one.
    pub second: Option<Ref>,
    /// The term operator.
    pub oper: Oper,
    /// The access declaration.
    pub inout: InOut,
    /// Traversal relationship for resolving the term on an ancestor when
    /// the iterated table does not provide it.
    pub up: Option<Entity>,
    /// Group the matched tables by traversal depth.
    pub cascade: bool,
    /// Order cascade groups by descending depth.
    pub desc: bool,
}

impl Term {
    /// A term matching a plain component.
    pub fn new(component: Entity) -> Self {
        Self {
            src: Ref::This,
            first: Ref::Entity(component),
            second: None,
            oper: Oper::And,
            inout: InOut::Default,
            up: None,
            cascade: false,
            desc: false,
        }
    }

    /// A term matching a relationship pair. Use [`Entity::WILDCARD`] in
    /// either position for wildcard expansion.
    pub fn pair(relationship: Entity, target: Entity) -> Self {
        Self {
            second: Some(Ref::Entity(target)),
            ..Self::new(relationship)
        }
    }

    /// Make the term optional.
    pub fn optional(mut self) -> Self {
        self.oper = Oper::Optional;
        self
    }

    /// Negate the term.
    pub fn not(mut self) -> Self {
        self.oper = Oper::Not;
        self
    }

    /// Match the term against a fixed source entity instead of `$this`.
    pub fn src_entity(mut self, entity: Entity) -> Self {
        self.src = Ref::Entity(entity);
        self
    }

    /// Resolve the term on ancestors along the given relationship when the
    /// iterated table does not provide it.
    pub fn up(mut self, relationship: Entity) -> Self {
        self.up = Some(relationship);
        self
    }

    /// Group matched tables by traversal depth along this term's
    /// relationship.
    pub fn cascade(mut self) -> Self {
        self.cascade = true;
        self
    }

    /// Cascade with deepest tables first.
    pub fn cascade_desc(mut self) -> Self {
        self.cascade = true;
        self.desc = true;
        self
    }

    /// Declare the term as filter-only.
    pub fn filter(mut self) -> Self {
        self.inout = InOut::Filter;
        self
    }

    /// The id this term declares, when both references are fixed.
    pub fn declared_id(&self) -> Option<Id> {
        match (&self.first, &self.second) {
            (Ref::Entity(first), None) => Some(Id::entity(*first)),
            (Ref::Entity(first), Some(Ref::Entity(second))) => Some(Id::pair(*first, *second)),
            _ => None,
        }
    }

    /// The relationship cascade depth is computed along: the explicit
    /// traversal relationship, the declared pair's relationship, or the
    /// builtin hierarchy.
    pub fn cascade_rel(&self) -> Entity {
        self.up.unwrap_or_else(|| {
            match self.declared_id() {
                Some(id) if id.is_pair() && id.first() != Entity::WILDCARD => id.first(),
                _ => Entity::CHILD_OF,
            }
        })
    }
}
