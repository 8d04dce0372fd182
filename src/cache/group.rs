//! The group index: a key-ordered partition of the iteration list.
//!
//! Groups are an overlay on the cache's global list, not independent lists:
//! each group owns a contiguous `first..last` segment, and the global list
//! is the concatenation of the groups in key order. Iteration without a
//! group filter traverses the global list at full speed; iteration of a
//! single group walks its window.
//!
//! The group map is a `BTreeMap`, so finding the neighbouring group a new
//! group must be spliced after is a range query rather than a scan.

use std::{any::Any, collections::BTreeMap, ops::Bound};

use crate::{cache::arena::Key, entity::Entity, id::Id, storage::Table, world::World};

/// Computes the group key for a matched table.
pub type GroupByFn = Box<dyn Fn(&World, &Table, Entity) -> u64>;

/// Produces the opaque per-group context when a group is created.
pub type GroupCreateFn = Box<dyn Fn(&World, u64) -> Option<Box<dyn Any>>>;

/// Receives the per-group context back when a group is destroyed.
pub type GroupDeleteFn = Box<dyn Fn(&World, u64, Option<Box<dyn Any>>)>;

/// Externally visible group state.
#[derive(Default)]
pub struct GroupInfo {
    /// Records currently in the group (one per matched table expansion).
    pub table_count: u32,
    /// Monotonic change stamp, bumped on every insert or remove touching
    /// the group.
    pub match_count: u64,
    /// Opaque context produced by the group-create hook.
    pub ctx: Option<Box<dyn Any>>,
}

/// A contiguous segment of the iteration list.
pub struct Group {
    /// First record of the segment.
    pub(crate) first: Key,
    /// Last record of the segment.
    pub(crate) last: Key,
    /// Counters and user context.
    pub(crate) info: GroupInfo,
}

impl Group {
    /// Counters and user context for this group.
    #[inline]
    pub fn info(&self) -> &GroupInfo {
        &self.info
    }
}

impl std::fmt::Debug for GroupInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupInfo")
            .field("table_count", &self.table_count)
            .field("match_count", &self.match_count)
            .field("has_ctx", &self.ctx.is_some())
            .finish()
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("first", &self.first)
            .field("last", &self.last)
            .field("info", &self.info)
            .finish()
    }
}

/// The grouping configuration and the live group map of a cache.
pub(crate) struct GroupIndex {
    /// Live groups by key.
    pub(crate) groups: BTreeMap<u64, Group>,

    /// The relationship the default key function matches as `(group_by, *)`.
    pub(crate) group_by: Entity,

    /// User key function, overriding the default.
    pub(crate) callback: Option<GroupByFn>,

    /// Group lifecycle hooks.
    pub(crate) on_create: Option<GroupCreateFn>,
    pub(crate) on_delete: Option<GroupDeleteFn>,

    /// Traversal relationship for cascade grouping, when active.
    pub(crate) cascade: Option<Entity>,

    /// Concatenate groups in descending key order.
    pub(crate) descending: bool,
}

impl GroupIndex {
    /// Compute the group key for a table: the user callback when installed,
    /// the traversal depth under cascade, or the second element of the
    /// table's `(group_by, *)` pair (zero on miss).
    pub(crate) fn compute(&self, world: &World, table: &Table) -> u64 {
        if let Some(callback) = &self.callback {
            return callback(world, table, self.group_by);
        }
        if let Some(rel) = self.cascade {
            return world.depth(rel, table.id()) as u64;
        }
        table
            .spec()
            .search(Id::pair(self.group_by, Entity::WILDCARD))
            .next()
            .and_then(|(_, id)| id.second())
            .map(|target| target.raw() as u64)
            .unwrap_or(0)
    }

    /// The last record of the group a new group with this key must be
    /// spliced after; `None` places the new group at the global head.
    ///
    /// Ascending order anchors on the nearest smaller key, descending on
    /// the nearest larger key.
    pub(crate) fn anchor(&self, group_id: u64) -> Option<Key> {
        if self.descending {
            self.groups
                .range((Bound::Excluded(group_id), Bound::Unbounded))
                .next()
                .map(|(_, group)| group.last)
        } else {
            self.groups
                .range(..group_id)
                .next_back()
                .map(|(_, group)| group.last)
        }
    }
}

impl std::fmt::Debug for GroupIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupIndex")
            .field("groups", &self.groups.len())
            .field("group_by", &self.group_by)
            .field("cascade", &self.cascade)
            .field("descending", &self.descending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Spec;

    fn index(descending: bool) -> GroupIndex {
        GroupIndex {
            groups: BTreeMap::new(),
            group_by: Entity::new(60),
            callback: None,
            on_create: None,
            on_delete: None,
            cascade: None,
            descending,
        }
    }

    fn group(first: Key, last: Key) -> Group {
        Group {
            first,
            last,
            info: GroupInfo::default(),
        }
    }

    // Keys are opaque outside the arena; conjure a couple through one.
    fn keys() -> (Key, Key, Key) {
        let mut arena = crate::cache::arena::Arena::new();
        (arena.alloc(()), arena.alloc(()), arena.alloc(()))
    }

    #[test]
    fn default_key_is_pair_target() {
        // Given - a table carrying (group_by, 50)
        let mut world = World::new();
        let rel = Entity::new(60);
        let target = Entity::new(50);
        let t = world.create_table(Spec::new(vec![Id::pair(rel, target)]));
        let plain = world.create_table(Spec::new(vec![Id::entity(Entity::new(40))]));

        let index = GroupIndex {
            group_by: rel,
            ..index(false)
        };

        // Then
        let table = world.storage().get(t).unwrap();
        assert_eq!(index.compute(&world, table), target.raw() as u64);

        // And zero on miss
        let table = world.storage().get(plain).unwrap();
        assert_eq!(index.compute(&world, table), 0);
    }

    #[test]
    fn cascade_key_is_depth() {
        // Given - a parent table and a child table
        let mut world = World::new();
        let tag = Id::entity(Entity::new(40));
        let root = world.create_table(Spec::new(vec![tag]));
        let parent = world.spawn(root);
        let child = world.create_table(Spec::new(vec![tag, Id::pair(Entity::CHILD_OF, parent)]));

        let index = GroupIndex {
            cascade: Some(Entity::CHILD_OF),
            ..index(false)
        };

        // Then
        assert_eq!(index.compute(&world, world.storage().get(root).unwrap()), 0);
        assert_eq!(index.compute(&world, world.storage().get(child).unwrap()), 1);
    }

    #[test]
    fn ascending_anchor_is_nearest_smaller() {
        let (k10, k30, _) = keys();
        let mut idx = index(false);
        idx.groups.insert(10, group(k10, k10));
        idx.groups.insert(30, group(k30, k30));

        assert_eq!(idx.anchor(20), Some(k10));
        assert_eq!(idx.anchor(40), Some(k30));
        assert_eq!(idx.anchor(5), None);
    }

    #[test]
    fn descending_anchor_is_nearest_larger() {
        let (k10, k30, _) = keys();
        let mut idx = index(true);
        idx.groups.insert(10, group(k10, k10));
        idx.groups.insert(30, group(k30, k30));

        assert_eq!(idx.anchor(20), Some(k30));
        assert_eq!(idx.anchor(5), Some(k10));
        assert_eq!(idx.anchor(40), None);
    }
}
