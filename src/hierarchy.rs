//! Entity hierarchy (component G): parent→children and child→parent tables
//! with bounded inline child storage and heap overflow.
//!
//! Unlike the old `Parent`/`Children` pair, this is not component data living
//! inside an archetype — it is a dedicated side table the world consults
//! directly, since hierarchy edits (reparenting, subtree destruction) need
//! to walk ancestor/descendant chains that component storage has no notion
//! of.

use ahash::AHashMap;
use smallvec::SmallVec;
use std::collections::VecDeque;

use crate::entity::Entity;
use crate::error::{EcsError, Result};

/// Inline capacity before a node's children spill to the heap.
const INLINE_CHILDREN: usize = 4;

type ChildList = SmallVec<[Entity; INLINE_CHILDREN]>;

/// Parent→children and child→parent relation, with cycle prevention at the
/// API boundary ("Prevent at the API").
#[derive(Default)]
pub struct EntityHierarchy {
    parent_of: AHashMap<Entity, Entity>,
    children_of: AHashMap<Entity, ChildList>,
    scratch: VecDeque<Entity>,
}

impl EntityHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_parent(&self, child: Entity) -> Option<Entity> {
        self.parent_of.get(&child).copied()
    }

    pub fn get_children(&self, parent: Entity) -> &[Entity] {
        self.children_of.get(&parent).map(|c| c.as_slice()).unwrap_or(&[])
    }

    pub fn is_root(&self, e: Entity) -> bool {
        !self.parent_of.contains_key(&e)
    }

    /// True if `ancestor` appears somewhere in `node`'s parent chain.
    fn is_ancestor(&self, ancestor: Entity, node: Entity) -> bool {
        let mut cursor = node;
        while let Some(&p) = self.parent_of.get(&cursor) {
            if p == ancestor {
                return true;
            }
            cursor = p;
        }
        false
    }

    fn detach(&mut self, child: Entity) {
        if let Some(old_parent) = self.parent_of.remove(&child) {
            if let Some(siblings) = self.children_of.get_mut(&old_parent) {
                siblings.retain(|c| *c != child);
            }
        }
    }

    /// Adds `child` under `parent`; `parent = None` adds `child` as a root
    /// ("parent = sentinel means add as root").
    pub fn add_entry(&mut self, parent: Option<Entity>, child: Entity) -> Result<()> {
        let Some(parent) = parent else {
            self.detach(child);
            return Ok(());
        };
        if parent == child || self.is_ancestor(child, parent) {
            return Err(EcsError::HierarchyCycle { parent, child });
        }
        self.detach(child);
        self.parent_of.insert(child, parent);
        let siblings = self.children_of.entry(parent).or_default();
        if !siblings.contains(&child) {
            siblings.push(child);
        }
        Ok(())
    }

    /// Detaches `child` from `old_parent`, making it a root. Fails if
    /// `child`'s current parent is not `old_parent`.
    pub fn change_parent(&mut self, old_parent: Entity, child: Entity) -> Result<()> {
        match self.parent_of.get(&child) {
            Some(&p) if p == old_parent => {
                self.detach(child);
                Ok(())
            }
            _ => Err(EcsError::HierarchyEntryMissing(child)),
        }
    }

    /// Reparents `child` under `parent`, regardless of whether it already
    /// had one.
    pub fn change_or_set_parent(&mut self, parent: Entity, child: Entity) -> Result<()> {
        self.add_entry(Some(parent), child)
    }

    /// Detaches `e` from its parent and removes its own children entry. If
    /// `destroy_children` is set, also returns the full descendant subtree
    /// (breadth-first) for the caller to delete through the entity manager;
    /// otherwise orphaned children become roots.
    pub fn remove_entry(&mut self, e: Entity, destroy_children: bool) -> Vec<Entity> {
        self.detach(e);
        if destroy_children {
            let subtree = self.collect_subtree(e);
            for &descendant in &subtree {
                self.parent_of.remove(&descendant);
                self.children_of.remove(&descendant);
            }
            self.children_of.remove(&e);
            subtree
        } else {
            if let Some(children) = self.children_of.remove(&e) {
                for child in children {
                    self.parent_of.remove(&child);
                }
            }
            Vec::new()
        }
    }

    /// Breadth-first walk of `root`'s descendants (not including `root`
    /// itself), reusing the hierarchy's own scratch queue ("copy
    /// children ... allocating and reusing a scratch queue").
    pub fn collect_subtree(&mut self, root: Entity) -> Vec<Entity> {
        let mut out = Vec::new();
        self.scratch.clear();
        self.scratch.push_back(root);
        while let Some(node) = self.scratch.pop_front() {
            let children: Vec<Entity> = self.get_children(node).to_vec();
            for child in children {
                out.push(child);
                self.scratch.push_back(child);
            }
        }
        out
    }

    pub fn try_get_children(&self, parent: Entity) -> Option<&[Entity]> {
        self.children_of.get(&parent).map(|c| c.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(i: u32) -> Entity {
        Entity::new(i, 0)
    }

    #[test]
    fn add_entry_links_parent_and_child() {
        let mut h = EntityHierarchy::new();
        h.add_entry(Some(e(1)), e(2)).unwrap();
        assert_eq!(h.get_parent(e(2)), Some(e(1)));
        assert_eq!(h.get_children(e(1)), &[e(2)]);
    }

    #[test]
    fn add_entry_none_parent_is_root() {
        let mut h = EntityHierarchy::new();
        h.add_entry(None, e(1)).unwrap();
        assert!(h.is_root(e(1)));
    }

    #[test]
    fn add_entry_rejects_cycle() {
        let mut h = EntityHierarchy::new();
        h.add_entry(Some(e(1)), e(2)).unwrap();
        h.add_entry(Some(e(2)), e(3)).unwrap();
        let err = h.add_entry(Some(e(3)), e(1)).unwrap_err();
        assert!(matches!(err, EcsError::HierarchyCycle { .. }));
    }

    #[test]
    fn change_parent_detaches_when_matching() {
        let mut h = EntityHierarchy::new();
        h.add_entry(Some(e(1)), e(2)).unwrap();
        h.change_parent(e(1), e(2)).unwrap();
        assert!(h.is_root(e(2)));
        assert!(h.get_children(e(1)).is_empty());
    }

    #[test]
    fn change_parent_fails_on_mismatch() {
        let mut h = EntityHierarchy::new();
        h.add_entry(Some(e(1)), e(2)).unwrap();
        let err = h.change_parent(e(9), e(2)).unwrap_err();
        assert!(matches!(err, EcsError::HierarchyEntryMissing(_)));
    }

    #[test]
    fn remove_entry_without_destroy_orphans_children_as_roots() {
        let mut h = EntityHierarchy::new();
        h.add_entry(Some(e(1)), e(2)).unwrap();
        h.remove_entry(e(1), false);
        assert!(h.is_root(e(2)));
    }

    #[test]
    fn remove_entry_with_destroy_returns_full_subtree() {
        let mut h = EntityHierarchy::new();
        h.add_entry(Some(e(1)), e(2)).unwrap();
        h.add_entry(Some(e(2)), e(3)).unwrap();
        h.add_entry(Some(e(1)), e(4)).unwrap();

        let subtree = h.remove_entry(e(1), true);
        assert_eq!(subtree.len(), 3);
        assert!(subtree.contains(&e(2)));
        assert!(subtree.contains(&e(3)));
        assert!(subtree.contains(&e(4)));
        assert!(h.get_parent(e(3)).is_none());
    }

    #[test]
    fn parent_and_children_tables_are_mutual_inverses() {
        let mut h = EntityHierarchy::new();
        h.add_entry(Some(e(1)), e(2)).unwrap();
        h.add_entry(Some(e(1)), e(3)).unwrap();
        for &child in h.get_children(e(1)).to_vec().iter() {
            assert_eq!(h.get_parent(child), Some(e(1)));
        }
    }
}
