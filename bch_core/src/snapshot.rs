//! The snapshot DAG.
//!
//! Snapshot ids form a forest: every subvolume points at a leaf, and taking
//! a snapshot splits that leaf into two new children — one the subvolume
//! moves to for its future writes, one the snapshot keeps. Keys written
//! before the split sit at the (now interior) parent and stay visible from
//! both sides; keys written after the split are visible only on their own
//! branch.
//!
//! A read at snapshot `s` observes the key version whose snapshot id is the
//! nearest ancestor of `s`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotNode {
    /// 0 for a tree root.
    pub parent: u32,
    pub depth: u32,
    /// Owning subvolume, 0 once the node is interior.
    pub subvol: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotTable {
    nodes: HashMap<u32, SnapshotNode>,
    next_id: u32,
}

impl SnapshotTable {
    pub fn new() -> Self {
        SnapshotTable { nodes: HashMap::new(), next_id: 1 }
    }

    pub fn node(&self, id: u32) -> Option<&SnapshotNode> {
        self.nodes.get(&id)
    }

    pub fn depth(&self, id: u32) -> u32 {
        self.nodes.get(&id).map_or(0, |n| n.depth)
    }

    fn alloc(&mut self, parent: u32, subvol: u32) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        let depth = if parent != 0 { self.depth(parent) + 1 } else { 0 };
        self.nodes.insert(id, SnapshotNode { parent, depth, subvol });
        id
    }

    /// New root node for a brand-new subvolume.
    pub fn create_tree(&mut self, subvol: u32) -> u32 {
        self.alloc(0, subvol)
    }

    /// Split `at` for a snapshot: returns `(subvol_leaf, snapshot_leaf)`.
    /// `at` becomes interior; the owning subvolume must move to
    /// `subvol_leaf`, the new snapshot subvolume gets `snapshot_leaf`.
    pub fn create_children(&mut self, at: u32, subvol: u32, snap_subvol: u32) -> (u32, u32) {
        let subvol_leaf = self.alloc(at, subvol);
        let snap_leaf = self.alloc(at, snap_subvol);
        if let Some(n) = self.nodes.get_mut(&at) {
            n.subvol = 0;
        }
        (subvol_leaf, snap_leaf)
    }

    /// Is `ancestor` an ancestor of (or equal to) `id`?
    pub fn is_ancestor(&self, mut id: u32, ancestor: u32) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.nodes.get(&id) {
                Some(n) if n.parent != 0 => id = n.parent,
                _ => return false,
            }
        }
    }

    /// All live snapshot ids.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.nodes.keys().copied()
    }
}

impl Default for SnapshotTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_isolates_future_writes() {
        let mut t = SnapshotTable::new();
        let root = t.create_tree(1);
        let (subvol_leaf, snap_leaf) = t.create_children(root, 1, 2);

        // both sides still see the pre-split ancestor
        assert!(t.is_ancestor(subvol_leaf, root));
        assert!(t.is_ancestor(snap_leaf, root));

        // neither side is an ancestor of the other
        assert!(!t.is_ancestor(subvol_leaf, snap_leaf));
        assert!(!t.is_ancestor(snap_leaf, subvol_leaf));

        // the split point is interior now
        assert_eq!(t.node(root).unwrap().subvol, 0);
        assert_eq!(t.node(subvol_leaf).unwrap().subvol, 1);
        assert_eq!(t.node(snap_leaf).unwrap().subvol, 2);
    }

    #[test]
    fn ancestor_is_reflexive_and_deep() {
        let mut t = SnapshotTable::new();
        let a = t.create_tree(1);
        let (b, _) = t.create_children(a, 1, 2);
        let (c, _) = t.create_children(b, 1, 3);

        assert!(t.is_ancestor(c, c));
        assert!(t.is_ancestor(c, b));
        assert!(t.is_ancestor(c, a));
        assert!(!t.is_ancestor(a, c));
    }

    #[test]
    fn separate_trees_are_unrelated() {
        let mut t = SnapshotTable::new();
        let a = t.create_tree(1);
        let b = t.create_tree(2);
        assert!(!t.is_ancestor(a, b));
        assert!(!t.is_ancestor(b, a));
    }
}
