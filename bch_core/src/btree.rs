//! In-memory storage trees: ordered key/value maps with copy-on-write
//! snapshot visibility.
//!
//! Keys carry a snapshot id in their position. A read at snapshot `s`
//! observes, for each (inode, offset), the version whose snapshot id is the
//! nearest ancestor of `s` — a whiteout version shadows anything older
//! without removing it.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, FromRepr};

use crate::accounting::accounting_accumulate;
use crate::bkey::{bkey_le, BkeyI, Bpos, KeyValue};
use crate::snapshot::SnapshotTable;

#[derive(
    Copy, Clone, PartialEq, Eq, Debug, Display, EnumString, FromRepr,
    Serialize, Deserialize,
)]
#[repr(u8)]
#[strum(serialize_all = "snake_case")]
pub enum BtreeId {
    Inodes = 0,
    Dirents = 1,
    Xattrs = 2,
    Subvolumes = 3,
    Accounting = 4,
}

pub const BTREE_NR: usize = 5;

pub struct BtreeStore {
    trees: Vec<RwLock<BTreeMap<Bpos, BkeyI>>>,
}

impl BtreeStore {
    pub fn new() -> Self {
        BtreeStore {
            trees: (0..BTREE_NR).map(|_| RwLock::new(BTreeMap::new())).collect(),
        }
    }

    fn tree(&self, id: BtreeId) -> &RwLock<BTreeMap<Bpos, BkeyI>> {
        &self.trees[id as usize]
    }

    /// Apply a point write: `Deleted` removes the exact key, anything else
    /// replaces it.
    pub fn point_write(&self, id: BtreeId, k: BkeyI) {
        let mut t = self.tree(id).write();
        if matches!(k.v, KeyValue::Deleted) {
            t.remove(&k.p);
        } else {
            t.insert(k.p, k);
        }
    }

    /// Write-buffer semantics for accounting keys: the counters are a delta
    /// against the existing value, inserting zero+delta when absent.
    pub fn accounting_apply_delta(&self, k: &BkeyI) {
        let mut t = self.tree(BtreeId::Accounting).write();
        match t.get_mut(&k.p) {
            Some(cur) => accounting_accumulate(cur, k),
            None => {
                t.insert(k.p, k.clone());
            }
        }
    }

    /// The key at exactly `pos`, ignoring snapshot visibility.
    pub fn get_exact(&self, id: BtreeId, pos: Bpos) -> Option<BkeyI> {
        self.tree(id).read().get(&pos).cloned()
    }

    /// The version of (inode, offset) whose snapshot is the nearest ancestor
    /// of `pos.snapshot` — whiteouts included. The distinction matters for
    /// hash probing, where a whiteout is an occupied-but-deleted slot.
    pub fn lookup_visible_any(
        &self,
        id: BtreeId,
        pos: Bpos,
        snapshots: &SnapshotTable,
    ) -> Option<BkeyI> {
        let t = self.tree(id).read();
        let lo = pos.with_snapshot(0);
        let hi = pos.with_snapshot(u32::MAX);

        let mut best: Option<&BkeyI> = None;
        for (p, k) in t.range(lo..=hi) {
            if !snapshots.is_ancestor(pos.snapshot, p.snapshot) {
                continue;
            }
            if best.map_or(true, |b| snapshots.depth(p.snapshot) > snapshots.depth(b.p.snapshot)) {
                best = Some(k);
            }
        }
        best.cloned()
    }

    /// The version of (inode, offset) visible at snapshot `pos.snapshot`:
    /// the one at the nearest ancestor. Whiteouts shadow; `None` if nothing
    /// is visible.
    pub fn lookup_visible(
        &self,
        id: BtreeId,
        pos: Bpos,
        snapshots: &SnapshotTable,
    ) -> Option<BkeyI> {
        self.lookup_visible_any(id, pos, snapshots)
            .filter(|k| k.v.is_visible())
    }

    /// Does some strict-ancestor snapshot hold a visible version of this
    /// position? Decides whether a delete must leave a whiteout.
    pub fn key_in_ancestor_snapshot(
        &self,
        id: BtreeId,
        pos: Bpos,
        snapshots: &SnapshotTable,
    ) -> bool {
        let t = self.tree(id).read();
        let lo = pos.with_snapshot(0);
        let hi = pos.with_snapshot(u32::MAX);

        t.range(lo..=hi).any(|(p, k)| {
            p.snapshot != pos.snapshot
                && snapshots.is_ancestor(pos.snapshot, p.snapshot)
                && k.v.is_visible()
        })
    }

    /// First visible, non-whiteout key with (inode, offset) in
    /// `[from ..= end]`, read at snapshot `from.snapshot`.
    pub fn peek_visible_range(
        &self,
        id: BtreeId,
        from: Bpos,
        end: Bpos,
        snapshots: &SnapshotTable,
    ) -> Option<BkeyI> {
        let mut cur = from.with_snapshot(0);

        loop {
            let next = {
                let t = self.tree(id).read();
                match t.range(cur..).next() {
                    Some((p, _)) if bkey_le(*p, end) => Some(*p),
                    _ => None,
                }
            };
            let p = next?;

            if let Some(k) =
                self.lookup_visible(id, p.with_snapshot(from.snapshot), snapshots)
            {
                return Some(k);
            }

            // nothing visible here; advance past this (inode, offset)
            if p.offset < u64::MAX {
                cur = Bpos { inode: p.inode, offset: p.offset + 1, snapshot: 0 };
            } else if p.inode < u64::MAX {
                cur = Bpos { inode: p.inode + 1, offset: 0, snapshot: 0 };
            } else {
                return None;
            }
        }
    }

    /// Next key at or after `from` in raw (inode, offset, snapshot) order —
    /// the all-snapshots iteration mode.
    pub fn peek_raw(&self, id: BtreeId, from: Bpos) -> Option<BkeyI> {
        self.tree(id).read().range(from..).next().map(|(_, k)| k.clone())
    }

    /// Every key in the tree, in order. Mount replay and verification walk
    /// the accounting tree this way.
    pub fn keys(&self, id: BtreeId) -> Vec<BkeyI> {
        self.tree(id).read().values().cloned().collect()
    }

    pub fn load(&self, id: BtreeId, keys: Vec<BkeyI>) {
        let mut t = self.tree(id).write();
        t.clear();
        for k in keys {
            t.insert(k.p, k);
        }
    }
}

impl Default for BtreeStore {
    fn default() -> Self {
        Self::new()
    }
}
