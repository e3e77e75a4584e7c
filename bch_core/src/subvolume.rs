//! Subvolumes: named, independently versionable namespace roots.
//!
//! Records live in the subvolumes tree at (0, id), unsnapshotted.
//! `fs_path_parent` is the subvolume containing this one in the filesystem
//! path hierarchy; the parent pointer a subvolume-root inode carries must
//! agree with it.

use serde::{Deserialize, Serialize};

use crate::bkey::{spos, BkeyI, KeyValue};
use crate::btree::BtreeId;
use crate::errcode::{BchResult, Errcode};
use crate::trans::{BtreeIter, BtreeIterFlags, BtreeTrans};

pub const ROOT_SUBVOL: u32 = 1;

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Subvolume {
    pub root_inode: u64,
    pub snapshot: u32,
    pub fs_path_parent: u32,
    pub is_snapshot: bool,
    pub is_ro: bool,
}

fn subvolume_iter<'t, 'f>(trans: &'t BtreeTrans<'f>, id: u32) -> BtreeIter<'t, 'f> {
    BtreeIter::new(
        trans,
        BtreeId::Subvolumes,
        spos(0, id as u64, 0),
        BtreeIterFlags::INTENT | BtreeIterFlags::ALL_SNAPSHOTS | BtreeIterFlags::WITH_UPDATES,
    )
}

pub fn subvolume_get(trans: &BtreeTrans, id: u32) -> BchResult<Subvolume> {
    match subvolume_iter(trans, id).peek_slot()? {
        Some(BkeyI { v: KeyValue::Subvolume(s), .. }) => Ok(s),
        _ => Err(Errcode::Noent),
    }
}

/// The snapshot id a subvolume currently writes at.
pub fn subvolume_get_snapshot(trans: &BtreeTrans, id: u32) -> BchResult<u32> {
    Ok(subvolume_get(trans, id)?.snapshot)
}

pub fn subvol_is_ro_trans(trans: &BtreeTrans, id: u32) -> BchResult<()> {
    if subvolume_get(trans, id)?.is_ro {
        Err(Errcode::Rofs)
    } else {
        Ok(())
    }
}

/// Recursive subvolume destroy is not allowed: error if any subvolume names
/// `id` as its path parent.
pub fn subvol_has_children(trans: &BtreeTrans, id: u32) -> BchResult<()> {
    for k in trans.fs.btree.keys(BtreeId::Subvolumes) {
        if let KeyValue::Subvolume(s) = &k.v {
            if s.fs_path_parent == id {
                return Err(Errcode::NotEmpty);
            }
        }
    }
    // staged creations count too
    let mut pos = spos(0, 0, 0);
    loop {
        match trans.staged_next(BtreeId::Subvolumes, pos) {
            Some((p, KeyValue::Subvolume(s))) => {
                if s.fs_path_parent == id {
                    return Err(Errcode::NotEmpty);
                }
                pos = p.successor();
            }
            Some((p, _)) => pos = p.successor(),
            None => break,
        }
    }
    Ok(())
}

/// Create a subvolume record (and its snapshot node).
///
/// For a snapshot (`snapshot_src != 0`) the source subvolume's snapshot leaf
/// is split: the source moves to one child for its future writes, the new
/// subvolume takes the other. `new_snapshot_out` is the snapshot the new
/// subvolume writes at.
pub fn subvolume_create(
    trans: &BtreeTrans,
    root_inode: u64,
    parent_subvol: u32,
    snapshot_src: u32,
    ro: bool,
) -> BchResult<(u32, u32)> {
    let fs = trans.fs;
    let new_subvol = fs.alloc_subvol_id();

    let new_snapshot = if snapshot_src == 0 {
        fs.snapshots.write().create_tree(new_subvol)
    } else {
        let mut src = subvolume_get(trans, snapshot_src)?;
        let (src_leaf, snap_leaf) = fs
            .snapshots
            .write()
            .create_children(src.snapshot, snapshot_src, new_subvol);

        // the source subvolume moves to its new leaf
        src.snapshot = src_leaf;
        trans.update(
            BtreeId::Subvolumes,
            BkeyI::new(spos(0, snapshot_src as u64, 0), KeyValue::Subvolume(src)),
        )?;
        snap_leaf
    };

    let s = Subvolume {
        root_inode,
        snapshot: new_snapshot,
        fs_path_parent: parent_subvol,
        is_snapshot: snapshot_src != 0,
        is_ro: ro,
    };
    trans.update(
        BtreeId::Subvolumes,
        BkeyI::new(spos(0, new_subvol as u64, 0), KeyValue::Subvolume(s)),
    )?;

    Ok((new_subvol, new_snapshot))
}

/// Remove the subvolume record. The keys under its snapshot are reaped
/// separately.
pub fn subvolume_unlink(trans: &BtreeTrans, id: u32) -> BchResult<()> {
    if id == ROOT_SUBVOL {
        return Err(Errcode::Perm);
    }
    // must exist
    subvolume_get(trans, id)?;
    trans.update(
        BtreeId::Subvolumes,
        BkeyI::new(spos(0, id as u64, 0), KeyValue::Deleted),
    )
}
