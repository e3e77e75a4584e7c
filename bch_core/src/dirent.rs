//! Directory entries.
//!
//! A dirent maps (parent inode, hash(name), snapshot) to a target — an
//! inode number, or a subvolume id for subvolume roots — through the
//! string-hash layer in `str_hash`.

use serde::{Deserialize, Serialize};

use crate::bkey::{spos, BkeyI, Bpos, KeyValue, SubvolInum};
use crate::btree::BtreeId;
use crate::errcode::{BchResult, Errcode};
use crate::inode::FileType;
use crate::str_hash::{self, HashDesc, HashInfo};
use crate::subvolume::{subvolume_get, subvolume_get_snapshot};
use crate::trans::BtreeTrans;

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum DirentTarget {
    Inum(u64),
    Subvol(u32),
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Dirent {
    pub d_type: FileType,
    pub target: DirentTarget,
    pub name: String,
}

pub const DIRENT_HASH_DESC: HashDesc = HashDesc {
    btree: BtreeId::Dirents,
    name_of: |v| match v {
        KeyValue::Dirent(d) => Some(&d.name),
        _ => None,
    },
};

/// Bytes a dirent occupies in its directory, as accounted in the
/// directory's `bi_size`: key header plus the name, rounded to key units.
pub fn dirent_occupied_size(name: &str) -> u64 {
    ((48 + name.len() + 7) & !7) as u64
}

/// Create a dirent in `dir` (at `snapshot`); returns the slot offset.
pub fn dirent_create(
    trans: &BtreeTrans,
    dir: SubvolInum,
    snapshot: u32,
    hash_info: &HashInfo,
    d_type: FileType,
    name: &str,
    target: DirentTarget,
    must_create: bool,
) -> BchResult<u64> {
    let d = Dirent { d_type, target, name: name.to_owned() };

    str_hash::hash_create(
        trans,
        &DIRENT_HASH_DESC,
        hash_info,
        dir.inum,
        snapshot,
        KeyValue::Dirent(d),
        must_create,
    )
}

/// Look up `name` in `dir`: returns the slot position (at the read
/// snapshot), the found key (whose own snapshot may be an ancestor), and
/// the resolved target.
pub fn dirent_lookup_trans(
    trans: &BtreeTrans,
    dir: SubvolInum,
    hash_info: &HashInfo,
    name: &str,
) -> BchResult<(Bpos, BkeyI, SubvolInum)> {
    let snapshot = subvolume_get_snapshot(trans, dir.subvol)?;
    let (pos, k) =
        str_hash::hash_lookup(trans, &DIRENT_HASH_DESC, hash_info, dir.inum, snapshot, name)?;

    let KeyValue::Dirent(d) = &k.v else {
        return Err(Errcode::Noent);
    };
    let inum = dirent_read_target(trans, dir, d)?;
    Ok((pos, k, inum))
}

/// Resolve a dirent's target to (subvol, inum). A subvolume target resolves
/// through the subvolume record to its root inode.
pub fn dirent_read_target(
    trans: &BtreeTrans,
    dir: SubvolInum,
    d: &Dirent,
) -> BchResult<SubvolInum> {
    match d.target {
        DirentTarget::Inum(inum) => Ok(SubvolInum::new(dir.subvol, inum)),
        DirentTarget::Subvol(subvol) => {
            let s = subvolume_get(trans, subvol)?;
            Ok(SubvolInum::new(subvol, s.root_inode))
        }
    }
}

/// `NotEmpty` unless the directory has no visible entries.
pub fn empty_dir_trans(trans: &BtreeTrans, dir: SubvolInum) -> BchResult<()> {
    let snapshot = subvolume_get_snapshot(trans, dir.subvol)?;
    let snapshots = trans.fs.snapshots.read();

    match trans.fs.btree.peek_visible_range(
        BtreeId::Dirents,
        spos(dir.inum, 0, snapshot),
        spos(dir.inum, u64::MAX, 0),
        &snapshots,
    ) {
        Some(_) => Err(Errcode::NotEmpty),
        None => Ok(()),
    }
}

/// Visible entries of a directory, in hash order.
pub fn dirent_list(trans: &BtreeTrans, dir: SubvolInum) -> BchResult<Vec<Dirent>> {
    let snapshot = subvolume_get_snapshot(trans, dir.subvol)?;
    let mut out = Vec::new();
    let mut pos = spos(dir.inum, 0, snapshot);

    loop {
        let next = {
            let snapshots = trans.fs.snapshots.read();
            trans.fs.btree.peek_visible_range(
                BtreeId::Dirents,
                pos,
                spos(dir.inum, u64::MAX, 0),
                &snapshots,
            )
        };
        match next {
            Some(k) => {
                if let KeyValue::Dirent(d) = k.v {
                    out.push(d);
                }
                if k.p.offset == u64::MAX {
                    break;
                }
                pos = spos(dir.inum, k.p.offset + 1, snapshot);
            }
            None => break,
        }
    }
    Ok(out)
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RenameMode {
    Rename,
    Overwrite,
    Exchange,
}

/// The dirent half of rename: move/exchange the entries, returning the
/// resolved targets and slot offsets for the inode updates.
///
/// Returns `(src_inum, src_offset, dst_inum, dst_offset)`; `dst_inum` is
/// `None` for a plain rename with no displaced target.
#[allow(clippy::too_many_arguments)]
pub fn dirent_rename(
    trans: &BtreeTrans,
    src_dir: SubvolInum,
    src_hash: &HashInfo,
    dst_dir: SubvolInum,
    dst_hash: &HashInfo,
    src_name: &str,
    dst_name: &str,
    mode: RenameMode,
) -> BchResult<(SubvolInum, u64, Option<SubvolInum>, u64)> {
    let src_snapshot = subvolume_get_snapshot(trans, src_dir.subvol)?;
    let dst_snapshot = subvolume_get_snapshot(trans, dst_dir.subvol)?;

    let (src_pos, src_k) = str_hash::hash_lookup(
        trans, &DIRENT_HASH_DESC, src_hash, src_dir.inum, src_snapshot, src_name,
    )?;
    let KeyValue::Dirent(src_d) = src_k.v.clone() else {
        return Err(Errcode::Noent);
    };
    let src_inum = dirent_read_target(trans, src_dir, &src_d)?;

    let dst_slot = str_hash::hash_lookup(
        trans, &DIRENT_HASH_DESC, dst_hash, dst_dir.inum, dst_snapshot, dst_name,
    );

    let (dst_inum, dst_offset) = match (mode, dst_slot) {
        (RenameMode::Rename, Ok(_)) => return Err(Errcode::Exist),
        (RenameMode::Rename, Err(Errcode::Noent)) => {
            // new entry in the destination
            let offset = dirent_create(
                trans, dst_dir, dst_snapshot, dst_hash,
                src_d.d_type, dst_name, src_d.target, true,
            )?;
            (None, offset)
        }
        (_, Ok((dst_pos, dst_k))) => {
            let KeyValue::Dirent(dst_d) = dst_k.v else {
                return Err(Errcode::Noent);
            };
            let dst_inum = dirent_read_target(trans, dst_dir, &dst_d)?;

            // replace the target in place
            let new = Dirent {
                d_type: src_d.d_type,
                target: src_d.target,
                name: dst_name.to_owned(),
            };
            trans.update(
                BtreeId::Dirents,
                BkeyI::new(dst_pos.with_snapshot(dst_snapshot), KeyValue::Dirent(new)),
            )?;

            if mode == RenameMode::Exchange {
                let back = Dirent {
                    d_type: dst_d.d_type,
                    target: dst_d.target,
                    name: src_name.to_owned(),
                };
                trans.update(
                    BtreeId::Dirents,
                    BkeyI::new(src_pos.with_snapshot(src_snapshot), KeyValue::Dirent(back)),
                )?;
            }
            (Some(dst_inum), dst_pos.offset)
        }
        (_, Err(e)) => return Err(e),
    };

    if mode != RenameMode::Exchange {
        str_hash::hash_delete_at(
            trans,
            &DIRENT_HASH_DESC,
            src_pos,
            src_k.p.snapshot,
            false,
        )?;
    }

    Ok((src_inum, src_pos.offset, dst_inum, dst_offset))
}
