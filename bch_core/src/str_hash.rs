//! String-keyed hash indexes over a tree: dirents and xattrs.
//!
//! Open addressing in the key space: an entry for `name` lives at
//! (container inode, hash(name), snapshot), colliding entries probe forward
//! one offset at a time. Whiteouts count as occupied-but-deleted slots — a
//! probe walks past them, and deletion in a snapshot leaves one behind
//! whenever an ancestor snapshot still holds the entry.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use crate::bkey::{spos, BkeyI, Bpos, KeyValue};
use crate::btree::BtreeId;
use crate::errcode::{BchResult, Errcode};
use crate::inode::InodeUnpacked;
use crate::trans::BtreeTrans;

#[derive(Copy, Clone, Debug)]
pub struct HashInfo {
    pub seed: u64,
}

pub fn hash_info_init(inode: &InodeUnpacked) -> HashInfo {
    HashInfo { seed: inode.bi_hash_seed }
}

/// Per-index description: which tree, and how to read a key's name.
#[derive(Copy, Clone)]
pub struct HashDesc {
    pub btree: BtreeId,
    pub name_of: fn(&KeyValue) -> Option<&str>,
}

/// Hash a name to its home offset. Offsets stay in [1, 2^63] so probe
/// sequences have room to walk forward.
pub fn str_hash(info: &HashInfo, name: &str) -> u64 {
    let mut h = DefaultHasher::new();
    h.write_u64(info.seed);
    h.write(name.as_bytes());
    (h.finish() >> 1) + 1
}

/// The occupant of one slot: this transaction's staged update wins over the
/// tree, whiteouts included.
fn probe_slot(trans: &BtreeTrans, btree: BtreeId, pos: Bpos) -> Option<BkeyI> {
    if let Some(u) = trans.staged(btree, pos) {
        return match u.v {
            KeyValue::Deleted => None,
            _ => Some(u),
        };
    }
    let snapshots = trans.fs.snapshots.read();
    trans.fs.btree.lookup_visible_any(btree, pos, &snapshots)
}

/// Find `name`; returns the slot position and the key.
pub fn hash_lookup(
    trans: &BtreeTrans,
    desc: &HashDesc,
    info: &HashInfo,
    inum: u64,
    snapshot: u32,
    name: &str,
) -> BchResult<(Bpos, BkeyI)> {
    let mut offset = str_hash(info, name);

    loop {
        let pos = spos(inum, offset, snapshot);
        match probe_slot(trans, desc.btree, pos) {
            None => return Err(Errcode::Noent),
            Some(k) if !k.v.is_visible() => (),
            Some(k) => {
                if (desc.name_of)(&k.v) == Some(name) {
                    return Ok((pos, k));
                }
            }
        }
        offset = offset.checked_add(1).ok_or(Errcode::Noent)?;
    }
}

/// Insert `v` under its name. With `must_create`, an existing entry is
/// `Exist`; otherwise it is replaced in place. Returns the slot offset.
pub fn hash_create(
    trans: &BtreeTrans,
    desc: &HashDesc,
    info: &HashInfo,
    inum: u64,
    snapshot: u32,
    v: KeyValue,
    must_create: bool,
) -> BchResult<u64> {
    let name = (desc.name_of)(&v).ok_or(Errcode::Inval)?.to_owned();
    let mut offset = str_hash(info, &name);
    let mut free_slot: Option<u64> = None;

    // walk the whole probe chain: a reusable whiteout slot early in the
    // chain must not hide an existing entry for the same name further on
    loop {
        let pos = spos(inum, offset, snapshot);
        match probe_slot(trans, desc.btree, pos) {
            None => {
                let slot = free_slot.unwrap_or(offset);
                trans.update(desc.btree, BkeyI::new(spos(inum, slot, snapshot), v))?;
                return Ok(slot);
            }
            Some(k) if !k.v.is_visible() => {
                free_slot.get_or_insert(offset);
            }
            Some(k) => {
                if (desc.name_of)(&k.v) == Some(name.as_str()) {
                    if must_create {
                        return Err(Errcode::Exist);
                    }
                    trans.update(desc.btree, BkeyI::new(pos, v))?;
                    return Ok(offset);
                }
            }
        }
        offset = offset.checked_add(1).ok_or(Errcode::Nospc)?;
    }
}

/// Delete the entry at `pos` (which holds a key whose own snapshot is
/// `key_snapshot`).
///
/// When the entry is inherited from an ancestor snapshot — or an ancestor
/// holds its own version — deletion must shadow with a whiteout rather than
/// remove. `exact` forces a real removal at `pos.snapshot` regardless
/// (subvolume deletion, where the caller repositioned the iterator to the
/// key's own snapshot).
pub fn hash_delete_at(
    trans: &BtreeTrans,
    desc: &HashDesc,
    pos: Bpos,
    key_snapshot: u32,
    exact: bool,
) -> BchResult<()> {
    if exact {
        return trans.update(desc.btree, BkeyI::new(pos, KeyValue::Deleted));
    }

    let needs_whiteout = key_snapshot != pos.snapshot || {
        let snapshots = trans.fs.snapshots.read();
        trans.fs.btree.key_in_ancestor_snapshot(desc.btree, pos, &snapshots)
    };

    let v = if needs_whiteout { KeyValue::Whiteout } else { KeyValue::Deleted };
    trans.update(desc.btree, BkeyI::new(pos, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_seeded_and_stable() {
        let a = HashInfo { seed: 1 };
        let b = HashInfo { seed: 2 };
        assert_eq!(str_hash(&a, "hello"), str_hash(&a, "hello"));
        assert_ne!(str_hash(&a, "hello"), str_hash(&b, "hello"));
        assert_ne!(str_hash(&a, "hello"), str_hash(&a, "world"));
        assert!(str_hash(&a, "") >= 1);
    }
}
