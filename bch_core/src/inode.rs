//! On-disk inodes and the transactional operations on them.
//!
//! Inodes live in the inodes tree at position (0, inum, snapshot). `bi_dir` /
//! `bi_dir_offset` are the back-pointer naming the dirent that points at this
//! inode — a lookup key, not a reference; the namespace operations reconcile
//! both sides on every mutation.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, FromRepr};

use crate::bkey::{spos, KeyValue, SubvolInum};
use crate::errcode::{BchResult, Errcode};
use crate::percpu;
use crate::subvolume::subvolume_get_snapshot;
use crate::trans::{BtreeIter, BtreeIterFlags, BtreeTrans};
use crate::btree::BtreeId;

pub const ROOT_INO: u64 = 4096;

/// Inode flags (`bi_flags` bits).
pub const INODE_UNLINKED: u32 = 1 << 0;
pub const INODE_IMMUTABLE: u32 = 1 << 1;

/// The device number stored in a whiteout dirent's char-device inode.
pub const WHITEOUT_DEV: u32 = 0;

#[derive(
    Copy, Clone, PartialEq, Eq, Debug, Display, EnumString, FromRepr,
    Serialize, Deserialize,
)]
#[repr(u8)]
#[strum(serialize_all = "snake_case")]
pub enum FileType {
    Unknown = 0,
    Fifo = 1,
    Chr = 2,
    Dir = 4,
    Blk = 6,
    Reg = 8,
    Lnk = 10,
    Sock = 12,
    Whiteout = 14,
    Subvol = 16,
}

pub fn mode_to_type(mode: u32) -> FileType {
    match mode & (libc::S_IFMT as u32) {
        x if x == libc::S_IFIFO as u32 => FileType::Fifo,
        x if x == libc::S_IFCHR as u32 => FileType::Chr,
        x if x == libc::S_IFDIR as u32 => FileType::Dir,
        x if x == libc::S_IFBLK as u32 => FileType::Blk,
        x if x == libc::S_IFREG as u32 => FileType::Reg,
        x if x == libc::S_IFLNK as u32 => FileType::Lnk,
        x if x == libc::S_IFSOCK as u32 => FileType::Sock,
        _ => FileType::Unknown,
    }
}

pub fn is_dir(mode: u32) -> bool {
    mode & (libc::S_IFMT as u32) == libc::S_IFDIR as u32
}

/// Inheritable per-inode options; a set bit in `bi_fields_set` means the
/// option was set explicitly and reinheritance must leave it alone.
#[derive(Copy, Clone, PartialEq, Eq, Debug, FromRepr)]
#[repr(u8)]
pub enum InodeOpt {
    DataReplicas = 0,
    Compression = 1,
    ForegroundTarget = 2,
    BackgroundTarget = 3,
}

pub const INODE_OPT_NR: u8 = 4;

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct InodeUnpacked {
    pub bi_inum: u64,
    /// Nonzero iff this inode is a subvolume root.
    pub bi_subvol: u32,
    pub bi_parent_subvol: u32,
    pub bi_mode: u32,
    pub bi_uid: u32,
    pub bi_gid: u32,
    /// Links beyond the implicit ones; see [`InodeUnpacked::nlink_get`].
    pub bi_nlink: u32,
    pub bi_size: u64,
    pub bi_sectors: u64,
    pub bi_atime: u64,
    pub bi_mtime: u64,
    pub bi_ctime: u64,
    pub bi_otime: u64,
    /// Back-pointer: the dirent at (bi_dir, bi_dir_offset) names this inode.
    pub bi_dir: u64,
    pub bi_dir_offset: u64,
    pub bi_depth: u32,
    pub bi_flags: u32,
    pub bi_generation: u32,
    pub bi_dev: u32,
    pub bi_project: u32,
    pub bi_hash_seed: u64,
    pub bi_fields_set: u32,
    pub bi_data_replicas: u64,
    pub bi_compression: u64,
    pub bi_foreground_target: u64,
    pub bi_background_target: u64,
}

impl InodeUnpacked {
    pub fn is_dir(&self) -> bool {
        is_dir(self.bi_mode)
    }

    pub fn is_unlinked(&self) -> bool {
        self.bi_flags & INODE_UNLINKED != 0
    }

    /// The externally visible link count: directories start at 2
    /// (self + "."), everything else at 1.
    pub fn nlink_get(&self) -> u32 {
        if self.is_unlinked() {
            0
        } else {
            self.bi_nlink + if self.is_dir() { 2 } else { 1 }
        }
    }

    pub fn opt_get(&self, opt: InodeOpt) -> u64 {
        match opt {
            InodeOpt::DataReplicas => self.bi_data_replicas,
            InodeOpt::Compression => self.bi_compression,
            InodeOpt::ForegroundTarget => self.bi_foreground_target,
            InodeOpt::BackgroundTarget => self.bi_background_target,
        }
    }

    pub fn opt_set(&mut self, opt: InodeOpt, v: u64) {
        match opt {
            InodeOpt::DataReplicas => self.bi_data_replicas = v,
            InodeOpt::Compression => self.bi_compression = v,
            InodeOpt::ForegroundTarget => self.bi_foreground_target = v,
            InodeOpt::BackgroundTarget => self.bi_background_target = v,
        }
    }
}

/// Subdirectories (but not subvolume roots) contribute to the parent
/// directory's link count.
pub fn is_subdir_for_nlink(inode: &InodeUnpacked) -> bool {
    inode.is_dir() && inode.bi_subvol == 0
}

pub fn inode_nlink_inc(inode: &mut InodeUnpacked) -> BchResult<()> {
    if inode.is_unlinked() {
        return Err(Errcode::Noent);
    }
    if inode.bi_flags & INODE_IMMUTABLE != 0 {
        return Err(Errcode::Perm);
    }
    if inode.bi_nlink == u32::MAX {
        return Err(Errcode::Mlink);
    }
    inode.bi_nlink += 1;
    Ok(())
}

pub fn inode_nlink_dec(inode: &mut InodeUnpacked) {
    if inode.bi_nlink > 0 {
        inode.bi_nlink -= 1;
    } else {
        inode.bi_flags |= INODE_UNLINKED;
    }
}

/// Copy inheritable options from `src` (the new parent) onto `dst`, skipping
/// options explicitly set on `dst`. Returns whether anything changed.
pub fn reinherit_attrs(dst: &mut InodeUnpacked, src: &InodeUnpacked) -> bool {
    let mut ret = false;

    for id in 0..INODE_OPT_NR {
        let opt = InodeOpt::from_repr(id).unwrap();
        if dst.bi_fields_set & (1 << id) != 0 {
            continue;
        }

        let s = src.opt_get(opt);
        let d = dst.opt_get(opt);
        if s != d {
            dst.opt_set(opt, s);
            ret = true;
        }
    }
    ret
}

/// Initialize a fresh inode from the creating context.
pub fn inode_init_late(
    inode: &mut InodeUnpacked,
    now: u64,
    uid: u32,
    gid: u32,
    mode: u32,
    rdev: u32,
    parent: Option<&InodeUnpacked>,
) {
    inode.bi_uid = uid;
    inode.bi_gid = gid;
    inode.bi_mode = mode;
    inode.bi_dev = rdev;
    inode.bi_atime = now;
    inode.bi_mtime = now;
    inode.bi_ctime = now;
    inode.bi_otime = now;

    if let Some(p) = parent {
        inode.bi_project = p.bi_project;
        for id in 0..INODE_OPT_NR {
            let opt = InodeOpt::from_repr(id).unwrap();
            inode.opt_set(opt, p.opt_get(opt));
        }
    }
}

/// Look up an inode with an intent iterator positioned on it.
pub fn inode_peek<'t, 'f>(
    trans: &'t BtreeTrans<'f>,
    inum: SubvolInum,
    flags: BtreeIterFlags,
) -> BchResult<(BtreeIter<'t, 'f>, InodeUnpacked)> {
    let snapshot = subvolume_get_snapshot(trans, inum.subvol)?;

    let iter = BtreeIter::new(
        trans,
        BtreeId::Inodes,
        spos(0, inum.inum, snapshot),
        flags | BtreeIterFlags::INTENT,
    );

    match iter.peek_slot()? {
        Some(k) => match k.v {
            KeyValue::Inode(inode) => Ok((iter, inode)),
            _ => Err(Errcode::Noent),
        },
        None => Err(Errcode::Noent),
    }
}

/// Stage a write of `inode` at the iterator's position.
pub fn inode_write(
    _trans: &BtreeTrans,
    iter: &BtreeIter,
    inode: &InodeUnpacked,
) -> BchResult<()> {
    iter.write(KeyValue::Inode(inode.clone()))
}

pub fn inode_find_by_inum_trans(
    trans: &BtreeTrans,
    inum: SubvolInum,
) -> BchResult<InodeUnpacked> {
    let (_iter, inode) = inode_peek(trans, inum, BtreeIterFlags::empty())?;
    Ok(inode)
}

/// Allocate an inode number and position an iterator for the first write.
///
/// Allocation starts from a per-shard hint so concurrent creators don't
/// contend on the same range of the inodes tree.
pub fn inode_create<'t, 'f>(
    trans: &'t BtreeTrans<'f>,
    inode: &mut InodeUnpacked,
    snapshot: u32,
) -> BchResult<BtreeIter<'t, 'f>> {
    let fs = trans.fs;
    let shard = percpu::this_shard();
    let mut candidate = fs.inum_hint(shard);

    let mut iter = BtreeIter::new(
        trans,
        BtreeId::Inodes,
        spos(0, candidate, snapshot),
        BtreeIterFlags::INTENT | BtreeIterFlags::WITH_UPDATES | BtreeIterFlags::ALL_SNAPSHOTS,
    );

    loop {
        if candidate == u64::MAX {
            return Err(Errcode::Nospc);
        }

        // an inum is free if no snapshot has a key for it
        iter.set_pos(spos(0, candidate, 0));
        let in_tree = iter.peek_max(spos(0, candidate, u32::MAX))?.is_some();
        let staged = trans.staged(BtreeId::Inodes, spos(0, candidate, 0)).is_some();
        if !in_tree && !staged {
            break;
        }
        candidate += 1;
    }

    fs.set_inum_hint(shard, candidate + 1);
    inode.bi_inum = candidate;
    inode.bi_hash_seed = fs.next_hash_seed();

    iter.set_pos(spos(0, candidate, snapshot));
    iter.traverse()?;
    Ok(iter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nlink_bias_for_directories() {
        let mut dir = InodeUnpacked {
            bi_mode: libc::S_IFDIR as u32 | 0o755,
            ..Default::default()
        };
        assert_eq!(dir.nlink_get(), 2);
        dir.bi_nlink = 3;
        assert_eq!(dir.nlink_get(), 5);

        let reg = InodeUnpacked {
            bi_mode: libc::S_IFREG as u32 | 0o644,
            ..Default::default()
        };
        assert_eq!(reg.nlink_get(), 1);
    }

    #[test]
    fn nlink_inc_rejects_unlinked_and_immutable() {
        let mut inode = InodeUnpacked {
            bi_mode: libc::S_IFREG as u32,
            bi_flags: INODE_UNLINKED,
            ..Default::default()
        };
        assert_eq!(inode_nlink_inc(&mut inode), Err(Errcode::Noent));

        inode.bi_flags = INODE_IMMUTABLE;
        assert_eq!(inode_nlink_inc(&mut inode), Err(Errcode::Perm));

        inode.bi_flags = 0;
        assert!(inode_nlink_inc(&mut inode).is_ok());
        assert_eq!(inode.bi_nlink, 1);
    }

    #[test]
    fn nlink_dec_sets_unlinked_at_zero() {
        let mut inode = InodeUnpacked {
            bi_mode: libc::S_IFREG as u32,
            bi_nlink: 1,
            ..Default::default()
        };
        inode_nlink_dec(&mut inode);
        assert_eq!(inode.nlink_get(), 1);
        inode_nlink_dec(&mut inode);
        assert_eq!(inode.nlink_get(), 0);
        assert!(inode.is_unlinked());
    }

    #[test]
    fn reinherit_skips_explicitly_set_options() {
        let mut parent = InodeUnpacked::default();
        parent.bi_compression = 4;
        parent.bi_data_replicas = 2;

        let mut child = InodeUnpacked::default();
        child.bi_fields_set = 1 << InodeOpt::DataReplicas as u8;
        child.bi_data_replicas = 3;

        assert!(reinherit_attrs(&mut child, &parent));
        assert_eq!(child.bi_compression, 4);
        assert_eq!(child.bi_data_replicas, 3);

        // second run is a no-op
        assert!(!reinherit_attrs(&mut child, &parent));
    }

    #[test]
    fn subdir_for_nlink_excludes_subvol_roots() {
        let mut d = InodeUnpacked {
            bi_mode: libc::S_IFDIR as u32,
            ..Default::default()
        };
        assert!(is_subdir_for_nlink(&d));
        d.bi_subvol = 7;
        assert!(!is_subdir_for_nlink(&d));
    }

    #[test]
    fn mode_to_type_mapping() {
        assert_eq!(mode_to_type(libc::S_IFDIR as u32 | 0o755), FileType::Dir);
        assert_eq!(mode_to_type(libc::S_IFREG as u32 | 0o644), FileType::Reg);
        assert_eq!(mode_to_type(libc::S_IFLNK as u32), FileType::Lnk);
        assert_eq!(mode_to_type(libc::S_IFCHR as u32), FileType::Chr);
    }
}
