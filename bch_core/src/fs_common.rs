//! Namespace transactions: create, link, unlink, rename, and path
//! reconstruction.
//!
//! Every operation here is a retryable transaction body: callers run it
//! under [`commit_do`](crate::trans::commit_do), and on restart the body is
//! rerun from the top with fresh iterators. The `*_u` out-parameters
//! receive the post-operation inode images for the caller's cache update.

use bitflags::bitflags;

use crate::accounting::update::disk_accounting_mod;
use crate::accounting::DiskAccountingPos;
use crate::bkey::{spos, BkeyI, KeyValue, SubvolInum};
use crate::btree::BtreeId;
use crate::dirent::{
    dirent_create, dirent_lookup_trans, dirent_occupied_size, dirent_rename, empty_dir_trans,
    DirentTarget, RenameMode, DIRENT_HASH_DESC,
};
use crate::errcode::{BchResult, Errcode};
use crate::inode::{
    inode_create, inode_find_by_inum_trans, inode_init_late, inode_nlink_dec, inode_nlink_inc,
    inode_peek, inode_write, is_dir, is_subdir_for_nlink, mode_to_type, reinherit_attrs,
    FileType, InodeUnpacked, INODE_UNLINKED, ROOT_INO,
};
use crate::str_hash::{hash_delete_at, hash_info_init};
use crate::subvolume::{
    subvol_has_children, subvolume_create, subvolume_get, subvolume_get_snapshot,
    subvolume_unlink, ROOT_SUBVOL,
};
use crate::trans::{BtreeIterFlags, BtreeTrans};
use crate::xattr::{set_acl_trans, AclType};

bitflags! {
    pub struct CreateFlags: u32 {
        /// Reuse the source subvolume's root inode instead of allocating.
        const SNAPSHOT = 1 << 0;
        /// Create a new subvolume record.
        const SUBVOL = 1 << 1;
        /// Mark the new subvolume read-only.
        const SNAPSHOT_RO = 1 << 2;
        /// Start unlinked, no dirent.
        const TMPFILE = 1 << 3;
    }
}

#[allow(clippy::too_many_arguments)]
pub fn create_trans(
    trans: &BtreeTrans,
    dir: SubvolInum,
    dir_u: &mut InodeUnpacked,
    new_inode: &mut InodeUnpacked,
    name: Option<&str>,
    uid: u32,
    gid: u32,
    mode: u32,
    rdev: u32,
    default_acl: Option<&[u8]>,
    acl: Option<&[u8]>,
    mut snapshot_src: SubvolInum,
    mut flags: CreateFlags,
) -> BchResult<()> {
    let now = trans.fs.current_time();
    let mut new_inum = dir;
    let mut dir_type = mode_to_type(mode);

    let mut snapshot = subvolume_get_snapshot(trans, dir.subvol)?;

    let (mut dir_iter, dir_read) =
        inode_peek(trans, dir, BtreeIterFlags::INTENT | BtreeIterFlags::WITH_UPDATES)?;
    *dir_u = dir_read;

    let mut inode_iter;
    if !flags.contains(CreateFlags::SNAPSHOT) {
        // normal create path - allocate a new inode
        *new_inode = InodeUnpacked::default();
        inode_init_late(new_inode, now, uid, gid, mode, rdev, Some(dir_u));

        if flags.contains(CreateFlags::TMPFILE) {
            new_inode.bi_flags |= INODE_UNLINKED;
        }

        inode_iter = inode_create(trans, new_inode, snapshot)?;
        snapshot_src = SubvolInum::new(0, 0);
    } else {
        // Creating a snapshot - no new inode, but the root inode of the
        // subvolume being snapshotted is rewritten in the new snapshot.
        if snapshot_src.inum == 0 {
            let s = subvolume_get(trans, snapshot_src.subvol)?;
            snapshot_src.inum = s.root_inode;
        }

        let (it, inode) = inode_peek(trans, snapshot_src, BtreeIterFlags::INTENT)?;
        inode_iter = it;
        *new_inode = inode;

        if new_inode.bi_subvol != snapshot_src.subvol {
            // not a subvolume root
            return Err(Errcode::Inval);
        }

        // snapshotting someone else's subvolume needs root
        if uid != 0 && new_inode.bi_uid != uid {
            return Err(Errcode::Perm);
        }

        flags |= CreateFlags::SUBVOL;
    }

    new_inum.inum = new_inode.bi_inum;
    let mut dir_target = DirentTarget::Inum(new_inode.bi_inum);

    if flags.contains(CreateFlags::SUBVOL) {
        let (new_subvol, new_snapshot) = subvolume_create(
            trans,
            new_inode.bi_inum,
            dir.subvol,
            snapshot_src.subvol,
            flags.contains(CreateFlags::SNAPSHOT_RO),
        )?;

        snapshot = new_snapshot;
        new_inode.bi_parent_subvol = dir.subvol;
        new_inode.bi_subvol = new_subvol;
        new_inum.subvol = new_subvol;
        dir_target = DirentTarget::Subvol(new_subvol);
        dir_type = FileType::Subvol;

        let dir_snapshot = subvolume_get_snapshot(trans, dir.subvol)?;
        dir_iter.set_snapshot(dir_snapshot);
        dir_iter.traverse()?;
    }

    if !flags.contains(CreateFlags::SNAPSHOT) {
        let inode_hash = hash_info_init(new_inode);

        if let Some(d) = default_acl {
            set_acl_trans(trans, new_inum, snapshot, &inode_hash, d, AclType::Default)?;
        }
        if let Some(a) = acl {
            set_acl_trans(trans, new_inum, snapshot, &inode_hash, a, AclType::Access)?;
        }
    }

    if !flags.contains(CreateFlags::TMPFILE) {
        let name = name.ok_or(Errcode::Inval)?;
        let dir_hash = hash_info_init(dir_u);

        if is_subdir_for_nlink(new_inode) {
            dir_u.bi_nlink += 1;
        }
        dir_u.bi_mtime = now;
        dir_u.bi_ctime = now;
        dir_u.bi_size += dirent_occupied_size(name);

        inode_write(trans, &dir_iter, dir_u)?;

        let dir_offset = dirent_create(
            trans,
            dir,
            dir_iter.pos.snapshot,
            &dir_hash,
            dir_type,
            name,
            dir_target,
            true,
        )?;

        new_inode.bi_dir = dir_u.bi_inum;
        new_inode.bi_dir_offset = dir_offset;
    }

    if is_dir(mode) && new_inode.bi_subvol == 0 {
        new_inode.bi_depth = dir_u.bi_depth + 1;
    }

    inode_iter.set_snapshot(snapshot);
    inode_iter.traverse()?;
    inode_write(trans, &inode_iter, new_inode)?;

    disk_accounting_mod(trans, DiskAccountingPos::NrInodes, &[1], false)?;
    Ok(())
}

pub fn link_trans(
    trans: &BtreeTrans,
    dir: SubvolInum,
    dir_u: &mut InodeUnpacked,
    inum: SubvolInum,
    inode_u: &mut InodeUnpacked,
    name: &str,
) -> BchResult<()> {
    let now = trans.fs.current_time();

    if dir.subvol != inum.subvol {
        return Err(Errcode::Xdev);
    }

    let (inode_iter, inode_read) = inode_peek(trans, inum, BtreeIterFlags::INTENT)?;
    *inode_u = inode_read;

    inode_u.bi_ctime = now;
    inode_nlink_inc(inode_u)?;

    let (dir_iter, dir_read) = inode_peek(trans, dir, BtreeIterFlags::INTENT)?;
    *dir_u = dir_read;

    if reinherit_attrs(inode_u, dir_u) {
        return Err(Errcode::Xdev);
    }

    dir_u.bi_mtime = now;
    dir_u.bi_ctime = now;
    dir_u.bi_size += dirent_occupied_size(name);

    let dir_hash = hash_info_init(dir_u);

    let dir_offset = dirent_create(
        trans,
        dir,
        dir_iter.pos.snapshot,
        &dir_hash,
        mode_to_type(inode_u.bi_mode),
        name,
        DirentTarget::Inum(inum.inum),
        true,
    )?;

    inode_u.bi_dir = dir.inum;
    inode_u.bi_dir_offset = dir_offset;

    inode_write(trans, &dir_iter, dir_u)?;
    inode_write(trans, &inode_iter, inode_u)?;
    Ok(())
}

pub fn unlink_trans(
    trans: &BtreeTrans,
    dir: SubvolInum,
    dir_u: &mut InodeUnpacked,
    inode_u: &mut InodeUnpacked,
    name: &str,
    deleting_subvol: bool,
) -> BchResult<()> {
    let now = trans.fs.current_time();

    let (dir_iter, dir_read) = inode_peek(trans, dir, BtreeIterFlags::INTENT)?;
    *dir_u = dir_read;

    let dir_hash = hash_info_init(dir_u);

    let (dirent_pos, dirent_k, inum) = dirent_lookup_trans(trans, dir, &dir_hash, name)?;

    let (inode_iter, inode_read) = inode_peek(trans, inum, BtreeIterFlags::INTENT)?;
    *inode_u = inode_read;

    if !deleting_subvol && inode_u.is_dir() {
        empty_dir_trans(trans, inum)?;
    }

    if deleting_subvol && inode_u.bi_subvol == 0 {
        return Err(Errcode::NoentNotSubvol);
    }

    if inode_u.bi_subvol != 0 {
        // recursive subvolume destroy is not allowed
        subvol_has_children(trans, inode_u.bi_subvol)?;
    }

    let mut delete_pos = dirent_pos;
    let mut exact = false;

    if deleting_subvol || inode_u.bi_subvol != 0 {
        subvolume_unlink(trans, inode_u.bi_subvol)?;

        // Deleting a subvolume: really delete the dirent, don't emit a
        // whiteout in the current snapshot.
        delete_pos = dirent_k.p;
        exact = true;
    } else {
        inode_nlink_dec(inode_u);
    }

    if inode_u.bi_dir == dirent_pos.inode && inode_u.bi_dir_offset == dirent_pos.offset {
        inode_u.bi_dir = 0;
        inode_u.bi_dir_offset = 0;
    }

    dir_u.bi_mtime = now;
    dir_u.bi_ctime = now;
    inode_u.bi_ctime = now;
    dir_u.bi_nlink = dir_u.bi_nlink.saturating_sub(is_subdir_for_nlink(inode_u) as u32);
    dir_u.bi_size = dir_u.bi_size.saturating_sub(dirent_occupied_size(name));

    hash_delete_at(trans, &DIRENT_HASH_DESC, delete_pos, dirent_k.p.snapshot, exact)?;
    inode_write(trans, &dir_iter, dir_u)?;
    inode_write(trans, &inode_iter, inode_u)?;
    Ok(())
}

fn subvol_update_parent(trans: &BtreeTrans, subvol: u32, new_parent: u32) -> BchResult<()> {
    let mut s = subvolume_get(trans, subvol)?;
    s.fs_path_parent = new_parent;
    trans.update(
        BtreeId::Subvolumes,
        BkeyI::new(spos(0, subvol as u64, 0), KeyValue::Subvolume(s)),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn rename_trans(
    trans: &BtreeTrans,
    src_dir: SubvolInum,
    src_dir_u: &mut InodeUnpacked,
    dst_dir: SubvolInum,
    dst_dir_u: &mut InodeUnpacked,
    src_inode_u: &mut InodeUnpacked,
    dst_inode_u: &mut InodeUnpacked,
    src_name: &str,
    dst_name: &str,
    mode: RenameMode,
) -> BchResult<()> {
    let now = trans.fs.current_time();
    let same_dir = dst_dir.inum == src_dir.inum && dst_dir.subvol == src_dir.subvol;

    let (src_dir_iter, src_dir_read) = inode_peek(trans, src_dir, BtreeIterFlags::INTENT)?;
    let mut src_dir_l = src_dir_read;
    let src_hash = hash_info_init(&src_dir_l);

    // When source and destination are the same directory, every dst_dir
    // mutation below must land on the same image.
    let mut dst_dir_l: Option<InodeUnpacked> = None;
    let mut dst_dir_iter = None;
    let dst_hash;
    if !same_dir {
        let (it, v) = inode_peek(trans, dst_dir, BtreeIterFlags::INTENT)?;
        dst_hash = hash_info_init(&v);
        dst_dir_l = Some(v);
        dst_dir_iter = Some(it);
    } else {
        dst_hash = src_hash;
    }

    fn dstd<'a>(
        src: &'a mut InodeUnpacked,
        dst: &'a mut Option<InodeUnpacked>,
    ) -> &'a mut InodeUnpacked {
        dst.as_mut().unwrap_or(src)
    }

    let (src_inum, src_offset, dst_inum, dst_offset) = dirent_rename(
        trans, src_dir, &src_hash, dst_dir, &dst_hash, src_name, dst_name, mode,
    )?;

    let (src_inode_iter, src_inode_read) = inode_peek(trans, src_inum, BtreeIterFlags::INTENT)?;
    *src_inode_u = src_inode_read;

    let mut dst_inode_iter = None;
    if let Some(dst_inum) = dst_inum {
        let (it, v) = inode_peek(trans, dst_inum, BtreeIterFlags::INTENT)?;
        *dst_inode_u = v;
        dst_inode_iter = Some(it);
    }

    if src_inode_u.bi_subvol != 0 && dst_dir.subvol != src_inode_u.bi_parent_subvol {
        subvol_update_parent(trans, src_inode_u.bi_subvol, dst_dir.subvol)?;
    }

    if mode == RenameMode::Exchange
        && dst_inode_u.bi_subvol != 0
        && src_dir.subvol != dst_inode_u.bi_parent_subvol
    {
        subvol_update_parent(trans, dst_inode_u.bi_subvol, src_dir.subvol)?;
    }

    // can't move across subvolumes, unless it's a subvolume root
    if src_dir.subvol != dst_dir.subvol
        && (src_inode_u.bi_subvol == 0
            || (dst_inum.is_some() && dst_inode_u.bi_subvol == 0))
    {
        return Err(Errcode::Xdev);
    }

    if mode == RenameMode::Rename {
        src_dir_l.bi_size = src_dir_l.bi_size.saturating_sub(dirent_occupied_size(src_name));
        dstd(&mut src_dir_l, &mut dst_dir_l).bi_size += dirent_occupied_size(dst_name);
    }

    if mode == RenameMode::Overwrite {
        src_dir_l.bi_size = src_dir_l.bi_size.saturating_sub(dirent_occupied_size(src_name));
    }

    if src_inode_u.bi_parent_subvol != 0 {
        src_inode_u.bi_parent_subvol = dst_dir.subvol;
    }

    if mode == RenameMode::Exchange && dst_inode_u.bi_parent_subvol != 0 {
        dst_inode_u.bi_parent_subvol = src_dir.subvol;
    }

    src_inode_u.bi_dir = dstd(&mut src_dir_l, &mut dst_dir_l).bi_inum;
    src_inode_u.bi_dir_offset = dst_offset;

    if mode == RenameMode::Exchange {
        dst_inode_u.bi_dir = src_dir_l.bi_inum;
        dst_inode_u.bi_dir_offset = src_offset;
    }

    if mode == RenameMode::Overwrite
        && dst_inode_u.bi_dir == dstd(&mut src_dir_l, &mut dst_dir_l).bi_inum
        && dst_inode_u.bi_dir_offset == src_offset
    {
        dst_inode_u.bi_dir = 0;
        dst_inode_u.bi_dir_offset = 0;
    }

    if mode == RenameMode::Overwrite {
        if src_inode_u.is_dir() != dst_inode_u.is_dir() {
            return Err(Errcode::NotDir);
        }
        if dst_inode_u.is_dir() {
            empty_dir_trans(trans, dst_inum.unwrap())?;
        }
    }

    if reinherit_attrs(src_inode_u, dstd(&mut src_dir_l, &mut dst_dir_l)) && src_inode_u.is_dir()
    {
        return Err(Errcode::Xdev);
    }

    if mode == RenameMode::Exchange
        && reinherit_attrs(dst_inode_u, &src_dir_l)
        && dst_inode_u.is_dir()
    {
        return Err(Errcode::Xdev);
    }

    if is_subdir_for_nlink(src_inode_u) {
        src_dir_l.bi_nlink = src_dir_l.bi_nlink.saturating_sub(1);
        dstd(&mut src_dir_l, &mut dst_dir_l).bi_nlink += 1;
    }

    if src_inode_u.is_dir() && src_inode_u.bi_subvol == 0 {
        src_inode_u.bi_depth = dstd(&mut src_dir_l, &mut dst_dir_l).bi_depth + 1;
    }

    if mode == RenameMode::Exchange && dst_inode_u.is_dir() && dst_inode_u.bi_subvol == 0 {
        dst_inode_u.bi_depth = src_dir_l.bi_depth + 1;
    }

    if dst_inum.is_some() && is_subdir_for_nlink(dst_inode_u) {
        let d = dstd(&mut src_dir_l, &mut dst_dir_l);
        d.bi_nlink = d.bi_nlink.saturating_sub(1);
        if mode == RenameMode::Exchange {
            src_dir_l.bi_nlink += 1;
        }
    }

    if mode == RenameMode::Overwrite {
        inode_nlink_dec(dst_inode_u);
    }

    src_dir_l.bi_mtime = now;
    src_dir_l.bi_ctime = now;

    if src_dir.inum != dst_dir.inum {
        let d = dstd(&mut src_dir_l, &mut dst_dir_l);
        d.bi_mtime = now;
        d.bi_ctime = now;
    }

    src_inode_u.bi_ctime = now;
    if dst_inum.is_some() {
        dst_inode_u.bi_ctime = now;
    }

    inode_write(trans, &src_dir_iter, &src_dir_l)?;
    if let (Some(it), Some(d)) = (&dst_dir_iter, &dst_dir_l) {
        inode_write(trans, it, d)?;
    }
    inode_write(trans, &src_inode_iter, src_inode_u)?;
    if let Some(it) = &dst_inode_iter {
        inode_write(trans, it, dst_inode_u)?;
    }

    *src_dir_u = src_dir_l.clone();
    *dst_dir_u = dst_dir_l.unwrap_or(src_dir_l);
    Ok(())
}

/// Resolve `(subvol, inum)` to an absolute path by walking back-pointers.
///
/// Components are emitted byte-reversed as the walk climbs, and the whole
/// buffer is reversed once at the end. A broken back-pointer or unreadable
/// dirent terminates the walk with a `(disconnected)` marker.
pub fn inum_to_path(trans: &BtreeTrans, mut inum: SubvolInum) -> BchResult<String> {
    let mut buf: Vec<u8> = Vec::new();
    let mut disconnected = false;

    while !(inum.subvol == ROOT_SUBVOL && inum.inum == ROOT_INO) {
        let step = (|| -> BchResult<String> {
            let inode = inode_find_by_inum_trans(trans, inum)?;

            if inode.bi_dir == 0 && inode.bi_dir_offset == 0 {
                return Err(Errcode::NoentInodeNoBackpointer);
            }

            inum.subvol = if inode.bi_parent_subvol != 0 {
                inode.bi_parent_subvol
            } else {
                inum.subvol
            };
            inum.inum = inode.bi_dir;

            let snapshot = subvolume_get_snapshot(trans, inum.subvol)?;
            let snapshots = trans.fs.snapshots.read();
            match trans.fs.btree.lookup_visible(
                BtreeId::Dirents,
                spos(inode.bi_dir, inode.bi_dir_offset, snapshot),
                &snapshots,
            ) {
                Some(BkeyI { v: KeyValue::Dirent(d), .. }) => Ok(d.name),
                _ => Err(Errcode::Noent),
            }
        })();

        match step {
            Ok(name) => {
                buf.extend(name.bytes().rev());
                buf.push(b'/');
            }
            Err(e) if e.matches(Errcode::TransactionRestart) => return Err(e),
            Err(_) => {
                disconnected = true;
                break;
            }
        }
    }

    if disconnected {
        buf.extend("(disconnected)".bytes().rev());
    }
    if buf.is_empty() {
        buf.push(b'/');
    }
    buf.reverse();

    String::from_utf8(buf).map_err(|_| Errcode::Inval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::bkey::spos;
    use crate::fs::tests::test_fs;
    use crate::fs::Fs;
    use crate::inode::WHITEOUT_DEV;
    use crate::trans::{commit_do, lockrestart_do};
    use crate::vfs::{self, CachedInode, RenameFlags};

    const DIR: u32 = libc::S_IFDIR as u32;
    const REG: u32 = libc::S_IFREG as u32;

    fn root(fs: &Fs) -> Arc<CachedInode> {
        vfs::vfs_inode_get(fs, SubvolInum::new(ROOT_SUBVOL, ROOT_INO)).unwrap()
    }

    fn mkdir(fs: &Fs, dir: &Arc<CachedInode>, name: &str) -> Arc<CachedInode> {
        vfs::create(fs, dir, Some(name), 0, 0, DIR | 0o755, 0,
                    SubvolInum::new(0, 0), CreateFlags::empty()).unwrap()
    }

    fn touch(fs: &Fs, dir: &Arc<CachedInode>, name: &str) -> Arc<CachedInode> {
        vfs::create(fs, dir, Some(name), 0, 0, REG | 0o644, 0,
                    SubvolInum::new(0, 0), CreateFlags::empty()).unwrap()
    }

    fn mksubvol(fs: &Fs, dir: &Arc<CachedInode>, name: &str) -> Arc<CachedInode> {
        vfs::create(fs, dir, Some(name), 0, 0, DIR | 0o755, 0,
                    SubvolInum::new(0, 0), CreateFlags::SUBVOL).unwrap()
    }

    fn on_disk(fs: &Fs, inum: SubvolInum) -> InodeUnpacked {
        let trans = BtreeTrans::new(fs);
        lockrestart_do(&trans, |t| inode_find_by_inum_trans(t, inum)).unwrap()
    }

    #[test]
    fn create_wires_up_backpointer_and_nlink() {
        let fs = test_fs();
        let r = root(&fs);

        let d = mkdir(&fs, &r, "dir");
        let f = touch(&fs, &d, "file");

        let d_disk = on_disk(&fs, d.inum);
        assert_eq!(d_disk.nlink_get(), 2);
        assert_eq!(d_disk.bi_depth, 1);
        assert_eq!(on_disk(&fs, r.inum).nlink_get(), 3);

        // the dirent at the file's back-pointer resolves to the file
        let f_disk = on_disk(&fs, f.inum);
        assert_eq!(f_disk.bi_dir, d.inum.inum);
        let snapshots = fs.snapshots.read();
        let k = fs
            .btree
            .lookup_visible(
                BtreeId::Dirents,
                spos(f_disk.bi_dir, f_disk.bi_dir_offset, d.snapshot),
                &snapshots,
            )
            .unwrap();
        match k.v {
            KeyValue::Dirent(de) => {
                assert_eq!(de.name, "file");
                assert_eq!(de.target, DirentTarget::Inum(f.inum.inum));
            }
            v => panic!("not a dirent: {:?}", v),
        }
    }

    #[test]
    fn link_and_unlink_roundtrip() {
        let fs = test_fs();
        let r = root(&fs);
        let f = touch(&fs, &r, "a");

        vfs::link(&fs, &r, &f, "b").unwrap();
        assert_eq!(on_disk(&fs, f.inum).nlink_get(), 2);

        vfs::unlink(&fs, &r, "a", false).unwrap();
        let disk = on_disk(&fs, f.inum);
        assert_eq!(disk.nlink_get(), 1);
        // "a" held the back-pointer; unlink cleared it
        assert_eq!(disk.bi_dir, 0);

        assert!(vfs::resolve_path(&fs, "/a").is_err());
        assert!(vfs::resolve_path(&fs, "/b").is_ok());
    }

    #[test]
    fn cross_subvolume_link_is_rejected_without_mutation() {
        let fs = test_fs();
        let r = root(&fs);
        let sv = mksubvol(&fs, &r, "sv");
        let f = touch(&fs, &r, "file");

        let size_before = on_disk(&fs, sv.inum).bi_size;
        assert_eq!(vfs::link(&fs, &sv, &f, "alias"), Err(Errcode::Xdev));

        assert_eq!(on_disk(&fs, sv.inum).bi_size, size_before);
        assert_eq!(on_disk(&fs, f.inum).nlink_get(), 1);
    }

    #[test]
    fn rmdir_requires_empty() {
        let fs = test_fs();
        let r = root(&fs);
        let d = mkdir(&fs, &r, "d");
        touch(&fs, &d, "f");

        assert_eq!(vfs::unlink(&fs, &r, "d", false), Err(Errcode::NotEmpty));

        vfs::unlink(&fs, &d, "f", false).unwrap();
        vfs::unlink(&fs, &r, "d", false).unwrap();
        assert_eq!(on_disk(&fs, r.inum).nlink_get(), 2);
    }

    #[test]
    fn rename_moves_backpointer_and_dir_sizes() {
        let fs = test_fs();
        let r = root(&fs);
        let d1 = mkdir(&fs, &r, "d1");
        let d2 = mkdir(&fs, &r, "d2");
        let f = touch(&fs, &d1, "f");

        let d1_size = on_disk(&fs, d1.inum).bi_size;
        let d2_size = on_disk(&fs, d2.inum).bi_size;

        vfs::rename(&fs, &d1, &d2, "f", "g", RenameFlags::empty()).unwrap();

        let f_disk = on_disk(&fs, f.inum);
        assert_eq!(f_disk.bi_dir, d2.inum.inum);
        assert_eq!(vfs::path_of(&fs, f.inum).unwrap(), "/d2/g");

        assert_eq!(
            on_disk(&fs, d1.inum).bi_size,
            d1_size - dirent_occupied_size("f")
        );
        assert_eq!(
            on_disk(&fs, d2.inum).bi_size,
            d2_size + dirent_occupied_size("g")
        );
    }

    #[test]
    fn rename_subdir_moves_nlink_and_depth() {
        let fs = test_fs();
        let r = root(&fs);
        let d1 = mkdir(&fs, &r, "d1");
        let d2 = mkdir(&fs, &r, "d2");
        let sub = mkdir(&fs, &d1, "sub");
        let deep = mkdir(&fs, &sub, "deep");

        vfs::rename(&fs, &d1, &d2, "sub", "sub", RenameFlags::empty()).unwrap();

        assert_eq!(on_disk(&fs, d1.inum).nlink_get(), 2);
        assert_eq!(on_disk(&fs, d2.inum).nlink_get(), 3);
        assert_eq!(on_disk(&fs, sub.inum).bi_depth, 2);
        // directory nlink == 2 + subdirectories
        assert_eq!(on_disk(&fs, sub.inum).nlink_get(), 3);
        assert_eq!(on_disk(&fs, deep.inum).bi_depth, 3);
    }

    #[test]
    fn rename_noreplace_and_overwrite() {
        let fs = test_fs();
        let r = root(&fs);
        let a = touch(&fs, &r, "a");
        let b = touch(&fs, &r, "b");

        assert_eq!(
            vfs::rename(&fs, &r, &r, "a", "b", RenameFlags::NOREPLACE),
            Err(Errcode::Exist)
        );

        vfs::rename(&fs, &r, &r, "a", "b", RenameFlags::empty()).unwrap();
        assert!(vfs::resolve_path(&fs, "/a").is_err());
        assert_eq!(vfs::resolve_path(&fs, "/b").unwrap().inum, a.inum);
        assert_eq!(on_disk(&fs, b.inum).nlink_get(), 0);
    }

    #[test]
    fn rename_overwrite_requires_matching_kind() {
        let fs = test_fs();
        let r = root(&fs);
        touch(&fs, &r, "f");
        mkdir(&fs, &r, "d");

        assert_eq!(
            vfs::rename(&fs, &r, &r, "f", "d", RenameFlags::empty()),
            Err(Errcode::NotDir)
        );
    }

    #[test]
    fn exchange_of_subvolume_roots_swaps_parents() {
        let fs = test_fs();
        let r = root(&fs);
        let sva = mksubvol(&fs, &r, "sva");
        let svb = mksubvol(&fs, &r, "svb");

        // nested subvolumes, one in each
        let a = mksubvol(&fs, &sva, "suba");
        let b = mksubvol(&fs, &svb, "subb");
        assert_eq!(on_disk(&fs, a.inum).bi_parent_subvol, sva.inum.subvol);

        vfs::rename(&fs, &sva, &svb, "suba", "subb", RenameFlags::EXCHANGE).unwrap();

        let a_disk = on_disk(&fs, a.inum);
        let b_disk = on_disk(&fs, b.inum);
        assert_eq!(a_disk.bi_parent_subvol, svb.inum.subvol);
        assert_eq!(b_disk.bi_parent_subvol, sva.inum.subvol);

        // subvolume records agree with the inode parent pointers
        let trans = BtreeTrans::new(&fs);
        let a_sv = lockrestart_do(&trans, |t| subvolume_get(t, a.inum.subvol)).unwrap();
        let b_sv = lockrestart_do(&trans, |t| subvolume_get(t, b.inum.subvol)).unwrap();
        assert_eq!(a_sv.fs_path_parent, svb.inum.subvol);
        assert_eq!(b_sv.fs_path_parent, sva.inum.subvol);

        // back-pointers swapped: each resolves through the other directory
        assert_eq!(vfs::path_of(&fs, a.inum).unwrap(), "/svb/subb");
        assert_eq!(vfs::path_of(&fs, b.inum).unwrap(), "/sva/suba");

        // same-length names: net-zero size change
        assert_eq!(
            on_disk(&fs, sva.inum).bi_size,
            on_disk(&fs, svb.inum).bi_size
        );
    }

    #[test]
    fn cross_subvolume_rename_of_plain_file_is_rejected() {
        let fs = test_fs();
        let r = root(&fs);
        let sv = mksubvol(&fs, &r, "sv");
        touch(&fs, &r, "f");

        assert_eq!(
            vfs::rename(&fs, &r, &sv, "f", "f", RenameFlags::empty()),
            Err(Errcode::Xdev)
        );
    }

    #[test]
    fn unlink_in_snapshot_leaves_whiteout() {
        let fs = test_fs();
        let r = root(&fs);
        let sv = mksubvol(&fs, &r, "sv");
        let f = touch(&fs, &sv, "f");

        // snapshot the subvolume, then delete the file in the source
        vfs::create(
            &fs, &r, Some("snap"), 0, 0, DIR | 0o755, 0,
            SubvolInum::new(sv.inum.subvol, 0),
            CreateFlags::SNAPSHOT,
        )
        .unwrap();

        let f_disk_before = on_disk(&fs, f.inum);
        vfs::unlink(&fs, &sv, "f", false).unwrap();

        // the snapshot still sees the file
        assert!(vfs::resolve_path(&fs, "/snap/f").is_ok());
        assert!(vfs::resolve_path(&fs, "/sv/f").is_err());

        // the deletion is a whiteout at the source's snapshot, shadowing the
        // dirent both sides inherited
        let trans = BtreeTrans::new(&fs);
        let src_snapshot =
            lockrestart_do(&trans, |t| subvolume_get_snapshot(t, sv.inum.subvol)).unwrap();
        let wh = fs
            .btree
            .get_exact(
                BtreeId::Dirents,
                spos(f_disk_before.bi_dir, f_disk_before.bi_dir_offset, src_snapshot),
            )
            .unwrap();
        assert_eq!(wh.v, KeyValue::Whiteout);

        // nlink dropped and the back-pointer was cleared in the source
        let src_snapshots = fs.snapshots.read();
        let f_now = fs
            .btree
            .lookup_visible(
                BtreeId::Inodes,
                spos(0, f.inum.inum, src_snapshot),
                &src_snapshots,
            )
            .unwrap();
        match f_now.v {
            KeyValue::Inode(i) => {
                assert_eq!(i.nlink_get(), 0);
                assert_eq!(i.bi_dir, 0);
            }
            v => panic!("not an inode: {:?}", v),
        }
    }

    #[test]
    fn deleting_subvol_really_removes_the_dirent() {
        let fs = test_fs();
        let r = root(&fs);
        let sv = mksubvol(&fs, &r, "sv");

        let sv_root_disk = on_disk(&fs, sv.inum);
        let dirent_pos = spos(sv_root_disk.bi_dir, sv_root_disk.bi_dir_offset, r.snapshot);

        let deleted = vfs::unlink(&fs, &r, "sv", true).unwrap();
        assert_eq!(deleted, Some(sv.inum));

        // really gone, not whiteout-shadowed
        assert!(fs.btree.get_exact(BtreeId::Dirents, dirent_pos).is_none());

        let trans = BtreeTrans::new(&fs);
        assert_eq!(
            lockrestart_do(&trans, |t| subvolume_get(t, sv.inum.subvol)),
            Err(Errcode::Noent)
        );
    }

    #[test]
    fn unlink_deleting_subvol_on_plain_dir_fails() {
        let fs = test_fs();
        let r = root(&fs);
        mkdir(&fs, &r, "d");

        assert_eq!(
            vfs::unlink(&fs, &r, "d", true),
            Err(Errcode::NoentNotSubvol)
        );
    }

    #[test]
    fn rename_survives_injected_restart() {
        let fs = test_fs();
        let r = root(&fs);
        let d1 = mkdir(&fs, &r, "d1");
        let d2 = mkdir(&fs, &r, "d2");
        let f = touch(&fs, &d1, "f");
        let d1_size = on_disk(&fs, d1.inum).bi_size;
        let d2_size = on_disk(&fs, d2.inum).bi_size;

        fs.inject_restart_after(1);
        vfs::rename(&fs, &d1, &d2, "f", "f", RenameFlags::empty()).unwrap();

        // applied exactly once, no torn state
        assert_eq!(vfs::path_of(&fs, f.inum).unwrap(), "/d2/f");
        assert_eq!(
            on_disk(&fs, d1.inum).bi_size,
            d1_size - dirent_occupied_size("f")
        );
        assert_eq!(
            on_disk(&fs, d2.inum).bi_size,
            d2_size + dirent_occupied_size("f")
        );
    }

    #[test]
    fn tmpfile_is_unlinked_and_reaped_on_put() {
        let fs = test_fs();
        let r = root(&fs);

        let tmp = vfs::create(
            &fs, &r, None, 0, 0, REG | 0o600, 0,
            SubvolInum::new(0, 0), CreateFlags::TMPFILE,
        )
        .unwrap();

        assert_eq!(tmp.inode().nlink_get(), 0);
        let inum = tmp.inum;

        let nr_before = fs.usage.read().nr_inodes;
        vfs::inode_put(&fs, tmp).unwrap();
        assert_eq!(fs.usage.read().nr_inodes, nr_before - 1);

        let trans = BtreeTrans::new(&fs);
        assert!(lockrestart_do(&trans, |t| inode_find_by_inum_trans(t, inum)).is_err());
    }

    #[test]
    fn path_walk_reports_disconnected_inodes() {
        let fs = test_fs();
        let r = root(&fs);
        let f = touch(&fs, &r, "f");

        // sever the back-pointer
        let trans = BtreeTrans::new(&fs);
        commit_do(&trans, |t| {
            let (iter, mut bi) = inode_peek(t, f.inum, BtreeIterFlags::INTENT)?;
            bi.bi_dir = 0;
            bi.bi_dir_offset = 0;
            inode_write(t, &iter, &bi)
        })
        .unwrap();

        let p = vfs::path_of(&fs, f.inum).unwrap();
        assert_eq!(p, "(disconnected)");
        assert_eq!(vfs::path_of(&fs, r.inum).unwrap(), "/");
    }

    #[test]
    fn whiteout_rename_leaves_char_dev_entry() {
        let fs = test_fs();
        let r = root(&fs);
        let d = mkdir(&fs, &r, "d");
        touch(&fs, &d, "f");

        vfs::rename(&fs, &d, &r, "f", "moved", RenameFlags::WHITEOUT).unwrap();

        assert!(vfs::resolve_path(&fs, "/moved").is_ok());
        let wh = vfs::resolve_path(&fs, "/d/f").unwrap();
        let wh_disk = on_disk(&fs, wh.inum);
        assert_eq!(mode_to_type(wh_disk.bi_mode), FileType::Chr);
        assert_eq!(wh_disk.bi_dev, WHITEOUT_DEV);
    }

    #[test]
    fn namespace_workload_keeps_accounting_clean() {
        let fs = test_fs();
        let r = root(&fs);
        let d = mkdir(&fs, &r, "d");
        for i in 0..10 {
            touch(&fs, &d, &format!("f{}", i));
        }
        vfs::unlink(&fs, &d, "f3", false).unwrap();
        vfs::rename(&fs, &d, &r, "f5", "top", RenameFlags::empty()).unwrap();

        // 1 root + 2 dirs-and-files worth of inodes: root, d, 10 files
        assert_eq!(fs.usage.read().nr_inodes, 12);
        assert!(fs.verify_accounting_clean());
    }
}
