//! The cached-inode table and the operations binding namespace transactions
//! to it.
//!
//! Cached inodes are hashed by (subvol, inum) only after full
//! initialization. A lookup that lands on an entry being torn down waits on
//! the entry's condition (dropping transaction locks first); an insert that
//! loses a race returns the winner and quietly discards the loser.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::accounting::update::disk_accounting_mod;
use crate::accounting::DiskAccountingPos;
use crate::bkey::{BkeyI, KeyValue, SubvolInum};
use crate::btree::BtreeId;
use crate::dirent::dirent_lookup_trans;
use crate::errcode::{BchResult, Errcode};
use crate::fs::Fs;
use crate::inode::{inode_find_by_inum_trans, inode_peek, inode_write, InodeUnpacked};
use crate::str_hash::HashInfo;
use crate::subvolume::{subvolume_get, subvolume_get_snapshot, Subvolume};
use crate::trans::{commit_do, lockrestart_do, BtreeIterFlags, BtreeTrans};

pub struct CachedInode {
    pub inum: SubvolInum,
    /// The subvolume's snapshot when this inode was initialized; used for
    /// snapshot-scoped eviction.
    pub snapshot: u32,
    /// Guarded copy of the on-disk inode.
    pub ei_inode: Mutex<InodeUnpacked>,
    /// Serializes operations updating this inode's on-disk image.
    pub ei_update_lock: Mutex<()>,
    state: Mutex<CacheState>,
    cond: Condvar,
}

#[derive(Default)]
struct CacheState {
    hashed: bool,
    freeing: bool,
}

impl CachedInode {
    fn new(inum: SubvolInum, snapshot: u32, bi: InodeUnpacked) -> Arc<Self> {
        Arc::new(CachedInode {
            inum,
            snapshot,
            ei_inode: Mutex::new(bi),
            ei_update_lock: Mutex::new(()),
            state: Mutex::new(CacheState::default()),
            cond: Condvar::new(),
        })
    }

    pub fn inode(&self) -> InodeUnpacked {
        self.ei_inode.lock().clone()
    }
}

pub struct InodeCache {
    table: Mutex<HashMap<SubvolInum, Arc<CachedInode>>>,
}

impl InodeCache {
    pub fn new() -> Self {
        InodeCache { table: Mutex::new(HashMap::new()) }
    }

    /// Look up a cached inode. An entry being freed is waited out: held
    /// transaction locks are dropped first, and after the wake the caller's
    /// iterators are stale — hence the relock that can restart.
    pub fn find(
        &self,
        trans: Option<&BtreeTrans>,
        inum: SubvolInum,
    ) -> BchResult<Option<Arc<CachedInode>>> {
        loop {
            let Some(e) = self.table.lock().get(&inum).cloned() else {
                return Ok(None);
            };

            let mut st = e.state.lock();
            if !st.hashed {
                return Ok(None);
            }
            if st.freeing {
                if let Some(t) = trans {
                    t.unlock();
                    e.cond.wait(&mut st);
                    drop(st);
                    t.relock()?;
                } else {
                    e.cond.wait(&mut st);
                    drop(st);
                }
                continue;
            }

            drop(st);
            return Ok(Some(e));
        }
    }

    /// Insert a fully-initialized inode. If another thread won the race, the
    /// existing entry is returned and the loser is discarded — without
    /// running any teardown that could delete it on disk (tmpfiles start
    /// with nlink 0).
    pub fn insert(&self, inode: Arc<CachedInode>) -> Arc<CachedInode> {
        inode.state.lock().hashed = true;

        loop {
            let mut table = self.table.lock();
            match table.entry(inode.inum) {
                Entry::Vacant(v) => {
                    v.insert(inode.clone());
                    return inode;
                }
                Entry::Occupied(o) => {
                    let old = o.get().clone();
                    drop(table);

                    let mut st = old.state.lock();
                    if !st.hashed {
                        // raced with a remove; retry the insert
                        continue;
                    }
                    if st.freeing {
                        old.cond.wait(&mut st);
                        continue;
                    }
                    drop(st);

                    inode.state.lock().hashed = false;
                    return old;
                }
            }
        }
    }

    /// Unhash; idempotent via the one-shot hashed flag.
    pub fn remove(&self, inode: &Arc<CachedInode>) {
        let was_hashed = {
            let mut st = inode.state.lock();
            std::mem::replace(&mut st.hashed, false)
        };
        if was_hashed {
            self.table.lock().remove(&inode.inum);
        }
    }

    fn start_freeing(&self, inode: &Arc<CachedInode>) {
        inode.state.lock().freeing = true;
    }

    fn finish_freeing(&self, inode: &Arc<CachedInode>) {
        self.remove(inode);
        let mut st = inode.state.lock();
        st.freeing = false;
        inode.cond.notify_all();
    }
}

impl Default for InodeCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a cached inode and hash it, resolving insert races.
pub fn inode_hash_init_insert(
    fs: &Fs,
    inum: SubvolInum,
    bi: &InodeUnpacked,
    subvol: &Subvolume,
) -> Arc<CachedInode> {
    let inode = CachedInode::new(inum, subvol.snapshot, bi.clone());
    let winner = fs.inode_cache.insert(inode.clone());

    if Arc::ptr_eq(&winner, &inode) {
        fs.vfs_inodes.lock().push(inode.clone());
    }
    winner
}

/// Get the cached inode for `inum`, loading from the trees on a miss.
pub fn vfs_inode_get(fs: &Fs, inum: SubvolInum) -> BchResult<Arc<CachedInode>> {
    if let Some(inode) = fs.inode_cache.find(None, inum)? {
        return Ok(inode);
    }

    let trans = BtreeTrans::new(fs);
    let (subvol, bi) = lockrestart_do(&trans, |t| {
        let subvol = subvolume_get(t, inum.subvol)?;
        let bi = inode_find_by_inum_trans(t, inum)?;
        Ok((subvol, bi))
    })?;

    Ok(inode_hash_init_insert(fs, inum, &bi, &subvol))
}

/// Inodes that must point back at their dirent: directories, subvolume
/// roots, and single-linked files.
fn inode_should_have_bp(bi: &InodeUnpacked) -> bool {
    bi.is_dir() || bi.bi_subvol != 0 || bi.bi_nlink == 0
}

/// Dirent lookup with cache integration and back-pointer verification.
pub fn lookup_trans(
    trans: &BtreeTrans,
    dir: SubvolInum,
    dir_hash: &HashInfo,
    name: &str,
) -> BchResult<Arc<CachedInode>> {
    let fs = trans.fs;
    let (_pos, dirent_k, inum) = dirent_lookup_trans(trans, dir, dir_hash, name)?;

    if let Some(inode) = fs.inode_cache.find(Some(trans), inum)? {
        return Ok(inode);
    }

    let subvol = subvolume_get(trans, inum.subvol)?;
    let bi = match inode_find_by_inum_trans(trans, inum) {
        Ok(bi) => bi,
        Err(e) if e.matches(Errcode::Noent) => {
            fs.inconsistent(&format!("dirent to missing inode {:?}", inum));
            return Err(Errcode::NoentDirentToMissingInode);
        }
        Err(e) => return Err(e),
    };

    // regular files may have hardlinks, which don't all point back
    if inode_should_have_bp(&bi)
        && !(bi.bi_dir == dirent_k.p.inode && bi.bi_dir_offset == dirent_k.p.offset)
    {
        fs.inconsistent(&format!(
            "dirent points to inode that does not point back: {:?} -> {:?}",
            dirent_k.p, inum
        ));
        return Err(Errcode::NoentDirentToMissingBackpointer);
    }

    Ok(inode_hash_init_insert(fs, inum, &bi, &subvol))
}

/// Propagate a just-committed inode image into the cache.
pub fn inode_update_after_write(inode: &Arc<CachedInode>, bi: &InodeUnpacked) {
    *inode.ei_inode.lock() = bi.clone();
}

/// Update an inode's on-disk image through `set`, retrying on restart, and
/// propagate the result into the cache.
pub fn write_inode<F>(fs: &Fs, inode: &Arc<CachedInode>, set: F) -> BchResult<()>
where
    F: Fn(&BtreeTrans, &mut InodeUnpacked) -> BchResult<()>,
{
    let _guard = inode.ei_update_lock.lock();

    let trans = BtreeTrans::new(fs);
    let ret = commit_do(&trans, |t| {
        let (iter, mut bi) = inode_peek(t, inode.inum, BtreeIterFlags::INTENT)?;
        set(t, &mut bi)?;
        inode_write(t, &iter, &bi)?;
        Ok(bi)
    });

    match ret {
        Ok(bi) => {
            inode_update_after_write(inode, &bi);
            Ok(())
        }
        Err(e) if e.matches(Errcode::Noent) => {
            fs.inconsistent(&format!("inode {:?} not found when updating", inode.inum));
            Err(Errcode::Io)
        }
        Err(e) => Err(e),
    }
}

/// Remove an inode from the trees (tmpfile teardown, last unlink).
fn inode_rm(fs: &Fs, inum: SubvolInum) -> BchResult<()> {
    let trans = BtreeTrans::new(fs);
    commit_do(&trans, |t| {
        let snapshot = subvolume_get_snapshot(t, inum.subvol)?;
        let pos = crate::bkey::spos(0, inum.inum, snapshot);

        let k = {
            let snapshots = t.fs.snapshots.read();
            t.fs.btree.lookup_visible(BtreeId::Inodes, pos, &snapshots)
        }
        .ok_or(Errcode::Noent)?;

        let shadowed = {
            let snapshots = t.fs.snapshots.read();
            k.p.snapshot != snapshot
                || t.fs.btree.key_in_ancestor_snapshot(BtreeId::Inodes, pos, &snapshots)
        };

        let v = if shadowed { KeyValue::Whiteout } else { KeyValue::Deleted };
        t.update(BtreeId::Inodes, BkeyI::new(pos, v))?;
        disk_accounting_mod(t, DiskAccountingPos::NrInodes, &[-1], false)?;
        Ok(())
    })
}

/// Drop a reference to a cached inode. When the inode is unlinked and this
/// was the last user, it is torn down: concurrent finds wait on the freeing
/// state, the on-disk inode is removed, then the entry is unhashed and
/// waiters wake to reload.
pub fn inode_put(fs: &Fs, inode: Arc<CachedInode>) -> BchResult<()> {
    let unlinked = inode.ei_inode.lock().nlink_get() == 0;
    if !unlinked {
        return Ok(());
    }

    fs.inode_cache.start_freeing(&inode);
    let ret = inode_rm(fs, inode.inum);
    fs.inode_cache.finish_freeing(&inode);

    fs.vfs_inodes.lock().retain(|i| !Arc::ptr_eq(i, &inode));
    ret
}

/// Evict a cached inode without deleting anything: unhash first, then drop.
pub fn evict_inode(fs: &Fs, inode: &Arc<CachedInode>) {
    fs.inode_cache.remove(inode);
    fs.vfs_inodes.lock().retain(|i| !Arc::ptr_eq(i, inode));
}

// ---- namespace operation drivers ----
//
// These wrap the transactional bodies in fs_common with the cache locking
// and post-commit cache updates, and are what an adapter layer (or the
// management tool) calls.

use crate::dirent::RenameMode;
use crate::fs_common::{
    create_trans, inum_to_path, link_trans, rename_trans, unlink_trans, CreateFlags,
};
use crate::inode::{mode_to_type, FileType, WHITEOUT_DEV};
use crate::str_hash::hash_info_init;
use crate::subvolume::subvol_is_ro_trans;

bitflags::bitflags! {
    pub struct RenameFlags: u32 {
        const NOREPLACE = 1 << 0;
        const EXCHANGE = 1 << 1;
        /// Leave a char-device whiteout at the source.
        const WHITEOUT = 1 << 2;
    }
}

/// Create a file/directory/special inode (or subvolume/snapshot) in `dir`.
#[allow(clippy::too_many_arguments)]
pub fn create(
    fs: &Fs,
    dir: &Arc<CachedInode>,
    name: Option<&str>,
    uid: u32,
    gid: u32,
    mode: u32,
    rdev: u32,
    snapshot_src: SubvolInum,
    flags: CreateFlags,
) -> BchResult<Arc<CachedInode>> {
    fs.check_rw()?;

    let tmpfile = flags.contains(CreateFlags::TMPFILE);
    let _dir_guard = if !tmpfile {
        Some(dir.ei_update_lock.lock())
    } else {
        None
    };

    let mut dir_u = InodeUnpacked::default();
    let mut inode_u = InodeUnpacked::default();

    let trans = BtreeTrans::new(fs);
    let inum = commit_do(&trans, |t| {
        subvol_is_ro_trans(t, dir.inum.subvol)?;
        create_trans(
            t,
            dir.inum,
            &mut dir_u,
            &mut inode_u,
            name,
            uid,
            gid,
            mode,
            rdev,
            None,
            None,
            snapshot_src,
            flags,
        )?;
        let subvol = if inode_u.bi_subvol != 0 {
            inode_u.bi_subvol
        } else {
            dir.inum.subvol
        };
        Ok(SubvolInum::new(subvol, inode_u.bi_inum))
    })?;

    if !tmpfile {
        inode_update_after_write(dir, &dir_u);
    }

    let subvol = {
        let trans = BtreeTrans::new(fs);
        lockrestart_do(&trans, |t| subvolume_get(t, inum.subvol))?
    };

    // insert into the cache before anyone else can pull the inode in and
    // modify it
    Ok(inode_hash_init_insert(fs, inum, &inode_u, &subvol))
}

pub fn link(
    fs: &Fs,
    dir: &Arc<CachedInode>,
    inode: &Arc<CachedInode>,
    name: &str,
) -> BchResult<()> {
    fs.check_rw()?;
    let _guard = inode.ei_update_lock.lock();

    let mut dir_u = InodeUnpacked::default();
    let mut inode_u = InodeUnpacked::default();

    let trans = BtreeTrans::new(fs);
    commit_do(&trans, |t| {
        subvol_is_ro_trans(t, dir.inum.subvol)?;
        subvol_is_ro_trans(t, inode.inum.subvol)?;
        link_trans(t, dir.inum, &mut dir_u, inode.inum, &mut inode_u, name)
    })?;

    inode_update_after_write(dir, &dir_u);
    inode_update_after_write(inode, &inode_u);
    Ok(())
}

pub fn unlink(
    fs: &Fs,
    dir: &Arc<CachedInode>,
    name: &str,
    deleting_subvol: bool,
) -> BchResult<Option<SubvolInum>> {
    fs.check_rw()?;
    let _guard = dir.ei_update_lock.lock();

    let mut dir_u = InodeUnpacked::default();
    let mut inode_u = InodeUnpacked::default();

    let trans = BtreeTrans::new(fs);
    commit_do(&trans, |t| {
        subvol_is_ro_trans(t, dir.inum.subvol)?;
        unlink_trans(t, dir.inum, &mut dir_u, &mut inode_u, name, deleting_subvol)
    })?;

    inode_update_after_write(dir, &dir_u);

    let inum = SubvolInum::new(
        if inode_u.bi_subvol != 0 { inode_u.bi_subvol } else { dir.inum.subvol },
        inode_u.bi_inum,
    );
    if let Some(cached) = fs.inode_cache.find(None, inum)? {
        inode_update_after_write(&cached, &inode_u);
    }

    // subvolume deletion is reported so the caller can evict its inodes
    Ok(if inode_u.bi_subvol != 0 { Some(inum) } else { None })
}

pub fn rename(
    fs: &Fs,
    src_dir: &Arc<CachedInode>,
    dst_dir: &Arc<CachedInode>,
    src_name: &str,
    dst_name: &str,
    flags: RenameFlags,
) -> BchResult<()> {
    fs.check_rw()?;

    let mut src_dir_u = InodeUnpacked::default();
    let mut dst_dir_u = InodeUnpacked::default();
    let mut src_inode_u = InodeUnpacked::default();
    let mut dst_inode_u = InodeUnpacked::default();

    let trans = BtreeTrans::new(fs);
    commit_do(&trans, |t| {
        subvol_is_ro_trans(t, src_dir.inum.subvol)?;
        subvol_is_ro_trans(t, dst_dir.inum.subvol)?;

        // pick the dirent-level mode from the flags and the destination
        let dst_hash = {
            let (_, d) = inode_peek(t, dst_dir.inum, BtreeIterFlags::empty())?;
            hash_info_init(&d)
        };
        let dst_exists =
            dirent_lookup_trans(t, dst_dir.inum, &dst_hash, dst_name).is_ok();

        let mode = if flags.contains(RenameFlags::EXCHANGE) {
            RenameMode::Exchange
        } else if dst_exists {
            if flags.contains(RenameFlags::NOREPLACE) {
                return Err(Errcode::Exist);
            }
            RenameMode::Overwrite
        } else {
            RenameMode::Rename
        };

        rename_trans(
            t,
            src_dir.inum,
            &mut src_dir_u,
            dst_dir.inum,
            &mut dst_dir_u,
            &mut src_inode_u,
            &mut dst_inode_u,
            src_name,
            dst_name,
            mode,
        )?;

        if flags.contains(RenameFlags::WHITEOUT) {
            let mut wh_dir_u = InodeUnpacked::default();
            let mut wh_u = InodeUnpacked::default();
            create_trans(
                t,
                src_dir.inum,
                &mut wh_dir_u,
                &mut wh_u,
                Some(src_name),
                0,
                0,
                libc::S_IFCHR as u32 | 0o600,
                WHITEOUT_DEV,
                None,
                None,
                SubvolInum::new(0, 0),
                CreateFlags::empty(),
            )?;
            debug_assert_eq!(mode_to_type(wh_u.bi_mode), FileType::Chr);
        }
        Ok(())
    })?;

    inode_update_after_write(src_dir, &src_dir_u);
    if !Arc::ptr_eq(src_dir, dst_dir) {
        inode_update_after_write(dst_dir, &dst_dir_u);
    }
    Ok(())
}

/// Walk an absolute path to its inode.
pub fn resolve_path(fs: &Fs, path: &str) -> BchResult<Arc<CachedInode>> {
    let mut cur = vfs_inode_get(fs, SubvolInum::new(crate::subvolume::ROOT_SUBVOL, crate::inode::ROOT_INO))?;

    for comp in path.split('/').filter(|c| !c.is_empty()) {
        let trans = BtreeTrans::new(fs);
        let hash = hash_info_init(&cur.inode());
        cur = lockrestart_do(&trans, |t| lookup_trans(t, cur.inum, &hash, comp))?;
    }
    Ok(cur)
}

/// Resolve `(subvol, inum)` to a path, under a retry loop.
pub fn path_of(fs: &Fs, inum: SubvolInum) -> BchResult<String> {
    let trans = BtreeTrans::new(fs);
    lockrestart_do(&trans, |t| inum_to_path(t, inum))
}

/// Drop every cached inode belonging to one of `snapshots` (a dying
/// subvolume's snapshot set).
pub fn evict_subvolume_inodes(fs: &Fs, snapshots: &[u32]) {
    let victims: Vec<_> = fs
        .vfs_inodes
        .lock()
        .iter()
        .filter(|i| snapshots.contains(&i.snapshot))
        .cloned()
        .collect();

    for inode in victims {
        evict_inode(fs, &inode);
    }
}
