//! The filesystem handle.
//!
//! Everything lives here and is passed explicitly — the accounting table,
//! the trees, the journal, the inode cache, the replica registry — and is
//! released together when the handle drops. No singletons.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::accounting::gc;
use crate::accounting::mem::Accounting;
use crate::accounting::update::{dev_usage_init, disk_accounting_mod};
use crate::accounting::DiskAccountingPos;
use crate::bkey::{spos, BkeyI, KeyValue};
use crate::btree::{BtreeId, BtreeStore};
use crate::errcode::{BchResult, Errcode};
use crate::fs_usage::{DataType, DevUsage, FsUsagePercpu};
use crate::inode::{inode_init_late, InodeUnpacked, ROOT_INO};
use crate::journal::Journal;
use crate::opts::{FixErrors, Opts};
use crate::percpu;
use crate::sb::{Member, SuperBlock};
use crate::snapshot::SnapshotTable;
use crate::subvolume::{subvolume_create, ROOT_SUBVOL};
use crate::trans::{commit_do, BtreeTrans};
use crate::vfs::{CachedInode, InodeCache};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FsckClass {
    /// Counters that disagree; safe to repair in place.
    CounterMismatch,
    /// Broken structure (dangling references, bad records).
    Structural,
}

pub struct Fs {
    pub opts: Opts,
    pub sb: RwLock<SuperBlock>,
    pub btree: BtreeStore,
    pub journal: Journal,
    pub accounting: Accounting,
    pub usage: FsUsagePercpu,
    dev_usage: Vec<DevUsage>,
    pub snapshots: RwLock<SnapshotTable>,
    pub inode_cache: InodeCache,
    pub vfs_inodes: Mutex<Vec<Arc<CachedInode>>>,
    pub commit_lock: Mutex<()>,

    may_go_rw: AtomicBool,
    rw: AtomicBool,
    emergency_ro: AtomicBool,

    next_subvol: AtomicU32,
    inum_hints: Mutex<Vec<u64>>,
    seed_counter: AtomicU64,
    time_override: AtomicU64,
    restart_inject: AtomicI64,

    pub fsck_errors_seen: AtomicU64,
    pub fsck_errors_fixed: AtomicU64,
}

impl Fs {
    /// Assemble a handle around existing state (a loaded image, or a fresh
    /// superblock). Callers follow up with [`Fs::mount_finish`] or
    /// [`Fs::format_finish`].
    pub fn assemble(
        sb: SuperBlock,
        snapshots: SnapshotTable,
        journal: Journal,
        opts: Opts,
    ) -> BchResult<Fs> {
        let nr_devs = sb.members.len();
        let mut dev_usage = Vec::with_capacity(nr_devs);
        for _ in 0..nr_devs {
            dev_usage.push(DevUsage::new()?);
        }

        Ok(Fs {
            opts,
            sb: RwLock::new(sb),
            btree: BtreeStore::new(),
            journal,
            accounting: Accounting::new(),
            usage: FsUsagePercpu::new()?,
            dev_usage,
            snapshots: RwLock::new(snapshots),
            inode_cache: InodeCache::new(),
            vfs_inodes: Mutex::new(Vec::new()),
            commit_lock: Mutex::new(()),
            may_go_rw: AtomicBool::new(false),
            rw: AtomicBool::new(false),
            emergency_ro: AtomicBool::new(false),
            next_subvol: AtomicU32::new(1),
            inum_hints: Mutex::new(vec![ROOT_INO + 1; percpu::nr_shards()]),
            seed_counter: AtomicU64::new(1),
            time_override: AtomicU64::new(0),
            restart_inject: AtomicI64::new(0),
            fsck_errors_seen: AtomicU64::new(0),
            fsck_errors_fixed: AtomicU64::new(0),
        })
    }

    /// Create a fresh filesystem: root subvolume, root directory, device
    /// usage counters.
    pub fn format(members: Vec<Member>, opts: Opts) -> BchResult<Fs> {
        let nr_devs = members.len();
        let fs = Fs::assemble(
            SuperBlock::new(members),
            SnapshotTable::new(),
            Journal::new(),
            opts,
        )?;
        fs.may_go_rw.store(true, Ordering::SeqCst);
        fs.rw.store(true, Ordering::SeqCst);

        {
            let trans = BtreeTrans::new(&fs);
            commit_do(&trans, |t| {
                let (subvol, snapshot) = subvolume_create(t, ROOT_INO, 0, 0, false)?;
                debug_assert_eq!(subvol, ROOT_SUBVOL);

                let mut root = InodeUnpacked::default();
                inode_init_late(
                    &mut root,
                    fs.current_time(),
                    0,
                    0,
                    libc::S_IFDIR as u32 | 0o755,
                    0,
                    None,
                );
                root.bi_inum = ROOT_INO;
                root.bi_hash_seed = fs.next_hash_seed();

                t.update(
                    BtreeId::Inodes,
                    BkeyI::new(spos(0, ROOT_INO, snapshot), KeyValue::Inode(root)),
                )?;
                disk_accounting_mod(t, DiskAccountingPos::NrInodes, &[1], false)
            })?;
        }

        for dev in 0..nr_devs {
            dev_usage_init(&fs, dev as u8, false)?;
        }

        Ok(fs)
    }

    /// Mount-time recovery: replay accounting, then (unless mounting
    /// read-only) go read-write.
    pub fn mount_finish(&self) -> BchResult<()> {
        self.next_subvol.store(self.max_subvol_id() + 1, Ordering::SeqCst);

        gc::accounting_read(self)?;

        self.may_go_rw.store(true, Ordering::SeqCst);
        if !self.opts.read_only {
            self.rw.store(true, Ordering::SeqCst);
        }
        let sb = self.sb.read();
        log::info!("mounted {} ({} devices)", sb.uuid, sb.members.len());
        Ok(())
    }

    fn max_subvol_id(&self) -> u32 {
        self.btree
            .keys(BtreeId::Subvolumes)
            .iter()
            .map(|k| k.p.offset as u32)
            .max()
            .unwrap_or(0)
    }

    /// Flush the write buffer: apply pending accounting deltas to the
    /// accounting tree. Synchronous.
    pub fn write_buffer_flush(&self) {
        let mut keys = self.journal.keys.lock();
        keys.retain(|jk| {
            if jk.is_accounting() {
                self.btree.accounting_apply_delta(&jk.k);
                false
            } else {
                true
            }
        });
    }

    /// Clean shutdown: everything flushed, journal empty.
    pub fn unmount_clean(&self) {
        self.write_buffer_flush();
        self.journal.clear();
        self.rw.store(false, Ordering::SeqCst);
    }

    // ---- state checks ----

    pub fn check_may_write(&self) -> BchResult<()> {
        if self.emergency_ro.load(Ordering::SeqCst) {
            return Err(Errcode::Rofs);
        }
        Ok(())
    }

    /// For externally-driven mutations: fails on read-only mounts too.
    pub fn check_rw(&self) -> BchResult<()> {
        self.check_may_write()?;
        if self.opts.read_only {
            return Err(Errcode::Rofs);
        }
        Ok(())
    }

    pub fn may_go_rw(&self) -> bool {
        self.may_go_rw.load(Ordering::SeqCst)
    }

    /// A fatal error: stop writing, stay up for reads.
    pub fn emergency_read_only(&self, why: &str) {
        if !self.emergency_ro.swap(true, Ordering::SeqCst) {
            log::error!("emergency read-only: {}", why);
        }
    }

    // ---- fsck channel ----

    /// Report an inconsistency; returns whether the caller should repair.
    pub fn fsck_err(&self, class: FsckClass, msg: &str) -> bool {
        self.fsck_errors_seen.fetch_add(1, Ordering::Relaxed);
        log::warn!("fsck: {}", msg);

        let fix = match self.opts.fix_errors {
            FixErrors::Yes => true,
            FixErrors::No => false,
            FixErrors::Exit => false,
        };

        if fix {
            self.fsck_errors_fixed.fetch_add(1, Ordering::Relaxed);
        } else if class == FsckClass::Structural {
            self.emergency_read_only("unfixed structural error");
        }
        fix
    }

    pub fn inconsistent(&self, msg: &str) {
        self.fsck_errors_seen.fetch_add(1, Ordering::Relaxed);
        log::error!("inconsistency: {}", msg);
    }

    // ---- id allocation ----

    pub fn alloc_subvol_id(&self) -> u32 {
        self.next_subvol.fetch_add(1, Ordering::Relaxed)
    }

    pub fn inum_hint(&self, shard: usize) -> u64 {
        let hints = self.inum_hints.lock();
        hints[shard % hints.len()]
    }

    pub fn set_inum_hint(&self, shard: usize, hint: u64) {
        let mut hints = self.inum_hints.lock();
        let n = hints.len();
        hints[shard % n] = hint;
    }

    pub fn next_hash_seed(&self) -> u64 {
        // splitmix64 over a counter; stable within the handle, distinct per
        // inode
        let mut z = self
            .seed_counter
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_mul(0x9e3779b97f4a7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    // ---- clock ----

    /// Nanoseconds since the epoch; overridable for deterministic tests.
    pub fn current_time(&self) -> u64 {
        let o = self.time_override.load(Ordering::Relaxed);
        if o != 0 {
            return o;
        }
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    pub fn set_time(&self, now: u64) {
        self.time_override.store(now, Ordering::Relaxed);
    }

    // ---- per-device usage ----

    pub fn dev_usage_acc(&self, dev: u8, t: DataType, deltas: &[i64]) {
        if let Some(u) = self.dev_usage.get(dev as usize) {
            u.acc(t, deltas);
        }
    }

    pub fn dev_usage_set(&self, dev: u8, t: DataType, v: &[u64; 3]) {
        if let Some(u) = self.dev_usage.get(dev as usize) {
            u.set(t, v);
        }
    }

    pub fn dev_usage_read(&self, dev: u8, t: DataType) -> [u64; 3] {
        self.dev_usage
            .get(dev as usize)
            .map(|u| u.read(t))
            .unwrap_or([0; 3])
    }

    // ---- restart injection (tests) ----

    /// Make the `n`-th subsequent commit attempt fail with a transaction
    /// restart.
    pub fn inject_restart_after(&self, n: i64) {
        self.restart_inject.store(n, Ordering::SeqCst);
    }

    pub fn maybe_inject_restart(&self) -> BchResult<()> {
        if self.restart_inject.load(Ordering::SeqCst) > 0
            && self.restart_inject.fetch_sub(1, Ordering::SeqCst) == 1
        {
            return Err(Errcode::TransactionRestart);
        }
        Ok(())
    }

    // ---- reporting ----

    pub fn verify_accounting_clean(&self) -> bool {
        self.write_buffer_flush();
        gc::verify_accounting_clean(self)
    }

    pub fn usage_summary(&self) -> UsageSummary {
        let capacity = self.sb.read().capacity();
        let u = self.usage.read();
        let used = u.used();
        let free_sectors = capacity.saturating_sub(used);

        UsageSummary {
            capacity,
            used,
            nr_inodes: u.nr_inodes,
            avail_inodes: free_sectors * 512 / self.opts.avg_inode_bytes.max(1) as u64,
        }
    }
}

/// Top-level numbers for statfs-style reporting; sectors except inode
/// counts. Available inodes are estimated from free space via the
/// `avg_inode_bytes` tunable.
#[derive(Copy, Clone, Debug)]
pub struct UsageSummary {
    pub capacity: u64,
    pub used: u64,
    pub nr_inodes: u64,
    pub avail_inodes: u64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::accounting::update::mod_dev_cached_sectors;
    use crate::accounting::{DiskAccountingPos, ReplicasEntry};
    use crate::bkey::BVersion;
    use crate::fs_usage::DataType;
    use crate::trans::lockrestart_do;

    pub(crate) fn test_fs() -> Fs {
        let members = vec![
            Member { bucket_size: 8, nbuckets: 1024, first_bucket: 8 },
            Member { bucket_size: 8, nbuckets: 1024, first_bucket: 8 },
            Member { bucket_size: 8, nbuckets: 1024, first_bucket: 8 },
            Member { bucket_size: 8, nbuckets: 1024, first_bucket: 8 },
            Member { bucket_size: 8, nbuckets: 1024, first_bucket: 8 },
            Member { bucket_size: 8, nbuckets: 1024, first_bucket: 8 },
        ];
        let mut opts = Opts::default();
        opts.avg_inode_bytes = 64;
        let fs = Fs::format(members, opts).unwrap();
        fs.set_time(1_000_000);
        fs
    }

    fn replicas(devs: Vec<u8>) -> DiskAccountingPos {
        DiskAccountingPos::Replicas(ReplicasEntry {
            data_type: DataType::User,
            nr_required: 1,
            devs,
        })
    }

    fn mem_read_one(fs: &Fs, pos: &DiskAccountingPos) -> u64 {
        let mut v = [0u64; 1];
        fs.accounting.mem_read(pos.to_bpos(), &mut v);
        v[0]
    }

    #[test]
    fn counter_round_trip() {
        let fs = test_fs();
        let trans = BtreeTrans::new(&fs);

        let pos = replicas(vec![2, 5]);
        commit_do(&trans, |t| disk_accounting_mod(t, pos.clone(), &[100], false)).unwrap();
        assert_eq!(mem_read_one(&fs, &pos), 100);

        commit_do(&trans, |t| disk_accounting_mod(t, pos.clone(), &[-40], false)).unwrap();
        assert_eq!(mem_read_one(&fs, &pos), 60);

        // permuted device list canonicalizes onto the same entry
        let permuted = replicas(vec![5, 2]);
        commit_do(&trans, |t| disk_accounting_mod(t, permuted.clone(), &[1], false)).unwrap();
        assert_eq!(mem_read_one(&fs, &pos), 61);

        // and the commit registered the replicas entry in the superblock
        let r = ReplicasEntry { data_type: DataType::User, nr_required: 1, devs: vec![2, 5] };
        assert!(fs.sb.read().replicas_marked(&r));
    }

    #[test]
    fn deltas_commute() {
        let fs = test_fs();
        let trans = BtreeTrans::new(&fs);
        let pos = replicas(vec![0]);

        let deltas = [7i64, -3, 100, -4, 25];
        for d in deltas {
            commit_do(&trans, |t| disk_accounting_mod(t, pos.clone(), &[d], false)).unwrap();
        }
        assert_eq!(mem_read_one(&fs, &pos), 125);

        let fs2 = test_fs();
        let trans2 = BtreeTrans::new(&fs2);
        for d in deltas.iter().rev() {
            commit_do(&trans2, |t| disk_accounting_mod(t, pos.clone(), &[*d], false)).unwrap();
        }
        assert_eq!(mem_read_one(&fs2, &pos), 125);
    }

    #[test]
    fn same_key_deltas_merge_within_one_commit() {
        let fs = test_fs();
        let trans = BtreeTrans::new(&fs);
        let pos = replicas(vec![1]);

        commit_do(&trans, |t| {
            disk_accounting_mod(t, pos.clone(), &[10], false)?;
            disk_accounting_mod(t, pos.clone(), &[20], false)?;
            disk_accounting_mod(t, pos.clone(), &[30], false)
        })
        .unwrap();
        assert_eq!(mem_read_one(&fs, &pos), 60);

        // one merged journal key, with a nonzero version stamp
        let keys = fs.journal.keys.lock();
        let acc: Vec<_> = keys.iter().filter(|jk| jk.is_accounting()).collect();
        let ours: Vec<_> = acc.iter().filter(|jk| jk.k.p == pos.to_bpos()).collect();
        assert_eq!(ours.len(), 1);
        assert!(!ours[0].k.version.is_zero());
    }

    #[test]
    fn cached_sectors_shorthand() {
        let fs = test_fs();
        let trans = BtreeTrans::new(&fs);

        commit_do(&trans, |t| mod_dev_cached_sectors(t, 3, 128, false)).unwrap();

        let pos = DiskAccountingPos::Replicas(ReplicasEntry::cached(3));
        assert_eq!(mem_read_one(&fs, &pos), 128);
        assert_eq!(fs.usage.read().cached, 128);
    }

    #[test]
    fn usage_base_tracks_commits() {
        let fs = test_fs();
        let trans = BtreeTrans::new(&fs);

        commit_do(&trans, |t| disk_accounting_mod(t, replicas(vec![0, 1]), &[64], false))
            .unwrap();
        commit_do(&trans, |t| {
            disk_accounting_mod(
                t,
                DiskAccountingPos::PersistentReserved { nr_replicas: 2 },
                &[10],
                false,
            )
        })
        .unwrap();

        let u = fs.usage.read();
        assert_eq!(u.data, 64);
        assert_eq!(u.reserved, 20);
        // root inode from format
        assert_eq!(u.nr_inodes, 1);
    }

    #[test]
    fn verify_clean_after_flush() {
        let fs = test_fs();
        let trans = BtreeTrans::new(&fs);

        commit_do(&trans, |t| disk_accounting_mod(t, replicas(vec![4]), &[100], false))
            .unwrap();
        assert!(fs.verify_accounting_clean());
    }

    #[test]
    fn restart_injection_is_survived() {
        let fs = test_fs();
        let trans = BtreeTrans::new(&fs);
        let pos = replicas(vec![2]);

        fs.inject_restart_after(1);
        commit_do(&trans, |t| disk_accounting_mod(t, pos.clone(), &[5], false)).unwrap();

        // the retried commit applied the delta exactly once
        assert_eq!(mem_read_one(&fs, &pos), 5);
    }

    #[test]
    fn gc_emits_corrective_delta() {
        let fs = test_fs();
        let trans = BtreeTrans::new(&fs);
        let pos = replicas(vec![1, 2]);

        commit_do(&trans, |t| disk_accounting_mod(t, pos.clone(), &[100], false)).unwrap();

        gc::gc_accounting_start(&fs).unwrap();

        // an accurate recount: every live counter lands in the shadows...
        let entries: Vec<_> = {
            let acc = fs.accounting.mark_lock.read();
            (0..acc.k.len())
                .map(|i| {
                    let nr = acc.k[i].nr_counters;
                    let mut v = [0u64; 3];
                    acc.read_counters(i, false, &mut v[..nr]);
                    (acc.k[i].pos, v, nr)
                })
                .collect()
        };
        for (p, v, nr) in entries {
            let d: Vec<i64> = v[..nr].iter().map(|x| *x as i64).collect();
            lockrestart_do(&trans, |t| {
                disk_accounting_mod(t, DiskAccountingPos::from_bpos(p), &d, true)
            })
            .unwrap();
        }

        let read_side = |gc: bool| {
            let acc = fs.accounting.mark_lock.read();
            let idx = acc.find(pos.to_bpos()).unwrap();
            let mut v = [0u64; 1];
            acc.read_counters(idx, gc, &mut v);
            v[0]
        };

        // a live transaction commits mid-pass; it must land on both sides,
        // so the diff below doesn't mistake it for drift
        commit_do(&trans, |t| disk_accounting_mod(t, pos.clone(), &[7], false)).unwrap();
        assert_eq!(read_side(false), 107);
        assert_eq!(read_side(true), 107);

        // a bug writes 5 extra to the live counters only
        {
            let acc = fs.accounting.mark_lock.read();
            let idx = acc.find(pos.to_bpos()).unwrap();
            acc.mod_counters(idx, &[5], BVersion::ZERO, false);
        }
        assert_eq!(read_side(false), 112);
        assert_eq!(read_side(true), 107);

        gc::gc_accounting_done(&fs).unwrap();
        gc::accounting_gc_free(&fs);

        // only the drift was corrected; the concurrent commit survived
        assert_eq!(mem_read_one(&fs, &pos), 107);
        assert_eq!(fs.fsck_errors_fixed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn gc_compacts_zero_entries() {
        let fs = test_fs();
        let trans = BtreeTrans::new(&fs);
        let pos = replicas(vec![3]);

        commit_do(&trans, |t| disk_accounting_mod(t, pos.clone(), &[30], false)).unwrap();
        commit_do(&trans, |t| disk_accounting_mod(t, pos.clone(), &[-30], false)).unwrap();

        gc::accounting_mem_gc(&fs);
        assert!(fs.accounting.mark_lock.read().find(pos.to_bpos()).is_none());
    }

    #[test]
    fn emergency_ro_blocks_commits() {
        let fs = test_fs();
        let trans = BtreeTrans::new(&fs);

        fs.emergency_read_only("test");
        let r = commit_do(&trans, |t| disk_accounting_mod(t, replicas(vec![0]), &[1], false));
        assert_eq!(r, Err(Errcode::Rofs));
    }

    #[test]
    fn avail_inodes_uses_tunable() {
        let fs = test_fs();
        let s = fs.usage_summary();
        let free = s.capacity - s.used;
        assert_eq!(s.avail_inodes, free * 512 / 64);

        let members = vec![Member { bucket_size: 8, nbuckets: 64, first_bucket: 8 }];
        let mut opts = Opts::default();
        opts.avg_inode_bytes = 512;
        let fs2 = Fs::format(members, opts).unwrap();
        let s2 = fs2.usage_summary();
        assert_eq!(s2.avail_inodes, (s2.capacity - s2.used) * 512 / 512);
    }

    #[test]
    fn dev_usage_remove_clears_device() {
        let fs = test_fs();

        crate::accounting::update::dev_usage_remove(&fs, 1).unwrap();

        let pos = DiskAccountingPos::DevDataType { dev: 1, data_type: DataType::Free };
        assert_eq!(mem_read_one(&fs, &pos), 0);
        assert_eq!(fs.dev_usage_read(1, DataType::Free), [0; 3]);
        assert!(fs.verify_accounting_clean());
    }
}
