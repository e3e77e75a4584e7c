//! The in-memory accounting table: an eytzinger-ordered array of entries,
//! each owning striped per-CPU counters — one live vector, plus a shadow
//! vector while a GC recount is in flight.
//!
//! The table's structure is guarded by `mark_lock` ([`Accounting`] wraps the
//! lock): counter reads and counter mods take the shared side, insertion,
//! compaction and GC bookkeeping take the exclusive side. Lock upgrade is
//! drop-then-reacquire; anyone who dropped the shared side must re-run
//! `find()` afterwards, their indices are stale.

use parking_lot::{Mutex, RwLock};

use crate::accounting::ACCOUNTING_MAX_COUNTERS;
use crate::bkey::{BkeyI, BVersion, Bpos, KeyValue};
use crate::errcode::{BchResult, Errcode};
use crate::eytzinger;
use crate::percpu::PerCpuU64s;

pub struct AccountingMemEntry {
    pub pos: Bpos,
    /// Version of the newest update applied to this entry; journal replay
    /// compares against it to skip already-applied keys.
    pub version: Mutex<BVersion>,
    pub nr_counters: usize,
    /// `v[0]` live, `v[1]` the GC shadow.
    v: [Option<PerCpuU64s>; 2],
}

impl AccountingMemEntry {
    fn counters(&self, gc: bool) -> Option<&PerCpuU64s> {
        self.v[gc as usize].as_ref()
    }
}

/// Table contents; access goes through [`Accounting::mark_lock`].
#[derive(Default)]
pub struct AccountingMem {
    /// Entries in eytzinger order over the position comparator.
    pub k: Vec<AccountingMemEntry>,
    pub gc_running: bool,
}

impl AccountingMem {
    /// Eytzinger search; wait-free, runs under the shared lock.
    pub fn find(&self, pos: Bpos) -> Option<usize> {
        eytzinger::find(&self.k, |e| e.pos.cmp(&pos))
    }

    /// Smallest entry at or after `pos`.
    pub fn find_ge(&self, pos: Bpos) -> Option<usize> {
        eytzinger::find_ge(&self.k, |e| e.pos.cmp(&pos))
    }

    /// Sum entry `idx`'s counters across shards into `out` (zero-padded).
    pub fn read_counters(&self, idx: usize, gc: bool, out: &mut [u64]) {
        match self.k[idx].counters(gc) {
            Some(c) => c.read(out),
            None => out.fill(0),
        }
    }

    /// Apply deltas to entry `idx`'s live or shadow vector, caller's shard
    /// only. Advances the entry version for live (normal) application.
    ///
    /// While a GC pass is in flight, a normal application must also land in
    /// the shadow vector: the recount runs in parallel with live mutations,
    /// and a write the shadow side misses would show up at gc-done as a
    /// spurious mismatch — the corrective delta would then undo it.
    pub fn mod_counters(&self, idx: usize, deltas: &[i64], version: BVersion, gc: bool) {
        let e = &self.k[idx];
        if let Some(c) = e.counters(gc) {
            c.add(deltas);
        }
        if !gc && !version.is_zero() {
            if let Some(shadow) = e.counters(true) {
                shadow.add(deltas);
            }
            let mut v = e.version.lock();
            if version > *v {
                *v = version;
            }
        }
    }

    pub fn is_zero(&self, idx: usize) -> bool {
        let e = &self.k[idx];
        e.v.iter()
            .flatten()
            .all(|c| c.is_zero())
    }

    /// Insert a new entry for `a`'s position, preserving eytzinger order.
    /// Idempotent: raced inserts of the same position return success.
    ///
    /// Exclusive lock required.
    pub fn insert(&mut self, a: &BkeyI) -> BchResult<()> {
        // raced with another insert, already present:
        if self.find(a.p).is_some() {
            return Ok(());
        }

        let KeyValue::Accounting(val) = &a.v else {
            return Err(Errcode::Inval);
        };
        let nr = val.nr_counters().min(ACCOUNTING_MAX_COUNTERS);

        let live = PerCpuU64s::new(nr)?;
        let shadow = if self.gc_running {
            Some(PerCpuU64s::new(nr)?)
        } else {
            None
        };

        self.k.push(AccountingMemEntry {
            pos: a.p,
            version: Mutex::new(a.version),
            nr_counters: nr,
            v: [Some(live), shadow],
        });
        eytzinger::sort_by(&mut self.k, |l, r| l.pos.cmp(&r.pos));
        Ok(())
    }

    /// Drop entries whose live and shadow counters are all zero.
    ///
    /// Exclusive lock required.
    pub fn compact(&mut self) {
        self.k.retain(|e| {
            !e.v.iter().flatten().all(|c| c.is_zero())
        });
        eytzinger::sort_by(&mut self.k, |l, r| l.pos.cmp(&r.pos));
    }

    /// Allocate a shadow vector on every entry. On allocation failure all
    /// shadows are released and the table is unchanged.
    ///
    /// Exclusive lock required.
    pub fn gc_start(&mut self) -> BchResult<()> {
        let mut ret = Ok(());

        for e in &mut self.k {
            match PerCpuU64s::new(e.nr_counters) {
                Ok(c) => e.v[1] = Some(c),
                Err(err) => {
                    ret = Err(err);
                    break;
                }
            }
        }
        if ret.is_err() {
            for e in &mut self.k {
                e.v[1] = None;
            }
        }

        self.gc_running = ret.is_ok();
        ret
    }

    /// Release every shadow vector and clear the GC flag.
    ///
    /// Exclusive lock required.
    pub fn gc_free(&mut self) {
        for e in &mut self.k {
            e.v[1] = None;
        }
        self.gc_running = false;
    }
}

/// The accounting table and its structure lock.
pub struct Accounting {
    pub mark_lock: RwLock<AccountingMem>,
}

impl Accounting {
    pub fn new() -> Self {
        Accounting { mark_lock: RwLock::new(AccountingMem::default()) }
    }

    /// Read the counters for `pos`, zero if absent. Takes the shared lock.
    pub fn mem_read(&self, pos: Bpos, out: &mut [u64]) {
        let acc = self.mark_lock.read();
        match acc.find(pos) {
            Some(idx) => acc.read_counters(idx, false, out),
            None => out.fill(0),
        }
    }

    /// Insert following the upgrade protocol: the caller has dropped the
    /// shared lock; take exclusive, re-check, insert, and return — the
    /// caller reacquires shared and re-runs `find()`.
    pub fn mem_insert(&self, a: &BkeyI) -> BchResult<()> {
        let mut acc = self.mark_lock.write();
        acc.insert(a)
    }
}

impl Default for Accounting {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::{accounting_key_init, DiskAccountingPos, ReplicasEntry};
    use crate::fs_usage::DataType;

    fn replicas_pos(devs: Vec<u8>) -> DiskAccountingPos {
        DiskAccountingPos::Replicas(ReplicasEntry {
            data_type: DataType::User,
            nr_required: 1,
            devs,
        })
    }

    fn key(pos: DiskAccountingPos, d: &[i64], seq: u64) -> BkeyI {
        let mut k = accounting_key_init(pos, d);
        k.version = BVersion { journal_seq: seq, offset: 0 };
        k
    }

    #[test]
    fn insert_find_mod_read() {
        let mut acc = AccountingMem::default();
        let k = key(replicas_pos(vec![2, 5]), &[0], 1);
        acc.insert(&k).unwrap();

        let idx = acc.find(k.p).unwrap();
        acc.mod_counters(idx, &[100], k.version, false);
        acc.mod_counters(idx, &[-40], k.version, false);

        let mut v = [0u64; 1];
        acc.read_counters(idx, false, &mut v);
        assert_eq!(v[0], 60);
    }

    #[test]
    fn insert_is_idempotent_on_race() {
        let mut acc = AccountingMem::default();
        let k = key(DiskAccountingPos::NrInodes, &[0], 1);
        acc.insert(&k).unwrap();
        acc.insert(&k).unwrap();
        assert_eq!(acc.k.len(), 1);
    }

    #[test]
    fn table_stays_searchable_as_it_grows() {
        let mut acc = AccountingMem::default();
        let mut keys = Vec::new();
        for dev in [9u8, 1, 7, 3, 5, 0, 8, 2, 6, 4] {
            let k = key(replicas_pos(vec![dev]), &[0], 1);
            acc.insert(&k).unwrap();
            keys.push(k.p);
            for p in &keys {
                assert!(acc.find(*p).is_some());
            }
        }
    }

    #[test]
    fn compact_drops_zero_entries_only() {
        let mut acc = AccountingMem::default();
        let ka = key(replicas_pos(vec![1]), &[0], 1);
        let kb = key(replicas_pos(vec![2]), &[0], 1);
        acc.insert(&ka).unwrap();
        acc.insert(&kb).unwrap();

        let idx = acc.find(kb.p).unwrap();
        acc.mod_counters(idx, &[10], BVersion { journal_seq: 2, offset: 0 }, false);

        acc.compact();
        assert_eq!(acc.k.len(), 1);
        assert!(acc.find(ka.p).is_none());
        assert!(acc.find(kb.p).is_some());
    }

    #[test]
    fn gc_shadow_on_every_entry() {
        let mut acc = AccountingMem::default();
        acc.insert(&key(replicas_pos(vec![1]), &[0], 1)).unwrap();
        acc.insert(&key(DiskAccountingPos::NrInodes, &[0], 1)).unwrap();

        acc.gc_start().unwrap();
        assert!(acc.gc_running);
        assert!(acc.k.iter().all(|e| e.v[1].is_some()));

        // new entries while GC runs get a shadow too
        acc.insert(&key(replicas_pos(vec![3]), &[0], 1)).unwrap();
        assert!(acc.k.iter().all(|e| e.v[1].is_some()));

        // shadow mods don't touch live
        let idx = acc.find(DiskAccountingPos::NrInodes.to_bpos()).unwrap();
        acc.mod_counters(idx, &[5], BVersion::ZERO, true);
        let mut live = [0u64; 1];
        let mut shadow = [0u64; 1];
        acc.read_counters(idx, false, &mut live);
        acc.read_counters(idx, true, &mut shadow);
        assert_eq!(live[0], 0);
        assert_eq!(shadow[0], 5);

        // a normal application during the pass lands on both sides
        acc.mod_counters(idx, &[2], BVersion { journal_seq: 9, offset: 0 }, false);
        acc.read_counters(idx, false, &mut live);
        acc.read_counters(idx, true, &mut shadow);
        assert_eq!(live[0], 2);
        assert_eq!(shadow[0], 7);

        acc.gc_free();
        assert!(!acc.gc_running);
        assert!(acc.k.iter().all(|e| e.v[1].is_none()));
    }

    #[test]
    fn version_only_advances() {
        let mut acc = AccountingMem::default();
        let k = key(DiskAccountingPos::NrInodes, &[0], 5);
        acc.insert(&k).unwrap();
        let idx = acc.find(k.p).unwrap();

        acc.mod_counters(idx, &[1], BVersion { journal_seq: 3, offset: 0 }, false);
        assert_eq!(acc.k[idx].version.lock().journal_seq, 5);

        acc.mod_counters(idx, &[1], BVersion { journal_seq: 9, offset: 0 }, false);
        assert_eq!(acc.k[idx].version.lock().journal_seq, 9);
    }
}
