//! Accounting GC and mount-time replay.
//!
//! GC runs a parallel recount: every table entry gets a shadow counter
//! vector, the recount triggers write into the shadows while live updates
//! keep flowing into the live vectors, and at the end live-vs-shadow
//! mismatches are repaired with corrective deltas through the normal update
//! path.
//!
//! Replay seeds the in-memory table at mount: first from the accounting
//! tree, then from the journal's pending keys, deduplicated by version
//! stamp.

use std::fmt::Write as _;

use crate::accounting::update::{
    accounting_mem_apply, disk_accounting_mod, AccountingMode,
};
use crate::accounting::{
    accounting_to_replicas, AccountingVal, DiskAccountingPos, ACCOUNTING_MAX_COUNTERS,
};
use crate::bkey::{KeyValue, POS_MIN};
use crate::btree::BtreeId;
use crate::errcode::{BchResult, Errcode};
use crate::eytzinger;
use crate::fs::{Fs, FsckClass};
use crate::fs_usage::{data_type_is_hidden, FsUsageBase};
use crate::trans::{commit_do, BtreeTrans};

/// Allocate shadow vectors on every entry and raise `gc_running`.
pub fn gc_accounting_start(fs: &Fs) -> BchResult<()> {
    fs.accounting.mark_lock.write().gc_start()
}

/// Compare live counters against the GC recount; emit corrective deltas for
/// every drifted entry through the normal update path.
pub fn gc_accounting_done(fs: &Fs) -> BchResult<()> {
    let trans = BtreeTrans::new(fs);
    let mut pos = POS_MIN;

    loop {
        let (acc_pos, live, shadow, nr) = {
            let acc = fs.accounting.mark_lock.write();
            let Some(idx) = acc.find_ge(pos) else { break };

            let e = &acc.k[idx];
            pos = e.pos.successor();

            let acc_pos = DiskAccountingPos::from_bpos(e.pos);
            if matches!(acc_pos, DiskAccountingPos::Unknown(_)) {
                continue;
            }

            let nr = e.nr_counters;
            let mut live = [0u64; ACCOUNTING_MAX_COUNTERS];
            let mut shadow = [0u64; ACCOUNTING_MAX_COUNTERS];
            acc.read_counters(idx, false, &mut live[..nr]);
            acc.read_counters(idx, true, &mut shadow[..nr]);
            (acc_pos, live, shadow, nr)
        };

        if live[..nr] == shadow[..nr] {
            continue;
        }

        let mut msg = format!("accounting mismatch for {}: got", acc_pos);
        for v in &live[..nr] {
            write!(msg, " {}", v).unwrap();
        }
        msg.push_str(" should be");
        for v in &shadow[..nr] {
            write!(msg, " {}", v).unwrap();
        }

        if !fs.fsck_err(FsckClass::CounterMismatch, &msg) {
            continue;
        }

        let delta: Vec<i64> = (0..nr)
            .map(|i| shadow[i].wrapping_sub(live[i]) as i64)
            .collect();

        // The corrective commit applies the delta to the live counters and
        // folds it into fs_usage_base, whether or not the filesystem has
        // gone read-write yet.
        commit_do(&trans, |t| {
            disk_accounting_mod(t, acc_pos.clone(), &delta, false)
        })?;
    }

    Ok(())
}

/// Release all shadow vectors and clear `gc_running`.
pub fn accounting_gc_free(fs: &Fs) {
    fs.accounting.mark_lock.write().gc_free();
}

/// Drop entries that went to zero; typically follows `accounting_gc_free`.
pub fn accounting_mem_gc(fs: &Fs) {
    fs.accounting.mark_lock.write().compact();
}

/// Initialize in-memory accounting from the tree and the journal at mount.
pub fn accounting_read(fs: &Fs) -> BchResult<()> {
    let mut unused = FsUsageBase::default();

    // 1) seed from the accounting tree
    for k in fs.btree.keys(BtreeId::Accounting) {
        if !matches!(k.v, KeyValue::Accounting(_)) {
            continue;
        }
        accounting_mem_apply(fs, &k, AccountingMode::Read, &mut unused)?;
    }

    // 2) the journal's pending accounting keys, in insertion order
    let mut pending: Vec<_> = {
        let mut keys = fs.journal.keys.lock();
        keys.drain(..).collect()
    };
    let mut retained = Vec::with_capacity(pending.len());

    let n = pending.len();
    for i in 0..n {
        if !pending[i].is_accounting() {
            retained.push(pending[i].clone());
            continue;
        }

        let applied = {
            let acc = fs.accounting.mark_lock.read();
            acc.find(pending[i].k.p)
                .map(|idx| *acc.k[idx].version.lock() >= pending[i].k.version)
                .unwrap_or(false)
        };
        if applied {
            continue;
        }

        // collapse a run of same-position deltas into one application
        if i + 1 < n
            && pending[i + 1].is_accounting()
            && pending[i + 1].k.p == pending[i].k.p
        {
            let cur = pending[i].k.clone();
            crate::accounting::accounting_accumulate(&mut pending[i + 1].k, &cur);
            continue;
        }

        apply_journal_key(fs, pending[i].clone())?;
    }
    *fs.journal.keys.lock() = retained;

    // 3) replicas entries must be registered in the superblock
    let entries: Vec<_> = {
        let acc = fs.accounting.mark_lock.read();
        (0..acc.k.len())
            .map(|i| {
                let mut v = [0u64; ACCOUNTING_MAX_COUNTERS];
                acc.read_counters(i, false, &mut v);
                (acc.k[i].pos, v)
            })
            .collect()
    };

    for (pos, v) in &entries {
        if v.iter().all(|x| *x == 0) {
            continue;
        }
        let Some(r) = accounting_to_replicas(*pos) else { continue };

        // invalid entries get cleaned up by the allocation checks later
        if fs.sb.read().replicas_entry_validate(&r).is_err() {
            continue;
        }

        if !fs.sb.read().replicas_marked(&r) {
            let msg = format!(
                "accounting not marked in superblock replicas\n  {}",
                DiskAccountingPos::from_bpos(*pos)
            );
            if !fs.fsck_err(FsckClass::CounterMismatch, &msg) {
                return Err(Errcode::FsckErrors);
            }
            // re-mark without holding the table lock
            fs.sb.write().mark_replicas(&r)?;
        }
    }

    // 4) rebuild the derived aggregates
    let mut base = FsUsageBase::default();
    for (pos, v) in &entries {
        match DiskAccountingPos::from_bpos(*pos) {
            DiskAccountingPos::NrInodes => {
                base.nr_inodes = base.nr_inodes.wrapping_add(v[0]);
            }
            DiskAccountingPos::PersistentReserved { nr_replicas } => {
                base.reserved = base
                    .reserved
                    .wrapping_add(v[0].wrapping_mul(nr_replicas as u64));
            }
            DiskAccountingPos::Replicas(r) => {
                base.data_type_to_base(r.data_type, v[0] as i64);
            }
            DiskAccountingPos::DevDataType { dev, data_type } => {
                fs.dev_usage_set(dev, data_type, &[v[0], v[1], v[2]]);

                if data_type_is_hidden(data_type) {
                    if let Some(m) = fs.sb.read().member(dev) {
                        base.hidden = base
                            .hidden
                            .wrapping_add(v[0].wrapping_mul(m.bucket_size as u64));
                    }
                }
            }
            _ => (),
        }
    }
    fs.usage.set(&base);

    Ok(())
}

fn apply_journal_key(fs: &Fs, jk: crate::journal::JournalKey) -> BchResult<()> {
    let mut unused = FsUsageBase::default();
    accounting_mem_apply(fs, &jk.k, AccountingMode::Read, &mut unused)?;
    fs.btree.accounting_apply_delta(&jk.k);
    Ok(())
}

/// Idle-time assertion that the three representations agree: tree values vs
/// in-memory counters, per-device counters, and fs_usage_base. Returns
/// whether everything matched.
pub fn verify_accounting_clean(fs: &Fs) -> bool {
    let mut mismatch = false;
    let mut base = FsUsageBase::default();

    for k in fs.btree.keys(BtreeId::Accounting) {
        let KeyValue::Accounting(val) = &k.v else { continue };
        let acc_pos = DiskAccountingPos::from_bpos(k.p);
        if matches!(acc_pos, DiskAccountingPos::Unknown(_)) {
            continue;
        }

        let nr = val.d.len();
        let mut v = [0u64; ACCOUNTING_MAX_COUNTERS];
        fs.accounting.mem_read(k.p, &mut v[..nr]);

        let disk: Vec<u64> = val.d.iter().map(|d| *d as u64).collect();
        if disk[..] != v[..nr] {
            log::error!("accounting mismatch: {} != {:?} (mem)", acc_pos, &v[..nr]);
            mismatch = true;
        }

        match &acc_pos {
            DiskAccountingPos::NrInodes => {
                base.nr_inodes = base.nr_inodes.wrapping_add(disk[0]);
            }
            DiskAccountingPos::PersistentReserved { nr_replicas } => {
                base.reserved = base
                    .reserved
                    .wrapping_add(disk[0].wrapping_mul(*nr_replicas as u64));
            }
            DiskAccountingPos::Replicas(r) => {
                base.data_type_to_base(r.data_type, disk[0] as i64);
            }
            DiskAccountingPos::DevDataType { dev, data_type } => {
                let in_mem = fs.dev_usage_read(*dev, *data_type);
                if disk.len() == 3 && disk[..] != in_mem[..] {
                    log::error!(
                        "dev accounting mismatch: {} in mem {:?}",
                        acc_pos,
                        in_mem
                    );
                    mismatch = true;
                }
                if data_type_is_hidden(*data_type) {
                    if let Some(m) = fs.sb.read().member(*dev) {
                        base.hidden = base
                            .hidden
                            .wrapping_add(disk[0].wrapping_mul(m.bucket_size as u64));
                    }
                }
            }
            _ => (),
        }
    }

    let inmem = fs.usage.read();
    macro_rules! check {
        ($field:ident) => {
            if base.$field != inmem.$field {
                log::error!(
                    "fs_usage_base.{} mismatch: {} != {}",
                    stringify!($field),
                    base.$field,
                    inmem.$field
                );
                mismatch = true;
            }
        };
    }

    //check!(hidden);
    check!(btree);
    check!(data);
    check!(cached);
    check!(reserved);
    check!(nr_inodes);

    !mismatch
}

/// Text dump of the in-memory table, one line per entry, sorted.
pub fn fs_accounting_to_text(fs: &Fs) -> String {
    let acc = fs.accounting.mark_lock.read();
    let mut out = String::new();

    for i in eytzinger::sorted_indices(acc.k.len()) {
        let pos = DiskAccountingPos::from_bpos(acc.k[i].pos);
        let nr = acc.k[i].nr_counters;
        let mut v = [0u64; ACCOUNTING_MAX_COUNTERS];
        acc.read_counters(i, false, &mut v[..nr]);

        write!(out, "{}:", pos).unwrap();
        for x in &v[..nr] {
            write!(out, " {}", x).unwrap();
        }
        out.push('\n');
    }
    out
}

/// Replicas entries and their sector counts, for the usage report.
pub fn fs_replicas_usage_read(fs: &Fs) -> Vec<(crate::accounting::ReplicasEntry, u64)> {
    let acc = fs.accounting.mark_lock.read();
    let mut out = Vec::new();

    for i in eytzinger::sorted_indices(acc.k.len()) {
        let Some(r) = accounting_to_replicas(acc.k[i].pos) else { continue };
        let mut v = [0u64; 1];
        acc.read_counters(i, false, &mut v);
        out.push((r, v[0]));
    }
    out
}

/// Accounting entries of the requested kinds, with their current values.
pub fn fs_accounting_read(
    fs: &Fs,
    mut want: impl FnMut(&DiskAccountingPos) -> bool,
) -> Vec<(DiskAccountingPos, AccountingVal)> {
    let acc = fs.accounting.mark_lock.read();
    let mut out = Vec::new();

    for i in eytzinger::sorted_indices(acc.k.len()) {
        let pos = DiskAccountingPos::from_bpos(acc.k[i].pos);
        if !want(&pos) {
            continue;
        }
        let nr = acc.k[i].nr_counters;
        let mut v = [0u64; ACCOUNTING_MAX_COUNTERS];
        acc.read_counters(i, false, &mut v[..nr]);

        let val = AccountingVal { d: v[..nr].iter().map(|x| *x as i64).collect() };
        if !val.is_zero() {
            out.push((pos, val));
        }
    }
    out
}
