//! The accounting update pipeline: transaction-time queueing of deltas, and
//! their commit-time application to the in-memory table and the derived
//! usage aggregates.

use crate::accounting::{
    accounting_key_init, accounting_to_replicas, AccountingVal, DiskAccountingPos,
    ReplicasEntry,
};
use crate::bkey::{BkeyI, KeyValue};
use crate::btree::BtreeId;
use crate::errcode::{BchResult, Errcode};
use crate::fs::Fs;
use crate::fs_usage::{data_type_is_hidden, FsUsageBase};
use crate::trans::{commit_do, BtreeTrans};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AccountingMode {
    /// Commit-time application: replicas must be registered, aggregates are
    /// folded into the transaction's usage delta.
    Normal,
    /// Mount-time replay: skips the replicas-registration check, aggregates
    /// are rebuilt separately afterwards.
    Read,
    /// GC recount: deltas go to the shadow vector only.
    GcShadow,
}

/// Queue an accounting update on the transaction.
///
/// The normal path stages a write-buffer update against the accounting tree;
/// the GC path applies the delta straight into the shadow counters.
pub fn disk_accounting_mod(
    trans: &BtreeTrans,
    pos: DiskAccountingPos,
    deltas: &[i64],
    gc: bool,
) -> BchResult<()> {
    let k = accounting_key_init(pos, deltas);

    if !gc {
        trans.update_buffered(BtreeId::Accounting, k)
    } else {
        let mut unused = FsUsageBase::default();
        accounting_mem_apply(trans.fs, &k, AccountingMode::GcShadow, &mut unused)
    }
}

/// Shorthand: adjust cached sectors on one device.
pub fn mod_dev_cached_sectors(
    trans: &BtreeTrans,
    dev: u8,
    sectors: i64,
    gc: bool,
) -> BchResult<()> {
    disk_accounting_mod(
        trans,
        DiskAccountingPos::Replicas(ReplicasEntry::cached(dev)),
        &[sectors],
        gc,
    )
}

/// Apply one accounting key to the in-memory table.
///
/// Runs under the shared side of `mark_lock`; a missing entry forces the
/// upgrade protocol — drop shared, insert under exclusive, reacquire shared
/// and find again. A new `Replicas` entry that isn't registered in the
/// superblock fails with `NeedMarkReplicas` (unless replaying in `Read`
/// mode), before any counter moves.
pub fn accounting_mem_apply(
    fs: &Fs,
    k: &BkeyI,
    mode: AccountingMode,
    usage_delta: &mut FsUsageBase,
) -> BchResult<()> {
    let KeyValue::Accounting(val) = &k.v else {
        return Err(Errcode::Inval);
    };
    let gc = mode == AccountingMode::GcShadow;

    loop {
        {
            let acc = fs.accounting.mark_lock.read();
            if let Some(idx) = acc.find(k.p) {
                acc.mod_counters(idx, &val.d, k.version, gc);
                break;
            }
        }

        // Entry missing. New replicas entries must be registered in the
        // superblock before they can hold counters.
        if mode == AccountingMode::Normal {
            if let Some(r) = accounting_to_replicas(k.p) {
                if !fs.sb.read().replicas_marked(&r) {
                    return Err(Errcode::NeedMarkReplicas);
                }
            }
        }

        fs.accounting.mem_insert(k)?;
        // shared lock reacquired at the top; indices from before are stale
    }

    if mode == AccountingMode::Normal {
        apply_aggregates(fs, DiskAccountingPos::from_bpos(k.p), val, usage_delta);
    }
    Ok(())
}

/// Fold one applied delta into the derived aggregates.
fn apply_aggregates(
    fs: &Fs,
    pos: DiskAccountingPos,
    val: &AccountingVal,
    usage_delta: &mut FsUsageBase,
) {
    let d0 = val.d.first().copied().unwrap_or(0);

    match pos {
        DiskAccountingPos::NrInodes => {
            usage_delta.nr_inodes = usage_delta.nr_inodes.wrapping_add(d0 as u64);
        }
        DiskAccountingPos::PersistentReserved { nr_replicas } => {
            usage_delta.reserved = usage_delta
                .reserved
                .wrapping_add((d0 * nr_replicas as i64) as u64);
        }
        DiskAccountingPos::Replicas(r) => {
            usage_delta.data_type_to_base(r.data_type, d0);
        }
        DiskAccountingPos::DevDataType { dev, data_type } => {
            fs.dev_usage_acc(dev, data_type, &val.d);

            if data_type_is_hidden(data_type) {
                if let Some(m) = fs.sb.read().member(dev) {
                    usage_delta.hidden = usage_delta
                        .hidden
                        .wrapping_add((d0 * m.bucket_size as i64) as u64);
                }
            }
        }
        _ => (),
    }
}

/// Seed the free-space counter for a new device.
pub fn dev_usage_init(fs: &Fs, dev: u8, gc: bool) -> BchResult<()> {
    let buckets = {
        let sb = fs.sb.read();
        sb.member(dev).ok_or(Errcode::Inval)?.usable_buckets()
    };
    let v = [buckets as i64, 0, 0];

    let trans = BtreeTrans::new(fs);
    commit_do(&trans, |t| {
        disk_accounting_mod(
            t,
            DiskAccountingPos::DevDataType { dev, data_type: crate::fs_usage::DataType::Free },
            &v,
            gc,
        )
    })
}

/// Retire a device's usage counters: emit negating deltas for every
/// `DevDataType` key it owns, then flush and drop the zeroed keys.
pub fn dev_usage_remove(fs: &Fs, dev: u8) -> BchResult<()> {
    fs.write_buffer_flush();

    let trans = BtreeTrans::new(fs);
    for k in fs.btree.keys(BtreeId::Accounting) {
        let DiskAccountingPos::DevDataType { dev: d, data_type } =
            DiskAccountingPos::from_bpos(k.p)
        else {
            continue;
        };
        if d != dev {
            continue;
        }

        let mut v = [0u64; 3];
        fs.accounting.mem_read(k.p, &mut v);
        let neg: Vec<i64> = v.iter().map(|x| (*x as i64).wrapping_neg()).collect();

        commit_do(&trans, |t| {
            disk_accounting_mod(
                t,
                DiskAccountingPos::DevDataType { dev, data_type },
                &neg,
                false,
            )
        })?;
    }

    fs.write_buffer_flush();

    // drop the now-zero keys and compact the table
    for k in fs.btree.keys(BtreeId::Accounting) {
        if let DiskAccountingPos::DevDataType { dev: d, .. } = DiskAccountingPos::from_bpos(k.p) {
            if d == dev {
                fs.btree.point_write(BtreeId::Accounting, BkeyI::new(k.p, KeyValue::Deleted));
            }
        }
    }
    fs.accounting.mark_lock.write().compact();
    Ok(())
}
