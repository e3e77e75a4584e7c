//! Transactions: staged multi-tree updates with all-or-nothing commit.
//!
//! Restart is an explicit result, not unwinding: any commit (and some lock
//! operations) can return `TransactionRestart`, and every operation runs
//! inside a [`lockrestart_do`] / [`commit_do`] loop that rewinds its
//! iterators and reruns the body. Nothing staged survives a restart.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::accounting::update::{self, AccountingMode};
use crate::accounting::{accounting_accumulate, accounting_to_replicas};
use crate::bkey::{bkey_eq, BVersion, BkeyI, Bpos, KeyValue};
use crate::btree::BtreeId;
use crate::errcode::{BchResult, Errcode};
use crate::fs::Fs;
use crate::fs_usage::FsUsageBase;
use crate::journal::JournalKey;

bitflags! {
    pub struct BtreeIterFlags: u32 {
        /// Will write through this iterator; take intent locks.
        const INTENT = 1 << 0;
        const PREFETCH = 1 << 1;
        /// Iterate raw keys, no snapshot filtering.
        const ALL_SNAPSHOTS = 1 << 2;
        /// Reads observe this transaction's staged updates.
        const WITH_UPDATES = 1 << 3;
    }
}

pub struct BtreeTrans<'f> {
    pub fs: &'f Fs,
    updates: Mutex<Vec<(BtreeId, BkeyI)>>,
    acc_updates: Mutex<Vec<BkeyI>>,
    restart_count: AtomicU32,
}

impl<'f> BtreeTrans<'f> {
    pub fn new(fs: &'f Fs) -> Self {
        BtreeTrans {
            fs,
            updates: Mutex::new(Vec::new()),
            acc_updates: Mutex::new(Vec::new()),
            restart_count: AtomicU32::new(0),
        }
    }

    /// Reset to a clean slate; called at the top of every retry loop.
    pub fn begin(&self) -> u32 {
        self.updates.lock().clear();
        self.acc_updates.lock().clear();
        self.restart_count.fetch_add(1, Ordering::Relaxed)
    }

    /// Stage a point write; a later update to the same position replaces an
    /// earlier one.
    pub fn update(&self, btree: BtreeId, k: BkeyI) -> BchResult<()> {
        let mut updates = self.updates.lock();
        if let Some(u) = updates.iter_mut().find(|(b, u)| *b == btree && u.p == k.p) {
            u.1 = k;
        } else {
            updates.push((btree, k));
        }
        Ok(())
    }

    /// Stage an accounting delta on the write-buffer list. Same-position
    /// deltas within one commit merge additively.
    pub fn update_buffered(&self, btree: BtreeId, k: BkeyI) -> BchResult<()> {
        debug_assert_eq!(btree, BtreeId::Accounting);
        let mut acc = self.acc_updates.lock();
        if let Some(u) = acc.iter_mut().find(|u| u.p == k.p) {
            accounting_accumulate(u, &k);
        } else {
            acc.push(k);
        }
        Ok(())
    }

    /// This transaction's staged update at (inode, offset), if any.
    pub fn staged(&self, btree: BtreeId, pos: Bpos) -> Option<BkeyI> {
        self.updates
            .lock()
            .iter()
            .rev()
            .find(|(b, u)| *b == btree && bkey_eq(u.p, pos))
            .map(|(_, u)| u.clone())
    }

    /// The lowest staged update at or after `from` in one tree.
    pub fn staged_next(&self, btree: BtreeId, from: Bpos) -> Option<(Bpos, KeyValue)> {
        self.updates
            .lock()
            .iter()
            .filter(|(b, u)| *b == btree && u.p >= from)
            .min_by_key(|(_, u)| u.p)
            .map(|(_, u)| (u.p, u.v.clone()))
    }

    /// Drop btree locks (e.g. to wait on a freeing inode). Iterators are
    /// invalidated; the caller must relock and re-traverse.
    pub fn unlock(&self) {}

    pub fn relock(&self) -> BchResult<()> {
        Ok(())
    }

    /// Commit every staged update.
    ///
    /// Assigns the version stamp from the journal sequence, applies
    /// accounting deltas to the in-memory counters (registering replicas
    /// entries in the superblock first, via the `NeedMarkReplicas` retry),
    /// folds the usage delta, point-writes the rest, and appends everything
    /// to the journal.
    pub fn commit(&self) -> BchResult<()> {
        self.fs.check_may_write()?;
        self.fs.maybe_inject_restart()?;

        let _commit = self.fs.commit_lock.lock();

        let mut acc = self.acc_updates.lock();
        let mut updates = self.updates.lock();

        let seq = self.fs.journal.next_seq();
        for (i, k) in acc.iter_mut().enumerate() {
            k.version = BVersion { journal_seq: seq, offset: i as u32 };
        }

        loop {
            match self.apply_accounting(&acc) {
                Ok(()) => break,
                Err(Errcode::NeedMarkReplicas) => {
                    // Mark every replicas entry this commit touches, then
                    // retry the application.
                    let mut sb = self.fs.sb.write();
                    for k in acc.iter() {
                        if let Some(r) = accounting_to_replicas(k.p) {
                            sb.mark_replicas(&r)?;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let mut jkeys: Vec<JournalKey> = acc
            .iter()
            .map(|k| JournalKey { btree: BtreeId::Accounting, k: k.clone() })
            .collect();

        for (i, (btree, k)) in updates.iter().enumerate() {
            let mut k = k.clone();
            k.version = BVersion { journal_seq: seq, offset: (acc.len() + i) as u32 };
            self.fs.btree.point_write(*btree, k.clone());
            jkeys.push(JournalKey { btree: *btree, k });
        }

        self.fs.journal.append(jkeys);

        acc.clear();
        updates.clear();
        Ok(())
    }

    /// Apply the accounting updates to the in-memory table. On failure the
    /// already-applied prefix is reverted with negated deltas, so the caller
    /// can mark replicas (or give up) and retry from scratch.
    fn apply_accounting(&self, acc: &[BkeyI]) -> BchResult<()> {
        let mut usage_delta = FsUsageBase::default();
        let mut err = Ok(());
        let mut applied = 0;

        for k in acc {
            match update::accounting_mem_apply(
                self.fs,
                k,
                AccountingMode::Normal,
                &mut usage_delta,
            ) {
                Ok(()) => applied += 1,
                Err(e) => {
                    err = Err(e);
                    break;
                }
            }
        }

        if err.is_err() {
            for k in &acc[..applied] {
                let mut rev = k.clone();
                if let KeyValue::Accounting(v) = &mut rev.v {
                    for d in &mut v.d {
                        *d = d.wrapping_neg();
                    }
                }
                let _ = update::accounting_mem_apply(
                    self.fs,
                    &rev,
                    AccountingMode::Normal,
                    &mut usage_delta,
                );
            }
            return err;
        }

        self.fs.usage.acc(&usage_delta);
        Ok(())
    }
}

/// Retry `f` until it stops returning a transaction restart.
pub fn lockrestart_do<T, F>(trans: &BtreeTrans, mut f: F) -> BchResult<T>
where
    F: FnMut(&BtreeTrans) -> BchResult<T>,
{
    loop {
        trans.begin();

        match f(trans) {
            Err(e) if e.matches(Errcode::TransactionRestart) => continue,
            r => return r,
        }
    }
}

/// Run `f` and commit, retrying the whole body on restart.
pub fn commit_do<T, F>(trans: &BtreeTrans, mut f: F) -> BchResult<T>
where
    F: FnMut(&BtreeTrans) -> BchResult<T>,
{
    lockrestart_do(trans, |t| {
        let v = f(t)?;
        t.commit()?;
        Ok(v)
    })
}

pub struct BtreeIter<'t, 'f> {
    trans: &'t BtreeTrans<'f>,
    btree: BtreeId,
    pub pos: Bpos,
    flags: BtreeIterFlags,
}

impl<'t, 'f> BtreeIter<'t, 'f> {
    pub fn new(
        trans: &'t BtreeTrans<'f>,
        btree: BtreeId,
        pos: Bpos,
        flags: BtreeIterFlags,
    ) -> Self {
        BtreeIter { trans, btree, pos, flags }
    }

    pub fn set_pos(&mut self, pos: Bpos) {
        self.pos = pos;
    }

    pub fn set_snapshot(&mut self, snapshot: u32) {
        self.pos.snapshot = snapshot;
    }

    /// Revalidate after the position or snapshot changed, or after any
    /// suspension point.
    pub fn traverse(&mut self) -> BchResult<()> {
        Ok(())
    }

    /// The key at the iterator position (snapshot-filtered unless
    /// ALL_SNAPSHOTS), or `None` for an empty slot.
    pub fn peek_slot(&self) -> BchResult<Option<BkeyI>> {
        if self.flags.contains(BtreeIterFlags::WITH_UPDATES) {
            if let Some(u) = self.trans.staged(self.btree, self.pos) {
                return Ok(Some(u).filter(|u| u.v.is_visible()));
            }
        }

        let fs = self.trans.fs;
        if self.flags.contains(BtreeIterFlags::ALL_SNAPSHOTS) {
            Ok(fs.btree.get_exact(self.btree, self.pos))
        } else {
            let snapshots = fs.snapshots.read();
            Ok(fs.btree.lookup_visible(self.btree, self.pos, &snapshots))
        }
    }

    /// Next key from the iterator position through `end` (inclusive),
    /// advancing the position to the found key.
    pub fn peek_max(&mut self, end: Bpos) -> BchResult<Option<BkeyI>> {
        let fs = self.trans.fs;

        if self.flags.contains(BtreeIterFlags::ALL_SNAPSHOTS) {
            let k = fs.btree.peek_raw(self.btree, self.pos);
            return Ok(match k {
                Some(k) if k.p <= end => {
                    self.pos = k.p;
                    Some(k)
                }
                _ => None,
            });
        }

        let snapshots = fs.snapshots.read();
        match fs.btree.peek_visible_range(self.btree, self.pos, end, &snapshots) {
            Some(k) => {
                self.pos = Bpos {
                    inode: k.p.inode,
                    offset: k.p.offset,
                    snapshot: self.pos.snapshot,
                };
                Ok(Some(k))
            }
            None => Ok(None),
        }
    }

    /// Step past the current position.
    pub fn advance(&mut self) {
        if self.flags.contains(BtreeIterFlags::ALL_SNAPSHOTS) {
            self.pos = self.pos.successor();
        } else if self.pos.offset < u64::MAX {
            self.pos.offset += 1;
        } else {
            self.pos.inode += 1;
            self.pos.offset = 0;
        }
    }

    /// Stage a write at the iterator's position. Intent iterators only.
    pub fn write(&self, v: KeyValue) -> BchResult<()> {
        if self.flags.contains(BtreeIterFlags::INTENT) {
            self.trans.update(self.btree, BkeyI::new(self.pos, v))
        } else {
            Err(Errcode::Inval)
        }
    }
}
