use std::fmt;

use serde::{Deserialize, Serialize};

use crate::accounting::AccountingVal;
use crate::dirent::Dirent;
use crate::inode::InodeUnpacked;
use crate::subvolume::Subvolume;
use crate::xattr::Xattr;

/// Position of a key in a btree. Ordered by (inode, offset, snapshot).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bpos {
    pub inode: u64,
    pub offset: u64,
    pub snapshot: u32,
}

pub const POS_MIN: Bpos = Bpos { inode: 0, offset: 0, snapshot: 0 };
pub const SPOS_MAX: Bpos = Bpos {
    inode: u64::MAX,
    offset: u64::MAX,
    snapshot: u32::MAX,
};

pub fn pos(inode: u64, offset: u64) -> Bpos {
    Bpos { inode, offset, snapshot: 0 }
}

pub fn spos(inode: u64, offset: u64, snapshot: u32) -> Bpos {
    Bpos { inode, offset, snapshot }
}

impl Bpos {
    /// The next position in (inode, offset, snapshot) order.
    pub fn successor(self) -> Bpos {
        if self.snapshot != u32::MAX {
            Bpos { snapshot: self.snapshot + 1, ..self }
        } else if self.offset != u64::MAX {
            Bpos { offset: self.offset + 1, snapshot: 0, ..self }
        } else {
            Bpos { inode: self.inode + 1, offset: 0, snapshot: 0 }
        }
    }

    pub fn with_snapshot(self, snapshot: u32) -> Bpos {
        Bpos { snapshot, ..self }
    }
}

impl fmt::Debug for Bpos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.inode, self.offset, self.snapshot)
    }
}

/// Equality/ordering on (inode, offset) only, ignoring the snapshot field.
#[inline(always)]
pub fn bkey_eq(l: Bpos, r: Bpos) -> bool {
    l.inode == r.inode && l.offset == r.offset
}

#[inline(always)]
pub fn bkey_lt(l: Bpos, r: Bpos) -> bool {
    if l.inode != r.inode {
        l.inode < r.inode
    } else {
        l.offset < r.offset
    }
}

#[inline(always)]
pub fn bkey_le(l: Bpos, r: Bpos) -> bool {
    if l.inode != r.inode {
        l.inode < r.inode
    } else {
        l.offset <= r.offset
    }
}

#[inline(always)]
pub fn bkey_gt(l: Bpos, r: Bpos) -> bool {
    bkey_lt(r, l)
}

/// Version stamp assigned at commit: (journal sequence, offset within that
/// journal buffer). Monotone across commits; zero only on invalid keys.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Serialize, Deserialize)]
pub struct BVersion {
    pub journal_seq: u64,
    pub offset: u32,
}

impl BVersion {
    pub const ZERO: BVersion = BVersion { journal_seq: 0, offset: 0 };

    pub fn is_zero(self) -> bool {
        self == BVersion::ZERO
    }
}

/// (subvolume, inode number): the identity of an inode in the namespace.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubvolInum {
    pub subvol: u32,
    pub inum: u64,
}

impl SubvolInum {
    pub fn new(subvol: u32, inum: u64) -> Self {
        SubvolInum { subvol, inum }
    }
}

impl fmt::Debug for SubvolInum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.subvol, self.inum)
    }
}

/// The typed value union stored in the trees.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum KeyValue {
    /// Point-delete of the exact key (write-buffer/update marker).
    Deleted,
    /// Shadows a key inherited from an ancestor snapshot without removing it
    /// there.
    Whiteout,
    Accounting(AccountingVal),
    Inode(InodeUnpacked),
    Dirent(Dirent),
    Subvolume(Subvolume),
    Xattr(Xattr),
}

impl KeyValue {
    pub fn is_visible(&self) -> bool {
        !matches!(self, KeyValue::Deleted | KeyValue::Whiteout)
    }
}

/// A key with its value, as staged in transactions, carried in the journal,
/// and stored in the trees.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct BkeyI {
    pub p: Bpos,
    pub version: BVersion,
    pub v: KeyValue,
}

impl BkeyI {
    pub fn new(p: Bpos, v: KeyValue) -> Self {
        BkeyI { p, version: BVersion::ZERO, v }
    }
}
