//! Disk accounting.
//!
//! Two parallel sets of counters are kept in sync:
//!
//! - Persistent accounting, stored in the accounting tree and updated via
//!   write-buffer entries whose counters are deltas applied to the existing
//!   value when flushed (or at journal replay).
//! - In-memory accounting: an eytzinger array of accounting positions, each
//!   owning striped per-CPU counters. Cheap to read, not persistent.
//!
//! To update a counter: build a [`DiskAccountingPos`], the counter deltas
//! (1–[`ACCOUNTING_MAX_COUNTERS`] signed 64s), and call
//! `disk_accounting_mod()`. The commit path applies queued updates to the
//! in-memory table, assigns each a version stamp from the journal sequence,
//! and ensures replicas entries are marked in the superblock first.

pub mod gc;
pub mod mem;
pub mod update;

use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, FromRepr};

use crate::bkey::{BkeyI, Bpos, KeyValue};
use crate::btree::BtreeId;
use crate::errcode::{BchResult, Errcode};
use crate::fs_usage::{data_type_from_u8, DataType};

pub const ACCOUNTING_MAX_COUNTERS: usize = 3;

/// Size of a tree position in bytes — also the maximum accounting payload.
const BPOS_SIZE: usize = 20;

/// Most devices a replicas entry can name within one key.
pub const REPLICAS_MAX_DEVS: usize = BPOS_SIZE - 4;

#[derive(
    Copy, Clone, PartialEq, Eq, Debug, Display, EnumString, FromRepr,
    Serialize, Deserialize,
)]
#[repr(u8)]
#[strum(serialize_all = "snake_case")]
pub enum CompressionType {
    None = 0,
    Lz4Old = 1,
    Gzip = 2,
    Lz4 = 3,
    Zstd = 4,
    Incompressible = 5,
}

/// A set of devices holding replicas of one kind of data.
///
/// Canonical form keeps `devs` sorted ascending; two entries differing only
/// in device order must encode to the same key.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ReplicasEntry {
    pub data_type: DataType,
    pub nr_required: u8,
    pub devs: Vec<u8>,
}

impl ReplicasEntry {
    /// Entry for cached data on a single device. Cached data needs no
    /// durability, hence `nr_required` 0.
    pub fn cached(dev: u8) -> Self {
        ReplicasEntry {
            data_type: DataType::Cached,
            nr_required: 0,
            devs: vec![dev],
        }
    }

    pub fn canonicalize(&mut self) {
        self.devs.sort_unstable();
    }

    pub fn validate(&self) -> BchResult<()> {
        if self.devs.is_empty() || self.devs.len() > REPLICAS_MAX_DEVS {
            return Err(Errcode::Inval);
        }
        if self.nr_required as usize > self.devs.len()
            || (self.nr_required > 1 && self.nr_required as usize == self.devs.len())
        {
            return Err(Errcode::Inval);
        }
        for w in self.devs.windows(2) {
            if w[0] >= w[1] {
                return Err(Errcode::Inval);
            }
        }
        Ok(())
    }
}

impl fmt::Display for ReplicasEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} [",
            self.data_type,
            self.nr_required,
            self.devs.len()
        )?;
        for (i, d) in self.devs.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Accounting type tags, stable on-disk values.
const TAG_NR_INODES: u8 = 0;
const TAG_PERSISTENT_RESERVED: u8 = 1;
const TAG_REPLICAS: u8 = 2;
const TAG_DEV_DATA_TYPE: u8 = 3;
const TAG_COMPRESSION: u8 = 4;
const TAG_SNAPSHOT: u8 = 5;
const TAG_BTREE: u8 = 6;
const TAG_REBALANCE_WORK: u8 = 7;
pub const ACCOUNTING_TYPE_NR: u8 = 8;

/// The typed, in-memory form of an accounting key.
///
/// On disk the key is a tree position: the payload below is laid out
/// little-endian in a 20-byte buffer, tag first, then byte-reversed into the
/// position's (inode, offset, snapshot) fields. Big-endian hosts byte-swap
/// the position words on the way in and out, so the wire layout is the same
/// everywhere; [`DiskAccountingPos::to_wire`] is the canonical byte form.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DiskAccountingPos {
    NrInodes,
    PersistentReserved { nr_replicas: u8 },
    Replicas(ReplicasEntry),
    DevDataType { dev: u8, data_type: DataType },
    Compression { compression_type: CompressionType },
    Snapshot { id: u32 },
    Btree { id: u32 },
    RebalanceWork,
    /// Tolerated on read, never produced.
    Unknown(u8),
}

impl DiskAccountingPos {
    pub fn tag(&self) -> u8 {
        match self {
            Self::NrInodes => TAG_NR_INODES,
            Self::PersistentReserved { .. } => TAG_PERSISTENT_RESERVED,
            Self::Replicas(_) => TAG_REPLICAS,
            Self::DevDataType { .. } => TAG_DEV_DATA_TYPE,
            Self::Compression { .. } => TAG_COMPRESSION,
            Self::Snapshot { .. } => TAG_SNAPSHOT,
            Self::Btree { .. } => TAG_BTREE,
            Self::RebalanceWork => TAG_REBALANCE_WORK,
            Self::Unknown(t) => *t,
        }
    }

    /// Counter arity of this variant, `None` for unknown tags.
    pub fn expected_counters(&self) -> Option<usize> {
        match self {
            Self::DevDataType { .. } => Some(3),
            Self::Unknown(_) => None,
            _ => Some(1),
        }
    }

    /// Canonical little-endian wire bytes: tag, then the variant payload,
    /// zero-padded to the position size.
    pub fn to_wire(&self) -> [u8; BPOS_SIZE] {
        let mut raw = [0u8; BPOS_SIZE];
        match self {
            Self::NrInodes | Self::RebalanceWork => {
                raw[0] = self.tag();
            }
            Self::PersistentReserved { nr_replicas } => {
                raw[0] = TAG_PERSISTENT_RESERVED;
                raw[1] = *nr_replicas;
            }
            Self::Replicas(r) => {
                raw[0] = TAG_REPLICAS;
                raw[1] = r.data_type as u8;
                raw[2] = r.devs.len() as u8;
                raw[3] = r.nr_required;
                let n = r.devs.len().min(REPLICAS_MAX_DEVS);
                raw[4..4 + n].copy_from_slice(&r.devs[..n]);
            }
            Self::DevDataType { dev, data_type } => {
                raw[0] = TAG_DEV_DATA_TYPE;
                raw[1] = *dev;
                raw[2] = *data_type as u8;
            }
            Self::Compression { compression_type } => {
                raw[0] = TAG_COMPRESSION;
                raw[1] = *compression_type as u8;
            }
            Self::Snapshot { id } => {
                raw[0] = TAG_SNAPSHOT;
                raw[1..5].copy_from_slice(&id.to_le_bytes());
            }
            Self::Btree { id } => {
                raw[0] = TAG_BTREE;
                raw[1..5].copy_from_slice(&id.to_le_bytes());
            }
            Self::Unknown(t) => {
                raw[0] = *t;
            }
        }
        raw
    }

    /// Pack into a tree position: wire bytes are reversed into the position
    /// fields so that position order sorts accounting types together.
    pub fn to_bpos(&self) -> Bpos {
        let mut raw = self.to_wire();
        raw.reverse();

        Bpos {
            snapshot: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            offset: u64::from_le_bytes(raw[4..12].try_into().unwrap()),
            inode: u64::from_le_bytes(raw[12..20].try_into().unwrap()),
        }
    }

    pub fn from_bpos(p: Bpos) -> Self {
        let mut raw = [0u8; BPOS_SIZE];
        raw[0..4].copy_from_slice(&p.snapshot.to_le_bytes());
        raw[4..12].copy_from_slice(&p.offset.to_le_bytes());
        raw[12..20].copy_from_slice(&p.inode.to_le_bytes());
        raw.reverse();

        match raw[0] {
            TAG_NR_INODES => Self::NrInodes,
            TAG_PERSISTENT_RESERVED => Self::PersistentReserved { nr_replicas: raw[1] },
            TAG_REPLICAS => {
                let nr_devs = (raw[2] as usize).min(REPLICAS_MAX_DEVS);
                Self::Replicas(ReplicasEntry {
                    data_type: data_type_from_u8(raw[1]).unwrap_or(DataType::Free),
                    nr_required: raw[3],
                    devs: raw[4..4 + nr_devs].to_vec(),
                })
            }
            TAG_DEV_DATA_TYPE => Self::DevDataType {
                dev: raw[1],
                data_type: data_type_from_u8(raw[2]).unwrap_or(DataType::Free),
            },
            TAG_COMPRESSION => Self::Compression {
                compression_type: CompressionType::from_repr(raw[1])
                    .unwrap_or(CompressionType::None),
            },
            TAG_SNAPSHOT => Self::Snapshot {
                id: u32::from_le_bytes(raw[1..5].try_into().unwrap()),
            },
            TAG_BTREE => Self::Btree {
                id: u32::from_le_bytes(raw[1..5].try_into().unwrap()),
            },
            TAG_REBALANCE_WORK => Self::RebalanceWork,
            t => Self::Unknown(t),
        }
    }

    /// Payload length in wire bytes (tag included); bytes past this must be
    /// zero. `None` for unknown tags, which skip the padding check.
    fn payload_end(&self) -> Option<usize> {
        match self {
            Self::NrInodes | Self::RebalanceWork => Some(1),
            Self::PersistentReserved { .. } => Some(2),
            Self::Replicas(r) => Some(4 + r.devs.len()),
            Self::DevDataType { .. } => Some(3),
            Self::Compression { .. } => Some(2),
            Self::Snapshot { .. } | Self::Btree { .. } => Some(5),
            Self::Unknown(_) => None,
        }
    }
}

impl fmt::Display for DiskAccountingPos {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NrInodes => write!(f, "nr_inodes"),
            Self::PersistentReserved { nr_replicas } => {
                write!(f, "persistent_reserved replicas={}", nr_replicas)
            }
            Self::Replicas(r) => write!(f, "replicas {}", r),
            Self::DevDataType { dev, data_type } => {
                write!(f, "dev_data_type dev={} data_type={}", dev, data_type)
            }
            Self::Compression { compression_type } => {
                write!(f, "compression {}", compression_type)
            }
            Self::Snapshot { id } => write!(f, "snapshot id={}", id),
            Self::Btree { id } => {
                match u8::try_from(*id).ok().and_then(BtreeId::from_repr) {
                    Some(b) => write!(f, "btree={}", b),
                    None => write!(f, "btree=(unknown btree {})", id),
                }
            }
            Self::RebalanceWork => write!(f, "rebalance_work"),
            Self::Unknown(t) => write!(f, "unknown type {}", t),
        }
    }
}

/// The value of an accounting key: 1–3 signed 64-bit counters. In the tree
/// these are totals; in transaction updates and the journal they are deltas.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AccountingVal {
    pub d: Vec<i64>,
}

impl AccountingVal {
    pub fn nr_counters(&self) -> usize {
        self.d.len()
    }

    pub fn is_zero(&self) -> bool {
        self.d.iter().all(|v| *v == 0)
    }
}

/// Build the accounting key for one update. The position is canonicalized:
/// replicas device lists are sorted here, so permuted inputs land on the same
/// key.
pub fn accounting_key_init(mut pos: DiskAccountingPos, deltas: &[i64]) -> BkeyI {
    assert!(!deltas.is_empty() && deltas.len() <= ACCOUNTING_MAX_COUNTERS);

    if let DiskAccountingPos::Replicas(r) = &mut pos {
        r.canonicalize();
    }

    BkeyI::new(pos.to_bpos(), KeyValue::Accounting(AccountingVal { d: deltas.to_vec() }))
}

/// Merge `src` into `dst`: counters add, the version advances to the newer
/// of the two. Used to collapse same-position runs at replay.
pub fn accounting_accumulate(dst: &mut BkeyI, src: &BkeyI) {
    let (KeyValue::Accounting(d), KeyValue::Accounting(s)) = (&mut dst.v, &src.v) else {
        return;
    };

    if s.d.len() > d.d.len() {
        d.d.resize(s.d.len(), 0);
    }
    for (i, v) in s.d.iter().enumerate() {
        d.d[i] = d.d[i].wrapping_add(*v);
    }
    if src.version > dst.version {
        dst.version = src.version;
    }
}

/// The replicas entry a key registers in the superblock, if it is one.
pub fn accounting_to_replicas(p: Bpos) -> Option<ReplicasEntry> {
    match DiskAccountingPos::from_bpos(p) {
        DiskAccountingPos::Replicas(r) => Some(r),
        _ => None,
    }
}

/// Key validation, every rule a hard reject.
pub fn accounting_validate(k: &BkeyI) -> BchResult<()> {
    if k.version.is_zero() {
        log::error!("accounting key with version=0");
        return Err(Errcode::Inval);
    }

    let KeyValue::Accounting(v) = &k.v else {
        return Err(Errcode::Inval);
    };
    if v.d.is_empty() || v.d.len() > ACCOUNTING_MAX_COUNTERS {
        return Err(Errcode::Inval);
    }

    let acc = DiskAccountingPos::from_bpos(k.p);

    if let DiskAccountingPos::Replicas(r) = &acc {
        if r.devs.is_empty() {
            log::error!("accounting key replicas entry with nr_devs=0");
            return Err(Errcode::Inval);
        }
        if r.nr_required as usize > r.devs.len()
            || (r.nr_required > 1 && r.nr_required as usize == r.devs.len())
        {
            log::error!("accounting key replicas entry with bad nr_required");
            return Err(Errcode::Inval);
        }
        for w in r.devs.windows(2) {
            if w[0] >= w[1] {
                log::error!("accounting key replicas entry with unsorted devs");
                return Err(Errcode::Inval);
            }
        }
    }

    if let Some(end) = acc.payload_end() {
        let mut raw = [0u8; BPOS_SIZE];
        raw[0..4].copy_from_slice(&k.p.snapshot.to_le_bytes());
        raw[4..12].copy_from_slice(&k.p.offset.to_le_bytes());
        raw[12..20].copy_from_slice(&k.p.inode.to_le_bytes());
        raw.reverse();

        if raw[end..].iter().any(|b| *b != 0) {
            log::error!("junk at end of accounting key");
            return Err(Errcode::Inval);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bkey::BVersion;

    fn versioned(mut k: BkeyI) -> BkeyI {
        k.version = BVersion { journal_seq: 1, offset: 0 };
        k
    }

    #[test]
    fn codec_roundtrips_every_variant() {
        let cases = vec![
            DiskAccountingPos::NrInodes,
            DiskAccountingPos::PersistentReserved { nr_replicas: 2 },
            DiskAccountingPos::Replicas(ReplicasEntry {
                data_type: DataType::User,
                nr_required: 1,
                devs: vec![0, 2, 5],
            }),
            DiskAccountingPos::DevDataType { dev: 3, data_type: DataType::Journal },
            DiskAccountingPos::Compression { compression_type: CompressionType::Zstd },
            DiskAccountingPos::Snapshot { id: 0xdead },
            DiskAccountingPos::Btree { id: 2 },
            DiskAccountingPos::RebalanceWork,
        ];

        for pos in cases {
            let p = pos.to_bpos();
            assert_eq!(DiskAccountingPos::from_bpos(p), pos, "{}", pos);
        }
    }

    #[test]
    fn unknown_tag_survives_decode() {
        let mut raw = [0u8; 20];
        raw[0] = 42;
        raw.reverse();
        let p = Bpos {
            snapshot: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            offset: u64::from_le_bytes(raw[4..12].try_into().unwrap()),
            inode: u64::from_le_bytes(raw[12..20].try_into().unwrap()),
        };
        assert_eq!(DiskAccountingPos::from_bpos(p), DiskAccountingPos::Unknown(42));
    }

    #[test]
    fn replicas_device_order_is_canonicalized() {
        let a = accounting_key_init(
            DiskAccountingPos::Replicas(ReplicasEntry {
                data_type: DataType::User,
                nr_required: 1,
                devs: vec![5, 2],
            }),
            &[100],
        );
        let b = accounting_key_init(
            DiskAccountingPos::Replicas(ReplicasEntry {
                data_type: DataType::User,
                nr_required: 1,
                devs: vec![2, 5],
            }),
            &[100],
        );
        assert_eq!(a.p, b.p);
    }

    #[test]
    fn validate_rejects_version_zero() {
        let k = accounting_key_init(DiskAccountingPos::NrInodes, &[1]);
        assert_eq!(accounting_validate(&k), Err(Errcode::Inval));
        assert!(accounting_validate(&versioned(k)).is_ok());
    }

    #[test]
    fn validate_replicas_rules() {
        let bad_required = ReplicasEntry {
            data_type: DataType::User,
            nr_required: 2,
            devs: vec![0, 1],
        };
        let k = versioned(accounting_key_init(
            DiskAccountingPos::Replicas(bad_required),
            &[1],
        ));
        assert_eq!(accounting_validate(&k), Err(Errcode::Inval));

        // nr_required == nr_devs is fine when it's 1
        let ok = ReplicasEntry {
            data_type: DataType::User,
            nr_required: 1,
            devs: vec![4],
        };
        let k = versioned(accounting_key_init(DiskAccountingPos::Replicas(ok), &[1]));
        assert!(accounting_validate(&k).is_ok());
    }

    #[test]
    fn validate_rejects_junk_past_payload() {
        let mut raw = [0u8; 20];
        raw[0] = TAG_NR_INODES;
        raw[7] = 0xff;
        raw.reverse();
        let p = Bpos {
            snapshot: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            offset: u64::from_le_bytes(raw[4..12].try_into().unwrap()),
            inode: u64::from_le_bytes(raw[12..20].try_into().unwrap()),
        };
        let k = versioned(BkeyI::new(p, KeyValue::Accounting(AccountingVal { d: vec![0] })));
        assert_eq!(accounting_validate(&k), Err(Errcode::Inval));
    }

    #[test]
    fn accumulate_adds_and_takes_newer_version() {
        let mut dst = versioned(accounting_key_init(DiskAccountingPos::NrInodes, &[10]));
        let mut src = accounting_key_init(DiskAccountingPos::NrInodes, &[32]);
        src.version = BVersion { journal_seq: 7, offset: 1 };

        accounting_accumulate(&mut dst, &src);
        assert_eq!(dst.v, KeyValue::Accounting(AccountingVal { d: vec![42] }));
        assert_eq!(dst.version, src.version);
    }

    #[test]
    fn wire_form_is_position_order_compatible() {
        // Same-type keys must sort adjacently in the tree.
        let a = DiskAccountingPos::DevDataType { dev: 0, data_type: DataType::Free }.to_bpos();
        let b = DiskAccountingPos::DevDataType { dev: 1, data_type: DataType::Free }.to_bpos();
        let c = DiskAccountingPos::Snapshot { id: 0 }.to_bpos();
        assert!(a < b);
        assert!(b < c);
    }
}
