//! Filesystem- and device-level usage aggregates, derived from the
//! accounting counters at commit time and rebuilt wholesale at mount.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, FromRepr};

use crate::errcode::BchResult;
use crate::percpu::PerCpuU64s;

/// What a bucket (or a replicas entry) holds.
#[derive(
    Copy, Clone, PartialEq, Eq, Debug, Display, EnumString, FromRepr,
    Serialize, Deserialize,
)]
#[repr(u8)]
#[strum(serialize_all = "snake_case")]
pub enum DataType {
    Free = 0,
    Sb = 1,
    Journal = 2,
    Btree = 3,
    User = 4,
    Cached = 5,
    Parity = 6,
    Stripe = 7,
    NeedGcGens = 8,
    NeedDiscard = 9,
}

pub const DATA_TYPE_NR: usize = 10;

pub fn data_type_from_u8(v: u8) -> Option<DataType> {
    DataType::from_repr(v)
}

/// Free/empty data types — not counted as used space.
pub fn data_type_is_empty(t: DataType) -> bool {
    matches!(t, DataType::Free | DataType::NeedGcGens | DataType::NeedDiscard)
}

/// Internal data types, not user-visible (superblock, journal).
pub fn data_type_is_hidden(t: DataType) -> bool {
    matches!(t, DataType::Sb | DataType::Journal)
}

/// Top-level usage totals, in sectors (nr_inodes excepted).
///
/// Maintained per-CPU; deltas are folded in at commit and the whole thing is
/// rebuilt from the accounting table at mount. Arithmetic is wrapping so
/// negative deltas net out against shards they didn't originate on.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct FsUsageBase {
    pub hidden: u64,
    pub btree: u64,
    pub data: u64,
    pub cached: u64,
    pub reserved: u64,
    pub nr_inodes: u64,
}

pub const FS_USAGE_NR: usize = 6;

impl FsUsageBase {
    pub fn to_array(self) -> [u64; FS_USAGE_NR] {
        [self.hidden, self.btree, self.data, self.cached, self.reserved, self.nr_inodes]
    }

    pub fn from_array(v: [u64; FS_USAGE_NR]) -> Self {
        FsUsageBase {
            hidden: v[0],
            btree: v[1],
            data: v[2],
            cached: v[3],
            reserved: v[4],
            nr_inodes: v[5],
        }
    }

    pub fn acc(&mut self, delta: &FsUsageBase) {
        self.hidden = self.hidden.wrapping_add(delta.hidden);
        self.btree = self.btree.wrapping_add(delta.btree);
        self.data = self.data.wrapping_add(delta.data);
        self.cached = self.cached.wrapping_add(delta.cached);
        self.reserved = self.reserved.wrapping_add(delta.reserved);
        self.nr_inodes = self.nr_inodes.wrapping_add(delta.nr_inodes);
    }

    /// Route a replicas-entry delta to the field its data type feeds.
    pub fn data_type_to_base(&mut self, t: DataType, sectors: i64) {
        let s = sectors as u64;
        match t {
            DataType::Btree => self.btree = self.btree.wrapping_add(s),
            DataType::User | DataType::Parity => self.data = self.data.wrapping_add(s),
            DataType::Cached => self.cached = self.cached.wrapping_add(s),
            _ => (),
        }
    }

    /// Everything that counts against capacity.
    pub fn used(&self) -> u64 {
        self.hidden
            .wrapping_add(self.btree)
            .wrapping_add(self.data)
            .wrapping_add(self.reserved)
    }
}

/// Per-CPU form of [`FsUsageBase`].
pub struct FsUsagePercpu(PerCpuU64s);

impl FsUsagePercpu {
    pub fn new() -> BchResult<Self> {
        Ok(FsUsagePercpu(PerCpuU64s::new(FS_USAGE_NR)?))
    }

    pub fn acc(&self, delta: &FsUsageBase) {
        let d = delta.to_array();
        let signed: Vec<i64> = d.iter().map(|v| *v as i64).collect();
        self.0.add(&signed);
    }

    pub fn read(&self) -> FsUsageBase {
        let mut v = [0u64; FS_USAGE_NR];
        self.0.read(&mut v);
        FsUsageBase::from_array(v)
    }

    /// Reset to a freshly-rebuilt value (mount-time replay).
    pub fn set(&self, usage: &FsUsageBase) {
        for (i, v) in usage.to_array().iter().enumerate() {
            self.0.set(i, *v);
        }
    }
}

/// Per-device usage, one row of counters per data type.
pub struct DevUsage {
    d: Vec<PerCpuU64s>,
}

pub const DEV_USAGE_BUCKETS: usize = 0;
pub const DEV_USAGE_SECTORS: usize = 1;
pub const DEV_USAGE_FRAGMENTED: usize = 2;

impl DevUsage {
    pub fn new() -> BchResult<Self> {
        let mut d = Vec::with_capacity(DATA_TYPE_NR);
        for _ in 0..DATA_TYPE_NR {
            d.push(PerCpuU64s::new(3)?);
        }
        Ok(DevUsage { d })
    }

    pub fn acc(&self, t: DataType, deltas: &[i64]) {
        self.d[t as usize].add(deltas);
    }

    /// Overwrite the counters for one data type (mount-time replay).
    pub fn set(&self, t: DataType, v: &[u64; 3]) {
        for (i, val) in v.iter().enumerate() {
            self.d[t as usize].set(i, *val);
        }
    }

    pub fn read(&self, t: DataType) -> [u64; 3] {
        let mut v = [0u64; 3];
        self.d[t as usize].read(&mut v);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_routing() {
        let mut base = FsUsageBase::default();
        base.data_type_to_base(DataType::Btree, 8);
        base.data_type_to_base(DataType::User, 16);
        base.data_type_to_base(DataType::Parity, 4);
        base.data_type_to_base(DataType::Cached, 2);
        base.data_type_to_base(DataType::Sb, 100);
        assert_eq!(base.btree, 8);
        assert_eq!(base.data, 20);
        assert_eq!(base.cached, 2);
        assert_eq!(base.hidden, 0);
    }

    #[test]
    fn percpu_roundtrip_with_negative_deltas() {
        let u = FsUsagePercpu::new().unwrap();
        u.acc(&FsUsageBase { data: 100, nr_inodes: 3, ..Default::default() });
        u.acc(&FsUsageBase {
            data: (-40i64) as u64,
            nr_inodes: (-1i64) as u64,
            ..Default::default()
        });
        let r = u.read();
        assert_eq!(r.data, 60);
        assert_eq!(r.nr_inodes, 2);
    }

    #[test]
    fn data_type_classes() {
        assert!(data_type_is_hidden(DataType::Sb));
        assert!(data_type_is_hidden(DataType::Journal));
        assert!(!data_type_is_hidden(DataType::User));
        assert!(data_type_is_empty(DataType::Free));
        assert!(!data_type_is_empty(DataType::Cached));
        assert_eq!(data_type_from_u8(4), Some(DataType::User));
        assert_eq!(data_type_from_u8(200), None);
    }

    #[test]
    fn dev_usage_set_then_read() {
        let du = DevUsage::new().unwrap();
        du.set(DataType::Free, &[100, 0, 0]);
        du.acc(DataType::User, &[1, 128, 7]);
        assert_eq!(du.read(DataType::Free), [100, 0, 0]);
        assert_eq!(du.read(DataType::User), [1, 128, 7]);
    }
}
