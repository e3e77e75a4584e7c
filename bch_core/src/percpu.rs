//! Striped counters: the userspace stand-in for kernel per-CPU counters.
//!
//! Each logical counter is split across one shard per hardware thread.
//! Writers touch only their own shard (plain relaxed stores and adds, no
//! cross-shard contention on the hot path); readers sum all shards with
//! wrapping arithmetic, so concurrent signed deltas always net out.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::errcode::{BchResult, Errcode};

/// Number of counter shards, fixed for the life of the process.
pub fn nr_shards() -> usize {
    static NR: OnceLock<usize> = OnceLock::new();
    *NR.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

/// Shard index of the calling thread; the analogue of the CPU id.
///
/// Thread ids are handed out sequentially and folded onto the shard count,
/// so a thread always hits the same shard and shards stay evenly loaded.
pub fn this_shard() -> usize {
    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static ID: Cell<usize> = Cell::new(usize::MAX);
    }

    ID.with(|id| {
        if id.get() == usize::MAX {
            id.set(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get() % nr_shards()
    })
}

/// A vector of `nr_counters` striped u64 counters.
///
/// Layout is shard-major: shard `s`'s counters live at `v[s * nr .. (s+1) * nr]`.
pub struct PerCpuU64s {
    nr: usize,
    v: Box<[AtomicU64]>,
}

impl PerCpuU64s {
    /// Allocate; on allocation failure the enclosing operation fails with
    /// `NomemDiskAccounting` and no state has changed.
    pub fn new(nr_counters: usize) -> BchResult<Self> {
        let len = nr_counters * nr_shards();
        let mut v = Vec::new();
        v.try_reserve_exact(len)
            .map_err(|_| Errcode::NomemDiskAccounting)?;
        v.extend((0..len).map(|_| AtomicU64::new(0)));

        Ok(PerCpuU64s {
            nr: nr_counters,
            v: v.into_boxed_slice(),
        })
    }

    pub fn nr_counters(&self) -> usize {
        self.nr
    }

    /// Add signed deltas into the caller's shard only.
    pub fn add(&self, deltas: &[i64]) {
        debug_assert!(deltas.len() <= self.nr);
        let base = this_shard() * self.nr;
        for (i, d) in deltas.iter().enumerate() {
            self.v[base + i].fetch_add(*d as u64, Ordering::Relaxed);
        }
    }

    /// Sum counter `i` across all shards.
    pub fn get(&self, i: usize) -> u64 {
        let mut sum = 0u64;
        for shard in 0..nr_shards() {
            sum = sum.wrapping_add(self.v[shard * self.nr + i].load(Ordering::Relaxed));
        }
        sum
    }

    /// Read the first `out.len()` counters.
    pub fn read(&self, out: &mut [u64]) {
        for (i, o) in out.iter_mut().enumerate() {
            *o = if i < self.nr { self.get(i) } else { 0 };
        }
    }

    /// Overwrite counter `i`'s total: the caller's shard takes the value,
    /// every other shard is zeroed.
    pub fn set(&self, i: usize, val: u64) {
        let me = this_shard();
        for shard in 0..nr_shards() {
            let v = if shard == me { val } else { 0 };
            self.v[shard * self.nr + i].store(v, Ordering::Relaxed);
        }
    }

    pub fn is_zero(&self) -> bool {
        (0..self.nr).all(|i| self.get(i) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn signed_deltas_net_out() {
        let c = PerCpuU64s::new(2).unwrap();
        c.add(&[100, -7]);
        c.add(&[-40, 7]);
        assert_eq!(c.get(0), 60);
        assert_eq!(c.get(1), 0);
    }

    #[test]
    fn set_overrides_all_shards() {
        let c = PerCpuU64s::new(1).unwrap();
        c.add(&[123]);
        c.set(0, 17);
        assert_eq!(c.get(0), 17);
        assert!(!c.is_zero());
        c.set(0, 0);
        assert!(c.is_zero());
    }

    #[test]
    fn concurrent_adds_sum_exactly() {
        let c = Arc::new(PerCpuU64s::new(1).unwrap());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        c.add(&[3]);
                        c.add(&[-2]);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(c.get(0), 8 * 10_000);
    }

    #[test]
    fn read_pads_missing_counters_with_zero() {
        let c = PerCpuU64s::new(1).unwrap();
        c.add(&[5]);
        let mut out = [0u64; 3];
        c.read(&mut out);
        assert_eq!(out, [5, 0, 0]);
    }
}
