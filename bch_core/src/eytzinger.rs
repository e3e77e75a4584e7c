//! Eytzinger tree layout: a full binary search tree stored in a flat array,
//! node `i`'s children at `2i+1` and `2i+2` (0-based). Each level is
//! contiguous in memory, so searches touch O(log n) cache lines and the
//! descent loop has no data-dependent branches on the array contents.
//!
//! The accounting table keeps its entries in this layout; searches run under
//! the shared side of `mark_lock` and never block.

use std::cmp::Ordering;

#[inline]
fn child(i: usize, right: bool) -> usize {
    2 * i + 1 + right as usize
}

/// Indices of `0..n` visited in sorted (inorder) order.
pub struct SortedIndices {
    n: usize,
    i: usize,
    stack: Vec<usize>,
}

impl Iterator for SortedIndices {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.i < self.n {
            self.stack.push(self.i);
            self.i = child(self.i, false);
        }
        let j = self.stack.pop()?;
        self.i = child(j, true);
        Some(j)
    }
}

/// Iterate eytzinger indices in sorted-comparator order.
pub fn sorted_indices(n: usize) -> SortedIndices {
    SortedIndices { n, i: 0, stack: Vec::new() }
}

/// Rearrange `data` into eytzinger order with respect to `cmp`.
///
/// Runs after every structural mutation of the accounting table; the caller
/// holds the exclusive side of the table lock.
pub fn sort_by<T, F>(data: &mut Vec<T>, mut cmp: F)
where
    F: FnMut(&T, &T) -> Ordering,
{
    data.sort_unstable_by(&mut cmp);

    let n = data.len();
    let mut slots: Vec<Option<T>> = data.drain(..).map(Some).collect();
    let mut out: Vec<Option<T>> = (0..n).map(|_| None).collect();

    for (rank, idx) in sorted_indices(n).enumerate() {
        out[idx] = slots[rank].take();
    }

    data.extend(out.into_iter().map(|v| v.unwrap()));
}

/// Exact search: index of the element for which `f` returns `Equal`.
///
/// `f(elem)` compares the probed element against the search key
/// (`Less` = element sorts before the key).
pub fn find<T, F>(data: &[T], mut f: F) -> Option<usize>
where
    F: FnMut(&T) -> Ordering,
{
    let n = data.len();
    let mut i = 0;

    while i < n {
        match f(&data[i]) {
            Ordering::Equal => return Some(i),
            ord => i = child(i, ord == Ordering::Less),
        }
    }
    None
}

/// Index of the smallest element that sorts >= the search key, if any.
pub fn find_ge<T, F>(data: &[T], mut f: F) -> Option<usize>
where
    F: FnMut(&T) -> Ordering,
{
    let n = data.len();
    let mut i = 0;
    let mut candidate = None;

    while i < n {
        if f(&data[i]) == Ordering::Less {
            i = child(i, true);
        } else {
            candidate = Some(i);
            i = child(i, false);
        }
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eytzinger_of(mut v: Vec<u64>) -> Vec<u64> {
        sort_by(&mut v, u64::cmp);
        v
    }

    #[test]
    fn layout_yields_sorted_inorder_walk() {
        for n in 0..64usize {
            let data = eytzinger_of((0..n as u64).rev().collect());
            let walked: Vec<u64> = sorted_indices(n).map(|i| data[i]).collect();
            let mut expect: Vec<u64> = (0..n as u64).collect();
            expect.sort_unstable();
            assert_eq!(walked, expect, "n={}", n);
        }
    }

    #[test]
    fn find_present_and_absent() {
        // pseudo-random insertion order, no duplicates
        let mut keys: Vec<u64> = (0..200u64).map(|i| i * 7 + 3).collect();
        let mut x = 0x9e3779b9u64;
        for i in (1..keys.len()).rev() {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            keys.swap(i, (x % (i as u64 + 1)) as usize);
        }

        let data = eytzinger_of(keys.clone());
        for k in &keys {
            let idx = find(&data, |e| e.cmp(k)).unwrap();
            assert_eq!(data[idx], *k);
        }
        assert_eq!(find(&data, |e| e.cmp(&2)), None);
        assert_eq!(find(&data, |e| e.cmp(&(7 * 300))), None);
    }

    #[test]
    fn find_ge_picks_successor() {
        let data = eytzinger_of(vec![10, 20, 30, 40, 50]);

        let at = |key: u64| find_ge(&data, |e| e.cmp(&key)).map(|i| data[i]);

        assert_eq!(at(5), Some(10));
        assert_eq!(at(10), Some(10));
        assert_eq!(at(11), Some(20));
        assert_eq!(at(50), Some(50));
        assert_eq!(at(51), None);
    }

    #[test]
    fn holds_after_incremental_inserts_and_removals() {
        let mut live: Vec<u64> = Vec::new();
        for k in [9u64, 1, 8, 2, 7, 3, 6, 4, 5, 0] {
            live.push(k);
            let data = eytzinger_of(live.clone());
            for want in &live {
                assert!(find(&data, |e| e.cmp(want)).is_some());
            }
        }
        // compaction: drop every even key, re-sort, re-check
        live.retain(|k| k % 2 == 1);
        let data = eytzinger_of(live.clone());
        for want in &live {
            assert!(find(&data, |e| e.cmp(want)).is_some());
        }
        assert_eq!(find(&data, |e| e.cmp(&4)), None);
    }
}
