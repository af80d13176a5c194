//! Sorting primitives used by the criterion evaluation.

use rayon::prelude::*;
use std::cmp::Ordering;

/// Above this length the key/index sort runs on the rayon pool.
const PARALLEL_SORT_THRESHOLD: usize = 1 << 16;

/// Sorts `keys` ascending and applies the same permutation to `slave`.
///
/// `scratch` is reused between calls to avoid reallocating the pair buffer. The sort is
/// stable, so equal keys keep their incoming order.
pub fn sort_with_slave(keys: &mut [f64], slave: &mut [usize], scratch: &mut Vec<(f64, usize)>) {
    debug_assert_eq!(keys.len(), slave.len());
    scratch.clear();
    scratch.extend(keys.iter().copied().zip(slave.iter().copied()));

    let by_key = |a: &(f64, usize), b: &(f64, usize)| a.0.total_cmp(&b.0);
    if scratch.len() >= PARALLEL_SORT_THRESHOLD {
        scratch.par_sort_by(by_key);
    } else {
        scratch.sort_by(by_key);
    }

    for ((key, idx), (sorted_key, sorted_idx)) in
        keys.iter_mut().zip(slave.iter_mut()).zip(scratch.iter())
    {
        *key = *sorted_key;
        *idx = *sorted_idx;
    }
}

/// Replaces an ascending-sorted slice with 1-based ranks; ties share the mean rank of
/// their block.
///
/// The tie scan runs over the whole slice, so every block is resolved no matter how
/// long it is.
pub fn assign_tied_ranks(sorted: &mut [f64]) {
    let n = sorted.len();
    let mut j = 0;
    while j < n {
        let val = sorted[j];
        let mut k = j + 1;
        while k < n && sorted[k].total_cmp(&val) != Ordering::Greater {
            k += 1;
        }
        let rank = 0.5 * (j as f64 + k as f64 + 1.0);
        for slot in &mut sorted[j..k] {
            *slot = rank;
        }
        j = k;
    }
}
