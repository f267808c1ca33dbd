//! Depth-first seed search with backtracking, shared by [`crate::Consensus`]
//! and [`crate::Function`].

use crate::bits::UnalignedBitVector;
use crate::layout::{TreeLayout, TreeTask};
use crate::stats::BuildStatsCollector;
use crate::utils::remix;

/// Number of leading bits of the storage reserved for the root seed.
pub(crate) const ROOT_SEED_BITS: usize = 64;

/// Whether `key` goes to the left half under `seed`.
#[inline(always)]
pub(crate) fn to_left(key: u64, seed: u64) -> bool {
    remix(key.wrapping_add(seed)) & 1 != 0
}

/// A seed is successful iff it sends exactly half of the keys to the left.
#[inline]
pub(crate) fn is_seed_successful(keys: &[u64], seed: u64) -> bool {
    let num_to_left = keys.iter().filter(|key| to_left(**key, seed)).count();
    num_to_left == keys.len() / 2
}

/// Unstable in-place partition moving the keys that go left under `seed`
/// to the front. Order within the halves does not matter: seed success
/// depends only on counts.
pub(crate) fn partition_by_seed(keys: &mut [u64], seed: u64) {
    let mut left = 0;
    let mut right = keys.len();
    while left < right {
        if to_left(keys[left], seed) {
            left += 1;
        } else {
            right -= 1;
            keys.swap(left, right);
        }
    }
}

/// Searches seeds for every splitting task of `nbuckets` consecutive trees,
/// in storage order, writing them into `bits`. `keys` holds the trees' keys
/// back to back and is partitioned in place as the splits succeed.
///
/// Returns `false` when backtracking runs out of the very first task; the
/// storage is left zeroed then, ready for a retry under a fresh root seed.
pub(crate) fn find_seeds(keys: &mut [u64], layout: &TreeLayout, bits: &mut UnalignedBitVector, nbuckets: usize) -> bool {
    let k = 1usize << layout.log2k();
    let mut task = TreeTask::new(layout, 0, 0, 0, nbuckets);
    let mut seed = bits.read_at(task.end_position + ROOT_SEED_BITS);
    loop {
        let keys_begin = task.bucket * k + task.index * task.task_size;
        let keys_this_task = &mut keys[keys_begin..keys_begin + task.task_size];
        // candidates are tried from the inherited neighbor context upwards,
        // through the whole window, inclusive
        let max_seed = seed | task.seed_mask;
        let mut success = false;
        loop {
            if is_seed_successful(keys_this_task, seed) {
                success = true;
                break;
            }
            if seed == max_seed {
                break;
            }
            seed += 1;
        }
        if success {
            if task.task_size > 2 { // no need to partition the leaf layer
                partition_by_seed(keys_this_task, seed);
            }
            bits.write_to(task.end_position + ROOT_SEED_BITS, seed);
            task.next();
            if task.is_end() {
                return true;
            }
            seed = bits.read_at(task.end_position + ROOT_SEED_BITS);
        } else {
            // backtrack over all tasks that are at their max seed
            loop {
                seed &= !task.seed_mask;
                bits.write_to(task.end_position + ROOT_SEED_BITS, seed);
                if task.is_first() {
                    return false;
                }
                task.previous();
                seed = bits.read_at(task.end_position + ROOT_SEED_BITS);
                if seed & task.seed_mask != task.seed_mask {
                    break;
                }
            }
            seed += 1; // restart the revived task with its next candidate
        }
    }
}

/// Runs [`find_seeds`] under successive root seeds until the search succeeds.
/// Returns `false` after exhausting the root-seed space, which has never been
/// observed with reasonable overheads.
pub(crate) fn search_with_root_seed<BS: BuildStatsCollector>(
    keys: &mut [u64], layout: &TreeLayout, bits: &mut UnalignedBitVector,
    nbuckets: usize, stats: &mut BS,
) -> bool {
    for root_seed in 0..1u64 << (ROOT_SEED_BITS - 1) {
        bits.write_to(ROOT_SEED_BITS, root_seed);
        if root_seed != 0 {
            stats.root_seed_changed(root_seed);
        }
        if find_seeds(keys, layout, bits, nbuckets) {
            stats.end(true);
            return true;
        }
    }
    stats.end(false);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_by_seed() {
        let mut keys: Vec<u64> = (0..64u64).map(|i| i.wrapping_mul(0x9e3779b97f4a7c15)).collect();
        let seed = 12345;
        partition_by_seed(&mut keys, seed);
        let boundary = keys.iter().position(|key| !to_left(*key, seed)).unwrap_or(keys.len());
        assert!(keys[..boundary].iter().all(|key| to_left(*key, seed)));
        assert!(keys[boundary..].iter().all(|key| !to_left(*key, seed)));
        assert_eq!(keys.len(), 64);
    }

    #[test]
    fn test_successful_seed_splits_in_half() {
        let keys: Vec<u64> = (0..256u64).map(|i| i.wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(7)).collect();
        let seed = (0..).find(|seed| is_seed_successful(&keys, *seed)).unwrap();
        let count = keys.iter().filter(|key| to_left(**key, seed)).count();
        assert_eq!(count, 128);
    }
}
