//! Storage layout of the splitting trees and cursors over their tasks.
//!
//! The storage has to be laid out in exactly the order in which the seeds are
//! searched for consensus to work: bits of a successful seed leak into the
//! windows of the neighboring tasks and become part of their seed context.

use dyn_size_of::GetSize;

use crate::utils::int_log2;

/// Optimal number of bits to encode a split of m = 2^i keys into equal halves,
/// i.e. log₂(2^m / C(m, m/2)), for i = 0..=20.
///
/// sage: print(0, [N(log((2**(2**i))/binomial(2**i, (2**i)/2), 2)) for i in [1..20]], sep=', ')
const OPTIMAL_BITS_FOR_SPLIT: [f64; 21] = [0.0, 1.00000000000000, 1.41503749927884, 1.87071698305503,
    2.34827556689194, 2.83701728740494, 3.33138336299656, 3.82856579982622, 4.32715694302912, 4.82645250522622,
    5.32610028514914, 5.82592417496365, 6.32583611985253, 6.82579209229467, 7.32577007851546, 7.82575907162581,
    8.32575356818099, 8.82575081645857, 9.32574944059737, 9.82574875266676, 10.3257484087015];

/// Number of micro-bits per bit. Bit quantities are kept in this fixed-point
/// unit, since repeated floating-point evaluation could disagree with an
/// earlier one and corrupt the layout.
const MICRO_BITS_PER_BIT: u64 = 1 << 20;

/// Returns the `width`-bit all-ones mask. Windows wider than a word are
/// searched through their low 64 bits only.
#[inline(always)]
pub(crate) const fn seed_mask_for_width(width: u32) -> u64 {
    if width >= 64 { u64::MAX } else { (1u64 << width) - 1 }
}

/// Bit positions of the seeds in a splitting tree over k = 2^`log2k` keys.
///
/// All positions are derived from the same integer micro-bit tables, so any
/// two evaluations agree, including when one implies an adjacent task's
/// position. Computed once per (k, overhead) pair.
pub struct TreeLayout {
    log2k: u32,
    /// Micro-bits per split at each level; larger levels receive a
    /// super-linear share of the overhead, where each trial is more expensive.
    micro_bits_for_split: Box<[u64]>,
    /// Cumulative micro-bits of all levels below; `log2k + 1` entries.
    micro_bits_level_base: Box<[u64]>,
}

impl TreeLayout {
    /// Layout of a tree splitting `k` keys with `overhead` extra bits per split
    /// beyond the information-theoretic minimum.
    pub fn new(k: usize, overhead: f64) -> Self {
        assert!(k >= 2 && k.is_power_of_two(), "tree size must be a power of two, got {}", k);
        assert!(overhead > 0.0, "overhead must be positive, got {}", overhead);
        let log2k = int_log2(k);
        assert!((log2k as usize) < OPTIMAL_BITS_FOR_SPLIT.len(), "tree size must be at most 2^20");
        let micro_bits_for_split: Box<[u64]> = (0..log2k).map(|level| {
            let split_size = (1u64 << (log2k - level)) as f64;
            let bits = OPTIMAL_BITS_FOR_SPLIT[(log2k - level) as usize]
                + overhead / 3.4 * split_size.powf(0.75);
            (MICRO_BITS_PER_BIT as f64 * bits).ceil() as u64
        }).collect();
        let mut micro_bits_level_base = Vec::with_capacity(log2k as usize + 1);
        let mut micro_bits = 0;
        for level in 0..log2k {
            micro_bits_level_base.push(micro_bits);
            micro_bits += micro_bits_for_split[level as usize] << level;
        }
        micro_bits_level_base.push(micro_bits);
        Self { log2k, micro_bits_for_split, micro_bits_level_base: micro_bits_level_base.into_boxed_slice() }
    }

    #[inline(always)] pub fn log2k(&self) -> u32 { self.log2k }

    /// Number of keys split by each task at `level`.
    #[inline(always)] pub fn task_size(&self, level: u32) -> usize { 1 << (self.log2k - level) }

    /// Number of tasks at `level` of a single tree.
    #[inline(always)] pub fn tasks(&self, level: u32) -> usize { 1 << level }

    /// First bit position of the seed window of task (`level`, `index`)
    /// in the depth-first storage order. Accepts `(log2k, 0)` as the
    /// one-past-the-end position.
    #[inline]
    pub fn seed_start(&self, level: u32, index: usize) -> usize {
        let micro_bits = self.micro_bits_level_base[level as usize]
            + if index == 0 { 0 } else { self.micro_bits_for_split[level as usize] * index as u64 };
        ((micro_bits + MICRO_BITS_PER_BIT - 1) / MICRO_BITS_PER_BIT) as usize
    }

    /// One-past-the-end bit position of the seed window of task (`level`, `index`):
    /// the start of the next task in depth-first order.
    #[inline]
    pub fn seed_end(&self, level: u32, index: usize) -> usize {
        if index + 1 < self.tasks(level) {
            self.seed_start(level, index + 1)
        } else {
            self.seed_start(level + 1, 0)
        }
    }

    /// Total number of bits occupied by one tree in the depth-first storage.
    #[inline]
    pub fn tree_bits(&self) -> usize {
        self.seed_start(self.log2k, 0)
    }

    /// First bit position of the seed window of task `index` within the
    /// levelwise storage of its level. The levelwise storage keeps each level
    /// in its own vector, so positions are relative to the level, with plain
    /// (non-cumulative) rounding.
    #[inline]
    pub fn level_position(&self, level: u32, index: usize) -> usize {
        ((self.micro_bits_for_split[level as usize] * index as u64) / MICRO_BITS_PER_BIT) as usize
    }
}

impl GetSize for TreeLayout {
    fn size_bytes_dyn(&self) -> usize {
        self.micro_bits_for_split.size_bytes_dyn() + self.micro_bits_level_base.size_bytes_dyn()
    }
    const USES_DYN_MEM: bool = true;
}

/// Cursor over the splitting tasks of `nbuckets` consecutive trees in search
/// order: bucket-major, level-major, index-minor. Caches the storage window
/// of the current task.
pub(crate) struct TreeTask<'a> {
    layout: &'a TreeLayout,
    pub level: u32,
    pub index: usize,
    pub bucket: usize,
    nbuckets: usize,
    pub task_size: usize,
    tasks_this_level: usize,
    /// One-past-the-end bit position of the current seed window,
    /// relative to the start of the tree storage.
    pub end_position: usize,
    pub seed_width: u32,
    pub seed_mask: u64,
}

impl<'a> TreeTask<'a> {
    pub fn new(layout: &'a TreeLayout, level: u32, index: usize, bucket: usize, nbuckets: usize) -> Self {
        let mut task = Self {
            layout, level, index, bucket, nbuckets,
            task_size: 0, tasks_this_level: 0, end_position: 0, seed_width: 0, seed_mask: 0,
        };
        task.update_properties();
        task
    }

    fn update_properties(&mut self) {
        self.task_size = self.layout.task_size(self.level);
        self.tasks_this_level = self.layout.tasks(self.level);
        let tree_offset = self.bucket * self.layout.tree_bits();
        let start_position = tree_offset + self.layout.seed_start(self.level, self.index);
        self.end_position = tree_offset + self.layout.seed_end(self.level, self.index);
        self.seed_width = (self.end_position - start_position) as u32;
        self.seed_mask = seed_mask_for_width(self.seed_width);
    }

    pub fn next(&mut self) {
        self.index += 1;
        if self.index == self.tasks_this_level {
            self.index = 0;
            self.level += 1;
            if self.level == self.layout.log2k() {
                self.level = 0;
                self.bucket += 1;
            }
        }
        self.update_properties();
    }

    pub fn previous(&mut self) {
        if self.index == 0 {
            if self.level == 0 {
                self.level = self.layout.log2k() - 1;
                self.bucket -= 1;
            } else {
                self.level -= 1;
            }
            self.index = self.layout.tasks(self.level) - 1;
        } else {
            self.index -= 1;
        }
        self.update_properties();
    }

    #[inline(always)]
    pub fn is_end(&self) -> bool {
        self.bucket >= self.nbuckets
    }

    #[inline(always)]
    pub fn is_first(&self) -> bool {
        self.level == 0 && self.index == 0 && self.bucket == 0
    }

    pub fn set_level(&mut self, level: u32) {
        self.level = level;
        self.update_properties();
    }
}

/// Cursor over the tasks of a single level in the levelwise storage order.
///
/// Adjacent windows of the level-contiguous layout share context bits, so
/// moving forward only shifts the running `seed` by the width of the next
/// window instead of re-reading it.
pub(crate) struct LevelTask<'a> {
    layout: &'a TreeLayout,
    level: u32,
    pub idx: usize,
    /// One-past-the-end bit position of the current seed window,
    /// including the leading root-seed word.
    pub seed_end_position: usize,
    pub seed_width: u32,
    pub seed_mask: u64,
    /// Running 64-bit seed: window candidate bits plus neighbor context.
    pub seed: u64,
    pub max_seed: u64,
    /// Index of the first key of the current task.
    pub from_key: usize,
}

impl<'a> LevelTask<'a> {
    pub fn new(layout: &'a TreeLayout, level: u32, idx: usize, bits: &crate::bits::UnalignedBitVector) -> Self {
        let mut task = Self {
            layout, level, idx,
            seed_end_position: 0, seed_width: 0, seed_mask: 0, seed: 0, max_seed: 0, from_key: 0,
        };
        task.recalculate_positions();
        task.read_seed(bits);
        task
    }

    fn recalculate_positions(&mut self) {
        let start = self.layout.level_position(self.level, self.idx);
        let end = self.layout.level_position(self.level, self.idx + 1);
        self.seed_end_position = crate::search::ROOT_SEED_BITS + end;
        self.seed_width = (end - start) as u32;
        self.seed_mask = seed_mask_for_width(self.seed_width);
        self.from_key = self.idx * self.layout.task_size(self.level);
    }

    pub fn read_seed(&mut self, bits: &crate::bits::UnalignedBitVector) {
        self.seed = bits.read_at(self.seed_end_position);
        self.max_seed = self.seed | self.seed_mask;
    }

    pub fn write_seed(&self, bits: &mut crate::bits::UnalignedBitVector) {
        bits.write_to(self.seed_end_position, self.seed);
    }

    pub fn next(&mut self) {
        self.idx += 1;
        self.recalculate_positions();
        self.seed = if self.seed_width >= 64 { 0 } else { self.seed << self.seed_width };
        self.max_seed = self.seed | self.seed_mask;
    }

    pub fn prev(&mut self, bits: &crate::bits::UnalignedBitVector) {
        self.idx -= 1;
        self.recalculate_positions();
        self.read_seed(bits);
    }

    #[inline(always)]
    pub fn is_first(&self) -> bool {
        self.idx == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Checks that window positions tile the storage without gaps or overlaps.
    fn validate_continuity(layout: &TreeLayout) {
        assert_eq!(layout.seed_start(0, 0), 0);
        for level in 0..layout.log2k() {
            for index in 0..layout.tasks(level) {
                let start = layout.seed_start(level, index);
                let end = layout.seed_end(level, index);
                assert!(start <= end);
                if index + 1 < layout.tasks(level) {
                    assert_eq!(end, layout.seed_start(level, index + 1));
                } else {
                    assert_eq!(end, layout.seed_start(level + 1, 0));
                }
            }
        }
        assert_eq!(layout.seed_end(layout.log2k() - 1, layout.tasks(layout.log2k() - 1) - 1),
                   layout.tree_bits());
    }

    /// Widths of the adjacent windows of a level differ by at most 1.
    fn validate_widths(layout: &TreeLayout) {
        for level in 0..layout.log2k() {
            let widths: Vec<usize> = (0..layout.tasks(level).min(5000))
                .map(|i| layout.seed_end(level, i) - layout.seed_start(level, i))
                .collect();
            let min = widths.iter().min().unwrap();
            let max = widths.iter().max().unwrap();
            assert!(max - min <= 1, "widths at level {} spread over [{}, {}]", level, min, max);
        }
    }

    #[test]
    fn test_layout_1024() {
        let layout = TreeLayout::new(1024, 0.01);
        assert_eq!(layout.log2k(), 10);
        assert_eq!(layout.task_size(0), 1024);
        assert_eq!(layout.task_size(9), 2);
        validate_continuity(&layout);
        validate_widths(&layout);
    }

    #[test]
    fn test_layout_32768() {
        let layout = TreeLayout::new(1 << 15, 0.01);
        validate_continuity(&layout);
        validate_widths(&layout);
    }

    #[test]
    fn test_layout_minimal() {
        let layout = TreeLayout::new(2, 0.5);
        // a single split of 2 keys: 1 + 0.5/3.4*2^0.75 bits, rounded up
        assert_eq!(layout.tree_bits(), 2);
        validate_continuity(&layout);
    }

    #[test]
    fn test_levelwise_positions_monotone() {
        let layout = TreeLayout::new(256, 0.1);
        for level in 0..layout.log2k() {
            let mut previous = 0;
            for index in 1..=64 {
                let position = layout.level_position(level, index);
                assert!(position >= previous);
                assert!(position - previous <= 64);
                previous = position;
            }
        }
    }

    #[test]
    fn test_tree_task_order_roundtrip() {
        let layout = TreeLayout::new(16, 0.1);
        let mut task = TreeTask::new(&layout, 0, 0, 0, 2);
        let mut steps = 0;
        while !task.is_end() {
            task.next();
            steps += 1;
        }
        // 15 tasks per tree of 16 keys, 2 trees
        assert_eq!(steps, 2 * 15);
        for _ in 0..steps { task.previous(); }
        assert!(task.is_first());
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_non_power_of_two() {
        TreeLayout::new(100, 0.1);
    }

    #[test]
    #[should_panic(expected = "overhead")]
    fn test_rejects_non_positive_overhead() {
        TreeLayout::new(128, 0.0);
    }
}
