use std::hash::Hash;
use std::io;

use binout::{AsIs, Serializer, VByte};
use dyn_size_of::GetSize;

use crate::bits::UnalignedBitVector;
use crate::function::{hash_all, keys_per_bucket, BuildConf};
use crate::kphf::BumpedKPerfect;
use crate::layout::{LevelTask, TreeLayout};
use crate::search::{is_seed_successful, partition_by_seed, to_left, ROOT_SEED_BITS};
use crate::seedable_hash::{BuildDefaultSeededHasher, BuildSeededHasher};
use crate::stats::BuildStatsCollector;

/// Starting seed at each distance from the root (extracted at random).
/// Added to the stored seed before splitting, it decorrelates the levels and
/// lets all of them reuse the same small seed widths.
const LEVEL_START_SEEDS: [u64; 19] = [0x106393c187cae21a, 0x6453cec3f7376937, 0x643e521ddbd2be98, 0x3740c6412f6572cb,
    0x717d47562f1ce470, 0x4cd6eb4c63befb7c, 0x9bfd8c5e18c8da73, 0x082f20e10092a9a3, 0x2ada2ce68d21defc,
    0xe33cb4f3e7c6466b, 0x3980be458c509c59, 0xc466fd9584828e8c, 0x45f0aabe1a61ede6, 0xf6e7b8b33ad9b98d,
    0x4ef95e25f4b4983d, 0x81175195173b92d3, 0x4e50927d8dd15978, 0x1ea2099d1fafae7f, 0x425c8a06fbaaa815];

/// Searches the seeds of one whole level, across all buckets, into a fresh
/// bit vector whose leading word is the level's own root seed.
///
/// Within the level-contiguous storage, backtracking crosses task boundaries;
/// backtracking out of the first task increments the root seed and restarts
/// the level. Returns [`None`] after exhausting the root-seed space.
fn find_level_seeds<BS: BuildStatsCollector>(
    keys: &[u64], layout: &TreeLayout, level: u32, num_tasks: usize, stats: &mut BS,
) -> Option<UnalignedBitVector> {
    let task_size = layout.task_size(level);
    let start_seed = LEVEL_START_SEEDS[level as usize];
    let mut bits = UnalignedBitVector::new(ROOT_SEED_BITS + layout.level_position(level, num_tasks));
    let mut task = LevelTask::new(layout, level, 0, &bits);
    let mut root_seed_attempts = 0u64;
    loop {
        if is_seed_successful(&keys[task.from_key..task.from_key + task_size], task.seed.wrapping_add(start_seed)) {
            task.write_seed(&mut bits);
            if task.idx + 1 == num_tasks {
                return Some(bits);
            }
            task.next();
        } else if task.seed != task.max_seed {
            task.seed += 1;
        } else {
            // backtrack over all tasks that are at their max seed
            while task.seed == task.max_seed && !task.is_first() {
                task.prev(&bits);
            }
            if task.is_first() && task.seed == task.max_seed {
                // level exhausted under this root seed
                task.seed &= !task.seed_mask;
                task.write_seed(&mut bits);
                root_seed_attempts += 1;
                if root_seed_attempts >= 1u64 << (ROOT_SEED_BITS - 1) {
                    return None;
                }
                let root_seed = bits.read_at(ROOT_SEED_BITS).wrapping_add(1);
                bits.write_to(ROOT_SEED_BITS, root_seed);
                stats.root_seed_changed(root_seed);
                task.read_seed(&bits);
            } else {
                task.seed += 1;
            }
        }
    }
}

/// Minimal perfect hash function of [`crate::Function`]'s kind, built level
/// by level instead of depth-first.
///
/// All tasks of a level, across all buckets, are solved into one contiguous
/// bit vector before any key is partitioned for the next level. Construction
/// is faster (better locality, one running seed shifted along the level), at
/// the price of one cache line per tree level at query time instead of a
/// contiguous descent.
pub struct LevelwiseFunction<S = BuildDefaultSeededHasher> {
    level_seeds: Box<[UnalignedBitVector]>,
    layout: TreeLayout,
    bucketing: BumpedKPerfect,
    overhead: f64,
    hash_builder: S,
}

impl<S> GetSize for LevelwiseFunction<S> {
    fn size_bytes_dyn(&self) -> usize {
        self.level_seeds.size_bytes_dyn() + self.layout.size_bytes_dyn() + self.bucketing.size_bytes_dyn()
    }
    const USES_DYN_MEM: bool = true;
}

impl<S: BuildSeededHasher> LevelwiseFunction<S> {
    /// Gets the value associated with the already-hashed `key` (its 64-bit
    /// image used at construction).
    pub fn get_hash(&self, key: u64) -> usize {
        let nbuckets = self.bucketing.nbuckets();
        let bucket = self.bucketing.get(key);
        if bucket >= nbuckets {
            return bucket; // leftover keys are addressed directly
        }
        let mut task_idx = bucket;
        for level in 0..self.layout.log2k() {
            let position = ROOT_SEED_BITS + self.layout.level_position(level, task_idx + 1);
            let seed = self.level_seeds[level as usize].read_at(position)
                .wrapping_add(LEVEL_START_SEEDS[level as usize]);
            task_idx = 2 * task_idx + usize::from(!to_left(key, seed));
        }
        task_idx
    }

    /// Gets the value associated with the given `key`.
    ///
    /// The returned value is in the range from 0 (inclusive) to the number of
    /// input keys (exclusive). For a key outside the input set the result is
    /// an undetermined value from the same range.
    #[inline]
    pub fn get<K: Hash + ?Sized>(&self, key: &K) -> usize {
        self.get_hash(self.hash_builder.hash_one(key, 0))
    }

    /// Number of keys in the input collection given during construction.
    #[inline] pub fn len(&self) -> usize { self.bucketing.num_keys() }

    /// Space used, in bits: the per-level seed storage plus the bucketing hash.
    pub fn bits(&self) -> usize {
        self.level_seeds.iter().map(|seeds| seeds.bit_size()).sum::<usize>() + self.bucketing.bits()
    }

    /// Builds [`LevelwiseFunction`] for the given distinct 64-bit `keys`, used
    /// directly as their own images, with the configuration `conf` and
    /// reporting statistics with `stats`.
    ///
    /// The keys must be well mixed (e.g. already hashes). [`None`] is returned
    /// when the construction fails, which is almost certain to mean duplicate
    /// keys in the input.
    pub fn try_with_keys_conf_stats<BS>(keys: &[u64], conf: BuildConf<S>, stats: &mut BS) -> Option<Self>
        where BS: BuildStatsCollector
    {
        let k = conf.bucket_size;
        assert!(k >= 4 && k.is_power_of_two(), "bucket size must be a power of two, at least 4, got {}", k);
        let layout = TreeLayout::new(k, conf.overhead);
        assert!(layout.log2k() as usize <= LEVEL_START_SEEDS.len(),
            "bucket size must be at most 2^{} for the levelwise variant", LEVEL_START_SEEDS.len());
        let threads = if conf.use_multiple_threads { rayon::current_num_threads() } else { 1 };
        let bucketing = BumpedKPerfect::with_threads(keys, k, threads);
        let mut tree_keys = keys_per_bucket(keys, &bucketing, k)?;
        let nbuckets = bucketing.nbuckets();

        let mut level_seeds = Vec::with_capacity(layout.log2k() as usize);
        for level in 0..layout.log2k() {
            let num_tasks = nbuckets << level;
            let task_size = layout.task_size(level);
            stats.level(level as usize, task_size, layout.level_position(level, num_tasks));
            let bits = match find_level_seeds(&tree_keys, &layout, level, num_tasks, stats) {
                Some(bits) => bits,
                None => {
                    stats.end(false);
                    return None;
                }
            };
            if task_size > 2 { // no need to partition the leaf layer
                for task in 0..num_tasks {
                    let seed = bits.read_at(ROOT_SEED_BITS + layout.level_position(level, task + 1))
                        .wrapping_add(LEVEL_START_SEEDS[level as usize]);
                    partition_by_seed(&mut tree_keys[task * task_size..(task + 1) * task_size], seed);
                }
            }
            level_seeds.push(bits);
        }
        stats.end(true);
        Some(Self {
            level_seeds: level_seeds.into_boxed_slice(),
            layout, bucketing,
            overhead: conf.overhead,
            hash_builder: conf.hash_builder,
        })
    }

    /// Builds [`LevelwiseFunction`] for the given distinct 64-bit `keys`, used
    /// directly as their own images, with the configuration `conf`.
    ///
    /// Panics if the construction fails; then it is almost certain that the
    /// input contains duplicate keys.
    pub fn with_keys_conf(keys: &[u64], conf: BuildConf<S>) -> Self {
        Self::try_with_keys_conf_stats(keys, conf, &mut ())
            .expect("Constructing consensus LevelwiseFunction failed. Probably the input contains duplicate keys.")
    }

    /// Returns number of bytes which [`write`](Self::write) will write.
    pub fn write_bytes(&self) -> usize {
        AsIs::size(self.overhead.to_bits()) + self.bucketing.write_bytes()
            + VByte::size(self.level_seeds.len())
            + self.level_seeds.iter().map(|seeds| seeds.write_bytes()).sum::<usize>()
    }

    /// Writes `self` to the `output`.
    pub fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        AsIs::write(output, self.overhead.to_bits())?;
        self.bucketing.write(output)?;
        VByte::write(output, self.level_seeds.len())?;
        for seeds in self.level_seeds.iter() {
            seeds.write(output)?;
        }
        Ok(())
    }

    /// Reads `Self` from the `input`. Hasher must be the same as the one used
    /// to write.
    pub fn read_with_hasher(input: &mut dyn io::Read, hasher: S) -> io::Result<Self> {
        let overhead = f64::from_bits(AsIs::read(input)?);
        let bucketing = BumpedKPerfect::read(input)?;
        let levels: usize = VByte::read(input)?;
        let mut level_seeds = Vec::with_capacity(levels);
        for _ in 0..levels {
            level_seeds.push(UnalignedBitVector::read(input)?);
        }
        Ok(Self {
            level_seeds: level_seeds.into_boxed_slice(),
            layout: TreeLayout::new(bucketing.k(), overhead),
            bucketing, overhead, hash_builder: hasher,
        })
    }
}

impl<S: BuildSeededHasher + Sync> LevelwiseFunction<S> {
    /// Builds [`LevelwiseFunction`] for the given `keys`, hashing them to
    /// 64-bit images first, with the configuration `conf`.
    ///
    /// Panics if the construction fails; then it is almost certain that the
    /// input contains either duplicate keys or keys indistinguishable by the
    /// 64-bit hash used.
    pub fn from_slice_with_conf<K: Hash + Sync>(keys: &[K], conf: BuildConf<S>) -> Self {
        let hashes = hash_all(keys, &conf);
        Self::with_keys_conf(&hashes, conf)
    }
}

impl LevelwiseFunction {
    /// Builds [`LevelwiseFunction`] for the given distinct, well-mixed 64-bit
    /// `keys` with the default configuration.
    ///
    /// Panics if the construction fails; then it is almost certain that the
    /// input contains duplicate keys.
    pub fn with_keys(keys: &[u64]) -> Self {
        Self::with_keys_conf(keys, Default::default())
    }

    /// Reads `Self` from the `input`.
    /// Only functions that use the default hasher can be read by this method.
    pub fn read(input: &mut dyn io::Read) -> io::Result<Self> {
        Self::read_with_hasher(input, Default::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::tests::test_mphf;
    use butils::XorShift64;

    #[test]
    fn test_small() {
        let keys: Vec<u64> = XorShift64(0xaaaa).take(8 * 256).collect();
        let f = LevelwiseFunction::with_keys_conf(&keys, BuildConf::bs_eps(256, 0.1));
        test_mphf(&keys, |key| f.get_hash(*key));
        assert_eq!(f.len(), keys.len());
    }

    #[test]
    fn test_with_leftover_keys() {
        let keys: Vec<u64> = XorShift64(0xbbbb).take(16 * 128 + 99).collect();
        let f = LevelwiseFunction::with_keys_conf(&keys, BuildConf::bs_eps(128, 0.1));
        test_mphf(&keys, |key| f.get_hash(*key));
    }

    #[test]
    fn test_hashed_keys() {
        let keys: Vec<String> = (0..2000).map(|i| format!("levelwise key {}", i)).collect();
        let f = LevelwiseFunction::from_slice_with_conf(&keys, BuildConf::bs_eps(256, 0.1));
        test_mphf(&keys, |key| f.get(key));
    }

    #[test]
    fn test_determinism() {
        let keys: Vec<u64> = XorShift64(0xcccc).take(4 * 512).collect();
        let a = LevelwiseFunction::with_keys_conf(&keys, BuildConf::bs_eps(512, 0.1));
        let b = LevelwiseFunction::with_keys_conf(&keys, BuildConf::bs_eps(512, 0.1));
        assert!(a.level_seeds == b.level_seeds);
    }

    #[test]
    fn test_read_write() {
        let keys: Vec<u64> = XorShift64(0xdddd).take(5 * 128 + 21).collect();
        let f = LevelwiseFunction::with_keys_conf(&keys, BuildConf::bs_eps(128, 0.1));
        let mut buff = Vec::new();
        f.write(&mut buff).unwrap();
        assert_eq!(buff.len(), f.write_bytes());
        let read = LevelwiseFunction::read(&mut &buff[..]).unwrap();
        assert!(read.level_seeds == f.level_seeds);
        test_mphf(&keys, |key| read.get_hash(*key));
    }

    #[test]
    #[ignore = "uses much time"]
    fn test_single_bucket_32768() {
        let keys: Vec<u64> = XorShift64(0xeeee).take(1 << 15).collect();
        let f = LevelwiseFunction::with_keys_conf(&keys, BuildConf::eps(0.1));
        test_mphf(&keys, |key| f.get_hash(*key));
    }
}
