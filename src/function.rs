use std::hash::Hash;
use std::io;

use binout::{AsIs, Serializer};
use dyn_size_of::GetSize;
use rayon::prelude::*;

use crate::bits::UnalignedBitVector;
use crate::kphf::BumpedKPerfect;
use crate::layout::{TreeLayout, TreeTask};
use crate::search::{search_with_root_seed, to_left, ROOT_SEED_BITS};
use crate::seedable_hash::{BuildDefaultSeededHasher, BuildSeededHasher};
use crate::stats::BuildStatsCollector;

/// Build configuration accepted by [`Function`] and
/// [`LevelwiseFunction`](crate::LevelwiseFunction) constructors.
///
/// See field descriptions for details.
#[derive(Clone)]
pub struct BuildConf<S = BuildDefaultSeededHasher> {
    /// The family of hash functions used to map keys to their 64-bit images.
    /// (default: [`BuildDefaultSeededHasher`])
    pub hash_builder: S,

    /// Number of keys per splitting tree, *k*; must be a power of two, at
    /// least 4. (default: [`BuildConf::DEFAULT_BUCKET_SIZE`])
    ///
    /// The input must contain at least `bucket_size` keys. Larger trees are
    /// slightly smaller per key but take longer to construct.
    pub bucket_size: usize,

    /// Extra storage per split beyond the information-theoretic minimum, *ε*.
    /// (default: `0.01`)
    ///
    /// Smaller values give a smaller function at the cost of a longer seed
    /// search. Must be positive.
    pub overhead: f64,

    /// Whether to use multiple threads to hash and bucket-sort the keys during
    /// construction. (default: `true`)
    ///
    /// If `true`, these construction steps use the default [rayon] thread
    /// pool. The seed search itself is single-threaded either way.
    pub use_multiple_threads: bool,
}

impl Default for BuildConf {
    fn default() -> Self {
        Self {
            hash_builder: Default::default(),
            bucket_size: Self::DEFAULT_BUCKET_SIZE,
            overhead: 0.01,
            use_multiple_threads: true,
        }
    }
}

impl BuildConf {
    /// Returns configuration with the given [`bucket_size`](BuildConf::bucket_size).
    pub fn bs(bucket_size: usize) -> Self {
        Self { bucket_size, ..Default::default() }
    }

    /// Returns configuration with the given [`overhead`](BuildConf::overhead).
    pub fn eps(overhead: f64) -> Self {
        Self { overhead, ..Default::default() }
    }

    /// Returns configuration with the given [`bucket_size`](BuildConf::bucket_size)
    /// and [`overhead`](BuildConf::overhead).
    pub fn bs_eps(bucket_size: usize, overhead: f64) -> Self {
        Self { bucket_size, overhead, ..Default::default() }
    }

    /// Returns configuration that potentially uses
    /// [multiple threads](BuildConf::use_multiple_threads) during construction.
    pub fn mt(use_multiple_threads: bool) -> Self {
        Self { use_multiple_threads, ..Default::default() }
    }
}

impl<S> BuildConf<S> {
    /// The default value for [`bucket_size`](BuildConf::bucket_size).
    pub const DEFAULT_BUCKET_SIZE: usize = 1 << 15;

    /// Returns configuration that uses custom [`hash_builder`](BuildConf::hash_builder).
    pub fn hash(hash_builder: S) -> Self {
        Self { hash_builder, bucket_size: Self::DEFAULT_BUCKET_SIZE, overhead: 0.01, use_multiple_threads: true }
    }

    /// Returns configuration that uses custom [`hash_builder`](BuildConf::hash_builder),
    /// [`bucket_size`](BuildConf::bucket_size) and [`overhead`](BuildConf::overhead).
    pub fn hash_bs_eps(hash_builder: S, bucket_size: usize, overhead: f64) -> Self {
        Self { hash_builder, bucket_size, overhead, use_multiple_threads: true }
    }
}

/// Hashes all `keys` to their 64-bit images, in parallel when configured.
pub(crate) fn hash_all<K, S>(keys: &[K], conf: &BuildConf<S>) -> Vec<u64>
    where K: Hash + Sync, S: BuildSeededHasher + Sync
{
    if conf.use_multiple_threads && keys.len() > 4 * 2048 && rayon::current_num_threads() > 1 {
        keys.par_iter().with_min_len(256).map(|key| conf.hash_builder.hash_one(key, 0)).collect()
    } else {
        keys.iter().map(|key| conf.hash_builder.hash_one(key, 0)).collect()
    }
}

/// Distributes the 64-bit key images over the primary buckets of `bucketing`,
/// k keys per bucket, back to back. Returns [`None`] when some bucket receives
/// more than k keys, which means duplicate images in the input.
pub(crate) fn keys_per_bucket(mhcs: &[u64], bucketing: &BumpedKPerfect, k: usize) -> Option<Vec<u64>> {
    let nbuckets = bucketing.nbuckets();
    let mut counters = vec![0usize; nbuckets];
    let mut tree_keys = vec![0u64; nbuckets * k];
    for mhc in mhcs {
        let bucket = bucketing.get(*mhc);
        if bucket >= nbuckets {
            continue; // leftover key, already placed past the primary range
        }
        let counter = counters[bucket];
        if counter == k {
            return None;
        }
        tree_keys[bucket * k + counter] = *mhc;
        counters[bucket] = counter + 1;
    }
    debug_assert!(counters.iter().all(|counter| *counter == k));
    Some(tree_keys)
}

/// Minimal perfect hash function with combined search and encoding of the
/// splitting-tree seeds (*Consensus*), over buckets of a k-perfect hash.
///
/// A [`BumpedKPerfect`] partitions the n input keys into n/k buckets of
/// exactly k keys each. One splitting tree per bucket is then searched
/// depth-first, all trees sharing a single bit vector whose leading 64 bits
/// hold the root seed. Queries descend log₂k tree levels within one
/// contiguous region of the vector.
///
/// See:
/// - H.-P. Lehmann, P. Sanders, S. Walzer, J. Ziegler, *Combined Search and
///   Encoding for Seeds, with an Application to Minimal Perfect Hashing*,
///   <https://arxiv.org/abs/2502.05613>
pub struct Function<S = BuildDefaultSeededHasher> {
    seeds: UnalignedBitVector,
    layout: TreeLayout,
    bucketing: BumpedKPerfect,
    overhead: f64,
    hash_builder: S,
}

impl<S> GetSize for Function<S> {
    fn size_bytes_dyn(&self) -> usize {
        self.seeds.size_bytes_dyn() + self.layout.size_bytes_dyn() + self.bucketing.size_bytes_dyn()
    }
    const USES_DYN_MEM: bool = true;
}

impl<S: BuildSeededHasher> Function<S> {
    /// Gets the value associated with the already-hashed `key` (its 64-bit
    /// image used at construction).
    ///
    /// The returned value is in the range from 0 (inclusive) to the number of
    /// input keys (exclusive). For an image outside the input set the result
    /// is an undetermined value from the same range.
    pub fn get_hash(&self, key: u64) -> usize {
        let nbuckets = self.bucketing.nbuckets();
        let bucket = self.bucketing.get(key);
        if bucket >= nbuckets {
            return bucket; // leftover keys are addressed directly
        }
        let mut task = TreeTask::new(&self.layout, 0, 0, bucket, nbuckets);
        for level in 0..self.layout.log2k() {
            task.set_level(level);
            let seed = self.seeds.read_at(task.end_position + ROOT_SEED_BITS);
            task.index = 2 * task.index + usize::from(!to_left(key, seed));
        }
        bucket * (1 << self.layout.log2k()) + task.index
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

    /// Space used, in bits: the seed storage plus the bucketing hash.
    #[inline] pub fn bits(&self) -> usize {
        self.seeds.bit_size() + self.bucketing.bits()
    }

    /// Returns number of bytes which [`write`](Self::write) will write.
    pub fn write_bytes(&self) -> usize {
        AsIs::size(self.overhead.to_bits()) + self.seeds.write_bytes() + self.bucketing.write_bytes()
    }

    /// Writes `self` to the `output`.
    pub fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        AsIs::write(output, self.overhead.to_bits())?;
        self.seeds.write(output)?;
        self.bucketing.write(output)
    }

    /// Reads `Self` from the `input`. Hasher must be the same as the one used
    /// to write.
    pub fn read_with_hasher(input: &mut dyn io::Read, hasher: S) -> io::Result<Self> {
        let overhead = f64::from_bits(AsIs::read(input)?);
        let seeds = UnalignedBitVector::read(input)?;
        let bucketing = BumpedKPerfect::read(input)?;
        let layout = TreeLayout::new(bucketing.k(), overhead);
        Ok(Self { seeds, layout, bucketing, overhead, hash_builder: hasher })
    }
}

impl<S: BuildSeededHasher> Function<S> {
    /// Builds [`Function`] for the given distinct 64-bit `keys`, used directly
    /// as their own images, with the configuration `conf` and reporting
    /// statistics with `stats`.
    ///
    /// The keys must be well mixed (e.g. already hashes); for arbitrary 64-bit
    /// integers use [`Self::try_from_slice_with_conf_stats`] instead. [`None`] is
    /// returned when the construction fails, which is almost certain to mean
    /// duplicate keys in the input.
    pub fn try_with_keys_conf_stats<BS>(keys: &[u64], conf: BuildConf<S>, stats: &mut BS) -> Option<Self>
        where BS: BuildStatsCollector
    {
        let k = conf.bucket_size;
        assert!(k >= 4 && k.is_power_of_two(), "bucket size must be a power of two, at least 4, got {}", k);
        let layout = TreeLayout::new(k, conf.overhead);
        let threads = if conf.use_multiple_threads { rayon::current_num_threads() } else { 1 };
        let bucketing = BumpedKPerfect::with_threads(keys, k, threads);
        let mut tree_keys = keys_per_bucket(keys, &bucketing, k)?;
        let nbuckets = bucketing.nbuckets();
        let mut seeds = UnalignedBitVector::new(ROOT_SEED_BITS + nbuckets * layout.tree_bits());
        search_with_root_seed(&mut tree_keys, &layout, &mut seeds, nbuckets, stats)
            .then(|| Self { seeds, layout, bucketing, overhead: conf.overhead, hash_builder: conf.hash_builder })
    }

    /// Builds [`Function`] for the given distinct 64-bit `keys`, used directly
    /// as their own images, with the configuration `conf`.
    ///
    /// Panics if the construction fails; then it is almost certain that the
    /// input contains duplicate keys.
    pub fn with_keys_conf(keys: &[u64], conf: BuildConf<S>) -> Self {
        Self::try_with_keys_conf_stats(keys, conf, &mut ())
            .expect("Constructing consensus Function failed. Probably the input contains duplicate keys.")
    }
}

impl<S: BuildSeededHasher + Sync> Function<S> {
    /// Builds [`Function`] for the given `keys`, hashing them to 64-bit images
    /// first, with the configuration `conf` and reporting statistics with
    /// `stats`.
    ///
    /// [`None`] is returned when the construction fails; then it is almost
    /// certain that the input contains either duplicate keys or keys
    /// indistinguishable by the 64-bit hash used.
    pub fn try_from_slice_with_conf_stats<K, BS>(keys: &[K], conf: BuildConf<S>, stats: &mut BS) -> Option<Self>
        where K: Hash + Sync, BS: BuildStatsCollector
    {
        let hashes = hash_all(keys, &conf);
        Self::try_with_keys_conf_stats(&hashes, conf, stats)
    }

    /// Builds [`Function`] for the given `keys`, hashing them to 64-bit
    /// images first, with the configuration `conf`.
    ///
    /// Panics if the construction fails; then it is almost certain that the
    /// input contains either duplicate keys or keys indistinguishable by the
    /// 64-bit hash used.
    pub fn from_slice_with_conf<K: Hash + Sync>(keys: &[K], conf: BuildConf<S>) -> Self {
        Self::try_from_slice_with_conf_stats(keys, conf, &mut ())
            .expect("Constructing consensus Function failed. Probably the input contains duplicate keys.")
    }
}

impl Function {
    /// Builds [`Function`] for the given distinct, well-mixed 64-bit `keys`
    /// with the default configuration.
    ///
    /// Panics if the construction fails; then it is almost certain that the
    /// input contains duplicate keys.
    pub fn with_keys(keys: &[u64]) -> Self {
        Self::with_keys_conf(keys, Default::default())
    }

    /// Builds [`Function`] for the given `keys` with the default
    /// configuration.
    ///
    /// Panics if the construction fails; then it is almost certain that the
    /// input contains either duplicate keys or keys indistinguishable by the
    /// 64-bit hash used.
    pub fn from_slice<K: Hash + Sync>(keys: &[K]) -> Self {
        Self::from_slice_with_conf(keys, Default::default())
    }

    /// Reads `Self` from the `input`.
    /// Only functions that use the default hasher can be read by this method.
    pub fn read(input: &mut dyn io::Read) -> io::Result<Self> {
        Self::read_with_hasher(input, Default::default())
    }
}

impl<K: Hash + Sync> From<&[K]> for Function {
    fn from(keys: &[K]) -> Self {
        Self::from_slice(keys)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use butils::XorShift64;

    /// Checks that `mphf` maps the `keys` onto `0..keys.len()` without collisions.
    pub(crate) fn test_mphf<K, G: Fn(&K) -> usize>(keys: &[K], mphf: G) {
        let mut seen = vec![false; keys.len()];
        for key in keys {
            let value = mphf(key);
            assert!(value < keys.len(), "MPHF assigns too large value: {} >= {}", value, keys.len());
            assert!(!seen[value], "MPHF assigns {} to two keys", value);
            seen[value] = true;
        }
    }

    #[test]
    fn test_small() {
        let keys: Vec<u64> = XorShift64(0xc0ffee).take(8 * 256).collect();
        let f = Function::with_keys_conf(&keys, BuildConf::bs_eps(256, 0.1));
        test_mphf(&keys, |key| f.get_hash(*key));
        assert_eq!(f.len(), keys.len());
    }

    #[test]
    fn test_with_leftover_keys() {
        // n is not a multiple of k: the leftover keys map past the primary range
        let keys: Vec<u64> = XorShift64(0xbeef).take(16 * 128 + 77).collect();
        let f = Function::with_keys_conf(&keys, BuildConf::bs_eps(128, 0.1));
        test_mphf(&keys, |key| f.get_hash(*key));
    }

    #[test]
    fn test_hashed_keys() {
        let keys: Vec<String> = (0..3000).map(|i| format!("key number {}", i)).collect();
        let f = Function::from_slice_with_conf(&keys, BuildConf::bs_eps(512, 0.1));
        test_mphf(&keys, |key| f.get(key));
    }

    #[test]
    fn test_single_threaded_matches_multi() {
        let keys: Vec<u64> = XorShift64(123).take(4 * 512).collect();
        let st = Function::with_keys_conf(&keys, BuildConf { use_multiple_threads: false, ..BuildConf::bs_eps(512, 0.1) });
        let mt = Function::with_keys_conf(&keys, BuildConf::bs_eps(512, 0.1));
        assert!(st.seeds == mt.seeds);
    }

    #[test]
    fn test_small_overhead() {
        let keys: Vec<u64> = XorShift64(0xfeed).take(16 * 256).collect();
        let f = Function::with_keys_conf(&keys, BuildConf::bs_eps(256, 0.01));
        test_mphf(&keys, |key| f.get_hash(*key));
        // the seed storage stays near the ~1.44 bits/key lower bound of
        // splitting trees of 256 keys; the bucketing artifacts only amortize
        // at much larger inputs
        let seed_bits_per_key = f.seeds.bit_size() as f64 / keys.len() as f64;
        assert!(seed_bits_per_key < 1.6, "{} seed bits per key", seed_bits_per_key);
    }

    #[test]
    fn test_read_write() {
        let keys: Vec<u64> = XorShift64(17).take(6 * 128 + 5).collect();
        let f = Function::with_keys_conf(&keys, BuildConf::bs_eps(128, 0.1));
        let mut buff = Vec::new();
        f.write(&mut buff).unwrap();
        assert_eq!(buff.len(), f.write_bytes());
        let read = Function::read(&mut &buff[..]).unwrap();
        assert!(read.seeds == f.seeds);
        test_mphf(&keys, |key| read.get_hash(*key));
    }

    #[test]
    #[ignore = "uses much time"]
    fn test_single_bucket_32768() {
        let keys: Vec<u64> = XorShift64(0x5eed).take(1 << 15).collect();
        let f = Function::with_keys_conf(&keys, BuildConf::eps(0.1));
        test_mphf(&keys, |key| f.get_hash(*key));
    }

    #[test]
    #[ignore = "uses much time"]
    fn test_published_parameters() {
        let keys: Vec<u64> = XorShift64(0x1234_5678).take(10_000_000).collect();
        let f = Function::with_keys_conf(&keys, BuildConf::eps(0.01));
        test_mphf(&keys, |key| f.get_hash(*key));
        let bits_per_key = f.bits() as f64 / keys.len() as f64;
        assert!(bits_per_key < 2.0, "{} bits per key", bits_per_key);
    }
}
