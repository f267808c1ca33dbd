use std::cmp::Ordering;
use std::collections::HashMap;
use std::io;

use binout::{AsIs, Serializer, VByte};
use bitm::{BitAccess, BitVec, Select};
use dyn_size_of::GetSize;
use fxhash::FxBuildHasher;
use rayon::prelude::*;
use voracious_radix_sort::{RadixSort, Radixable};

use crate::utils::{map32_to_32, remix, ArrayWithRank};

/// Fraction of the primary buckets targeted by the first hashing layer.
/// Overloading the first layer lets most buckets fill completely there.
const OVERLOAD_FACTOR: f64 = 0.97;

/// Bumped k-perfect bucketing hash.
///
/// Assigns each of its n input keys to one of ⌊n/k⌋ primary buckets such that
/// every primary bucket receives *exactly* k keys. Keys that would overflow a
/// bucket are *bumped*: rehashed into a second layer of buckets and, failing
/// that, resolved through a dense fallback map and a rank/select bit vector
/// over the free positions the bumping left behind. The up to k−1 leftover
/// keys (when k does not divide n) are mapped past the primary range.
///
/// Operates on 64-bit key images; the caller is responsible for hashing
/// its keys and for the images being distinct.
///
/// Based on the k-perfect component described in:
/// - H.-P. Lehmann, P. Sanders, S. Walzer, J. Ziegler, *Combined Search and
///   Encoding for Seeds, with an Application to Minimal Perfect Hashing*,
///   <https://arxiv.org/abs/2502.05613>
pub struct BumpedKPerfect {
    num_keys: usize,
    k: usize,
    nbuckets: usize,
    threshold_bits: u8,
    /// Compact acceptance threshold of each bucket, `threshold_bits` each.
    thresholds: Box<[u64]>,
    /// Decode table from compact threshold code to 32-bit priority.
    threshold_mapping: Box<[u32]>,
    /// Cumulative bucket counts of the hashing layers; `layers + 1` entries.
    layer_bases: Box<[usize]>,
    /// Rank of each key bumped out of all hashing layers.
    fallback: HashMap<u64, usize, FxBuildHasher>,
    /// Marks position `rank + free_position(rank)` for each fallback rank.
    free_positions: Option<ArrayWithRank>,
}

/// Key with its currently assigned bucket and bump priority.
#[derive(Copy, Clone, Debug)]
struct KeyInfo {
    mhc: u64,
    bucket: u32,
    threshold: u32,
}

impl KeyInfo {
    #[inline(always)]
    fn of(mhc: u64, buckets_this_layer: usize) -> Self {
        Self {
            mhc,
            bucket: map32_to_32(mhc as u32, buckets_this_layer as u32),
            threshold: (mhc >> 32) as u32,
        }
    }

    #[inline(always)]
    fn sort_key(&self) -> u64 {
        (self.bucket as u64) << 32 | self.threshold as u64
    }
}

impl PartialEq for KeyInfo {
    #[inline] fn eq(&self, other: &Self) -> bool { self.sort_key() == other.sort_key() }
}

impl PartialOrd for KeyInfo {
    #[inline] fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.sort_key().partial_cmp(&other.sort_key())
    }
}

impl Radixable<u64> for KeyInfo {
    type Key = u64;
    #[inline] fn key(&self) -> u64 { self.sort_key() }
}

/// Fills the decode table from compact threshold codes to 32-bit priorities.
/// Most codes interpolate over the top tenth of the priority range, where the
/// acceptance cut of an overloaded bucket is expected to land; code 0 accepts
/// nothing and code 1 is a distant safeguard.
fn fill_threshold_mapping(threshold_range: usize) -> Box<[u32]> {
    debug_assert!(threshold_range >= 2);
    if threshold_range == 2 {
        return vec![0, u32::MAX].into_boxed_slice();
    }
    let mut mapping = vec![0u32; threshold_range].into_boxed_slice();
    mapping[0] = 0; // last resort
    mapping[1] = u32::MAX / 3; // safeguard, so much bumping should never happen in practice
    let interpolation_steps = threshold_range - 3;
    let interpolation_range = (u32::MAX / 10) as u64;
    let interpolation_start = u32::MAX as u64 - interpolation_range;
    let interpolation_step = interpolation_range / interpolation_steps as u64;
    for i in 0..interpolation_steps {
        mapping[2 + i] = (interpolation_start + i as u64 * interpolation_step) as u32;
    }
    mapping[threshold_range - 1] = u32::MAX; // keep all
    mapping
}

/// Smallest compact code whose decoded priority admits `threshold`.
#[inline]
fn compact_threshold(mapping: &[u32], threshold: u32) -> usize {
    // binary search would also work, but this is far from the hot path
    for (code, decoded) in mapping.iter().enumerate() {
        if threshold <= *decoded {
            return code;
        }
    }
    mapping.len() - 1
}

impl BumpedKPerfect {
    /// Builds the bucketing hash for the given 64-bit key images,
    /// with primary buckets of exactly `k` keys each.
    pub fn new(mhcs: &[u64], k: usize) -> Self {
        Self::with_threads(mhcs, k, 1)
    }

    /// Builds the bucketing hash, sorting and hashing with up to
    /// `threads_num` threads.
    pub fn with_threads(mhcs: &[u64], k: usize, threads_num: usize) -> Self {
        assert!(k >= 4, "bucket size must be at least 4, got {}", k);
        assert!(mhcs.len() >= k, "the input must contain at least one full bucket of {} keys", k);
        let num_keys = mhcs.len();
        let nbuckets = num_keys / k;
        let keys_in_end_bucket = num_keys - nbuckets * k;
        let threshold_bits = (crate::utils::int_log2(k) - 1) as u8;
        let threshold_range = 1usize << threshold_bits;
        let threshold_mapping = fill_threshold_mapping(threshold_range);
        let mut thresholds = Box::<[u64]>::with_zeroed_bits(nbuckets * threshold_bits as usize);

        let mut buckets_this_layer = 1.max((OVERLOAD_FACTOR * nbuckets as f64).ceil() as usize);
        let mut hashes: Vec<KeyInfo> = if threads_num > 1 && mhcs.len() > 4 * 2048 {
            mhcs.par_iter().with_min_len(256).map(|mhc| KeyInfo::of(*mhc, buckets_this_layer)).collect()
        } else {
            mhcs.iter().map(|mhc| KeyInfo::of(*mhc, buckets_this_layer)).collect()
        };

        let mut free_positions: Vec<usize> = Vec::new();
        let mut layer_bases = vec![0usize];
        for layer in 0..2 {
            let layer_base = layer_bases[layer];
            if layer != 0 {
                buckets_this_layer = nbuckets - layer_base;
                if buckets_this_layer == 0 {
                    break; // the first layer already covered every bucket
                }
                for hash in &mut hashes {
                    *hash = KeyInfo::of(remix(hash.mhc), buckets_this_layer);
                }
            }
            layer_bases.push(layer_base + buckets_this_layer);
            if threads_num > 1 {
                hashes.voracious_mt_sort(threads_num);
            } else {
                hashes.voracious_sort();
            }

            let mut bumped = Vec::new();
            let mut bucket_start = 0;
            let mut previous_bucket = 0;
            for i in 0..hashes.len() {
                let bucket = hashes[i].bucket as usize;
                while bucket != previous_bucket {
                    Self::flush_bucket(&mut thresholds, threshold_bits, &threshold_mapping, k,
                        layer_base, bucket_start, i, previous_bucket,
                        &hashes, &mut bumped, &mut free_positions);
                    previous_bucket += 1;
                    bucket_start = i;
                }
            }
            while previous_bucket < buckets_this_layer {
                Self::flush_bucket(&mut thresholds, threshold_bits, &threshold_mapping, k,
                    layer_base, bucket_start, hashes.len(), previous_bucket,
                    &hashes, &mut bumped, &mut free_positions);
                previous_bucket += 1;
                bucket_start = hashes.len();
            }
            hashes = bumped;
        }

        let mut fallback = HashMap::with_capacity_and_hasher(hashes.len(), FxBuildHasher::default());
        for (rank, hash) in hashes.iter().enumerate() {
            fallback.insert(hash.mhc, rank);
        }
        // Fallback keys beyond the free primary slots fill the final, short bucket.
        debug_assert_eq!(hashes.len() - free_positions.len(), keys_in_end_bucket);
        for i in 0..keys_in_end_bucket {
            free_positions.push(nbuckets + i);
        }
        let free_positions = Self::build_free_positions(&free_positions);

        Self {
            num_keys, k, nbuckets, threshold_bits, thresholds, threshold_mapping,
            layer_bases: layer_bases.into_boxed_slice(),
            fallback, free_positions,
        }
    }

    /// Closes bucket `bucket_idx` covering `hashes[bucket_start..end]`: stores
    /// its compact threshold, moves rejected keys to `bumped` and records a
    /// free position for every primary slot left unfilled.
    fn flush_bucket(thresholds: &mut [u64], threshold_bits: u8, mapping: &[u32], k: usize,
                    layer_base: usize, bucket_start: usize, end: usize, bucket_idx: usize,
                    hashes: &[KeyInfo], bumped: &mut Vec<KeyInfo>, free_positions: &mut Vec<usize>) {
        let bucket_size = end - bucket_start;
        if bucket_size <= k {
            thresholds.set_fragment(layer_base + bucket_idx, mapping.len() as u64 - 1, threshold_bits);
            for _ in bucket_size..k {
                free_positions.push(layer_base + bucket_idx);
            }
        } else {
            let last_threshold = compact_threshold(mapping, hashes[bucket_start + k - 1].threshold);
            let first_bumped_threshold = compact_threshold(mapping, hashes[bucket_start + k].threshold);
            let mut threshold = last_threshold;
            if first_bumped_threshold == last_threshold {
                // no ties across the cut: bump the whole tied run together
                threshold = threshold.saturating_sub(1);
            }
            thresholds.set_fragment(layer_base + bucket_idx, threshold as u64, threshold_bits);
            let decoded_threshold = mapping[threshold];
            for l in 0..bucket_size {
                if hashes[bucket_start + l].threshold > decoded_threshold {
                    bumped.push(hashes[bucket_start + l]);
                    if l < k {
                        free_positions.push(layer_base + bucket_idx);
                    }
                }
            }
        }
    }

    /// Unary-codes the non-decreasing `free_positions` sequence into a bit
    /// vector with select support: bit `rank + value` is set for each entry.
    fn build_free_positions(free_positions: &[usize]) -> Option<ArrayWithRank> {
        let last = *free_positions.last()?;
        let mut bit_vector = Box::<[u64]>::with_zeroed_bits(free_positions.len() + last + 1);
        for (rank, position) in free_positions.iter().enumerate() {
            bit_vector.set_bit(rank + position);
        }
        let (with_rank, _) = ArrayWithRank::build(bit_vector);
        Some(with_rank)
    }

    /// Number of primary buckets, each holding exactly `k` keys.
    #[inline(always)] pub fn nbuckets(&self) -> usize { self.nbuckets }

    /// Number of keys given during construction.
    #[inline(always)] pub fn num_keys(&self) -> usize { self.num_keys }

    /// Number of keys per primary bucket.
    #[inline(always)] pub fn k(&self) -> usize { self.k }

    #[inline(always)] fn layers(&self) -> usize { self.layer_bases.len() - 1 }

    /// Returns the bucket of the key with 64-bit image `mhc`, in `[0, nbuckets)`,
    /// or a value in `[k·nbuckets, k·nbuckets + k)` for the leftover keys past
    /// the primary range.
    ///
    /// Total for any input; the result for images outside the construction
    /// set is unspecified.
    #[inline]
    pub fn get(&self, mhc: u64) -> usize {
        let mut mhc = mhc;
        for layer in 0..self.layers() {
            if layer != 0 {
                mhc = remix(mhc);
            }
            let base = self.layer_bases[layer];
            let layer_size = self.layer_bases[layer + 1] - base;
            let bucket = map32_to_32(mhc as u32, layer_size as u32) as usize;
            let threshold = (mhc >> 32) as u32;
            let stored = self.thresholds.get_fragment(base + bucket, self.threshold_bits) as usize;
            if threshold <= self.threshold_mapping[stored] {
                return base + bucket;
            }
        }
        let rank = match self.fallback.get(&mhc) {
            Some(rank) => *rank,
            None => 0, // image outside the construction set
        };
        let bucket = match self.free_positions.as_ref().and_then(|fp| fp.try_select(rank)) {
            Some(position) => position - rank,
            None => return 0,
        };
        if bucket >= self.nbuckets {
            bucket - self.nbuckets + self.k * self.nbuckets // final short bucket
        } else {
            bucket
        }
    }

    /// Space used, in bits.
    pub fn bits(&self) -> usize {
        8 * self.size_bytes()
    }

    /// Returns number of bytes which [`write`](Self::write) will write.
    pub fn write_bytes(&self) -> usize {
        VByte::size(self.num_keys) + VByte::size(self.k)
            + AsIs::array_content_size(&self.thresholds)
            + VByte::size(self.fallback.len()) + self.fallback.len() * AsIs::size(0u64)
            + VByte::size(self.free_positions.as_ref().map_or(0, |fp| fp.content.len()))
            + self.free_positions.as_ref().map_or(0, |fp| AsIs::array_content_size(&fp.content))
    }

    /// Writes `self` to the `output`.
    pub fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        VByte::write(output, self.num_keys)?;
        VByte::write(output, self.k)?;
        AsIs::write_all(output, self.thresholds.iter())?;
        let mut fallback_by_rank = vec![0u64; self.fallback.len()];
        for (mhc, rank) in &self.fallback {
            fallback_by_rank[*rank] = *mhc;
        }
        VByte::write(output, fallback_by_rank.len())?;
        AsIs::write_all(output, fallback_by_rank.iter())?;
        match &self.free_positions {
            Some(fp) => {
                VByte::write(output, fp.content.len())?;
                AsIs::write_all(output, fp.content.iter())
            }
            None => VByte::write(output, 0usize),
        }
    }

    /// Reads `Self` from the `input`.
    pub fn read(input: &mut dyn io::Read) -> io::Result<Self> {
        let num_keys: usize = VByte::read(input)?;
        let k: usize = VByte::read(input)?;
        let nbuckets = num_keys / k;
        let threshold_bits = (crate::utils::int_log2(k) - 1) as u8;
        let thresholds = AsIs::read_n(input, bitm::ceiling_div(nbuckets * threshold_bits as usize, 64))?;
        let fallback_len: usize = VByte::read(input)?;
        let fallback_by_rank: Box<[u64]> = AsIs::read_n(input, fallback_len)?;
        let mut fallback = HashMap::with_capacity_and_hasher(fallback_len, FxBuildHasher::default());
        for (rank, mhc) in fallback_by_rank.iter().enumerate() {
            fallback.insert(*mhc, rank);
        }
        let free_words: usize = VByte::read(input)?;
        let free_positions = if free_words == 0 { None } else {
            let content: Box<[u64]> = AsIs::read_n(input, free_words)?;
            let (with_rank, _) = ArrayWithRank::build(content);
            Some(with_rank)
        };
        let buckets_layer0 = 1.max((OVERLOAD_FACTOR * nbuckets as f64).ceil() as usize);
        let layer_bases: Box<[usize]> = if buckets_layer0 >= nbuckets {
            vec![0, nbuckets].into_boxed_slice()
        } else {
            vec![0, buckets_layer0, nbuckets].into_boxed_slice()
        };
        Ok(Self {
            num_keys, k, nbuckets, threshold_bits, thresholds,
            threshold_mapping: fill_threshold_mapping(1usize << threshold_bits),
            layer_bases, fallback, free_positions,
        })
    }
}

impl GetSize for BumpedKPerfect {
    fn size_bytes_dyn(&self) -> usize {
        self.thresholds.size_bytes_dyn()
            + self.threshold_mapping.size_bytes_dyn()
            + self.layer_bases.size_bytes_dyn()
            // open-addressed map: key, value and a control byte per slot
            + self.fallback.capacity() * (std::mem::size_of::<(u64, usize)>() + 1)
            + self.free_positions.as_ref().map_or(0, |fp| fp.size_bytes_dyn())
    }
    const USES_DYN_MEM: bool = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use butils::XorShift64;

    fn validate_k_perfection(keys: &[u64], k: usize) -> BumpedKPerfect {
        let f = BumpedKPerfect::new(keys, k);
        let nbuckets = keys.len() / k;
        let keys_in_end_bucket = keys.len() - nbuckets * k;
        let mut fill = vec![0usize; nbuckets];
        let mut end_bucket_taken = vec![false; keys_in_end_bucket];
        for key in keys {
            let bucket = f.get(*key);
            if bucket >= nbuckets {
                let position = bucket - k * nbuckets;
                assert!(position < keys_in_end_bucket, "end-bucket value out of range: {}", bucket);
                assert!(!end_bucket_taken[position], "end-bucket collision at {}", position);
                end_bucket_taken[position] = true;
            } else {
                fill[bucket] += 1;
            }
        }
        for (bucket, &count) in fill.iter().enumerate() {
            assert_eq!(count, k, "bucket {} holds {} keys instead of {}", bucket, count, k);
        }
        f
    }

    #[test]
    fn test_exact_multiple() {
        let keys: Vec<u64> = XorShift64(0x1337).take(64 * 256).collect();
        validate_k_perfection(&keys, 256);
    }

    #[test]
    fn test_with_leftover() {
        let keys: Vec<u64> = XorShift64(42).take(20 * 256 + 37).collect();
        let f = validate_k_perfection(&keys, 256);
        assert_eq!(f.nbuckets(), 20);
    }

    #[test]
    fn test_single_layer_collapse() {
        // few buckets: the overloaded first layer covers all of them
        let keys: Vec<u64> = XorShift64(3).take(8 * 1024).collect();
        let f = validate_k_perfection(&keys, 1024);
        assert_eq!(f.layers(), 1);
    }

    #[test]
    fn test_determinism() {
        let keys: Vec<u64> = XorShift64(5).take(16 * 128 + 100).collect();
        let a = BumpedKPerfect::new(&keys, 128);
        let b = BumpedKPerfect::with_threads(&keys, 128, 2);
        assert_eq!(a.thresholds, b.thresholds);
        for key in &keys {
            assert_eq!(a.get(*key), b.get(*key));
        }
    }

    #[test]
    fn test_threshold_mapping() {
        let mapping = fill_threshold_mapping(1 << 7);
        assert_eq!(mapping.len(), 128);
        assert_eq!(mapping[0], 0);
        assert_eq!(mapping[127], u32::MAX);
        assert!(mapping.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(compact_threshold(&mapping, 0), 0);
        assert_eq!(compact_threshold(&mapping, u32::MAX), 127);
        for code in 1..mapping.len() {
            assert_eq!(compact_threshold(&mapping, mapping[code - 1] + 1), code);
        }
    }

    #[test]
    fn test_read_write() {
        let keys: Vec<u64> = XorShift64(7).take(10 * 512 + 11).collect();
        let f = BumpedKPerfect::new(&keys, 512);
        let mut buff = Vec::new();
        f.write(&mut buff).unwrap();
        assert_eq!(buff.len(), f.write_bytes());
        let read = BumpedKPerfect::read(&mut &buff[..]).unwrap();
        assert_eq!(read.layer_bases, f.layer_bases);
        for key in &keys {
            assert_eq!(read.get(*key), f.get(*key));
        }
    }
}
