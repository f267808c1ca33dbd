use std::io;

use binout::{AsIs, Serializer, VByte};
use dyn_size_of::GetSize;

use crate::bits::UnalignedBitVector;
use crate::layout::TreeLayout;
use crate::search::{search_with_root_seed, to_left, ROOT_SEED_BITS};
use crate::stats::BuildStatsCollector;

/// Minimal perfect hash function over exactly n = 2^l keys, built as a single
/// splitting tree with combined search and encoding of the seeds (*Consensus*).
///
/// Each internal node of the tree owns a fractional-bit window of a shared bit
/// vector; the successful seed that splits the node's keys into equal halves
/// is stored implicitly by the bit pattern the search leaves in that window.
/// The total size is within a chosen overhead ε of the information-theoretic
/// lower bound for splitting-based minimal perfect hashing.
///
/// For key sets that are not a power of two in size (or too large for a single
/// tree), see [`crate::Function`], which buckets the keys first.
pub struct Consensus {
    seeds: UnalignedBitVector,
    layout: TreeLayout,
    overhead: f64,
}

impl GetSize for Consensus {
    fn size_bytes_dyn(&self) -> usize {
        self.seeds.size_bytes_dyn() + self.layout.size_bytes_dyn()
    }
    const USES_DYN_MEM: bool = true;
}

impl Consensus {
    /// Builds the function for the given distinct, well-mixed 64-bit `keys`,
    /// reporting the search progress to `stats`.
    ///
    /// The number of keys must be a power of two and `overhead` must be
    /// positive. Returns [`None`] when the seed space is exhausted, which has
    /// never been observed with reasonable overheads and distinct keys.
    pub fn try_with_stats<BS: BuildStatsCollector>(keys: &[u64], overhead: f64, stats: &mut BS) -> Option<Self> {
        let layout = TreeLayout::new(keys.len(), overhead);
        let mut seeds = UnalignedBitVector::new(ROOT_SEED_BITS + layout.tree_bits());
        let mut keys = keys.to_vec();
        search_with_root_seed(&mut keys, &layout, &mut seeds, 1, stats)
            .then(|| Self { seeds, layout, overhead })
    }

    /// Builds the function for the given distinct, well-mixed 64-bit `keys`,
    /// whose number must be a power of two.
    ///
    /// Panics if the construction fails, which is almost certain to mean
    /// duplicate keys in the input.
    pub fn new(keys: &[u64], overhead: f64) -> Self {
        Self::try_with_stats(keys, overhead, &mut ())
            .expect("Constructing Consensus failed. Probably the input contains duplicate keys.")
    }

    /// Gets the value associated with the given `key`.
    ///
    /// The returned value is in the range from 0 (inclusive) to the number of
    /// input keys (exclusive). For a key outside the input set the result is
    /// an undetermined value from the same range.
    pub fn get(&self, key: u64) -> usize {
        let mut index = 0;
        for level in 0..self.layout.log2k() {
            let seed = self.seeds.read_at(self.layout.seed_end(level, index) + ROOT_SEED_BITS);
            index = 2 * index + usize::from(!to_left(key, seed));
        }
        index
    }

    /// Number of input keys.
    #[inline] pub fn len(&self) -> usize { 1 << self.layout.log2k() }

    /// Space used, in bits.
    #[inline] pub fn bits(&self) -> usize { self.seeds.bit_size() }

    /// Returns number of bytes which [`write`](Self::write) will write.
    pub fn write_bytes(&self) -> usize {
        VByte::size(self.len()) + AsIs::size(self.overhead.to_bits()) + self.seeds.write_bytes()
    }

    /// Writes `self` to the `output`.
    pub fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        VByte::write(output, self.len())?;
        AsIs::write(output, self.overhead.to_bits())?;
        self.seeds.write(output)
    }

    /// Reads `Self` from the `input`.
    pub fn read(input: &mut dyn io::Read) -> io::Result<Self> {
        let len: usize = VByte::read(input)?;
        let overhead = f64::from_bits(AsIs::read(input)?);
        let seeds = UnalignedBitVector::read(input)?;
        Ok(Self { seeds, layout: TreeLayout::new(len, overhead), overhead })
    }

    /// Restarts the search from the given root seed instead of zero;
    /// construction must still visit every splitting task.
    #[cfg(test)]
    pub(crate) fn with_root_seed(keys: &[u64], overhead: f64, root_seed: u64) -> Option<Self> {
        let layout = TreeLayout::new(keys.len(), overhead);
        let mut seeds = UnalignedBitVector::new(ROOT_SEED_BITS + layout.tree_bits());
        let mut keys = keys.to_vec();
        seeds.write_to(ROOT_SEED_BITS, root_seed);
        crate::search::find_seeds(&mut keys, &layout, &mut seeds, 1)
            .then(|| Self { seeds, layout, overhead })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butils::XorShift64;

    fn validate_perfection(keys: &[u64], f: &Consensus) {
        let mut seen = vec![false; keys.len()];
        for key in keys {
            let value = f.get(*key);
            assert!(value < keys.len(), "value {} out of range for key {}", value, key);
            assert!(!seen[value], "value {} assigned twice", value);
            seen[value] = true;
        }
    }

    #[test]
    fn test_single_tree_1024() {
        let keys: Vec<u64> = XorShift64(0xdecaf).take(1024).collect();
        let f = Consensus::new(&keys, 0.01);
        validate_perfection(&keys, &f);
        // exactly the tree plus the leading root-seed word, rounded to words
        let layout = TreeLayout::new(1024, 0.01);
        assert_eq!(f.bits(), (64 + layout.tree_bits() + 63) / 64 * 64);
    }

    #[test]
    fn test_tiny_trees() {
        for log2n in 1..=6 {
            for seed in 1..=8 {
                let keys: Vec<u64> = XorShift64(seed * 0xabcd).take(1 << log2n).collect();
                let f = Consensus::new(&keys, 0.05);
                validate_perfection(&keys, &f);
            }
        }
    }

    /// The tree search must also succeed when entered with a nonzero root
    /// seed, as happens after backtracking exhausts an unlucky one.
    #[test]
    fn test_recovers_from_any_root_seed() {
        let keys: Vec<u64> = XorShift64(99).take(256).collect();
        for root_seed in [1u64, 2, 31, 32, 1000] {
            let f = Consensus::with_root_seed(&keys, 0.05, root_seed)
                .expect("construction should succeed under every root seed");
            validate_perfection(&keys, &f);
        }
    }

    #[test]
    fn test_determinism() {
        let keys: Vec<u64> = XorShift64(4).take(512).collect();
        let a = Consensus::new(&keys, 0.1);
        let b = Consensus::new(&keys, 0.1);
        assert!(a.seeds == b.seeds);
    }

    #[test]
    fn test_read_write() {
        let keys: Vec<u64> = XorShift64(11).take(128).collect();
        let f = Consensus::new(&keys, 0.1);
        let mut buff = Vec::new();
        f.write(&mut buff).unwrap();
        assert_eq!(buff.len(), f.write_bytes());
        let read = Consensus::read(&mut &buff[..]).unwrap();
        assert!(read.seeds == f.seeds);
        validate_perfection(&keys, &read);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_wrong_input_size() {
        Consensus::new(&[1, 2, 3], 0.1);
    }
}
