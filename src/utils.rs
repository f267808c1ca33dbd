//! Utility functions.

use binout::{AsIs, Serializer};
use bitm::{RankSelect101111, CombinedSampling, ceiling_div};
pub use seedable_hash::{map64_to_64, map32_to_32};

/// Bit vector with rank structure and constant-time select support.
pub type ArrayWithRank = RankSelect101111<CombinedSampling>;

/// Reads `number_of_bits` bits, rounded up to multiple of 64, from `input`.
pub fn read_bits<R: std::io::Read + ?Sized>(input: &mut R, number_of_bits: usize) -> std::io::Result<Box<[u64]>> {
    AsIs::read_n(input, ceiling_div(number_of_bits, 64))
}

/// Remixes the bits of `z` with the avalanching finalizer of splitmix64.
#[inline(always)]
pub const fn remix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// Returns ⌊log₂(`x`)⌋. `x` must be nonzero.
#[inline(always)]
pub(crate) const fn int_log2(x: usize) -> u32 {
    usize::BITS - 1 - x.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_log2() {
        assert_eq!(int_log2(1), 0);
        assert_eq!(int_log2(2), 1);
        assert_eq!(int_log2(1024), 10);
        assert_eq!(int_log2(1025), 10);
    }

    #[test]
    fn test_remix_is_mixing() {
        assert_ne!(remix(0), 0);
        assert_ne!(remix(1), remix(2));
        // low bit of consecutive inputs should not be constant
        let low_bits: u32 = (0..64u64).map(|i| (remix(i) & 1) as u32).sum();
        assert!(low_bits > 16 && low_bits < 48);
    }
}
