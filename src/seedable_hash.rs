use std::hash::{BuildHasher, Hash, Hasher};

/// A trait for creating instances of [`Hasher`] that are initialized with a seed.
pub trait BuildSeededHasher {
    type Hasher: Hasher;

    /// Creates a new hasher initialized with given `seed`.
    fn build_hasher(&self, seed: u32) -> Self::Hasher;

    /// Calculates the hash of a single value, using given `seed`.
    #[inline]
    fn hash_one<T: Hash + ?Sized>(&self, x: &T, seed: u32) -> u64 {
        let mut h = self.build_hasher(seed);
        x.hash(&mut h);
        h.finish()
    }
}

/// [`BuildSeededHasher`] that uses standard [`BuildHasher`].
#[derive(Default, Copy, Clone)]
pub struct Seedable<BH: BuildHasher>(pub BH);

impl<BH: BuildHasher> BuildSeededHasher for Seedable<BH> {
    type Hasher = BH::Hasher;

    #[inline]
    fn build_hasher(&self, seed: u32) -> Self::Hasher {
        let mut result = self.0.build_hasher();
        result.write_u32(seed);
        result
    }
}

/// [`BuildSeededHasher`] that uses [`wyhash::WyHash`].
#[derive(Default, Copy, Clone)]
pub struct BuildDefaultSeededHasher;

impl BuildSeededHasher for BuildDefaultSeededHasher {
    type Hasher = wyhash::WyHash;

    #[inline] fn build_hasher(&self, seed: u32) -> Self::Hasher {
        Self::Hasher::with_seed(seed as u64)
    }
}
