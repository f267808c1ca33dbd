#![doc = include_str!("../README.md")]

pub mod utils;
pub mod stats;
pub mod seedable_hash;
pub use seedable_hash::{BuildDefaultSeededHasher, BuildSeededHasher, Seedable};

pub mod bits;
pub use bits::UnalignedBitVector;

pub mod layout;
pub use layout::TreeLayout;

pub mod kphf;
pub use kphf::BumpedKPerfect;

mod search;

mod consensus;
pub use consensus::Consensus;

mod function;
pub use function::{BuildConf, Function};

mod levelwise;
pub use levelwise::LevelwiseFunction;

pub use dyn_size_of::GetSize;
