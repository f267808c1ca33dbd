use std::time::Instant;

use butils::XorShift64;
use clap::{Parser, ValueEnum};
use consensus_mphf::{BuildConf, Consensus, Function, LevelwiseFunction};

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Method {
    /// Bucketed function, depth-first construction order
    DepthFirst,
    /// Bucketed function, levelwise construction order (faster construction,
    /// slower queries)
    Levelwise,
    /// Single splitting tree without bucketing; requires n to be a power of two
    Single,
}

impl Method {
    fn name(&self) -> &'static str {
        match self {
            Method::DepthFirst => "Consensus",
            Method::Levelwise => "ConsensusLevelwise",
            Method::Single => "ConsensusSingleTree",
        }
    }
}

/// Benchmarks minimal perfect hash functions based on combined search and
/// encoding of splitting-tree seeds.
#[derive(Parser)]
struct Conf {
    /// Number of keys to construct with
    #[arg(short = 'n', long, default_value_t = 1_000_000)]
    num_keys: usize,

    /// Number of queries to measure
    #[arg(short = 'q', long, default_value_t = 1_000_000)]
    num_queries: usize,

    /// Number of keys per splitting tree; a power of two
    #[arg(short = 'k', long, default_value_t = 1 << 15)]
    bucket_size: usize,

    /// Space overhead parameter ε
    #[arg(short = 'e', long, default_value_t = 0.01)]
    overhead: f64,

    /// Construction method
    #[arg(short = 'o', long, value_enum, default_value_t = Method::DepthFirst)]
    method: Method,

    /// Seed of the random key generator
    #[arg(short = 's', long, default_value_t = 1234)]
    seed: u64,
}

fn benchmark(conf: &Conf, keys: &[u64], construction_ms: u128, bits: usize, get: impl Fn(u64) -> usize) {
    println!("testing");
    let mut taken = vec![false; keys.len()];
    for (i, key) in keys.iter().enumerate() {
        let value = get(*key);
        if value >= keys.len() {
            eprintln!("out of range value for key {}!", i);
            std::process::exit(1);
        }
        if taken[value] {
            eprintln!("collision by key {}!", i);
            std::process::exit(1);
        }
        taken[value] = true;
    }

    println!("preparing query plan");
    let query_plan: Vec<u64> = XorShift64(conf.seed ^ 0x5555_5555_5555_5555)
        .take(conf.num_queries)
        .map(|random| keys[random as usize % keys.len()])
        .collect();

    println!("querying");
    let begin_queries = Instant::now();
    let mut checksum = 0usize;
    for key in &query_plan {
        checksum = checksum.wrapping_add(get(*key));
    }
    let query_ms = begin_queries.elapsed().as_millis();

    println!("RESULT method={} overhead={} N={} numQueries={} queryTimeMilliseconds={} constructionTimeMilliseconds={} bitsPerElement={:.4} checksum={}",
        conf.method.name(), conf.overhead, keys.len(), conf.num_queries,
        query_ms, construction_ms, bits as f64 / keys.len() as f64, checksum);
}

fn main() {
    let conf = Conf::parse();

    println!("generating input data (seed: {})", conf.seed);
    let keys: Vec<u64> = XorShift64(conf.seed).take(conf.num_keys).collect();

    println!("constructing");
    match conf.method {
        Method::DepthFirst => {
            let build_conf = BuildConf::bs_eps(conf.bucket_size, conf.overhead);
            let begin = Instant::now();
            let f = Function::with_keys_conf(&keys, build_conf);
            let elapsed = begin.elapsed().as_millis();
            benchmark(&conf, &keys, elapsed, f.bits(), |key| f.get_hash(key));
        }
        Method::Levelwise => {
            let build_conf = BuildConf::bs_eps(conf.bucket_size, conf.overhead);
            let begin = Instant::now();
            let f = LevelwiseFunction::with_keys_conf(&keys, build_conf);
            let elapsed = begin.elapsed().as_millis();
            benchmark(&conf, &keys, elapsed, f.bits(), |key| f.get_hash(key));
        }
        Method::Single => {
            let begin = Instant::now();
            let f = Consensus::new(&keys, conf.overhead);
            let elapsed = begin.elapsed().as_millis();
            benchmark(&conf, &keys, elapsed, f.bits(), |key| f.get(key));
        }
    }
}
