use butils::XorShift64;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use consensus_mphf::{BuildConf, Function, LevelwiseFunction};

pub fn get_hash(c: &mut Criterion) {
    let keys: Vec<u64> = XorShift64(1234).take(16 * 1024).collect();
    let depth_first = Function::with_keys_conf(&keys, BuildConf::bs_eps(1024, 0.1));
    let levelwise = LevelwiseFunction::with_keys_conf(&keys, BuildConf::bs_eps(1024, 0.1));
    let mut group = c.benchmark_group("get_hash");
    for nr in [0usize, 1000, 16000] {
        let key = keys[nr];
        group.bench_with_input(BenchmarkId::new("depth_first", nr), &key, |b, &key| {
            b.iter(|| depth_first.get_hash(key))
        });
        group.bench_with_input(BenchmarkId::new("levelwise", nr), &key, |b, &key| {
            b.iter(|| levelwise.get_hash(key))
        });
    }
    group.finish();
}

criterion_group!(consensus, get_hash);
criterion_main!(consensus);
