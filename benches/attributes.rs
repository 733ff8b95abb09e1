use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::PathBuf;
use std::time::Duration;

use spacefs::metadata::{Attributes, FileBackend, MetadataBackend};

fn gen_attrs(n: usize, seed: u64) -> Attributes {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut a = Attributes::new();
    for i in 0..n {
        let len = rng.gen_range(8..64);
        let v: Vec<u8> = (0..len).map(|_| rng.gen::<u8>()).collect();
        a.set(format!("md.key{}", i), v);
    }
    a
}

fn node_paths(dir: &std::path::Path, n: usize) -> Vec<PathBuf> {
    (0..n)
        .map(|i| {
            let p = dir.join(format!("node-{}", i));
            std::fs::write(&p, b"").unwrap();
            p
        })
        .collect()
}

fn bench_attributes(c: &mut Criterion) {
    let backend = FileBackend::new(Duration::from_secs(5), Duration::from_millis(1));
    let mut group = c.benchmark_group("attribute_store");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(20);

    for &n in &[8usize, 64usize] {
        let dir = tempfile::tempdir().unwrap();
        let paths = node_paths(dir.path(), 100);
        let attrs = gen_attrs(n, 0xBEEF_CAFE);

        group.throughput(Throughput::Elements(paths.len() as u64));
        group.bench_with_input(BenchmarkId::new("set_multiple", n.to_string()), &n, |b, _| {
            b.iter(|| {
                for p in &paths {
                    backend.set_multiple(p, &attrs, true).unwrap();
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("all", n.to_string()), &n, |b, _| {
            b.iter(|| {
                let mut total = 0usize;
                for p in &paths {
                    total += backend.all(p).unwrap().len();
                }
                criterion::black_box(total);
            });
        });

        group.bench_with_input(BenchmarkId::new("update_one", n.to_string()), &n, |b, _| {
            let mut rng = StdRng::seed_from_u64(0xFACE_FEED);
            b.iter(|| {
                let p = &paths[rng.gen_range(0..paths.len())];
                let mut one = Attributes::new();
                one.set_u64("treesize", rng.gen::<u32>() as u64);
                backend.update(p, &["tmp.etag"], &one, true).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_attributes);
criterion_main!(benches);
