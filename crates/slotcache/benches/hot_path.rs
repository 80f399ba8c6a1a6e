use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use slotcache::{Cache, OpenOptions, ScanOptions};
use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn scratch_path(tag: &str) -> std::path::PathBuf {
    let pid = std::process::id();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("slotcache_bench_{tag}_{pid}_{n}.slc"))
}

fn populated(capacity: u64, n: u64) -> Cache {
    let path = scratch_path("populated");
    let cache = Cache::open(OpenOptions::new(&path, 8, 8, capacity)).unwrap();
    let mut w = cache.writer().unwrap();
    for i in 0..n {
        w.put(&i.to_be_bytes(), i as i64, &i.to_le_bytes()).unwrap();
    }
    w.commit().unwrap();
    cache
}

fn bench_get(c: &mut Criterion) {
    let cache = populated(100_000, 50_000);
    let mut i = 0u64;
    c.bench_function("get_hit", |b| {
        b.iter(|| {
            i = (i + 1) % 50_000;
            cache.get(&i.to_be_bytes()).unwrap()
        })
    });
}

fn bench_commit_single_put(c: &mut Criterion) {
    let cache = populated(200_000, 100_000);
    let mut i = 100_000u64;
    c.bench_function("commit_single_insert", |b| {
        b.iter_batched(
            || {
                i += 1;
                i
            },
            |key| {
                let mut w = cache.writer().unwrap();
                w.put(&key.to_be_bytes(), key as i64, &key.to_le_bytes()).unwrap();
                w.commit().unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_scan(c: &mut Criterion) {
    let cache = populated(20_000, 10_000);
    c.bench_function("scan_all", |b| b.iter(|| cache.scan(&ScanOptions::new()).unwrap()));
}

criterion_group!(benches, bench_get, bench_commit_single_put, bench_scan);
criterion_main!(benches);
