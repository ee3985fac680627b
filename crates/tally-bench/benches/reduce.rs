use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tally_bench::{make_rng, random_records, random_tuples};
use tally_group::{CoordinatedGroup, GroupConfig, SingleProcess};
use tally_stats::{compute, format_g, print, PrintOptions, StatTuple};

// ---------------------------------------------------------------------------
// Merge operator
// ---------------------------------------------------------------------------

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    for &n in &[1usize, 64, 4096] {
        let input = random_tuples(n, 1);
        let base = random_tuples(n, 0);
        group.bench_with_input(BenchmarkId::new("merge_slices", n), &n, |b, _| {
            b.iter(|| {
                let mut inout = base.clone();
                StatTuple::merge_slices(
                    bytemuck::cast_slice(&input),
                    bytemuck::cast_slice_mut(&mut inout),
                );
                black_box(inout)
            })
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// compute: local derive vs. a coordinated all-reduce
// ---------------------------------------------------------------------------

fn bench_compute_single(c: &mut Criterion) {
    let comm = SingleProcess::new();
    let mut group = c.benchmark_group("compute_single");
    for &n in &[1usize, 16, 256] {
        let records = random_records(n, 8);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let mut records = records.clone();
                compute(&comm, &mut records).unwrap();
                black_box(records)
            })
        });
    }
    group.finish();
}

/// Time `iters` rounds of `compute` on every member of an in-process group;
/// reports the slowest member.
fn coordinated_rounds(size: usize, n: usize, iters: u64) -> Duration {
    let members = CoordinatedGroup::in_process(size, GroupConfig::default()).unwrap();
    let records = Arc::new(random_records(n, 8));
    let handles = members
        .into_iter()
        .map(|g| {
            let records = records.clone();
            thread::spawn(move || {
                let start = Instant::now();
                for _ in 0..iters {
                    let mut local = records.as_ref().clone();
                    compute(&g, &mut local).unwrap();
                    black_box(local);
                }
                start.elapsed()
            })
        })
        .collect::<Vec<_>>();
    handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .max()
        .unwrap_or_default()
}

fn bench_compute_coordinated(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_coordinated");
    group.sample_size(10);
    for &size in &[2usize, 4] {
        group.bench_with_input(BenchmarkId::new("participants", size), &size, |b, &size| {
            b.iter_custom(|iters| coordinated_rounds(size, 16, iters))
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Report formatting
// ---------------------------------------------------------------------------

fn bench_format(c: &mut Criterion) {
    let mut rng = make_rng();
    let values = (0..256)
        .map(|i| rng.f64() * 10f64.powi(i % 12 - 6))
        .collect::<Vec<_>>();
    c.bench_function("format_g", |b| {
        b.iter(|| {
            for &v in &values {
                black_box(format_g(black_box(v), 6));
            }
        })
    });

    let comm = SingleProcess::new();
    let mut records = random_records(32, 8);
    compute(&comm, &mut records).unwrap();
    c.bench_function("print_full_32", |b| {
        b.iter(|| {
            let mut sink = Vec::with_capacity(8192);
            print(&records, PrintOptions::new(true, true), Some(&mut sink)).unwrap();
            black_box(sink)
        })
    });
}

criterion_group!(
    benches,
    bench_merge,
    bench_compute_single,
    bench_compute_coordinated,
    bench_format,
);
criterion_main!(benches);
