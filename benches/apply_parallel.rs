//! Benchmarks for per-slice parallel execution
//!
//! Measures `apply_parallel` over a mid-sized float32 stack for several
//! worker counts, and the chunk planner for a full-size detector stack.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tomochunk::prelude::*;

fn stack(shape: &Shape) -> SharedArray {
    let data: Vec<f32> = (0..shape.element_count()).map(|i| (i % 4096) as f32).collect();
    SharedArray::from_slice(shape, &data).unwrap()
}

fn minus_log(src: &[f32], dst: &mut [f32]) -> Result<(), BoxError> {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = -(s + 1.0).ln();
    }
    Ok(())
}

/// Benchmark apply_parallel with different core counts
fn bench_apply_parallel(c: &mut Criterion) {
    let shape = Shape::new([128, 256, 256]).unwrap();
    let mut group = c.benchmark_group("apply_parallel");
    group.throughput(Throughput::Bytes((shape.element_count() * 4) as u64));
    group.sample_size(20);

    for cores in [1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("cores", cores), &cores, |b, &cores| {
            let options = ParallelOptions::new().with_cores(cores).with_chunksize(4);
            let source = stack(&shape);
            b.iter(|| {
                let destination = create_shared_array(&shape, ElementDtype::Float32).unwrap();
                let out = apply_into(&source, destination, minus_log, &options, &NullProgress).unwrap();
                black_box(out)
            });
        });
    }

    group.finish();
}

/// Benchmark chunk planning
fn bench_planner(c: &mut Criterion) {
    let shape = Shape::new([1800, 2048, 2048]).unwrap();
    c.bench_function("compute_chunk_plan_1800x2048x2048", |b| {
        b.iter(|| {
            let plan = compute_chunk_plan(black_box(&shape), 0, "float32", 2048.0, 1.0).unwrap();
            black_box(plan)
        });
    });
}

criterion_group!(benches, bench_apply_parallel, bench_planner);
criterion_main!(benches);
