use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use teleop_sync::align::dedup::motion_keep_indices;
use teleop_sync::align::nearest::nearest_indices;

/// 30 Hz camera timeline against a 120 Hz controller stream, `secs` long.
fn timelines(secs: i64) -> (Vec<i64>, Vec<i64>) {
    let reference = (0..secs * 30).map(|i| i * 33_333_333).collect();
    let samples = (0..secs * 120).map(|i| i * 8_333_333 + (i % 7) * 10_000).collect();
    (reference, samples)
}

fn bench_nearest(c: &mut Criterion) {
    let mut group = c.benchmark_group("Align_nearest");

    for secs in [10, 60, 600] {
        let (reference, samples) = timelines(secs);
        group.bench_function(format!("two_pointer_{secs}s"), |b| {
            b.iter(|| nearest_indices(black_box(&reference), black_box(&samples)));
        });
    }
    group.finish();
}

fn bench_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("Align_dedup");

    // 14-dof pose, moving every other frame
    let poses: Vec<Vec<f64>> = (0..18_000)
        .map(|i| vec![(i / 2) as f64 * 1e-3; 14])
        .collect();
    group.bench_function("motion_keep_10min", |b| {
        b.iter_batched(
            || poses.clone(),
            |p| motion_keep_indices(black_box(&p), 1e-5),
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_nearest, bench_dedup);
criterion_main!(benches);
