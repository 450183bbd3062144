/// Loss Table Builder Benchmarks
///
/// Measures the 2-D table precomputation, the performance-critical path of
/// an experiment. The monotone-reuse fast path is what keeps realistic
/// grids tractable; the benchmark sweeps grid densities so a regression in
/// the copy path shows up as superlinear scaling.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use certeza::{build_ood_table, build_selective_table, linspace, ClassificationData, LambdaGrid, OodData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn synthetic_ood(n: usize, classes: usize) -> OodData {
    let mut rng = StdRng::seed_from_u64(0);
    let mut softmax_ind = Vec::with_capacity(n);
    let mut labels_ind = Vec::with_capacity(n);
    for _ in 0..n {
        let mut probs: Vec<f64> = (0..classes).map(|_| rng.gen_range(0.01..1.0)).collect();
        let total: f64 = probs.iter().sum();
        for p in &mut probs {
            *p /= total;
        }
        labels_ind.push(rng.gen_range(0..classes));
        softmax_ind.push(probs);
    }
    OodData {
        ood_scores_ind: (0..n).map(|_| rng.gen_range(0.0..1.0)).collect(),
        softmax_ind,
        labels_ind,
        ood_scores_ood: (0..n).map(|_| rng.gen_range(0.0..1.0)).collect(),
    }
}

fn bench_ood_builder(c: &mut Criterion) {
    let data = synthetic_ood(2_000, 10);
    let mut group = c.benchmark_group("ood_table_build");
    for grid_side in [25usize, 50, 100] {
        let grid = LambdaGrid::two_dim(
            linspace(0.0, 1.0, grid_side),
            linspace(0.0, 1.0, grid_side),
        );
        group.throughput(Throughput::Elements((grid_side * grid_side) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(grid_side),
            &grid,
            |b, grid| {
                b.iter(|| build_ood_table(black_box(&data), black_box(grid)).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_selective_builder(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let data = ClassificationData {
        scores: (0..20_000).map(|_| rng.gen_range(0.0..1.0)).collect(),
        corrects: (0..20_000).map(|_| rng.gen_bool(0.85)).collect(),
    };
    let grid = LambdaGrid::one_dim(linspace(0.0, 1.0, 1_000));
    c.bench_function("selective_table_build_20k_x_1k", |b| {
        b.iter(|| build_selective_table(black_box(&data), black_box(&grid)).unwrap());
    });
}

criterion_group!(benches, bench_ood_builder, bench_selective_builder);
criterion_main!(benches);
