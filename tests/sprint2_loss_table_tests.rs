// Sprint 2: Loss table precomputation
// Integration tests for the table builders: monotone-reuse correctness,
// marginal curves, and cache idempotence.

use certeza::{
    build_ood_table, build_ood_table_cached, build_selective_table, CacheStore,
    ClassificationData, LambdaGrid, OodData,
};
use certeza::{linspace, LossTable};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn synthetic_ood(n: usize, classes: usize, seed: u64) -> OodData {
    let mut rng = StdRng::seed_from_u64(seed);
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
        ood_scores_ood: (0..n / 2).map(|_| rng.gen_range(0.3..1.0)).collect(),
    }
}

// ============================================================================
// Test 1: The 2-D builder's slice-reuse fast path changes nothing
// ============================================================================

#[test]
fn test_ood_builder_reuse_equals_dense_grid() {
    // A grid much finer than the score resolution forces many adjacent
    // lambda1 values onto the same filter boundary, exercising the copy
    // path; a coarse grid recomputes every slice. Cells shared by both
    // grids must agree exactly.
    let data = synthetic_ood(120, 4, 9);
    let fine = LambdaGrid::two_dim(linspace(0.0, 1.0, 241), linspace(0.0, 1.0, 5));
    let coarse = LambdaGrid::two_dim(linspace(0.0, 1.0, 3), linspace(0.0, 1.0, 5));

    let fine_out = build_ood_table(&data, &fine).unwrap();
    let coarse_out = build_ood_table(&data, &coarse).unwrap();

    // lambda1 = 0.0, 0.5, 1.0 exist in both grids (fine indices 0, 120, 240)
    for (coarse_i1, fine_i1) in [(0usize, 0usize), (1, 120), (2, 240)] {
        for j in 0..5 {
            let coarse_cell = coarse.flat_index(&[coarse_i1, j]);
            let fine_cell = fine.flat_index(&[fine_i1, j]);
            for row in 0..120 {
                for slot in 0..2 {
                    assert_eq!(
                        coarse_out.table.loss(row, slot, coarse_cell),
                        fine_out.table.loss(row, slot, fine_cell),
                        "row {} slot {} lambda1 idx {}",
                        row,
                        slot,
                        coarse_i1
                    );
                }
                assert_eq!(
                    coarse_out.table.size(row, coarse_cell),
                    fine_out.table.size(row, fine_cell)
                );
            }
        }
    }
}

// ============================================================================
// Test 2: Marginal curves are monotone in lambda1
// ============================================================================

#[test]
fn test_ood_marginal_curves_monotone() {
    let data = synthetic_ood(200, 5, 3);
    let grid = LambdaGrid::two_dim(linspace(0.0, 1.0, 40), linspace(0.0, 1.0, 10));
    let out = build_ood_table(&data, &grid).unwrap();
    for w in out.frac_ind_flagged.windows(2) {
        assert!(w[1] <= w[0], "Type I curve must fall as lambda1 rises");
    }
    for w in out.frac_ood_flagged.windows(2) {
        assert!(w[1] <= w[0], "detection power curve must fall as lambda1 rises");
    }
}

// ============================================================================
// Test 3: Selective builder prediction-rate curve matches the table
// ============================================================================

#[test]
fn test_selective_predict_rate_consistent_with_sizes() {
    let mut rng = StdRng::seed_from_u64(11);
    let data = ClassificationData {
        scores: (0..500).map(|_| rng.gen_range(0.0..1.0)).collect(),
        corrects: (0..500).map(|_| rng.gen_bool(0.8)).collect(),
    };
    let grid = LambdaGrid::one_dim(linspace(0.0, 1.0, 30));
    let out = build_selective_table(&data, &grid).unwrap();
    let rows: Vec<usize> = (0..500).collect();
    let view = out.table.view(&rows);
    for cell in 0..grid.num_cells() {
        assert!(
            (out.predict_rate[cell] - view.mean_size(cell)).abs() < 1e-12,
            "curve and size table disagree at cell {}",
            cell
        );
    }
}

// ============================================================================
// Test 4: Cache idempotence - a hit returns a bit-identical table
// ============================================================================

#[test]
fn test_cache_hit_is_bit_identical() {
    let data = synthetic_ood(80, 3, 21);
    let grid = LambdaGrid::two_dim(linspace(0.0, 1.0, 15), linspace(0.0, 1.0, 8));
    let fresh = build_ood_table(&data, &grid).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cache = CacheStore::new(dir.path()).unwrap();

    let first = build_ood_table_cached(&cache, "synthetic-21", &data, &grid).unwrap();
    let second = build_ood_table_cached(&cache, "synthetic-21", &data, &grid).unwrap();

    assert_eq!(first.table, fresh.table);
    assert_eq!(second.table, fresh.table);
    assert_eq!(second.frac_ind_flagged, fresh.frac_ind_flagged);
    assert_eq!(second.frac_ood_flagged, fresh.frac_ood_flagged);
}

#[test]
fn test_cache_key_tracks_grid_identity() {
    // Same dataset id, different grid: the cached table must not alias
    let data = synthetic_ood(60, 3, 8);
    let grid_a = LambdaGrid::two_dim(linspace(0.0, 1.0, 6), linspace(0.0, 1.0, 4));
    let grid_b = LambdaGrid::two_dim(linspace(0.0, 1.0, 9), linspace(0.0, 1.0, 4));

    let dir = tempfile::tempdir().unwrap();
    let cache = CacheStore::new(dir.path()).unwrap();

    let a = build_ood_table_cached(&cache, "shared-id", &data, &grid_a).unwrap();
    let b = build_ood_table_cached(&cache, "shared-id", &data, &grid_b).unwrap();
    assert_eq!(a.table.num_cells(), 24);
    assert_eq!(b.table.num_cells(), 36);
}

// ============================================================================
// Test 5: Loss table serde round trip preserves every entry
// ============================================================================

#[test]
fn test_loss_table_serde_round_trip() {
    let mut table = LossTable::new(3, 2, 4);
    table.set_loss(1, 0, 2, 1.0);
    table.set_loss(2, 1, 3, 1.0);
    table.set_size(0, 1, 5.0);
    let bytes = rmp_serde::to_vec(&table).unwrap();
    let back: LossTable = rmp_serde::from_slice(&bytes).unwrap();
    assert_eq!(back, table);
}
