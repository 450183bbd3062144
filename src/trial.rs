//! Single calibration/validation trial
//!
//! One trial draws a seeded random permutation of the table rows, splits
//! it into a calibration prefix of `num_calib` rows and a validation
//! remainder, runs the rejection-region selection on the calibration view,
//! and evaluates the realized risks and mean prediction-set size of the
//! chosen threshold on the held-out view. The shared loss table is never
//! mutated; a trial owns nothing but its permutation.
//!
//! Determinism: the permutation seed is derived from the global seed and
//! the trial index through a SplitMix64 mixer, so identical inputs produce
//! identical `(lambda, risks, size)` triples regardless of how trials are
//! scheduled across workers.
//!
//! Empty valid set policy: the trial reports zero risk and zero size with
//! the most conservative grid boundary as the placeholder threshold
//! (predict nothing), and flags the record so aggregation can count it.
//! NaN means over empty validation subsets are normalized to 0; this is a
//! documented policy, not an accident of arithmetic.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::LambdaGrid;
use crate::region::{RejectionRegion, Selection};
use crate::risk::RiskProfile;
use crate::table::LossTable;

/// Errors raised before a trial can run at all
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("num_calib {num_calib} leaves no {side} split for {num_examples} examples")]
    BadSplit {
        num_calib: usize,
        num_examples: usize,
        side: &'static str,
    },
}

/// Result type for trial execution
pub type Result<T> = std::result::Result<T, TrialError>;

/// SplitMix64 counter mixing: deterministic, well-distributed seeds for
/// parallel trials from a base seed and a trial counter.
pub fn mix_seed(base_seed: u64, counter: u64) -> u64 {
    let mut z = base_seed.wrapping_add(counter.wrapping_mul(0x9e37_79b9_7f4a_7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Everything one trial produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub trial_index: usize,
    /// Flat grid cell of the selected threshold (the conservative
    /// boundary when `empty`).
    pub cell: usize,
    /// Lambda values of the selected cell.
    pub lambda: Vec<f64>,
    /// Realized validation risks, one per constraint.
    pub risks: Vec<f64>,
    /// Mean prediction-set size (selection indicator for 1-D problems)
    /// over the validation split.
    pub mean_size: f64,
    /// True when no cell was statistically valid.
    pub empty: bool,
}

/// Run one seeded calibration/validation trial.
pub fn run_trial(
    table: &LossTable,
    grid: &LambdaGrid,
    profile: &RiskProfile,
    region: &RejectionRegion,
    num_calib: usize,
    delta: f64,
    seed: u64,
    trial_index: usize,
) -> Result<TrialOutcome> {
    let n = table.num_examples();
    if num_calib == 0 {
        return Err(TrialError::BadSplit {
            num_calib,
            num_examples: n,
            side: "calibration",
        });
    }
    if num_calib >= n {
        return Err(TrialError::BadSplit {
            num_calib,
            num_examples: n,
            side: "validation",
        });
    }

    let mut rng = StdRng::seed_from_u64(mix_seed(seed, trial_index as u64));
    let mut rows: Vec<usize> = (0..n).collect();
    rows.shuffle(&mut rng);

    let calib = table.view(&rows[..num_calib]);
    let val = table.view(&rows[num_calib..]);

    match region.select(&calib, profile, grid, delta) {
        Selection::Chosen { cell, lambda } => Ok(TrialOutcome {
            trial_index,
            cell,
            lambda,
            risks: profile.realized_risks(&val, cell),
            mean_size: val.mean_size(cell),
            empty: false,
        }),
        Selection::Empty => {
            let cell = grid.conservative_cell();
            Ok(TrialOutcome {
                trial_index,
                cell,
                lambda: grid.cell_values(cell),
                risks: vec![0.0; profile.num_risks()],
                mean_size: 0.0,
                empty: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::linspace;
    use crate::table::{build_selective_table, ClassificationData};

    fn toy_setup() -> (LossTable, LambdaGrid, RiskProfile) {
        let data = ClassificationData {
            scores: (0..200).map(|i| (i as f64 + 0.5) / 200.0).collect(),
            corrects: (0..200).map(|i| i % 4 != 0).collect(),
        };
        let grid = LambdaGrid::one_dim(linspace(0.0, 1.0, 25));
        let out = build_selective_table(&data, &grid).unwrap();
        (out.table, grid, RiskProfile::selective_pfdp(0.3))
    }

    #[test]
    fn test_trial_is_deterministic_under_seed() {
        let (table, grid, profile) = toy_setup();
        let region = RejectionRegion::Bonferroni;
        let a = run_trial(&table, &grid, &profile, &region, 120, 0.1, 7, 3).unwrap();
        let b = run_trial(&table, &grid, &profile, &region, 120, 0.1, 7, 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_trials_get_distinct_permutations() {
        let mut a: Vec<usize> = (0..50).collect();
        let mut b = a.clone();
        a.shuffle(&mut StdRng::seed_from_u64(mix_seed(7, 0)));
        b.shuffle(&mut StdRng::seed_from_u64(mix_seed(7, 1)));
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_selection_falls_back_conservatively() {
        // Scores all wrong: no lambda can control pFDP at 1%
        let data = ClassificationData {
            scores: (0..100).map(|i| (i as f64 + 0.5) / 100.0).collect(),
            corrects: vec![false; 100],
        };
        let grid = LambdaGrid::one_dim(linspace(0.0, 0.9, 10));
        let out = build_selective_table(&data, &grid).unwrap();
        let profile = RiskProfile::selective_pfdp(0.01);
        let outcome = run_trial(
            &out.table,
            &grid,
            &profile,
            &RejectionRegion::Bonferroni,
            60,
            0.1,
            0,
            0,
        )
        .unwrap();
        assert!(outcome.empty);
        assert!((outcome.lambda[0] - 0.9).abs() < 1e-9);
        assert_eq!(outcome.risks, vec![0.0]);
        assert_eq!(outcome.mean_size, 0.0);
    }

    #[test]
    fn test_bad_split_is_rejected() {
        let (table, grid, profile) = toy_setup();
        let region = RejectionRegion::Bonferroni;
        assert!(run_trial(&table, &grid, &profile, &region, 0, 0.1, 0, 0).is_err());
        assert!(run_trial(&table, &grid, &profile, &region, 200, 0.1, 0, 0).is_err());
    }

    #[test]
    fn test_mix_seed_spreads_counters() {
        let seeds: Vec<u64> = (0..100).map(|i| mix_seed(42, i)).collect();
        let mut dedup = seeds.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), seeds.len());
    }
}
