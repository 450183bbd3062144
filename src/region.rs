//! Rejection-region strategies
//!
//! A rejection region is the subset of grid cells statistically certified
//! not to violate the target risks at family-wise confidence delta. Every
//! strategy runs the same three stages on a calibration view: compute the
//! corrected p-value vector (pure arithmetic, always succeeds), apply a
//! multiple-testing correction (may yield an empty set), and pick the
//! extremal cell with the deterministic tie-break. An empty valid set is a
//! defined outcome, not an error: the caller falls back to the most
//! conservative grid boundary and records zero risk and zero size.
//!
//! Strategies are a closed enum rather than boxed callables so a match is
//! exhaustive and adding a variant is a compile-time event.
//!
//! # References
//!
//! Holm, S. (1979). A simple sequentially rejective multiple test
//! procedure. Scandinavian Journal of Statistics 6(2).
//!
//! Romano, J. P., & Wolf, M. (2005). Exact and approximate stepdown
//! methods for multiple hypothesis testing. JASA 100(469).

use serde::{Deserialize, Serialize};

use crate::grid::LambdaGrid;
use crate::risk::RiskProfile;
use crate::table::TableView;

/// Default fraction of the calibration split spent on the coarse stage of
/// the multiscale strategy. A policy choice, not a derived constant.
pub const DEFAULT_COARSE_FRAC: f64 = 0.1;

/// Default widening of the coarse-stage band around delta. A policy
/// choice without a documented validity proof; kept configurable.
pub const DEFAULT_BAND_FACTOR: f64 = 1.5;

/// Multiple-testing strategy for certifying grid cells.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RejectionRegion {
    /// No multiplicity correction: certify every cell with p <= delta.
    /// Only valid when the p-values are already uniformly valid over the
    /// whole grid (a uniform concentration bound); there is no grid
    /// search to correct for.
    Uniform,

    /// Certify cells with p <= delta / num_cells. Conservative but valid
    /// under arbitrary dependence.
    Bonferroni,

    /// Fixed-sequence testing along the monotone cell ordering, from the
    /// most conservative cell down. The ordering is cut into
    /// `ceil(num_cells / downsample_factor)` segments started at evenly
    /// spaced cells; each segment is walked in order at budget
    /// delta / num_starts and stops at its first acceptance. Exploits
    /// loss monotonicity to spend far less correction than Bonferroni;
    /// `downsample_factor = num_cells` is the classical single-sequence
    /// test at full budget, `downsample_factor = 1` degenerates to
    /// brute-force Bonferroni.
    FixedSequence { downsample_factor: usize },

    /// Two-stage search: a coarse subsample of the calibration split
    /// locates the band of cells with p <= band_factor * delta, then the
    /// remaining fine sample is Bonferroni-corrected within that band
    /// only. If the coarse stage selects nothing, the fine stage falls
    /// back to the full grid (logged as a warning, not fatal).
    MultiscaleBootstrap { coarse_frac: f64, band_factor: f64 },
}

impl RejectionRegion {
    /// Multiscale strategy with the default coarse/band policy constants.
    pub fn multiscale() -> Self {
        Self::MultiscaleBootstrap {
            coarse_frac: DEFAULT_COARSE_FRAC,
            band_factor: DEFAULT_BAND_FACTOR,
        }
    }

    /// Human-readable strategy name, used in trial records and cache keys.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uniform => "Uniform",
            Self::Bonferroni => "Bonferroni",
            Self::FixedSequence { .. } => "Fixed Sequence",
            Self::MultiscaleBootstrap { .. } => "Multiscale Bootstrap",
        }
    }

    /// The set of certified cell indices, ascending. May be empty.
    pub fn valid_set(
        &self,
        calib: &TableView<'_>,
        profile: &RiskProfile,
        delta: f64,
    ) -> Vec<usize> {
        match *self {
            Self::Uniform => {
                let p = profile.corrected_p_values(calib);
                threshold_set(&p, delta)
            }
            Self::Bonferroni => {
                let p = profile.corrected_p_values(calib);
                bonferroni(&p, delta)
            }
            Self::FixedSequence { downsample_factor } => {
                let p = profile.corrected_p_values(calib);
                fixed_sequence(&p, delta, downsample_factor)
            }
            Self::MultiscaleBootstrap {
                coarse_frac,
                band_factor,
            } => multiscale(calib, profile, delta, coarse_frac, band_factor),
        }
    }

    /// Full selection pipeline: valid set, then the extremal cell.
    pub fn select(
        &self,
        calib: &TableView<'_>,
        profile: &RiskProfile,
        grid: &LambdaGrid,
        delta: f64,
    ) -> Selection {
        let valid = self.valid_set(calib, profile, delta);
        match grid.select_extremal(&valid) {
            Some(cell) => Selection::Chosen {
                cell,
                lambda: grid.cell_values(cell),
            },
            None => Selection::Empty,
        }
    }
}

/// Outcome of the selection state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// The extremal certified cell and its lambda values.
    Chosen { cell: usize, lambda: Vec<f64> },
    /// No cell is statistically valid at this confidence level.
    Empty,
}

/// Cells with p <= budget, no correction.
fn threshold_set(p_values: &[f64], budget: f64) -> Vec<usize> {
    p_values
        .iter()
        .enumerate()
        .filter(|(_, &p)| p <= budget)
        .map(|(i, _)| i)
        .collect()
}

/// Bonferroni: p <= delta / m.
fn bonferroni(p_values: &[f64], delta: f64) -> Vec<usize> {
    if p_values.is_empty() {
        return Vec::new();
    }
    threshold_set(p_values, delta / p_values.len() as f64)
}

/// Multi-start fixed-sequence testing over the descending cell order.
fn fixed_sequence(p_values: &[f64], delta: f64, downsample_factor: usize) -> Vec<usize> {
    let m = p_values.len();
    if m == 0 {
        return Vec::new();
    }
    let downsample_factor = downsample_factor.clamp(1, m);
    let num_starts = m.div_ceil(downsample_factor);
    let budget = delta / num_starts as f64;
    let seg_len = m.div_ceil(num_starts);

    let mut valid = Vec::new();
    for start in 0..num_starts {
        let lo = start * seg_len;
        let hi = ((start + 1) * seg_len).min(m);
        // Positions count down from the most conservative cell (index m-1)
        for pos in lo..hi {
            let cell = m - 1 - pos;
            if p_values[cell] <= budget {
                valid.push(cell);
            } else {
                break;
            }
        }
    }
    valid.sort_unstable();
    valid
}

/// Coarse/fine two-stage selection.
fn multiscale(
    calib: &TableView<'_>,
    profile: &RiskProfile,
    delta: f64,
    coarse_frac: f64,
    band_factor: f64,
) -> Vec<usize> {
    let n = calib.len();
    let n_coarse = ((n as f64) * coarse_frac.clamp(0.0, 1.0)) as usize;
    if n_coarse == 0 || n_coarse >= n {
        // Not enough rows to stage; plain Bonferroni on everything
        let p = profile.corrected_p_values(calib);
        return bonferroni(&p, delta);
    }

    let (coarse, fine) = calib.split_at(n_coarse);
    let p_coarse = profile.corrected_p_values(&coarse);
    let mut band: Vec<usize> = (0..p_coarse.len())
        .filter(|&i| p_coarse[i] <= band_factor * delta)
        .collect();
    if band.is_empty() {
        tracing::warn!(
            num_cells = p_coarse.len(),
            "multiscale coarse stage selected no cells; widening to the full grid"
        );
        band = (0..p_coarse.len()).collect();
    }

    let p_fine = profile.corrected_p_values(&fine);
    let budget = delta / band.len() as f64;
    band.into_iter().filter(|&i| p_fine[i] <= budget).collect()
}
