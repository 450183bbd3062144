//! Loss/risk table precomputation
//!
//! The loss table is the expensive O(examples x grid) precomputation shared
//! read-only by every calibration trial: for each example, each loss slot,
//! and each grid cell it stores the realized loss, alongside a parallel
//! prediction-set-size table. Storage is a flat `Vec<f32>` with explicit
//! strides; trials index rows through a permutation view and never copy.
//!
//! Two builders are provided:
//!
//! - [`build_selective_table`]: 1-D threshold over a confidence score.
//!   Slot 0 is the abstention indicator (score <= lambda), slot 1 is the
//!   predicted-and-incorrect indicator. Each example's row is a step
//!   function of lambda, so it is filled in one pass per example.
//! - [`build_ood_table`]: 2-D (lambda1 = OOD cutoff, lambda2 = cumulative
//!   softmax mass). Slot 0 is the flagged-OOD indicator, slot 1 the
//!   missed-label indicator for surviving examples. Examples are sorted by
//!   the OOD score so the lambda1 filter boundary moves monotonically;
//!   whenever the boundary does not move between adjacent lambda1 values
//!   the previous slice is copied wholesale instead of recomputed, which is
//!   what keeps realistic grids (hundreds x hundreds over tens of
//!   thousands of examples) tractable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheStore;
use crate::grid::LambdaGrid;

/// Errors raised by the table builders
#[derive(Error, Debug)]
pub enum TableError {
    #[error("input streams differ in length: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },

    #[error("expected a {expected}-dimensional grid, got {got}")]
    GridDimension { expected: usize, got: usize },

    #[error("no examples provided")]
    Empty,

    #[error("label {label} out of range for {classes} classes (example {example})")]
    LabelOutOfRange {
        label: usize,
        classes: usize,
        example: usize,
    },
}

/// Result type for table construction
pub type Result<T> = std::result::Result<T, TableError>;

/// Realized losses and prediction-set sizes for every (example, cell) pair.
///
/// Built once per dataset/grid configuration, then shared read-only across
/// all trials (wrap in `Arc` for the parallel harness).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossTable {
    num_examples: usize,
    num_slots: usize,
    num_cells: usize,
    losses: Vec<f32>,
    sizes: Vec<f32>,
}

impl LossTable {
    /// Zero-filled table with the given shape.
    pub fn new(num_examples: usize, num_slots: usize, num_cells: usize) -> Self {
        Self {
            num_examples,
            num_slots,
            num_cells,
            losses: vec![0.0; num_examples * num_slots * num_cells],
            sizes: vec![0.0; num_examples * num_cells],
        }
    }

    pub fn num_examples(&self) -> usize {
        self.num_examples
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn num_cells(&self) -> usize {
        self.num_cells
    }

    #[inline]
    fn loss_index(&self, example: usize, slot: usize, cell: usize) -> usize {
        (example * self.num_slots + slot) * self.num_cells + cell
    }

    #[inline]
    pub fn loss(&self, example: usize, slot: usize, cell: usize) -> f32 {
        self.losses[self.loss_index(example, slot, cell)]
    }

    #[inline]
    pub fn set_loss(&mut self, example: usize, slot: usize, cell: usize, value: f32) {
        let i = self.loss_index(example, slot, cell);
        self.losses[i] = value;
    }

    #[inline]
    pub fn size(&self, example: usize, cell: usize) -> f32 {
        self.sizes[example * self.num_cells + cell]
    }

    #[inline]
    pub fn set_size(&mut self, example: usize, cell: usize, value: f32) {
        self.sizes[example * self.num_cells + cell] = value;
    }

    /// Copy every example's cell block `[from_cell, from_cell + len)` to
    /// `[to_cell, ...)` across all loss slots and the size table. This is
    /// the monotone-reuse fast path of the 2-D builder.
    fn copy_cell_block(&mut self, from_cell: usize, to_cell: usize, len: usize) {
        for example in 0..self.num_examples {
            for slot in 0..self.num_slots {
                let src = self.loss_index(example, slot, from_cell);
                let dst = self.loss_index(example, slot, to_cell);
                self.losses.copy_within(src..src + len, dst);
            }
            let src = example * self.num_cells + from_cell;
            let dst = example * self.num_cells + to_cell;
            self.sizes.copy_within(src..src + len, dst);
        }
    }

    /// Non-owning view over a subset of rows (a permutation slice).
    pub fn view<'a>(&'a self, rows: &'a [usize]) -> TableView<'a> {
        TableView { table: self, rows }
    }
}

/// Read-only view of a loss table restricted to a row subset.
///
/// Trials own a private permutation and look at the shared table only
/// through views, so no trial can disturb another.
#[derive(Clone, Copy)]
pub struct TableView<'a> {
    table: &'a LossTable,
    rows: &'a [usize],
}

impl<'a> TableView<'a> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn num_cells(&self) -> usize {
        self.table.num_cells()
    }

    /// Split into a leading view of `mid` rows and the remainder.
    pub fn split_at(&self, mid: usize) -> (TableView<'a>, TableView<'a>) {
        let (head, tail) = self.rows.split_at(mid);
        (
            TableView {
                table: self.table,
                rows: head,
            },
            TableView {
                table: self.table,
                rows: tail,
            },
        )
    }

    /// Plain empirical mean of a loss slot at a cell.
    pub fn mean_loss(&self, slot: usize, cell: usize) -> f64 {
        if self.rows.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .rows
            .iter()
            .map(|&r| f64::from(self.table.loss(r, slot, cell)))
            .sum();
        sum / self.rows.len() as f64
    }

    /// Joint moments for the conditional-risk rescaling: the mean of
    /// `slot * (1 - given)` and the mean of `(1 - given)`.
    pub fn gated_moments(&self, slot: usize, given: usize, cell: usize) -> (f64, f64) {
        if self.rows.is_empty() {
            return (0.0, 0.0);
        }
        let mut joint = 0.0;
        let mut pass = 0.0;
        for &r in self.rows {
            let gate = 1.0 - f64::from(self.table.loss(r, given, cell));
            joint += f64::from(self.table.loss(r, slot, cell)) * gate;
            pass += gate;
        }
        let n = self.rows.len() as f64;
        (joint / n, pass / n)
    }

    /// Mean of a loss slot over the rows where the gate slot is zero.
    /// Returns NaN on an empty gate-passing set; callers normalize.
    pub fn conditional_mean(&self, slot: usize, given: usize, cell: usize) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;
        for &r in self.rows {
            if self.table.loss(r, given, cell) == 0.0 {
                sum += f64::from(self.table.loss(r, slot, cell));
                count += 1;
            }
        }
        sum / count as f64
    }

    /// Mean prediction-set size (or selection indicator) at a cell.
    pub fn mean_size(&self, cell: usize) -> f64 {
        if self.rows.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .rows
            .iter()
            .map(|&r| f64::from(self.table.size(r, cell)))
            .sum();
        sum / self.rows.len() as f64
    }
}

/// Per-example confidence scores paired 1:1 with correctness indicators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationData {
    pub scores: Vec<f64>,
    pub corrects: Vec<bool>,
}

/// Output of the selective-classification builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationTables {
    pub table: LossTable,
    /// Marginal fraction of examples predicted (score > lambda) per grid
    /// value; the efficiency curve the reporting layer plots.
    pub predict_rate: Vec<f64>,
}

/// Build the 1-D selective-classification loss table.
///
/// Slot 0: abstention (`score <= lambda`). Slot 1: predicted and incorrect.
/// Size: the prediction indicator, so its mean is the prediction rate.
/// Rows are in ascending score order; both losses are monotone in lambda
/// (abstention non-decreasing, error non-increasing), which the
/// fixed-sequence strategies rely on.
pub fn build_selective_table(
    data: &ClassificationData,
    grid: &LambdaGrid,
) -> Result<ClassificationTables> {
    if grid.dim() != 1 {
        return Err(TableError::GridDimension {
            expected: 1,
            got: grid.dim(),
        });
    }
    if data.scores.len() != data.corrects.len() {
        return Err(TableError::LengthMismatch {
            left: data.scores.len(),
            right: data.corrects.len(),
        });
    }
    if data.scores.is_empty() {
        return Err(TableError::Empty);
    }

    let lambdas = grid.axis(0);
    let m = lambdas.len();
    let n = data.scores.len();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| data.scores[a].total_cmp(&data.scores[b]));

    let mut table = LossTable::new(n, 2, m);
    for (row, &orig) in order.iter().enumerate() {
        let score = data.scores[orig];
        let incorrect = !data.corrects[orig];
        // Predicted on the prefix of lambdas strictly below the score
        let cut = lambdas.partition_point(|&l| l < score);
        for cell in 0..cut {
            if incorrect {
                table.set_loss(row, 1, cell, 1.0);
            }
            table.set_size(row, cell, 1.0);
        }
        for cell in cut..m {
            table.set_loss(row, 0, cell, 1.0);
        }
    }

    let sorted_scores: Vec<f64> = order.iter().map(|&i| data.scores[i]).collect();
    let predict_rate = lambdas
        .iter()
        .map(|&l| {
            let below = sorted_scores.partition_point(|&s| s <= l);
            (n - below) as f64 / n as f64
        })
        .collect();

    Ok(ClassificationTables {
        table,
        predict_rate,
    })
}

/// Inputs for the two-stage OOD builder. In-distribution examples carry an
/// OOD score (higher = more OOD-like), a softmax vector, and a label;
/// true-OOD examples contribute only their OOD scores (for the detection
/// power curve).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OodData {
    pub ood_scores_ind: Vec<f64>,
    pub softmax_ind: Vec<Vec<f64>>,
    pub labels_ind: Vec<usize>,
    pub ood_scores_ood: Vec<f64>,
}

/// Output of the OOD builder: the loss/size tables plus the marginal
/// curves per lambda1 value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OodTables {
    pub table: LossTable,
    /// Fraction of in-distribution examples flagged OOD at each lambda1
    /// (the realized Type I curve).
    pub frac_ind_flagged: Vec<f64>,
    /// Fraction of true OOD examples flagged OOD at each lambda1 (one
    /// minus this is the Type II rate recorded per trial).
    pub frac_ood_flagged: Vec<f64>,
}

/// Build the 2-D OOD loss table.
///
/// Slot 0: flagged OOD (`ood_score > lambda1`), identical across lambda2.
/// Slot 1: true label missed by the top-set of cumulative softmax mass
/// `<= lambda2` (clamped to at least one class), filled only for examples
/// surviving the lambda1 filter. Sizes hold the realized top-set size for
/// survivors.
pub fn build_ood_table(data: &OodData, grid: &LambdaGrid) -> Result<OodTables> {
    if grid.dim() != 2 {
        return Err(TableError::GridDimension {
            expected: 2,
            got: grid.dim(),
        });
    }
    let n = data.ood_scores_ind.len();
    if data.softmax_ind.len() != n {
        return Err(TableError::LengthMismatch {
            left: n,
            right: data.softmax_ind.len(),
        });
    }
    if data.labels_ind.len() != n {
        return Err(TableError::LengthMismatch {
            left: n,
            right: data.labels_ind.len(),
        });
    }
    if n == 0 {
        return Err(TableError::Empty);
    }

    let lambda1s = grid.axis(0);
    let lambda2s = grid.axis(1);
    let (m1, m2) = (lambda1s.len(), lambda2s.len());

    // Sort by OOD score so the lambda1 boundary moves monotonically and
    // adjacent equal boundaries can reuse the previous slice.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| data.ood_scores_ind[a].total_cmp(&data.ood_scores_ind[b]));
    let sorted_scores: Vec<f64> = order.iter().map(|&i| data.ood_scores_ind[i]).collect();

    // Per example: cumulative mass of classes sorted by descending
    // probability, and the 1-based rank of the true label in that order.
    let mut cum_masses: Vec<Vec<f64>> = Vec::with_capacity(n);
    let mut true_ranks: Vec<usize> = Vec::with_capacity(n);
    for &orig in &order {
        let probs = &data.softmax_ind[orig];
        let label = data.labels_ind[orig];
        if label >= probs.len() {
            return Err(TableError::LabelOutOfRange {
                label,
                classes: probs.len(),
                example: orig,
            });
        }
        let mut class_order: Vec<usize> = (0..probs.len()).collect();
        class_order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
        let mut rank = 0usize;
        let mut cum = Vec::with_capacity(probs.len());
        let mut acc = 0.0;
        for (pos, &c) in class_order.iter().enumerate() {
            if c == label {
                rank = pos + 1;
            }
            acc += probs[c];
            cum.push(acc);
        }
        cum_masses.push(cum);
        true_ranks.push(rank);
    }

    let mut table = LossTable::new(n, 2, m1 * m2);
    let mut frac_ind_flagged = Vec::with_capacity(m1);
    let mut prev_boundary = usize::MAX;

    for (i, &l1) in lambda1s.iter().enumerate() {
        // Survivors are the sorted prefix with score <= lambda1
        let boundary = sorted_scores.partition_point(|&s| s <= l1);
        frac_ind_flagged.push((n - boundary) as f64 / n as f64);

        let base = i * m2;
        if boundary == prev_boundary {
            table.copy_cell_block(base - m2, base, m2);
        } else {
            for row in boundary..n {
                for cell in base..base + m2 {
                    table.set_loss(row, 0, cell, 1.0);
                }
            }
            for row in 0..boundary {
                let cum = &cum_masses[row];
                let rank = true_ranks[row];
                // Merge walk: lambda2s and cum are both ascending, so the
                // top-set size pointer only moves forward.
                let mut k = 0usize;
                for (j, &l2) in lambda2s.iter().enumerate() {
                    while k < cum.len() && cum[k] <= l2 {
                        k += 1;
                    }
                    let set_size = k.max(1);
                    table.set_size(row, base + j, set_size as f32);
                    if set_size < rank {
                        table.set_loss(row, 1, base + j, 1.0);
                    }
                }
            }
        }
        prev_boundary = boundary;
    }

    let n_ood = data.ood_scores_ood.len();
    let frac_ood_flagged = lambda1s
        .iter()
        .map(|&l1| {
            if n_ood == 0 {
                return 0.0;
            }
            let flagged = data.ood_scores_ood.iter().filter(|&&s| s > l1).count();
            flagged as f64 / n_ood as f64
        })
        .collect();

    Ok(OodTables {
        table,
        frac_ind_flagged,
        frac_ood_flagged,
    })
}

/// Cache key for a precomputed table: dataset identity plus the exact grid
/// values, so a changed axis can never alias a stale table.
fn table_cache_key(kind: &str, dataset_id: &str, grid: &LambdaGrid) -> String {
    let mut parts = vec![kind.to_string(), dataset_id.to_string()];
    for d in 0..grid.dim() {
        parts.push(format!("{:?}", grid.axis(d)));
    }
    let part_refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    CacheStore::key(&part_refs)
}

/// [`build_selective_table`] behind the cache store: a hit skips the
/// precomputation entirely and returns a bit-identical table. Cache write
/// failures are logged and swallowed; persistence is an optimization, not
/// a correctness requirement.
pub fn build_selective_table_cached(
    cache: &CacheStore,
    dataset_id: &str,
    data: &ClassificationData,
    grid: &LambdaGrid,
) -> Result<ClassificationTables> {
    let key = table_cache_key("selective", dataset_id, grid);
    if let Ok(Some(cached)) = cache.load::<ClassificationTables>(&key) {
        tracing::debug!(dataset_id, "selective loss table loaded from cache");
        return Ok(cached);
    }
    let fresh = build_selective_table(data, grid)?;
    if let Err(err) = cache.store(&key, &fresh) {
        tracing::warn!(%err, "failed to persist selective loss table");
    }
    Ok(fresh)
}

/// [`build_ood_table`] behind the cache store; same contract as the
/// selective variant.
pub fn build_ood_table_cached(
    cache: &CacheStore,
    dataset_id: &str,
    data: &OodData,
    grid: &LambdaGrid,
) -> Result<OodTables> {
    let key = table_cache_key("ood", dataset_id, grid);
    if let Ok(Some(cached)) = cache.load::<OodTables>(&key) {
        tracing::debug!(dataset_id, "OOD loss tables loaded from cache");
        return Ok(cached);
    }
    let fresh = build_ood_table(data, grid)?;
    if let Err(err) = cache.store(&key, &fresh) {
        tracing::warn!(%err, "failed to persist OOD loss tables");
    }
    Ok(fresh)
}
