//! Risk constraints and corrected p-value computation
//!
//! A risk profile declares the simultaneous constraints a threshold must
//! satisfy, each tied to a loss slot of the table and a target level
//! alpha. Two kinds are supported:
//!
//! - **Marginal**: the plain empirical mean of a loss slot (e.g. the
//!   fraction of in-distribution examples flagged OOD).
//! - **Conditional**: the mean of an error slot among examples passing a
//!   gating slot (e.g. coverage among examples kept in-distribution, or
//!   precision among examples confident enough to predict). For the
//!   calibration-side bound this is rescaled into an unconditional mean
//!   over the full sample via
//!
//!   `r = mean(err * (1 - gate)) - alpha * mean(1 - gate) + alpha`
//!
//!   which keeps the observation count fixed at n and the summands
//!   bounded. The formula is used as asserted; it is the documented
//!   identity the joint validity guarantee rests on, and is deliberately
//!   not re-derived here.
//!
//! Per cell, the corrected p-value is the maximum of the per-constraint
//! Hoeffding-Bentkus p-values, so a cell is certified only when every
//! constraint holds simultaneously.

use serde::{Deserialize, Serialize};

use crate::bounds::hb_p_value;
use crate::table::TableView;

/// How a constraint reads the loss table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskKind {
    /// Empirical mean of `slot`.
    Marginal { slot: usize },
    /// Mean of `slot` among examples where `given` is zero, bounded via
    /// the rescaling above.
    Conditional { slot: usize, given: usize },
}

/// One risk constraint: a loss reading and its target level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskConstraint {
    pub kind: RiskKind,
    pub alpha: f64,
}

/// The full set of simultaneous constraints for an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    constraints: Vec<RiskConstraint>,
}

impl RiskProfile {
    pub fn new(constraints: Vec<RiskConstraint>) -> Self {
        debug_assert!(!constraints.is_empty());
        Self { constraints }
    }

    /// Selective classification: control the false discovery proportion
    /// (error rate among predicted examples) at `alpha`. Slot 0 gates
    /// (abstention), slot 1 is the error indicator.
    pub fn selective_pfdp(alpha: f64) -> Self {
        Self::new(vec![RiskConstraint {
            kind: RiskKind::Conditional { slot: 1, given: 0 },
            alpha,
        }])
    }

    /// Joint OOD control: Type I error (in-distribution flagged OOD) at
    /// `alpha1` and miscoverage among kept examples at `alpha2`.
    pub fn ood_joint(alpha1: f64, alpha2: f64) -> Self {
        Self::new(vec![
            RiskConstraint {
                kind: RiskKind::Marginal { slot: 0 },
                alpha: alpha1,
            },
            RiskConstraint {
                kind: RiskKind::Conditional { slot: 1, given: 0 },
                alpha: alpha2,
            },
        ])
    }

    pub fn constraints(&self) -> &[RiskConstraint] {
        &self.constraints
    }

    pub fn num_risks(&self) -> usize {
        self.constraints.len()
    }

    pub fn alphas(&self) -> Vec<f64> {
        self.constraints.iter().map(|c| c.alpha).collect()
    }

    /// Calibration-side empirical risk of constraint `k` at a cell, with
    /// the conditional rescaling applied.
    pub fn empirical_risk(&self, view: &TableView<'_>, k: usize, cell: usize) -> f64 {
        let c = &self.constraints[k];
        match c.kind {
            RiskKind::Marginal { slot } => view.mean_loss(slot, cell),
            RiskKind::Conditional { slot, given } => {
                let (joint, pass) = view.gated_moments(slot, given, cell);
                joint - c.alpha * pass + c.alpha
            }
        }
    }

    /// Corrected p-value per cell: the max over constraints of the
    /// Hoeffding-Bentkus p-value at that constraint's target.
    pub fn corrected_p_values(&self, view: &TableView<'_>) -> Vec<f64> {
        let n = view.len();
        (0..view.num_cells())
            .map(|cell| {
                self.constraints
                    .iter()
                    .enumerate()
                    .map(|(k, c)| hb_p_value(self.empirical_risk(view, k, cell), n, c.alpha))
                    .fold(0.0_f64, f64::max)
            })
            .collect()
    }

    /// Validation-side realized risks at a cell: marginal constraints as
    /// plain means, conditional constraints as the actual conditional mean
    /// with the empty-set NaN normalized to 0 (deliberate policy, see the
    /// module docs of `trial`).
    pub fn realized_risks(&self, view: &TableView<'_>, cell: usize) -> Vec<f64> {
        self.constraints
            .iter()
            .map(|c| match c.kind {
                RiskKind::Marginal { slot } => view.mean_loss(slot, cell),
                RiskKind::Conditional { slot, given } => {
                    let r = view.conditional_mean(slot, given, cell);
                    if r.is_nan() {
                        0.0
                    } else {
                        r
                    }
                }
            })
            .collect()
    }
}
