//! Certeza - distribution-free risk-controlling calibration
//!
//! This library selects prediction thresholds (lambdas) over a finite grid
//! such that the selected threshold provably controls one or more error
//! metrics (false discovery proportion, OOD Type I error, miscoverage) at
//! a user-specified confidence level, using only a finite calibration
//! sample. The pipeline: precompute a loss table over the grid, convert
//! calibration-split empirical risks into Hoeffding-Bentkus p-values,
//! apply a multiple-testing correction to certify a rejection region, pick
//! the extremal valid threshold, and evaluate it on the held-out split -
//! repeated over many randomized splits by a parallel trial harness.

pub mod bounds;
pub mod cache;
pub mod grid;
pub mod harness;
pub mod region;
pub mod risk;
pub mod table;
pub mod trial;
pub mod trial_table;

pub use bounds::hb_p_value;
pub use cache::CacheStore;
pub use grid::{linspace, LambdaGrid};
pub use harness::{
    run_experiment, run_experiment_cached, run_strategy_sweep, ExperimentConfig, HarnessError,
};
pub use region::{RejectionRegion, Selection};
pub use risk::{RiskConstraint, RiskKind, RiskProfile};
pub use table::{
    build_ood_table, build_ood_table_cached, build_selective_table, build_selective_table_cached,
    ClassificationData, ClassificationTables, LossTable, OodData, OodTables, TableView,
};
pub use trial::{run_trial, TrialOutcome};
pub use trial_table::{TrialRecord, TrialSummary, TrialTable};
