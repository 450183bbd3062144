//! Experiment harness: many trials on a bounded worker pool
//!
//! Trials are embarrassingly parallel: each owns only its seeded
//! permutation and reads the shared loss table through an `Arc`. The pool
//! is a fixed set of worker threads draining a job queue of trial indices,
//! so concurrency is capped without any sleep-polling, and a worker that
//! finishes early picks up the next index immediately. Results land in
//! disjoint slots indexed by trial id, which makes aggregation independent
//! of scheduling order: cap 1 and cap 30 produce identical tables.
//!
//! Failure isolation: a trial that errors (or panics) produces a sentinel
//! record and the batch continues; because workers drain a queue, there is
//! no in-flight counter to leak on any exit path.
//!
//! TODO: add a per-trial wall-clock timeout (watchdog thread joining with
//! a deadline) to guard against pathological inputs stalling a worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{CacheError, CacheStore};
use crate::grid::LambdaGrid;
use crate::region::RejectionRegion;
use crate::risk::RiskProfile;
use crate::table::LossTable;
use crate::trial::run_trial;
use crate::trial_table::{TrialRecord, TrialTable};

/// Default cap on concurrently running trials.
pub const DEFAULT_MAX_WORKERS: usize = 30;

/// Errors raised by the harness
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("experiment configured with zero trials")]
    NoTrials,

    #[error("a worker thread died outside trial isolation")]
    WorkerPanicked,
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Scalar configuration of one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Calibration split size per trial.
    pub num_calib: usize,
    /// Number of independent trials.
    pub num_trials: usize,
    /// Family-wise error budget.
    pub delta: f64,
    /// Cap on concurrently running trials.
    pub max_workers: usize,
    /// Global seed mixed with each trial index.
    pub seed: u64,
}

impl ExperimentConfig {
    pub fn new(num_calib: usize, num_trials: usize, delta: f64) -> Self {
        Self {
            num_calib,
            num_trials,
            delta,
            max_workers: DEFAULT_MAX_WORKERS,
            seed: 0,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Deterministic cache key for one (configuration, strategy) pair.
pub fn experiment_cache_key(
    profile: &RiskProfile,
    cfg: &ExperimentConfig,
    region: &RejectionRegion,
) -> String {
    let alphas = profile
        .alphas()
        .iter()
        .map(f64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    CacheStore::key(&[
        "trial_table",
        &alphas,
        &cfg.delta.to_string(),
        &cfg.num_calib.to_string(),
        &cfg.num_trials.to_string(),
        &cfg.seed.to_string(),
        region.name(),
    ])
}

/// Run `num_trials` independent trials and collect the trial table.
pub fn run_experiment(
    table: &Arc<LossTable>,
    grid: &LambdaGrid,
    profile: &RiskProfile,
    region: &RejectionRegion,
    cfg: &ExperimentConfig,
) -> Result<TrialTable> {
    if cfg.num_trials == 0 {
        return Err(HarnessError::NoTrials);
    }
    let workers = cfg.max_workers.clamp(1, cfg.num_trials);
    let alphas = profile.alphas();

    let (job_tx, job_rx) = crossbeam::channel::bounded::<usize>(cfg.num_trials);
    let (out_tx, out_rx) = crossbeam::channel::unbounded::<(usize, TrialRecord)>();

    let mut slots: Vec<Option<TrialRecord>> = vec![None; cfg.num_trials];
    crossbeam::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let out_tx = out_tx.clone();
            let table = Arc::clone(table);
            let alphas = alphas.clone();
            scope.spawn(move |_| {
                for trial_index in job_rx.iter() {
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        run_trial(
                            &table,
                            grid,
                            profile,
                            region,
                            cfg.num_calib,
                            cfg.delta,
                            cfg.seed,
                            trial_index,
                        )
                    }));
                    let record = match result {
                        Ok(Ok(outcome)) => TrialRecord::from_outcome(
                            outcome,
                            alphas.clone(),
                            cfg.delta,
                            region.name(),
                        ),
                        Ok(Err(err)) => {
                            tracing::warn!(trial_index, %err, "trial failed; recording sentinel");
                            TrialRecord::failure(trial_index, alphas.clone(), cfg.delta, region.name())
                        }
                        Err(_) => {
                            tracing::warn!(trial_index, "trial panicked; recording sentinel");
                            TrialRecord::failure(trial_index, alphas.clone(), cfg.delta, region.name())
                        }
                    };
                    if out_tx.send((trial_index, record)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(out_tx);

        // The queue is bounded at num_trials, so submission never blocks
        for trial_index in 0..cfg.num_trials {
            let _ = job_tx.send(trial_index);
        }
        drop(job_tx);

        for (trial_index, record) in out_rx.iter() {
            slots[trial_index] = Some(record);
        }
    })
    .map_err(|_| HarnessError::WorkerPanicked)?;

    let mut trial_table = TrialTable::new();
    for (trial_index, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(record) => trial_table.push(record),
            None => {
                // Unreachable unless a worker died outside catch_unwind
                tracing::warn!(trial_index, "missing trial slot; recording sentinel");
                trial_table.push(TrialRecord::failure(
                    trial_index,
                    alphas.clone(),
                    cfg.delta,
                    region.name(),
                ));
            }
        }
    }
    Ok(trial_table)
}

/// Cached variant: return the persisted trial table for this configuration
/// if present, otherwise run the experiment and persist the result.
pub fn run_experiment_cached(
    cache: &CacheStore,
    table: &Arc<LossTable>,
    grid: &LambdaGrid,
    profile: &RiskProfile,
    region: &RejectionRegion,
    cfg: &ExperimentConfig,
) -> Result<TrialTable> {
    let key = experiment_cache_key(profile, cfg, region);
    if let Some(cached) = cache.load::<TrialTable>(&key)? {
        tracing::info!(region = region.name(), "trial table loaded from cache");
        return Ok(cached);
    }
    let trial_table = run_experiment(table, grid, profile, region, cfg)?;
    cache.store(&key, &trial_table)?;
    Ok(trial_table)
}

/// Run the same experiment once per strategy, for side-by-side comparison.
/// With a cache, each strategy's table is persisted independently.
pub fn run_strategy_sweep(
    cache: Option<&CacheStore>,
    table: &Arc<LossTable>,
    grid: &LambdaGrid,
    profile: &RiskProfile,
    regions: &[RejectionRegion],
    cfg: &ExperimentConfig,
) -> Result<Vec<TrialTable>> {
    regions
        .iter()
        .map(|region| match cache {
            Some(cache) => run_experiment_cached(cache, table, grid, profile, region, cfg),
            None => run_experiment(table, grid, profile, region, cfg),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::linspace;
    use crate::table::{build_selective_table, ClassificationData};

    fn toy_experiment() -> (Arc<LossTable>, LambdaGrid, RiskProfile) {
        let data = ClassificationData {
            scores: (0..300).map(|i| (i as f64 + 0.5) / 300.0).collect(),
            corrects: (0..300).map(|i| i % 5 != 0).collect(),
        };
        let grid = LambdaGrid::one_dim(linspace(0.0, 1.0, 20));
        let out = build_selective_table(&data, &grid).unwrap();
        (Arc::new(out.table), grid, RiskProfile::selective_pfdp(0.3))
    }

    #[test]
    fn test_all_trials_complete_in_order() {
        let (table, grid, profile) = toy_experiment();
        let cfg = ExperimentConfig::new(150, 16, 0.1).with_max_workers(4);
        let out = run_experiment(&table, &grid, &profile, &RejectionRegion::Bonferroni, &cfg)
            .unwrap();
        assert_eq!(out.len(), 16);
        for (i, record) in out.records.iter().enumerate() {
            assert_eq!(record.trial_index, i);
            assert!(!record.failed);
        }
    }

    #[test]
    fn test_zero_trials_is_an_error() {
        let (table, grid, profile) = toy_experiment();
        let cfg = ExperimentConfig::new(150, 0, 0.1);
        assert!(matches!(
            run_experiment(&table, &grid, &profile, &RejectionRegion::Bonferroni, &cfg),
            Err(HarnessError::NoTrials)
        ));
    }

    #[test]
    fn test_bad_split_yields_sentinels_not_abort() {
        let (table, grid, profile) = toy_experiment();
        // num_calib equals the dataset size: every trial fails, none abort
        let cfg = ExperimentConfig::new(300, 5, 0.1).with_max_workers(2);
        let out = run_experiment(&table, &grid, &profile, &RejectionRegion::Bonferroni, &cfg)
            .unwrap();
        assert_eq!(out.len(), 5);
        assert!(out.records.iter().all(|r| r.failed));
        assert_eq!(out.summary().num_failed, 5);
    }

    #[test]
    fn test_cache_key_distinguishes_strategies() {
        let profile = RiskProfile::selective_pfdp(0.1);
        let cfg = ExperimentConfig::new(100, 10, 0.1);
        let a = experiment_cache_key(&profile, &cfg, &RejectionRegion::Bonferroni);
        let b = experiment_cache_key(&profile, &cfg, &RejectionRegion::Uniform);
        assert_ne!(a, b);
    }
}
