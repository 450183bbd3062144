//! Trial records, aggregation, and export
//!
//! The trial table collects one record per trial and is the only artifact
//! the reporting layer sees. Lifecycle: create empty, append per trial,
//! persist once complete, then read-only. Columns match what the plotting
//! consumer needs: selected lambda(s), realized risk(s), mean size, the
//! configuration scalars, and the strategy name.

use serde::{Deserialize, Serialize};

use crate::grid::LambdaGrid;
use crate::table::OodTables;
use crate::trial::TrialOutcome;

/// One row of the trial table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial_index: usize,
    /// Flat grid cell of the selected threshold; None for failed trials.
    pub cell: Option<usize>,
    pub lambda: Vec<f64>,
    pub risks: Vec<f64>,
    pub mean_size: f64,
    pub alphas: Vec<f64>,
    pub delta: f64,
    pub region: String,
    /// No statistically valid cell existed; conservative fallback used.
    pub empty: bool,
    /// The trial errored; all metrics are sentinel zeros.
    pub failed: bool,
    /// OOD detection Type II rate at the selected lambda1, filled by
    /// [`TrialTable::annotate_ood_type2`] for two-stage experiments.
    pub ood_type2: Option<f64>,
}

impl TrialRecord {
    pub fn from_outcome(
        outcome: TrialOutcome,
        alphas: Vec<f64>,
        delta: f64,
        region: &str,
    ) -> Self {
        Self {
            trial_index: outcome.trial_index,
            cell: Some(outcome.cell),
            lambda: outcome.lambda,
            risks: outcome.risks,
            mean_size: outcome.mean_size,
            alphas,
            delta,
            region: region.to_string(),
            empty: outcome.empty,
            failed: false,
            ood_type2: None,
        }
    }

    /// Sentinel row for an isolated trial failure.
    pub fn failure(trial_index: usize, alphas: Vec<f64>, delta: f64, region: &str) -> Self {
        let num_risks = alphas.len();
        Self {
            trial_index,
            cell: None,
            lambda: Vec::new(),
            risks: vec![0.0; num_risks],
            mean_size: 0.0,
            alphas,
            delta,
            region: region.to_string(),
            empty: false,
            failed: true,
            ood_type2: None,
        }
    }

    /// True when any realized risk exceeds its target level.
    pub fn violates(&self) -> bool {
        self.risks
            .iter()
            .zip(&self.alphas)
            .any(|(&risk, &alpha)| risk > alpha)
    }
}

/// Aggregate statistics over the completed trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSummary {
    pub num_trials: usize,
    pub num_failed: usize,
    pub num_empty: usize,
    /// Fraction of non-failed trials where at least one realized risk
    /// exceeded its target. The guarantee promises this stays below delta.
    pub fraction_violated: f64,
    pub mean_risks: Vec<f64>,
    pub mean_size: f64,
}

/// The completed per-configuration table of trial records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialTable {
    pub records: Vec<TrialRecord>,
}

impl TrialTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: TrialRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Aggregate precision/violation statistics. Failed trials are
    /// excluded from the means and the violation fraction but counted.
    pub fn summary(&self) -> TrialSummary {
        let completed: Vec<&TrialRecord> = self.records.iter().filter(|r| !r.failed).collect();
        let num_failed = self.records.len() - completed.len();
        let num_empty = completed.iter().filter(|r| r.empty).count();

        let num_risks = completed.first().map_or(0, |r| r.risks.len());
        let mut mean_risks = vec![0.0; num_risks];
        let mut mean_size = 0.0;
        let mut violated = 0usize;
        for record in &completed {
            for (acc, &risk) in mean_risks.iter_mut().zip(&record.risks) {
                *acc += risk;
            }
            mean_size += record.mean_size;
            if record.violates() {
                violated += 1;
            }
        }
        let denom = completed.len().max(1) as f64;
        for acc in &mut mean_risks {
            *acc /= denom;
        }

        TrialSummary {
            num_trials: self.records.len(),
            num_failed,
            num_empty,
            fraction_violated: violated as f64 / denom,
            mean_risks,
            mean_size: mean_size / denom,
        }
    }

    /// Fill the OOD Type II column from the builder's marginal curve: the
    /// fraction of true OOD examples the selected lambda1 fails to flag.
    pub fn annotate_ood_type2(&mut self, grid: &LambdaGrid, curves: &OodTables) {
        for record in &mut self.records {
            if let Some(cell) = record.cell {
                let idx1 = grid.multi_index(cell)[0];
                record.ood_type2 = Some(1.0 - curves.frac_ood_flagged[idx1]);
            }
        }
    }

    /// CSV export. Lambda and risk arities come from the widest record so
    /// 1-D and 2-D experiments both produce rectangular output.
    pub fn to_csv(&self) -> String {
        let lambda_arity = self.records.iter().map(|r| r.lambda.len()).max().unwrap_or(0);
        let risk_arity = self.records.iter().map(|r| r.risks.len()).max().unwrap_or(0);

        let mut header: Vec<String> = vec!["trial".into(), "region".into()];
        for d in 0..lambda_arity {
            header.push(format!("lambda{}", d + 1));
        }
        for k in 0..risk_arity {
            header.push(format!("risk{}", k + 1));
        }
        for k in 0..risk_arity {
            header.push(format!("alpha{}", k + 1));
        }
        header.extend([
            "mean_size".into(),
            "delta".into(),
            "empty".into(),
            "failed".into(),
            "ood_type2".into(),
        ]);

        let mut out = header.join(",");
        out.push('\n');
        for r in &self.records {
            let mut row: Vec<String> = vec![r.trial_index.to_string(), r.region.clone()];
            for d in 0..lambda_arity {
                row.push(r.lambda.get(d).map_or(String::new(), f64::to_string));
            }
            for k in 0..risk_arity {
                row.push(r.risks.get(k).map_or(String::new(), f64::to_string));
            }
            for k in 0..risk_arity {
                row.push(r.alphas.get(k).map_or(String::new(), f64::to_string));
            }
            row.push(r.mean_size.to_string());
            row.push(r.delta.to_string());
            row.push(r.empty.to_string());
            row.push(r.failed.to_string());
            row.push(r.ood_type2.map_or(String::new(), |v| v.to_string()));
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    /// Pretty JSON export of the full record list.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.records)
    }
}
