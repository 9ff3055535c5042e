//! Variant aggregation across policy run records.
//!
//! Runs are grouped by their evaluation variant label; each group reports the
//! mean (and spread) of what the run records already summarize.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::PolicyRunRecord;

/// Averages over every run of one variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantAggregate {
    pub variant: String,
    pub n_runs: usize,
    /// Mean policy accuracy over runs with labeled decisions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_mean: Option<f64>,
    /// Sample standard deviation of the accuracy (needs two runs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_std: Option<f64>,
    pub compute_saving_pct_mean: f64,
    pub mean_cost_mean: f64,
    pub full_cost_mean: f64,
    /// Mean exit rate per exit
    pub exit_rate_means: Vec<f64>,
    /// Runs flagged under-calibrated or infeasible
    pub flagged_runs: usize,
}

/// Aggregate `records` by variant label, sorted by label.
pub fn aggregate_variants(records: &[PolicyRunRecord]) -> Vec<VariantAggregate> {
    let mut groups: BTreeMap<&str, Vec<&PolicyRunRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.variant.label.as_str())
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .map(|(variant, runs)| {
            let n = runs.len() as f64;
            let mean =
                |f: &dyn Fn(&PolicyRunRecord) -> f64| runs.iter().map(|&r| f(r)).sum::<f64>() / n;

            let accuracies: Vec<f64> = runs.iter().filter_map(|r| r.summary.accuracy).collect();
            let (accuracy_mean, accuracy_std) = mean_std(&accuracies);

            let width = runs
                .iter()
                .map(|r| r.summary.exit_rates.len())
                .max()
                .unwrap_or(0);
            let exit_rate_means = (0..width)
                .map(|i| mean(&|r| r.summary.exit_rates.get(i).copied().unwrap_or(0.0)))
                .collect();

            VariantAggregate {
                variant: variant.to_string(),
                n_runs: runs.len(),
                accuracy_mean,
                accuracy_std,
                compute_saving_pct_mean: mean(&|r| r.summary.compute_saving_pct),
                mean_cost_mean: mean(&|r| r.summary.mean_cost),
                full_cost_mean: mean(&|r| r.summary.full_cost),
                exit_rate_means,
                flagged_runs: runs.iter().filter(|r| !r.flags.is_clean()).count(),
            }
        })
        .collect()
}

fn mean_std(values: &[f64]) -> (Option<f64>, Option<f64>) {
    if values.is_empty() {
        return (None, None);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.len() > 1).then(|| {
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        var.sqrt()
    });
    (Some(mean), std)
}
