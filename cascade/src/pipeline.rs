//! Stage entry points over a run directory
//!
//! ```text
//! calibrate ──▶ <run>/calibration.json
//!                    │ (persisted before select may read it)
//! select    ──▶ <run>/thresholds.json
//!                    │
//! evaluate  ──▶ <run>/policy_run.json  |  <run>/variants/<label>.json
//! profile   ──▶ <run>/variants/<label>.json  (one per reachable max exit)
//! ```
//!
//! Each stage reads its inputs from disk rather than from the previous
//! stage's memory, so the calibrate → select barrier is the file itself.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::calibration::{CalibrationOutcome, CalibrationParams, Calibrator};
use crate::config::{PipelineConfig, RunLayout};
use crate::error::{CascadeError, CascadeResult};
use crate::policy::{evaluate_parallel, EvaluationVariant, PolicyEvaluator};
use crate::record::{self, PolicyRunRecord};
use crate::scores::LogitCache;
use crate::thresholds::{PolicyObjective, SelectionOutcome, ThresholdSelector, ThresholdSet};

/// Fit temperatures on `cache` and persist them.
pub fn calibrate(
    layout: &RunLayout,
    cache: &LogitCache,
    config: &PipelineConfig,
) -> CascadeResult<CalibrationOutcome> {
    let outcome = Calibrator::new(config.calibration.clone()).calibrate(cache)?;
    let path = layout.calibration_path();
    record::save_calibration(&outcome.params, &path)?;
    info!(
        path = %path.display(),
        under_calibrated = outcome.params.under_calibrated_exits().len(),
        "calibration stage complete"
    );
    Ok(outcome)
}

/// Select thresholds under the persisted calibration and persist them.
pub fn select(
    layout: &RunLayout,
    cache: &LogitCache,
    objective: PolicyObjective,
    config: &PipelineConfig,
) -> CascadeResult<SelectionOutcome> {
    let params = load_required(&layout.calibration_path(), "calibrate", |p| {
        record::load_calibration(p)
    })?;
    let outcome =
        ThresholdSelector::new(config.selection.clone()).select(&params, cache, objective)?;
    let path = layout.thresholds_path();
    record::save_thresholds(&outcome.thresholds, &path)?;
    info!(
        path = %path.display(),
        infeasible = outcome.thresholds.constraint_infeasible,
        "selection stage complete"
    );
    Ok(outcome)
}

/// Evaluate the persisted policy on `cache` and persist the run record.
///
/// The full-depth variant lands at `policy_run.json`, restricted variants
/// under `variants/`.
pub async fn evaluate(
    layout: &RunLayout,
    cache: Arc<LogitCache>,
    variant: EvaluationVariant,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> CascadeResult<PolicyRunRecord> {
    let (params, thresholds) = load_policy(layout)?;
    let path = if variant.max_exit.is_none() {
        layout.policy_run_path()
    } else {
        layout.variant_path(&variant.label)
    };
    let record = run_variant(cache, params, thresholds, variant, config, cancel).await?;
    record.save(&path)?;
    Ok(record)
}

/// Evaluate every reachable max exit and persist one variant record each.
pub async fn profile(
    layout: &RunLayout,
    cache: Arc<LogitCache>,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> CascadeResult<Vec<PolicyRunRecord>> {
    let (params, thresholds) = load_policy(layout)?;
    let mut records = Vec::with_capacity(cache.profile.num_exits());
    for max_exit in 0..cache.profile.num_exits() {
        let variant = EvaluationVariant::up_to(&cache.profile, max_exit);
        let record = run_variant(
            cache.clone(),
            params.clone(),
            thresholds.clone(),
            variant,
            config,
            cancel.clone(),
        )
        .await?;
        record.save(layout.variant_path(&record.variant.label))?;
        records.push(record);
    }
    info!(variants = records.len(), "profiling complete");
    Ok(records)
}

async fn run_variant(
    cache: Arc<LogitCache>,
    params: CalibrationParams,
    thresholds: ThresholdSet,
    variant: EvaluationVariant,
    config: &PipelineConfig,
    cancel: CancellationToken,
) -> CascadeResult<PolicyRunRecord> {
    let evaluator = Arc::new(PolicyEvaluator::new(
        cache.profile.clone(),
        params,
        thresholds,
        variant,
    )?);
    let decisions = evaluate_parallel(
        evaluator.clone(),
        cache.clone(),
        config.evaluation.workers(),
        cancel,
    )
    .await?;

    let calibration_warnings = evaluator.params().warnings();
    Ok(PolicyRunRecord::finalize(
        evaluator.profile().clone(),
        evaluator.params().clone(),
        evaluator.thresholds().clone(),
        evaluator.variant().clone(),
        decisions,
        calibration_warnings,
    ))
}

fn load_policy(layout: &RunLayout) -> CascadeResult<(CalibrationParams, ThresholdSet)> {
    let params = load_required(&layout.calibration_path(), "calibrate", |p| {
        record::load_calibration(p)
    })?;
    let thresholds = load_required(&layout.thresholds_path(), "select", |p| {
        record::load_thresholds(p)
    })?;
    Ok((params, thresholds))
}

/// Load an artifact a previous stage must have written.
fn load_required<T>(
    path: &Path,
    stage: &str,
    load: impl FnOnce(&Path) -> CascadeResult<T>,
) -> CascadeResult<T> {
    if !path.exists() {
        return Err(CascadeError::invalid_input(format!(
            "{} not found; run the {} stage first",
            path.display(),
            stage
        )));
    }
    load(path)
}
