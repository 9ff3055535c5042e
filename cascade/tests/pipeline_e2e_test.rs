//! Pipeline end-to-end tests — calibrate, select, evaluate and profile over a
//! temporary run directory, each stage reading the previous stage's files.

use std::sync::Arc;

use cascade::analysis::{aggregate_variants, classification_per_exit};
use cascade::{
    pipeline, CascadeError, EvaluationVariant, ExitProfile, LogitCache, LogitEntry,
    PipelineConfig, PolicyObjective, PolicyRunRecord, RunLayout, RunWarning,
};
use tokio_util::sync::CancellationToken;

fn profile() -> ExitProfile {
    ExitProfile::new(3, &[1.0, 2.0, 4.0]).unwrap()
}

/// Logits putting `conf` on `class`, the remainder split evenly.
fn logits(class: usize, conf: f64) -> Vec<f64> {
    let rest = ((1.0 - conf) / 2.0).ln();
    let mut l = vec![rest; 3];
    l[class] = conf.ln();
    l
}

/// One synthetic row: exit 0 errs on every 4th row, exit 1 on every 7th,
/// exit 2 only on row 13. Errors are made with high confidence.
fn row(prefix: &str, i: usize, depth: usize) -> LogitEntry {
    let label = i % 3;
    let wrong = (label + 1) % 3;
    let wobble = 0.01 * (i % 9) as f64;
    let exits = [
        if i % 4 == 0 {
            logits(wrong, 0.88 + wobble)
        } else {
            logits(label, 0.6 + 3.0 * wobble)
        },
        if i % 7 == 0 {
            logits(wrong, 0.85 + wobble)
        } else {
            logits(label, 0.7 + 2.0 * wobble)
        },
        if i == 13 {
            logits(wrong, 0.6)
        } else {
            logits(label, 0.8 + wobble)
        },
    ];
    LogitEntry {
        segment_id: format!("{}-{:03}", prefix, i),
        label: Some(label),
        exit_logits: exits[..depth].to_vec(),
    }
}

/// Calibration split where only two rows reach the deepest exit.
fn calibration_cache() -> LogitCache {
    let entries = (0..40)
        .map(|i| row("cal", i, if i < 2 { 3 } else { 2 }))
        .collect();
    LogitCache::new(profile(), entries).unwrap()
}

fn split(prefix: &str, n: usize) -> LogitCache {
    let entries = (0..n).map(|i| row(prefix, i, 3)).collect();
    LogitCache::new(profile(), entries).unwrap()
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.selection.grid_steps = 20;
    config.evaluation.workers = Some(3);
    config
}

#[tokio::test]
async fn test_full_pipeline_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RunLayout::new(dir.path().join("run"));
    let config = config();

    let calibrated = pipeline::calibrate(&layout, &calibration_cache(), &config).unwrap();
    assert_eq!(calibrated.params.under_calibrated_exits(), vec![2]);
    assert_eq!(
        calibrated.warnings,
        vec![RunWarning::CalibrationDataInsufficient {
            exit: 2,
            samples: 2,
            required: 10,
        }]
    );
    assert!(layout.calibration_path().exists());

    let selected = pipeline::select(
        &layout,
        &split("val", 60),
        PolicyObjective::MinCostWithAccuracyFloor { floor: 0.9 },
        &config,
    )
    .unwrap();
    assert!(!selected.thresholds.constraint_infeasible);
    assert!(selected.thresholds.achieved_accuracy >= 0.9);
    assert_eq!(selected.thresholds.validation_samples, 60);

    let test = Arc::new(split("test", 45));
    let record = pipeline::evaluate(
        &layout,
        test.clone(),
        EvaluationVariant::default(),
        &config,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(record.decisions.len(), 45);
    assert_eq!(record.flags.under_calibrated_exits, vec![2]);
    assert!(!record.flags.constraint_infeasible);
    assert_eq!(record.thresholds, selected.thresholds);
    assert!(record.summary.mean_cost <= record.summary.full_cost);

    let reloaded = PolicyRunRecord::load(layout.policy_run_path()).unwrap();
    assert_eq!(reloaded, record);

    let reports = classification_per_exit(&test, &record.calibration).unwrap();
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.samples == 45));
}

#[tokio::test]
async fn test_profile_writes_one_record_per_variant() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RunLayout::new(dir.path());
    let config = config();

    pipeline::calibrate(&layout, &split("cal", 40), &config).unwrap();
    pipeline::select(
        &layout,
        &split("val", 60),
        PolicyObjective::MaxAccuracyWithCostCeiling { ceiling: 4.0 },
        &config,
    )
    .unwrap();

    let test = Arc::new(split("test", 30));
    let records = pipeline::profile(&layout, test, &config, CancellationToken::new())
        .await
        .unwrap();
    let labels: Vec<&str> = records.iter().map(|r| r.variant.label.as_str()).collect();
    assert_eq!(labels, vec!["upto_exit1", "upto_exit2", "full"]);
    for label in &labels {
        assert!(layout.variant_path(label).exists(), "missing {}", label);
    }
    assert!(!layout.policy_run_path().exists());

    // Shallowest variant accepts everything at exit 0
    assert_eq!(records[0].summary.exit_counts, vec![30, 0, 0]);
    assert_eq!(records[0].summary.mean_cost, 1.0);
    assert_eq!(records[0].summary.forced, 30);
    for pair in records.windows(2) {
        assert!(pair[0].summary.mean_cost <= pair[1].summary.mean_cost);
    }

    let aggregates = aggregate_variants(&records);
    assert_eq!(aggregates.len(), 3);
    assert!(aggregates.iter().all(|a| a.n_runs == 1));
}

#[tokio::test]
async fn test_record_reports_min_samples_used_at_calibration() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RunLayout::new(dir.path());
    let mut strict = config();
    strict.calibration.min_samples = 30;
    pipeline::calibrate(&layout, &split("cal", 20), &strict).unwrap();

    // Later stages run under a config with the default min_samples
    let relaxed = config();
    pipeline::select(
        &layout,
        &split("val", 30),
        PolicyObjective::MinCostWithAccuracyFloor { floor: 0.5 },
        &relaxed,
    )
    .unwrap();
    let record = pipeline::evaluate(
        &layout,
        Arc::new(split("test", 10)),
        EvaluationVariant::default(),
        &relaxed,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(record.calibration.min_samples, 30);
    assert_eq!(record.flags.under_calibrated_exits, vec![0, 1, 2]);
    let insufficient: Vec<&RunWarning> = record
        .flags
        .warnings
        .iter()
        .filter(|w| matches!(w, RunWarning::CalibrationDataInsufficient { .. }))
        .collect();
    assert_eq!(insufficient.len(), 3);
    for warning in insufficient {
        assert!(matches!(
            warning,
            RunWarning::CalibrationDataInsufficient {
                samples: 20,
                required: 30,
                ..
            }
        ));
    }
}

#[tokio::test]
async fn test_evaluate_requires_selected_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RunLayout::new(dir.path());
    let config = config();
    pipeline::calibrate(&layout, &split("cal", 20), &config).unwrap();

    let err = pipeline::evaluate(
        &layout,
        Arc::new(split("test", 5)),
        EvaluationVariant::default(),
        &config,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("select"));
}

#[tokio::test]
async fn test_recalibration_invalidates_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RunLayout::new(dir.path());
    let config = config();
    pipeline::calibrate(&layout, &split("cal", 40), &config).unwrap();
    pipeline::select(
        &layout,
        &split("val", 30),
        PolicyObjective::MinCostWithAccuracyFloor { floor: 0.8 },
        &config,
    )
    .unwrap();

    // A different split gives different temperatures
    pipeline::calibrate(&layout, &calibration_cache(), &config).unwrap();
    let err = pipeline::evaluate(
        &layout,
        Arc::new(split("test", 10)),
        EvaluationVariant::default(),
        &config,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CascadeError::CalibrationMismatch { .. }));
}

#[tokio::test]
async fn test_cancelled_evaluation_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RunLayout::new(dir.path());
    let config = config();
    pipeline::calibrate(&layout, &split("cal", 20), &config).unwrap();
    pipeline::select(
        &layout,
        &split("val", 20),
        PolicyObjective::MinCostWithAccuracyFloor { floor: 0.5 },
        &config,
    )
    .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = pipeline::evaluate(
        &layout,
        Arc::new(split("test", 50)),
        EvaluationVariant::default(),
        &config,
        cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CascadeError::Cancelled { .. }));
    assert!(!layout.policy_run_path().exists());
}
