//! Per-exit classification reports.
//!
//! Every labeled input is scored at every exit it has logits for, as if that
//! exit were the only one. The reports show how much each exit knows on its
//! own, independent of the thresholds.

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationParams;
use crate::error::CascadeResult;
use crate::scores::LogitCache;

/// Precision, recall and F1 for one class (or one average)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// True instances of the class
    pub support: usize,
}

/// Classification report for one exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitReport {
    pub exit: usize,
    /// Exit display name
    pub name: String,
    /// Labeled inputs with logits at this exit
    pub samples: usize,
    pub accuracy: f64,
    /// Mean calibrated top-class confidence
    pub mean_confidence: f64,
    /// One entry per class
    pub per_class: Vec<ClassMetrics>,
    /// Unweighted mean over classes
    pub macro_avg: ClassMetrics,
    /// Support-weighted mean over classes
    pub weighted_avg: ClassMetrics,
    /// `confusion[true][predicted]`
    pub confusion: Vec<Vec<usize>>,
}

/// Reports for every exit of `cache.profile`.
pub fn classification_per_exit(
    cache: &LogitCache,
    params: &CalibrationParams,
) -> CascadeResult<Vec<ExitReport>> {
    let profile = &cache.profile;
    params.validate_for(profile)?;
    let c = profile.num_classes;

    let reports = (0..profile.num_exits())
        .map(|exit| {
            let mut confusion = vec![vec![0usize; c]; c];
            let mut samples = 0;
            let mut confidence_sum = 0.0;
            for (entry, label) in cache.labeled() {
                let Some((predicted, confidence)) = entry
                    .logits_at(exit)
                    .and_then(|logits| params.top_class(exit, logits))
                else {
                    continue;
                };
                confusion[label][predicted] += 1;
                samples += 1;
                confidence_sum += confidence;
            }
            build_report(exit, profile.exit_label(exit), samples, confidence_sum, confusion)
        })
        .collect();
    Ok(reports)
}

fn build_report(
    exit: usize,
    name: String,
    samples: usize,
    confidence_sum: f64,
    confusion: Vec<Vec<usize>>,
) -> ExitReport {
    let c = confusion.len();
    let safe_div = |num: f64, den: f64| if den > 0.0 { num / den } else { 0.0 };

    let per_class: Vec<ClassMetrics> = (0..c)
        .map(|k| {
            let tp = confusion[k][k] as f64;
            let support: usize = confusion[k].iter().sum();
            let predicted: usize = confusion.iter().map(|row| row[k]).sum();
            let precision = safe_div(tp, predicted as f64);
            let recall = safe_div(tp, support as f64);
            ClassMetrics {
                precision,
                recall,
                f1: safe_div(2.0 * precision * recall, precision + recall),
                support,
            }
        })
        .collect();

    let correct: usize = (0..c).map(|k| confusion[k][k]).sum();
    let average = |weight: &dyn Fn(&ClassMetrics) -> f64| {
        let total: f64 = per_class.iter().map(weight).sum();
        let mean = |field: fn(&ClassMetrics) -> f64| {
            safe_div(per_class.iter().map(|m| field(m) * weight(m)).sum(), total)
        };
        ClassMetrics {
            precision: mean(|m| m.precision),
            recall: mean(|m| m.recall),
            f1: mean(|m| m.f1),
            support: samples,
        }
    };

    ExitReport {
        exit,
        name,
        samples,
        accuracy: safe_div(correct as f64, samples as f64),
        mean_confidence: safe_div(confidence_sum, samples as f64),
        macro_avg: average(&|_| 1.0),
        weighted_avg: average(&|m| m.support as f64),
        per_class,
        confusion,
    }
}
