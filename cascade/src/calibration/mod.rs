//! Temperature Calibrator — one scalar temperature per exit
//!
//! Each exit is calibrated on its own: confidence miscalibration is exit-local
//! (shallow exits are usually overconfident in a different way than deep
//! ones), so the params are a map from exit index to that exit's fit rather
//! than a single global temperature.
//!
//! ```text
//! LogitCache (held-out split)
//!     │  per exit: labeled samples with finite logits
//!     ├─ samples < min_samples → T = 1, CalibrationDataInsufficient
//!     └─ otherwise             → bisection on d NLL / d log T
//!     ▼
//! CalibrationParams (immutable, fingerprinted to the ExitProfile)
//! ```
//!
//! The threshold selector and the policy evaluator both read confidences
//! through [`CalibrationParams::top_class`], so the two stages can never
//! disagree about what a confidence means.

pub mod metrics;
pub mod temperature;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CascadeError, CascadeResult, RunWarning};
use crate::profile::ExitProfile;
use crate::scores::prob::{softmax_with_temperature, top_class};
use crate::scores::LogitCache;

pub use metrics::{expected_calibration_error, mean_nll, ExitSample};
pub use temperature::{fit_temperature, SearchBracket, TemperatureFit};

/// Calibration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Fewer labeled samples than this at an exit → identity temperature
    pub min_samples: usize,
    /// Smallest temperature searched
    pub t_min: f64,
    /// Largest temperature searched
    pub t_max: f64,
    /// Bisection stops when the log-bracket is narrower than this
    pub tolerance: f64,
    /// Bisection step cap
    pub max_iterations: u32,
    /// Equal-width bins for ECE diagnostics
    pub ece_bins: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        let bracket = SearchBracket::default();
        Self {
            min_samples: 10,
            t_min: bracket.t_min,
            t_max: bracket.t_max,
            tolerance: bracket.tolerance,
            max_iterations: bracket.max_iterations,
            ece_bins: 15,
        }
    }
}

impl CalibrationConfig {
    /// Bracket used by the per-exit search
    pub fn bracket(&self) -> SearchBracket {
        SearchBracket {
            t_min: self.t_min,
            t_max: self.t_max,
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
        }
    }

    /// Reject brackets that cannot produce a positive temperature.
    pub fn validate(&self) -> CascadeResult<()> {
        if !(self.t_min.is_finite() && self.t_min > 0.0) {
            return Err(CascadeError::config(format!(
                "calibration t_min must be positive, got {}",
                self.t_min
            )));
        }
        if !(self.t_max.is_finite() && self.t_max > self.t_min) {
            return Err(CascadeError::config(format!(
                "calibration t_max ({}) must exceed t_min ({})",
                self.t_max, self.t_min
            )));
        }
        if self.min_samples == 0 {
            return Err(CascadeError::config("calibration min_samples must be at least 1"));
        }
        if !(self.tolerance > 0.0) {
            return Err(CascadeError::config("calibration tolerance must be positive"));
        }
        if self.ece_bins == 0 {
            return Err(CascadeError::config("ece_bins must be at least 1"));
        }
        Ok(())
    }
}

/// Fitted temperature and diagnostics for one exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitCalibration {
    /// Fitted temperature (`> 0`)
    pub temperature: f64,
    /// Labeled samples that reached this exit
    pub samples: usize,
    /// True when `samples < min_samples` and the identity temperature was used
    pub insufficient_data: bool,
    /// Mean NLL at `T = 1`
    pub nll_before: f64,
    /// Mean NLL at the fitted temperature
    pub nll_after: f64,
    /// ECE at `T = 1`
    pub ece_before: f64,
    /// ECE at the fitted temperature
    pub ece_after: f64,
}

impl ExitCalibration {
    fn identity(samples: usize, insufficient_data: bool) -> Self {
        Self {
            temperature: 1.0,
            samples,
            insufficient_data,
            nll_before: 0.0,
            nll_after: 0.0,
            ece_before: 0.0,
            ece_after: 0.0,
        }
    }
}

/// Per-exit temperatures fit once per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    /// Fingerprint of the exit profile the params were fit against
    pub profile_fingerprint: String,
    /// Number of exits in that profile
    pub num_exits: usize,
    /// Exit index → fit
    pub exits: BTreeMap<usize, ExitCalibration>,
    /// `min_samples` the fit ran with (0 when no fit was run)
    pub min_samples: usize,
    /// When the fit completed
    pub fitted_at: DateTime<Utc>,
}

impl CalibrationParams {
    /// Identity temperature on every exit (no correction)
    pub fn identity(profile: &ExitProfile) -> Self {
        Self {
            profile_fingerprint: profile.fingerprint(),
            num_exits: profile.num_exits(),
            exits: (0..profile.num_exits())
                .map(|i| (i, ExitCalibration::identity(0, false)))
                .collect(),
            min_samples: 0,
            fitted_at: Utc::now(),
        }
    }

    /// Explicit temperatures, one per exit (mainly for replaying a known fit)
    pub fn from_temperatures(profile: &ExitProfile, temperatures: &[f64]) -> CascadeResult<Self> {
        if temperatures.len() != profile.num_exits() {
            return Err(CascadeError::profile_mismatch(
                format!("{} exits", profile.num_exits()),
                format!("{} temperatures", temperatures.len()),
            ));
        }
        let mut params = Self::identity(profile);
        for (i, &t) in temperatures.iter().enumerate() {
            if let Some(exit) = params.exits.get_mut(&i) {
                exit.temperature = t;
            }
        }
        params.validate_for(profile)?;
        Ok(params)
    }

    /// Temperature at `exit` (identity for unknown exits)
    pub fn temperature(&self, exit: usize) -> f64 {
        self.exits.get(&exit).map(|e| e.temperature).unwrap_or(1.0)
    }

    /// Calibrated probability vector at `exit`
    pub fn calibrated_probs(&self, exit: usize, logits: &[f64]) -> Vec<f64> {
        softmax_with_temperature(logits, self.temperature(exit))
    }

    /// Calibrated top class and its confidence at `exit`
    pub fn top_class(&self, exit: usize, logits: &[f64]) -> Option<(usize, f64)> {
        top_class(&self.calibrated_probs(exit, logits))
    }

    /// Exits that fell back to the identity temperature
    pub fn under_calibrated_exits(&self) -> Vec<usize> {
        self.exits
            .iter()
            .filter(|(_, e)| e.insufficient_data)
            .map(|(&i, _)| i)
            .collect()
    }

    /// Whether any exit fell back to the identity temperature
    pub fn is_under_calibrated(&self) -> bool {
        self.exits.values().any(|e| e.insufficient_data)
    }

    /// Warnings for every under-calibrated exit, against the fit's own
    /// `min_samples`
    pub fn warnings(&self) -> Vec<RunWarning> {
        self.exits
            .iter()
            .filter(|(_, e)| e.insufficient_data)
            .map(|(&exit, e)| RunWarning::CalibrationDataInsufficient {
                exit,
                samples: e.samples,
                required: self.min_samples,
            })
            .collect()
    }

    /// Content digest over fingerprint, `min_samples` and temperatures.
    ///
    /// Threshold sets remember this so evaluation can prove it uses the very
    /// calibration the thresholds were selected under.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"cascade-calibration/v1");
        hasher.update(self.profile_fingerprint.as_bytes());
        hasher.update(&(self.num_exits as u64).to_le_bytes());
        hasher.update(&(self.min_samples as u64).to_le_bytes());
        for (exit, fit) in &self.exits {
            hasher.update(&(*exit as u64).to_le_bytes());
            hasher.update(&fit.temperature.to_bits().to_le_bytes());
        }
        hasher.finalize().to_hex()[..16].to_string()
    }

    /// Check fingerprint, exit coverage and temperature positivity.
    pub fn validate_for(&self, profile: &ExitProfile) -> CascadeResult<()> {
        profile.ensure_fingerprint(&self.profile_fingerprint)?;
        if self.num_exits != profile.num_exits() || self.exits.len() != profile.num_exits() {
            return Err(CascadeError::profile_mismatch(
                format!("{} exits", profile.num_exits()),
                format!("{} calibrated exits", self.exits.len()),
            ));
        }
        for i in 0..profile.num_exits() {
            match self.exits.get(&i) {
                Some(fit) if fit.temperature.is_finite() && fit.temperature > 0.0 => {}
                Some(fit) => {
                    return Err(CascadeError::invalid_input(format!(
                        "exit {} temperature must be positive, got {}",
                        i, fit.temperature
                    )))
                }
                None => {
                    return Err(CascadeError::profile_mismatch(
                        format!("exit {} calibrated", i),
                        "missing".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Params plus the data-quality warnings raised while fitting them
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    pub params: CalibrationParams,
    pub warnings: Vec<RunWarning>,
}

/// Fits [`CalibrationParams`] from a labeled held-out split
#[derive(Debug, Clone, Default)]
pub struct Calibrator {
    config: CalibrationConfig,
}

impl Calibrator {
    /// Create a calibrator with the given settings
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    /// Settings in use
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Fit one temperature per exit of `cache.profile`.
    ///
    /// Exits with too few samples recover with `T = 1` and a warning; the
    /// call only fails on configuration errors.
    pub fn calibrate(&self, cache: &LogitCache) -> CascadeResult<CalibrationOutcome> {
        self.config.validate()?;
        let profile = &cache.profile;
        let bracket = self.config.bracket();
        let mut exits = BTreeMap::new();

        for exit in 0..profile.num_exits() {
            let samples: Vec<ExitSample<'_>> = cache
                .labeled()
                .filter_map(|(entry, label)| {
                    entry
                        .logits_at(exit)
                        .map(|logits| ExitSample { logits, label })
                })
                .collect();

            let fit = self.fit_exit(exit, &samples, &bracket);
            exits.insert(exit, fit);
        }

        let params = CalibrationParams {
            profile_fingerprint: profile.fingerprint(),
            num_exits: profile.num_exits(),
            exits,
            min_samples: self.config.min_samples,
            fitted_at: Utc::now(),
        };
        let warnings = params.warnings();

        info!(
            exits = params.num_exits,
            under_calibrated = warnings.len(),
            digest = %params.digest(),
            "calibration complete"
        );

        Ok(CalibrationOutcome { params, warnings })
    }

    fn fit_exit(
        &self,
        exit: usize,
        samples: &[ExitSample<'_>],
        bracket: &SearchBracket,
    ) -> ExitCalibration {
        if samples.is_empty() || samples.len() < self.config.min_samples {
            warn!(
                exit,
                samples = samples.len(),
                required = self.config.min_samples,
                "insufficient calibration data, using identity temperature"
            );
            return ExitCalibration::identity(samples.len(), true);
        }

        let fit = fit_temperature(samples, bracket);
        let bins = self.config.ece_bins;
        let calibration = ExitCalibration {
            temperature: fit.temperature,
            samples: samples.len(),
            insufficient_data: false,
            nll_before: mean_nll(samples, 1.0),
            nll_after: mean_nll(samples, fit.temperature),
            ece_before: expected_calibration_error(samples, 1.0, bins),
            ece_after: expected_calibration_error(samples, fit.temperature, bins),
        };

        info!(
            event = "exit_calibrated",
            exit,
            samples = calibration.samples,
            temperature = calibration.temperature,
            iterations = fit.iterations,
            at_boundary = fit.at_boundary,
            nll_before = calibration.nll_before,
            nll_after = calibration.nll_after,
            ece_before = calibration.ece_before,
            ece_after = calibration.ece_after,
            "exit calibrated"
        );

        calibration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scores::LogitEntry;

    fn profile() -> ExitProfile {
        ExitProfile::new(3, &[1.0, 2.0, 4.0]).unwrap()
    }

    /// 20 samples with all three exits, overconfident at exit 0.
    fn split() -> LogitCache {
        let entries = (0..20)
            .map(|i| {
                let label = if i % 10 < 7 { 0 } else { 1 };
                LogitEntry {
                    segment_id: format!("seg-{:03}", i),
                    label: Some(label),
                    exit_logits: vec![
                        vec![6.0, 0.0, -1.0],
                        vec![2.0, 1.0, 0.0],
                        if label == 0 {
                            vec![3.0, 0.0, 0.0]
                        } else {
                            vec![0.0, 3.0, 0.0]
                        },
                    ],
                }
            })
            .collect();
        LogitCache::new(profile(), entries).unwrap()
    }

    #[test]
    fn test_calibrate_every_exit() {
        let outcome = Calibrator::default().calibrate(&split()).unwrap();
        let params = outcome.params;
        assert_eq!(params.exits.len(), 3);
        assert!(outcome.warnings.is_empty());
        assert!(params.temperature(0) > 1.0);
        for fit in params.exits.values() {
            assert!(fit.temperature > 0.0);
            assert!(fit.nll_after <= fit.nll_before + 1e-12);
        }
        assert!(params.validate_for(&profile()).is_ok());
    }

    #[test]
    fn test_calibration_idempotent() {
        let cache = split();
        let a = Calibrator::default().calibrate(&cache).unwrap().params;
        let b = Calibrator::default().calibrate(&cache).unwrap().params;
        for exit in 0..3 {
            assert!((a.temperature(exit) - b.temperature(exit)).abs() < 1e-12);
        }
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_two_samples_falls_back_for_that_exit_only() {
        let mut cache = split();
        // Only the first two segments carry logits for exit 2
        for entry in cache.entries.iter_mut().skip(2) {
            entry.exit_logits.truncate(2);
        }
        let outcome = Calibrator::default().calibrate(&cache).unwrap();
        let params = &outcome.params;

        assert_eq!(params.temperature(2), 1.0);
        assert!(params.exits[&2].insufficient_data);
        assert_eq!(params.exits[&2].samples, 2);
        assert!(!params.exits[&0].insufficient_data);
        assert!(!params.exits[&1].insufficient_data);
        assert_eq!(params.under_calibrated_exits(), vec![2]);
        assert!(params.is_under_calibrated());
        assert_eq!(
            outcome.warnings,
            vec![RunWarning::CalibrationDataInsufficient {
                exit: 2,
                samples: 2,
                required: 10
            }]
        );
    }

    #[test]
    fn test_unlabeled_entries_ignored() {
        let mut cache = split();
        for entry in cache.entries.iter_mut().take(15) {
            entry.label = None;
        }
        let outcome = Calibrator::default().calibrate(&cache).unwrap();
        assert_eq!(outcome.warnings.len(), 3);
    }

    #[test]
    fn test_digest_tracks_temperatures() {
        let p = profile();
        let a = CalibrationParams::from_temperatures(&p, &[1.0, 1.5, 2.0]).unwrap();
        let b = CalibrationParams::from_temperatures(&p, &[1.0, 1.5, 2.0]).unwrap();
        let c = CalibrationParams::from_temperatures(&p, &[1.0, 1.5, 2.5]).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_from_temperatures_rejects_non_positive() {
        let p = profile();
        assert!(CalibrationParams::from_temperatures(&p, &[1.0, 0.0, 1.0]).is_err());
        assert!(CalibrationParams::from_temperatures(&p, &[1.0, 1.0]).is_err());
    }

    #[test]
    fn test_validate_rejects_other_profile() {
        let params = CalibrationParams::identity(&profile());
        let other = ExitProfile::new(3, &[1.0, 2.0]).unwrap();
        let err = params.validate_for(&other).unwrap_err();
        assert!(matches!(err, CascadeError::ExitProfileMismatch { .. }));
    }

    #[test]
    fn test_params_remember_min_samples() {
        let config = CalibrationConfig {
            min_samples: 30,
            ..Default::default()
        };
        let outcome = Calibrator::new(config).calibrate(&split()).unwrap();
        assert_eq!(outcome.params.min_samples, 30);
        assert_eq!(outcome.params.under_calibrated_exits(), vec![0, 1, 2]);
        assert_eq!(outcome.warnings, outcome.params.warnings());
        assert!(outcome.warnings.iter().all(|w| matches!(
            w,
            RunWarning::CalibrationDataInsufficient {
                samples: 20,
                required: 30,
                ..
            }
        )));

        let default = Calibrator::default().calibrate(&split()).unwrap().params;
        assert_ne!(default.digest(), outcome.params.digest());
    }

    #[test]
    fn test_exit_without_samples_keeps_identity() {
        let calibrator = Calibrator::new(CalibrationConfig {
            min_samples: 0,
            ..Default::default()
        });
        let fit = calibrator.fit_exit(2, &[], &SearchBracket::default());
        assert_eq!(fit.temperature, 1.0);
        assert_eq!(fit.samples, 0);
        assert!(fit.insufficient_data);
    }

    #[test]
    fn test_zero_min_samples_rejected() {
        let config = CalibrationConfig {
            min_samples: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            CascadeError::Config { .. }
        ));
        assert!(Calibrator::new(config).calibrate(&split()).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CalibrationConfig::default();
        assert!(config.validate().is_ok());
        config.t_max = config.t_min;
        assert!(config.validate().is_err());
        let bad = CalibrationConfig {
            t_min: -1.0,
            ..Default::default()
        };
        assert!(Calibrator::new(bad).calibrate(&split()).is_err());
    }
}
