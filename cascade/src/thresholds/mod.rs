//! Threshold Selector — one confidence cutoff per exit
//!
//! ```text
//! CalibrationParams + labeled validation LogitCache
//!     │  ValidationTable: calibrated (class, confidence) per row per exit
//!     ▼
//! greedy (shallowest → deepest, residual population)
//!     │
//!     ├─ candidate pool (defer-to-exit-j, uniform grid vectors)
//!     ▼
//! best feasible vector ── none feasible ──▶ Pareto-best + ThresholdConstraintInfeasible
//! ```
//!
//! The last exit's threshold is always `0.0`; the cascade forces a decision
//! there anyway. Selection never fails on an unreachable objective, it only
//! fails on structural problems (mismatched calibration, no labeled rows).

pub mod objective;
pub mod search;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::calibration::CalibrationParams;
use crate::error::{CascadeError, CascadeResult, RunWarning};
use crate::profile::ExitProfile;
use crate::scores::LogitCache;

pub use objective::{PolicyObjective, PolicyPoint};
pub use search::{
    candidate_pool, greedy_thresholds, pick_best, threshold_grid, ScoredCandidate, SearchResult,
    ValidationRow, ValidationTable,
};

/// Threshold search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Grid resolution: thresholds are searched over `grid_steps + 1` values in `[0, 1]`
    pub grid_steps: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self { grid_steps: 100 }
    }
}

impl SelectionConfig {
    /// Reject a zero-step grid
    pub fn validate(&self) -> CascadeResult<()> {
        if self.grid_steps == 0 {
            return Err(CascadeError::config("selection.grid_steps must be >= 1"));
        }
        Ok(())
    }
}

/// Selected thresholds plus everything needed to trust them later
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    /// `τ_i` per exit, last is `0.0`
    pub thresholds: Vec<f64>,
    /// Objective the thresholds were selected for (`None` when set by hand)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<PolicyObjective>,
    /// Validation accuracy of the induced policy
    pub achieved_accuracy: f64,
    /// Validation mean cumulative cost of the induced policy
    pub achieved_mean_cost: f64,
    /// True when no vector met the objective and the Pareto-best was used
    pub constraint_infeasible: bool,
    /// Fingerprint of the exit profile
    pub profile_fingerprint: String,
    /// Digest of the calibration params the thresholds were selected under
    pub calibration_digest: String,
    /// Labeled validation rows used
    pub validation_samples: usize,
    /// When selection completed
    pub selected_at: DateTime<Utc>,
}

impl ThresholdSet {
    /// Hand-specified thresholds bound to `params`.
    ///
    /// Used for replaying a known policy. Validation statistics are zero.
    pub fn manual(
        profile: &ExitProfile,
        params: &CalibrationParams,
        thresholds: Vec<f64>,
    ) -> CascadeResult<Self> {
        let set = Self {
            thresholds,
            objective: None,
            achieved_accuracy: 0.0,
            achieved_mean_cost: 0.0,
            constraint_infeasible: false,
            profile_fingerprint: profile.fingerprint(),
            calibration_digest: params.digest(),
            validation_samples: 0,
            selected_at: Utc::now(),
        };
        set.validate_for(profile, params)?;
        Ok(set)
    }

    /// Threshold at `exit`
    pub fn threshold(&self, exit: usize) -> Option<f64> {
        self.thresholds.get(exit).copied()
    }

    /// Check shape and range against `profile`, then provenance against `params`.
    pub fn validate_for(
        &self,
        profile: &ExitProfile,
        params: &CalibrationParams,
    ) -> CascadeResult<()> {
        profile.ensure_fingerprint(&self.profile_fingerprint)?;
        if self.thresholds.len() != profile.num_exits() {
            return Err(CascadeError::profile_mismatch(
                format!("{} exits", profile.num_exits()),
                format!("{} thresholds", self.thresholds.len()),
            ));
        }
        if let Some((exit, tau)) = self
            .thresholds
            .iter()
            .enumerate()
            .find(|(_, t)| !(0.0..=1.0).contains(*t))
        {
            return Err(CascadeError::invalid_input(format!(
                "threshold {} at exit {} outside [0, 1]",
                tau, exit
            )));
        }
        let digest = params.digest();
        if digest != self.calibration_digest {
            return Err(CascadeError::CalibrationMismatch {
                expected: self.calibration_digest.clone(),
                found: digest,
            });
        }
        Ok(())
    }

    /// `ThresholdConstraintInfeasible` when flagged
    pub fn warnings(&self) -> Vec<RunWarning> {
        if !self.constraint_infeasible {
            return Vec::new();
        }
        vec![RunWarning::ThresholdConstraintInfeasible {
            objective: self
                .objective
                .map(|o| o.to_string())
                .unwrap_or_else(|| "manual".to_string()),
            achieved_accuracy: self.achieved_accuracy,
            achieved_mean_cost: self.achieved_mean_cost,
        }]
    }
}

/// Selected set plus recovered warnings
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub thresholds: ThresholdSet,
    pub warnings: Vec<RunWarning>,
}

/// Searches for the threshold vector that best meets an objective
#[derive(Debug, Clone, Default)]
pub struct ThresholdSelector {
    config: SelectionConfig,
}

impl ThresholdSelector {
    /// Create a selector with the given settings
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    /// Settings in use
    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Select thresholds on the labeled rows of `cache`.
    ///
    /// Every labeled row must carry logits for every exit. Unlabeled rows are
    /// ignored.
    pub fn select(
        &self,
        params: &CalibrationParams,
        cache: &LogitCache,
        objective: PolicyObjective,
    ) -> CascadeResult<SelectionOutcome> {
        self.config.validate()?;
        objective.validate()?;
        let profile = &cache.profile;
        params.validate_for(profile)?;

        let table = ValidationTable::build(cache, params)?;
        if table.is_empty() {
            return Err(CascadeError::invalid_input(
                "threshold selection needs at least one labeled validation row",
            ));
        }

        let grid = threshold_grid(self.config.grid_steps);
        let greedy = greedy_thresholds(&table, profile, &objective, &grid);

        let candidates: Vec<ScoredCandidate> = std::iter::once(greedy)
            .chain(candidate_pool(profile, &grid))
            .map(|thresholds| {
                let point = table.simulate(profile, &thresholds);
                ScoredCandidate { thresholds, point }
            })
            .collect();

        let result = pick_best(&objective, candidates).ok_or_else(|| {
            CascadeError::invalid_input("threshold search produced no candidates")
        })?;

        let set = ThresholdSet {
            thresholds: result.chosen.thresholds,
            objective: Some(objective),
            achieved_accuracy: result.chosen.point.accuracy,
            achieved_mean_cost: result.chosen.point.mean_cost,
            constraint_infeasible: !result.feasible,
            profile_fingerprint: profile.fingerprint(),
            calibration_digest: params.digest(),
            validation_samples: table.len(),
            selected_at: Utc::now(),
        };

        if set.constraint_infeasible {
            warn!(
                objective = %objective,
                accuracy = set.achieved_accuracy,
                mean_cost = set.achieved_mean_cost,
                "objective infeasible on validation set; using Pareto-best thresholds"
            );
        }
        info!(
            objective = %objective,
            thresholds = ?set.thresholds,
            accuracy = set.achieved_accuracy,
            mean_cost = set.achieved_mean_cost,
            candidates = result.evaluated,
            samples = set.validation_samples,
            "thresholds selected"
        );

        let warnings = set.warnings();
        Ok(SelectionOutcome {
            thresholds: set,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scores::LogitEntry;

    fn profile() -> ExitProfile {
        ExitProfile::new(2, &[1.0, 2.0, 4.0]).unwrap()
    }

    /// Logits whose softmax top-class confidence at T = 1 is `conf` for `class`.
    fn logits(class: usize, conf: f64) -> Vec<f64> {
        let margin = (conf / (1.0 - conf)).ln();
        let mut l = vec![0.0, 0.0];
        l[class] = margin;
        l
    }

    /// Exit 0 is noisy, exits 1 and 2 are right on every row except
    /// `seg-007`, which no exit gets right. Best reachable accuracy is 0.95.
    fn cache() -> LogitCache {
        let mut entries = Vec::new();
        for i in 0..20 {
            let label = i % 2;
            let wrong = 1 - label;
            let shallow = if i % 5 == 0 || i == 7 { wrong } else { label };
            let deeper = if i == 7 { wrong } else { label };
            entries.push(LogitEntry {
                segment_id: format!("seg-{:03}", i),
                label: Some(label),
                exit_logits: vec![
                    logits(shallow, 0.7 + 0.01 * (i % 10) as f64),
                    logits(deeper, 0.8 + 0.01 * (i % 10) as f64),
                    logits(deeper, 0.9),
                ],
            });
        }
        LogitCache::new(profile(), entries).unwrap()
    }

    #[test]
    fn test_last_threshold_is_zero() {
        let c = cache();
        let params = CalibrationParams::identity(&c.profile);
        let outcome = ThresholdSelector::default()
            .select(
                &params,
                &c,
                PolicyObjective::MinCostWithAccuracyFloor { floor: 0.9 },
            )
            .unwrap();
        let set = outcome.thresholds;
        assert_eq!(set.thresholds.len(), 3);
        assert_eq!(set.thresholds[2], 0.0);
        assert!(!set.constraint_infeasible);
        assert!(set.achieved_accuracy >= 0.9);
        assert!(outcome.warnings.is_empty());
        assert_eq!(set.validation_samples, 20);
        set.validate_for(&c.profile, &params).unwrap();
    }

    #[test]
    fn test_unreachable_floor_is_flagged() {
        let c = cache();
        let params = CalibrationParams::identity(&c.profile);
        let outcome = ThresholdSelector::default()
            .select(
                &params,
                &c,
                PolicyObjective::MinCostWithAccuracyFloor { floor: 0.99 },
            )
            .unwrap();
        let set = &outcome.thresholds;
        assert!(set.constraint_infeasible);
        assert!((set.achieved_accuracy - 0.95).abs() < 1e-12);
        assert!(matches!(
            outcome.warnings.as_slice(),
            [RunWarning::ThresholdConstraintInfeasible { .. }]
        ));
    }

    #[test]
    fn test_cost_ceiling_met() {
        let c = cache();
        let params = CalibrationParams::identity(&c.profile);
        let outcome = ThresholdSelector::default()
            .select(
                &params,
                &c,
                PolicyObjective::MaxAccuracyWithCostCeiling { ceiling: 3.0 },
            )
            .unwrap();
        let set = outcome.thresholds;
        assert!(!set.constraint_infeasible);
        assert!(set.achieved_mean_cost <= 3.0 + 1e-9);
        // Deferring everything to exit 1 costs exactly 3 and reaches the best accuracy
        assert!((set.achieved_accuracy - 0.95).abs() < 1e-12);
    }

    #[test]
    fn test_cost_ceiling_below_first_exit_is_infeasible() {
        let c = cache();
        let params = CalibrationParams::identity(&c.profile);
        let outcome = ThresholdSelector::default()
            .select(
                &params,
                &c,
                PolicyObjective::MaxAccuracyWithCostCeiling { ceiling: 0.5 },
            )
            .unwrap();
        let set = outcome.thresholds;
        assert!(set.constraint_infeasible);
        assert_eq!(set.achieved_mean_cost, 1.0);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let c = cache();
        let params = CalibrationParams::identity(&c.profile);
        let objective = PolicyObjective::MinCostWithAccuracyFloor { floor: 0.85 };
        let selector = ThresholdSelector::default();
        let a = selector.select(&params, &c, objective).unwrap().thresholds;
        let b = selector.select(&params, &c, objective).unwrap().thresholds;
        assert_eq!(a.thresholds, b.thresholds);
        assert_eq!(a.achieved_mean_cost, b.achieved_mean_cost);
    }

    #[test]
    fn test_unlabeled_cache_rejected() {
        let mut c = cache();
        for e in &mut c.entries {
            e.label = None;
        }
        let params = CalibrationParams::identity(&c.profile);
        let err = ThresholdSelector::default()
            .select(
                &params,
                &c,
                PolicyObjective::MinCostWithAccuracyFloor { floor: 0.5 },
            )
            .unwrap_err();
        assert!(matches!(err, CascadeError::InvalidInput { .. }));
    }

    #[test]
    fn test_missing_exit_rejected() {
        let mut c = cache();
        c.entries[3].exit_logits.truncate(2);
        let params = CalibrationParams::identity(&c.profile);
        let err = ThresholdSelector::default()
            .select(
                &params,
                &c,
                PolicyObjective::MinCostWithAccuracyFloor { floor: 0.5 },
            )
            .unwrap_err();
        assert!(matches!(err, CascadeError::MissingExitScores { exit: 2, .. }));
    }

    #[test]
    fn test_validate_for_detects_other_calibration() {
        let p = profile();
        let params = CalibrationParams::identity(&p);
        let set = ThresholdSet::manual(&p, &params, vec![0.9, 0.8, 0.0]).unwrap();
        let other = CalibrationParams::from_temperatures(&p, &[1.5, 1.0, 1.0]).unwrap();
        let err = set.validate_for(&p, &other).unwrap_err();
        assert!(matches!(err, CascadeError::CalibrationMismatch { .. }));

        let wider = ExitProfile::new(2, &[1.0, 2.0, 4.0, 8.0]).unwrap();
        let err = set.validate_for(&wider, &params).unwrap_err();
        assert!(matches!(err, CascadeError::ExitProfileMismatch { .. }));
    }

    #[test]
    fn test_manual_rejects_out_of_range() {
        let p = profile();
        let params = CalibrationParams::identity(&p);
        assert!(ThresholdSet::manual(&p, &params, vec![1.2, 0.5, 0.0]).is_err());
        assert!(ThresholdSet::manual(&p, &params, vec![0.5, 0.0]).is_err());
    }
}
