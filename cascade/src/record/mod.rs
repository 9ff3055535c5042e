//! Run Record Store — persisted calibration, thresholds and policy runs
//!
//! Every artifact goes through the [`envelope`]: atomic save, verified load.
//! A [`PolicyRunRecord`] is built once from a completed pass and never
//! mutated; re-running calibration or selection produces a new record.

pub mod envelope;

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::calibration::CalibrationParams;
use crate::error::{CascadeResult, RunWarning};
use crate::policy::{Decision, EvaluationVariant, PolicySummary};
use crate::profile::ExitProfile;
use crate::thresholds::ThresholdSet;

pub use envelope::{read_header, Artifact, ArtifactKind, EnvelopeHeader};

/// Data-quality flags carried by a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFlags {
    /// Exits that fell back to the identity temperature
    pub under_calibrated_exits: Vec<usize>,
    /// Thresholds are the Pareto-best fallback, not a feasible solution
    pub constraint_infeasible: bool,
    /// Every recovered condition, in the order raised
    pub warnings: Vec<RunWarning>,
}

impl RunFlags {
    /// Whether the run was fully calibrated and met its objective
    pub fn is_clean(&self) -> bool {
        self.under_calibrated_exits.is_empty() && !self.constraint_infeasible
    }
}

/// One complete policy pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRunRecord {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub variant: EvaluationVariant,
    pub profile: ExitProfile,
    pub calibration: CalibrationParams,
    pub thresholds: ThresholdSet,
    /// Ordered by segment id
    pub decisions: Vec<Decision>,
    pub summary: PolicySummary,
    pub flags: RunFlags,
}

impl PolicyRunRecord {
    /// Assemble a record from a completed pass.
    ///
    /// `calibration_warnings` are the warnings raised when the params were
    /// fit; threshold warnings are derived from the set itself.
    pub fn finalize(
        profile: ExitProfile,
        calibration: CalibrationParams,
        thresholds: ThresholdSet,
        variant: EvaluationVariant,
        decisions: Vec<Decision>,
        calibration_warnings: Vec<RunWarning>,
    ) -> Self {
        let summary = PolicySummary::from_decisions(&profile, &decisions);
        let mut warnings = calibration_warnings;
        warnings.extend(thresholds.warnings());
        let flags = RunFlags {
            under_calibrated_exits: calibration.under_calibrated_exits(),
            constraint_infeasible: thresholds.constraint_infeasible,
            warnings,
        };
        Self {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            variant,
            profile,
            calibration,
            thresholds,
            decisions,
            summary,
            flags,
        }
    }

    /// Atomically persist the record.
    pub fn save(&self, path: impl AsRef<Path>) -> CascadeResult<()> {
        envelope::save(self, path.as_ref())?;
        info!(
            run_id = %self.run_id,
            variant = %self.variant.label,
            decisions = self.decisions.len(),
            path = %path.as_ref().display(),
            "policy run record saved"
        );
        Ok(())
    }

    /// Load and verify a record.
    pub fn load(path: impl AsRef<Path>) -> CascadeResult<Self> {
        envelope::load(path)
    }
}

impl Artifact for PolicyRunRecord {
    const KIND: ArtifactKind = ArtifactKind::PolicyRun;

    fn check_consistency(&self) -> Result<(), String> {
        self.profile.validate().map_err(|e| e.to_string())?;
        self.calibration
            .validate_for(&self.profile)
            .map_err(|e| e.to_string())?;
        self.thresholds
            .validate_for(&self.profile, &self.calibration)
            .map_err(|e| e.to_string())?;
        self.summary.consistent_with(&self.decisions)?;
        if self.summary.exit_counts.len() != self.profile.num_exits() {
            return Err(format!(
                "summary covers {} exits, profile has {}",
                self.summary.exit_counts.len(),
                self.profile.num_exits()
            ));
        }
        if let Some(w) = self
            .decisions
            .windows(2)
            .find(|w| w[0].segment_id >= w[1].segment_id)
        {
            return Err(format!(
                "decisions out of order at {} / {}",
                w[0].segment_id, w[1].segment_id
            ));
        }
        let deepest = self
            .variant
            .max_exit
            .unwrap_or_else(|| self.profile.last_exit());
        if let Some(d) = self.decisions.iter().find(|d| d.exit > deepest) {
            return Err(format!(
                "decision for {} at exit {} beyond reachable exit {}",
                d.segment_id, d.exit, deepest
            ));
        }
        if self.flags.constraint_infeasible != self.thresholds.constraint_infeasible {
            return Err("constraint_infeasible flag disagrees with thresholds".to_string());
        }
        if self.flags.under_calibrated_exits != self.calibration.under_calibrated_exits() {
            return Err("under-calibrated exits disagree with calibration".to_string());
        }
        Ok(())
    }
}

impl Artifact for CalibrationParams {
    const KIND: ArtifactKind = ArtifactKind::Calibration;

    fn check_consistency(&self) -> Result<(), String> {
        if self.exits.len() != self.num_exits {
            return Err(format!(
                "{} exits calibrated, {} declared",
                self.exits.len(),
                self.num_exits
            ));
        }
        match self
            .exits
            .iter()
            .find(|(_, e)| !(e.temperature.is_finite() && e.temperature > 0.0))
        {
            Some((exit, e)) => Err(format!(
                "exit {} temperature {} is not positive",
                exit, e.temperature
            )),
            None => Ok(()),
        }
    }
}

impl Artifact for ThresholdSet {
    const KIND: ArtifactKind = ArtifactKind::Thresholds;

    fn check_consistency(&self) -> Result<(), String> {
        if self.thresholds.is_empty() {
            return Err("no thresholds".to_string());
        }
        match self
            .thresholds
            .iter()
            .position(|t| !(0.0..=1.0).contains(t))
        {
            Some(exit) => Err(format!("threshold at exit {} outside [0, 1]", exit)),
            None => Ok(()),
        }
    }
}

/// Persist calibration params.
pub fn save_calibration(params: &CalibrationParams, path: impl AsRef<Path>) -> CascadeResult<()> {
    envelope::save(params, path)
}

/// Load calibration params.
pub fn load_calibration(path: impl AsRef<Path>) -> CascadeResult<CalibrationParams> {
    envelope::load(path)
}

/// Persist a threshold set.
pub fn save_thresholds(set: &ThresholdSet, path: impl AsRef<Path>) -> CascadeResult<()> {
    envelope::save(set, path)
}

/// Load a threshold set.
pub fn load_thresholds(path: impl AsRef<Path>) -> CascadeResult<ThresholdSet> {
    envelope::load(path)
}
