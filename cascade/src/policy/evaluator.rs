//! Policy Evaluator — one [`Decision`] per input
//!
//! Binds a profile, calibration params and a threshold set after checking
//! that all three agree, then drives an [`ExitCascade`] per input. Batch
//! evaluation is a pure map over inputs; the output order is segment id.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::state::{Acceptance, ExitCascade, ExitScore};
use crate::calibration::CalibrationParams;
use crate::error::{CascadeError, CascadeResult};
use crate::profile::ExitProfile;
use crate::scores::{FeatureInput, LogitCache, LogitEntry, MultiExitModel};
use crate::thresholds::ThresholdSet;

/// Outcome of running the cascade on one input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// Input identifier
    pub segment_id: String,
    /// Exit index the input was accepted at
    pub exit: usize,
    /// Calibrated top class at that exit
    pub predicted: usize,
    /// Calibrated confidence of `predicted`
    pub confidence: f64,
    /// Ground truth, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<usize>,
    /// Sum of the costs of the exits actually visited
    pub cumulative_cost: f64,
    /// True when the last reachable exit forced the decision
    #[serde(default)]
    pub forced: bool,
}

impl Decision {
    fn from_acceptance(segment_id: &str, label: Option<usize>, a: Acceptance) -> Self {
        Self {
            segment_id: segment_id.to_string(),
            exit: a.exit,
            predicted: a.class,
            confidence: a.confidence,
            label,
            cumulative_cost: a.cumulative_cost,
            forced: a.forced,
        }
    }

    /// `Some(true)` when the label is known and matches the prediction
    pub fn correct(&self) -> Option<bool> {
        self.label.map(|l| l == self.predicted)
    }
}

/// Compute variant: restricts the deepest reachable exit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationVariant {
    /// Grouping key used when aggregating records
    pub label: String,
    /// Deepest exit the cascade may visit (`None` = the profile's last exit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_exit: Option<usize>,
}

impl Default for EvaluationVariant {
    fn default() -> Self {
        Self {
            label: "full".to_string(),
            max_exit: None,
        }
    }
}

impl EvaluationVariant {
    /// Variant that stops at `max_exit`, labeled with that exit's name
    pub fn up_to(profile: &ExitProfile, max_exit: usize) -> Self {
        if max_exit >= profile.last_exit() {
            return Self::default();
        }
        Self {
            label: format!("upto_{}", profile.exit_label(max_exit)),
            max_exit: Some(max_exit),
        }
    }
}

/// Calibrated, thresholded early-exit policy
#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    profile: ExitProfile,
    params: CalibrationParams,
    thresholds: ThresholdSet,
    variant: EvaluationVariant,
}

impl PolicyEvaluator {
    /// Bind the three artifacts, refusing any that disagree.
    ///
    /// Fails with `ExitProfileMismatch` when params or thresholds were fit
    /// against another profile, and `CalibrationMismatch` when the thresholds
    /// were selected under other params.
    pub fn new(
        profile: ExitProfile,
        params: CalibrationParams,
        thresholds: ThresholdSet,
        variant: EvaluationVariant,
    ) -> CascadeResult<Self> {
        profile.validate()?;
        params.validate_for(&profile)?;
        thresholds.validate_for(&profile, &params)?;
        if let Some(max_exit) = variant.max_exit {
            if max_exit >= profile.num_exits() {
                return Err(CascadeError::invalid_input(format!(
                    "max_exit {} beyond last exit {}",
                    max_exit,
                    profile.last_exit()
                )));
            }
        }
        Ok(Self {
            profile,
            params,
            thresholds,
            variant,
        })
    }

    pub fn profile(&self) -> &ExitProfile {
        &self.profile
    }

    pub fn params(&self) -> &CalibrationParams {
        &self.params
    }

    pub fn thresholds(&self) -> &ThresholdSet {
        &self.thresholds
    }

    pub fn variant(&self) -> &EvaluationVariant {
        &self.variant
    }

    /// Calibrated top class and confidence for one exit's raw logits
    pub fn score(&self, exit: usize, logits: &[f64]) -> Option<ExitScore> {
        if logits.len() != self.profile.num_classes {
            return None;
        }
        self.params
            .top_class(exit, logits)
            .map(|(class, confidence)| ExitScore { class, confidence })
    }

    fn cascade(&self) -> ExitCascade<'_> {
        ExitCascade::new(&self.profile, &self.thresholds.thresholds, self.variant.max_exit)
    }

    /// Decide one cached input. Only the exits the cascade visits are read.
    pub fn decide(&self, entry: &LogitEntry) -> CascadeResult<Decision> {
        let acceptance = self
            .cascade()
            .run(|exit| entry.logits_at(exit).and_then(|l| self.score(exit, l)))
            .map_err(|exit| CascadeError::MissingExitScores {
                segment_id: entry.segment_id.clone(),
                exit,
            })?;
        Ok(Decision::from_acceptance(
            &entry.segment_id,
            entry.label,
            acceptance,
        ))
    }

    /// Decide one input by running `model` on its features.
    ///
    /// The model is evaluated once and its output must match the profile's
    /// shape; the per-exit logits are then consumed lazily by the cascade.
    pub fn decide_with_model<M: MultiExitModel + ?Sized>(
        &self,
        model: &M,
        input: &FeatureInput,
    ) -> CascadeResult<Decision> {
        let exit_logits = model
            .evaluate(&input.features)
            .map_err(|message| CascadeError::Model {
                segment_id: input.segment_id.clone(),
                message,
            })?;
        if exit_logits.len() != self.profile.num_exits() {
            return Err(CascadeError::profile_mismatch(
                format!("{} exits", self.profile.num_exits()),
                format!(
                    "{} exits from model for segment {}",
                    exit_logits.len(),
                    input.segment_id
                ),
            ));
        }
        if let Some(bad) = exit_logits
            .iter()
            .find(|l| l.len() != self.profile.num_classes)
        {
            return Err(CascadeError::profile_mismatch(
                format!("{} classes", self.profile.num_classes),
                format!(
                    "{} classes from model for segment {}",
                    bad.len(),
                    input.segment_id
                ),
            ));
        }
        let entry = LogitEntry {
            segment_id: input.segment_id.clone(),
            label: input.label,
            exit_logits,
        };
        self.decide(&entry)
    }

    /// Decide every entry of `cache` sequentially, in segment-id order.
    pub fn evaluate_cache(&self, cache: &LogitCache) -> CascadeResult<Vec<Decision>> {
        cache.ensure_profile(&self.profile)?;
        let decisions = cache
            .entries
            .iter()
            .map(|entry| self.decide(entry))
            .collect::<CascadeResult<Vec<_>>>()?;
        info!(
            variant = %self.variant.label,
            decisions = decisions.len(),
            "policy evaluated"
        );
        Ok(decisions)
    }
}

/// Apply the policy to `inputs` through `model`.
///
/// Inputs are decided independently and returned ordered by segment id.
/// Duplicate ids are rejected.
pub fn evaluate_policy<M: MultiExitModel + ?Sized>(
    model: &M,
    params: &CalibrationParams,
    thresholds: &ThresholdSet,
    inputs: &[FeatureInput],
    variant: EvaluationVariant,
) -> CascadeResult<Vec<Decision>> {
    let evaluator = PolicyEvaluator::new(
        model.profile().clone(),
        params.clone(),
        thresholds.clone(),
        variant,
    )?;

    let mut ordered: Vec<&FeatureInput> = inputs.iter().collect();
    ordered.sort_by(|a, b| a.segment_id.cmp(&b.segment_id));
    if let Some(dup) = ordered
        .windows(2)
        .find(|w| w[0].segment_id == w[1].segment_id)
    {
        return Err(CascadeError::DuplicateSegment {
            segment_id: dup[0].segment_id.clone(),
        });
    }

    let decisions = ordered
        .into_iter()
        .map(|input| evaluator.decide_with_model(model, input))
        .collect::<CascadeResult<Vec<_>>>()?;
    debug!(decisions = decisions.len(), "evaluate_policy complete");
    Ok(decisions)
}
