//! Threshold search over calibrated validation scores.
//!
//! The greedy pass fixes thresholds shallowest first, each against the
//! residual population that continued past the exits before it. The greedy
//! vector then competes with a small deterministic candidate pool and the best
//! feasible vector wins; if none is feasible the Pareto-best point is kept.

use tracing::debug;

use super::objective::{PolicyObjective, PolicyPoint};
use crate::calibration::CalibrationParams;
use crate::error::{CascadeError, CascadeResult};
use crate::policy::state::{ExitCascade, ExitScore};
use crate::profile::ExitProfile;
use crate::scores::LogitCache;

/// Calibrated scores of one labeled validation input at every exit
#[derive(Debug, Clone)]
pub struct ValidationRow {
    pub label: usize,
    pub scores: Vec<ExitScore>,
}

/// Calibrated validation scores shared by every simulated threshold vector
#[derive(Debug, Clone)]
pub struct ValidationTable {
    pub rows: Vec<ValidationRow>,
}

impl ValidationTable {
    /// Score every labeled entry at every exit through `params`.
    ///
    /// Unlabeled entries are skipped. A labeled entry missing any exit fails
    /// with [`CascadeError::MissingExitScores`].
    pub fn build(cache: &LogitCache, params: &CalibrationParams) -> CascadeResult<Self> {
        let num_exits = cache.profile.num_exits();
        let mut rows = Vec::new();
        for (entry, label) in cache.labeled() {
            let mut scores = Vec::with_capacity(num_exits);
            for exit in 0..num_exits {
                let score = entry
                    .logits_at(exit)
                    .and_then(|logits| params.top_class(exit, logits))
                    .ok_or_else(|| CascadeError::MissingExitScores {
                        segment_id: entry.segment_id.clone(),
                        exit,
                    })?;
                scores.push(ExitScore {
                    class: score.0,
                    confidence: score.1,
                });
            }
            rows.push(ValidationRow { label, scores });
        }
        Ok(Self { rows })
    }

    /// Number of labeled rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no labeled rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Run the cascade over every row.
    pub fn simulate(&self, profile: &ExitProfile, thresholds: &[f64]) -> PolicyPoint {
        if self.rows.is_empty() {
            return PolicyPoint {
                accuracy: 0.0,
                mean_cost: 0.0,
            };
        }
        let mut correct = 0usize;
        let mut cost = 0.0;
        for row in &self.rows {
            let cascade = ExitCascade::new(profile, thresholds, None);
            if let Ok(acceptance) = cascade.run(|exit| row.scores.get(exit).copied()) {
                if acceptance.class == row.label {
                    correct += 1;
                }
                cost += acceptance.cumulative_cost;
            }
        }
        let n = self.rows.len() as f64;
        PolicyPoint {
            accuracy: correct as f64 / n,
            mean_cost: cost / n,
        }
    }
}

/// Evenly spaced candidate thresholds `0, 1/steps, ..., 1`
pub fn threshold_grid(steps: usize) -> Vec<f64> {
    let steps = steps.max(1);
    (0..=steps).map(|i| i as f64 / steps as f64).collect()
}

/// Exit-by-exit greedy thresholds for `objective`.
pub fn greedy_thresholds(
    table: &ValidationTable,
    profile: &ExitProfile,
    objective: &PolicyObjective,
    grid: &[f64],
) -> Vec<f64> {
    let last = profile.last_exit();
    let mut thresholds = vec![0.0; profile.num_exits()];
    let mut residual: Vec<&ValidationRow> = table.rows.iter().collect();
    let total = table.rows.len() as f64;
    let mut committed_cost = 0.0;

    for exit in 0..last {
        let chosen = match *objective {
            PolicyObjective::MinCostWithAccuracyFloor { floor } => grid
                .iter()
                .copied()
                .find(|&tau| {
                    let (accepted, correct) = residual
                        .iter()
                        .filter(|row| row.scores[exit].confidence >= tau)
                        .fold((0usize, 0usize), |(n, c), row| {
                            (n + 1, c + usize::from(row.scores[exit].class == row.label))
                        });
                    accepted == 0 || correct as f64 / accepted as f64 + 1e-12 >= floor
                })
                .unwrap_or(1.0),
            PolicyObjective::MaxAccuracyWithCostCeiling { ceiling } => {
                let here = profile.cumulative_cost(exit);
                let next = profile.cumulative_cost(exit + 1);
                let budget = ceiling * total;
                grid.iter()
                    .rev()
                    .copied()
                    .find(|&tau| {
                        let accepted = residual
                            .iter()
                            .filter(|row| row.scores[exit].confidence >= tau)
                            .count() as f64;
                        let continuing = residual.len() as f64 - accepted;
                        committed_cost + accepted * here + continuing * next <= budget + 1e-9
                    })
                    .unwrap_or(0.0)
            }
        };

        let here = profile.cumulative_cost(exit);
        let before = residual.len();
        residual.retain(|row| row.scores[exit].confidence < chosen);
        committed_cost += (before - residual.len()) as f64 * here;
        thresholds[exit] = chosen;

        debug!(
            exit,
            threshold = chosen,
            accepted = before - residual.len(),
            residual = residual.len(),
            "threshold fixed"
        );
    }

    thresholds
}

/// Deterministic alternatives to the greedy vector.
///
/// One "defer everything to exit j" vector per exit, then one uniform vector
/// per grid value.
pub fn candidate_pool(profile: &ExitProfile, grid: &[f64]) -> Vec<Vec<f64>> {
    let k = profile.num_exits();
    let last = profile.last_exit();
    let mut pool = Vec::with_capacity(k + grid.len());

    for j in 0..k {
        pool.push((0..k).map(|i| if i < j { 1.0 } else { 0.0 }).collect());
    }
    for &tau in grid {
        pool.push((0..k).map(|i| if i < last { tau } else { 0.0 }).collect());
    }
    pool
}

/// A simulated threshold vector
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub thresholds: Vec<f64>,
    pub point: PolicyPoint,
}

/// Result of picking among simulated candidates
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub chosen: ScoredCandidate,
    pub feasible: bool,
    pub evaluated: usize,
}

/// Pick the best candidate under `objective`.
///
/// Candidates earlier in the slice win exact ties.
pub fn pick_best(
    objective: &PolicyObjective,
    candidates: Vec<ScoredCandidate>,
) -> Option<SearchResult> {
    let evaluated = candidates.len();
    let mut best_feasible: Option<ScoredCandidate> = None;
    let mut best_any: Option<ScoredCandidate> = None;

    for candidate in candidates {
        if objective.is_met(&candidate.point) {
            let better = best_feasible
                .as_ref()
                .map_or(true, |b| objective.prefers(&candidate.point, &b.point));
            if better {
                best_feasible = Some(candidate.clone());
            }
        }
        let closer = best_any
            .as_ref()
            .map_or(true, |b| objective.prefers_infeasible(&candidate.point, &b.point));
        if closer {
            best_any = Some(candidate);
        }
    }

    match (best_feasible, best_any) {
        (Some(chosen), _) => Some(SearchResult {
            chosen,
            feasible: true,
            evaluated,
        }),
        (None, Some(chosen)) => Some(SearchResult {
            chosen,
            feasible: false,
            evaluated,
        }),
        (None, None) => None,
    }
}
