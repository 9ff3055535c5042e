//! Summary statistics over one pass of decisions.

use serde::{Deserialize, Serialize};

use super::evaluator::Decision;
use crate::profile::ExitProfile;

/// Accuracy, cost and exit distribution of a decision list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySummary {
    /// Decisions in the pass
    pub total: usize,
    /// Decisions with a known label
    pub labeled: usize,
    /// Labeled decisions whose prediction matches
    pub correct: usize,
    /// `correct / labeled`, absent when nothing is labeled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Mean cumulative cost per decision
    pub mean_cost: f64,
    /// Cumulative cost of running every exit
    pub full_cost: f64,
    /// `100 * (1 - mean_cost / full_cost)`
    pub compute_saving_pct: f64,
    /// Decisions accepted at each exit
    pub exit_counts: Vec<usize>,
    /// `exit_counts[i] / total`
    pub exit_rates: Vec<f64>,
    /// Accuracy among labeled decisions accepted at each exit
    pub exit_accuracy: Vec<Option<f64>>,
    /// Decisions forced at the last reachable exit
    pub forced: usize,
}

impl PolicySummary {
    pub fn from_decisions(profile: &ExitProfile, decisions: &[Decision]) -> Self {
        let k = profile.num_exits();
        let mut exit_counts = vec![0usize; k];
        let mut exit_labeled = vec![0usize; k];
        let mut exit_correct = vec![0usize; k];
        let mut labeled = 0;
        let mut correct = 0;
        let mut forced = 0;
        let mut cost = 0.0;

        for d in decisions {
            if let Some(count) = exit_counts.get_mut(d.exit) {
                *count += 1;
            }
            if let Some(ok) = d.correct() {
                labeled += 1;
                if let Some(n) = exit_labeled.get_mut(d.exit) {
                    *n += 1;
                }
                if ok {
                    correct += 1;
                    if let Some(n) = exit_correct.get_mut(d.exit) {
                        *n += 1;
                    }
                }
            }
            if d.forced {
                forced += 1;
            }
            cost += d.cumulative_cost;
        }

        let total = decisions.len();
        let ratio = |num: usize, den: usize| (den > 0).then(|| num as f64 / den as f64);
        let mean_cost = if total > 0 { cost / total as f64 } else { 0.0 };
        let full_cost = profile.full_cost();
        let compute_saving_pct = if total > 0 && full_cost > 0.0 {
            100.0 * (1.0 - mean_cost / full_cost)
        } else {
            0.0
        };

        Self {
            total,
            labeled,
            correct,
            accuracy: ratio(correct, labeled),
            mean_cost,
            full_cost,
            compute_saving_pct,
            exit_rates: exit_counts
                .iter()
                .map(|&c| ratio(c, total).unwrap_or(0.0))
                .collect(),
            exit_accuracy: exit_correct
                .iter()
                .zip(&exit_labeled)
                .map(|(&c, &n)| ratio(c, n))
                .collect(),
            exit_counts,
            forced,
        }
    }

    /// Check counts against the decision list they claim to summarize.
    pub fn consistent_with(&self, decisions: &[Decision]) -> Result<(), String> {
        if self.total != decisions.len() {
            return Err(format!(
                "summary counts {} decisions, record holds {}",
                self.total,
                decisions.len()
            ));
        }
        let counted: usize = self.exit_counts.iter().sum();
        if counted != self.total {
            return Err(format!(
                "exit counts sum to {}, expected {}",
                counted, self.total
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(
        id: &str,
        exit: usize,
        predicted: usize,
        label: Option<usize>,
        cost: f64,
    ) -> Decision {
        Decision {
            segment_id: id.to_string(),
            exit,
            predicted,
            confidence: 0.9,
            label,
            cumulative_cost: cost,
            forced: exit == 2,
        }
    }

    #[test]
    fn test_summary_counts() {
        let profile = ExitProfile::new(3, &[1.0, 2.0, 4.0]).unwrap();
        let decisions = vec![
            decision("a", 0, 1, Some(1), 1.0),
            decision("b", 0, 2, Some(1), 1.0),
            decision("c", 1, 0, Some(0), 3.0),
            decision("d", 2, 2, None, 7.0),
        ];
        let s = PolicySummary::from_decisions(&profile, &decisions);
        assert_eq!(s.total, 4);
        assert_eq!(s.labeled, 3);
        assert_eq!(s.correct, 2);
        assert!((s.accuracy.unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(s.mean_cost, 3.0);
        assert_eq!(s.full_cost, 7.0);
        assert!((s.compute_saving_pct - 100.0 * (1.0 - 3.0 / 7.0)).abs() < 1e-9);
        assert_eq!(s.exit_counts, vec![2, 1, 1]);
        assert_eq!(s.exit_rates, vec![0.5, 0.25, 0.25]);
        assert_eq!(s.exit_accuracy, vec![Some(0.5), Some(1.0), None]);
        assert_eq!(s.forced, 1);
        assert!(s.consistent_with(&decisions).is_ok());
        assert!(s.consistent_with(&decisions[..3]).is_err());
    }

    #[test]
    fn test_empty_summary() {
        let profile = ExitProfile::new(2, &[1.0, 1.0]).unwrap();
        let s = PolicySummary::from_decisions(&profile, &[]);
        assert_eq!(s.total, 0);
        assert_eq!(s.accuracy, None);
        assert_eq!(s.mean_cost, 0.0);
        assert_eq!(s.compute_saving_pct, 0.0);
        assert_eq!(s.exit_rates, vec![0.0, 0.0]);
    }
}
