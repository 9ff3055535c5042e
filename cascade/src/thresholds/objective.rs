//! Policy objectives and the (accuracy, cost) points they rank.

use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, CascadeResult};

/// Slack for floating-point comparisons against a constraint
const EPS: f64 = 1e-12;

/// Global constraint the selected thresholds must satisfy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyObjective {
    /// Minimize mean compute cost subject to accuracy ≥ `floor`
    MinCostWithAccuracyFloor { floor: f64 },
    /// Maximize accuracy subject to mean compute cost ≤ `ceiling`
    MaxAccuracyWithCostCeiling { ceiling: f64 },
}

impl PolicyObjective {
    /// Reject floors outside `[0, 1]` and non-positive ceilings.
    pub fn validate(&self) -> CascadeResult<()> {
        match *self {
            Self::MinCostWithAccuracyFloor { floor } if !(0.0..=1.0).contains(&floor) => Err(
                CascadeError::invalid_input(format!("accuracy floor {} outside [0, 1]", floor)),
            ),
            Self::MaxAccuracyWithCostCeiling { ceiling }
                if !(ceiling.is_finite() && ceiling > 0.0) =>
            {
                Err(CascadeError::invalid_input(format!(
                    "cost ceiling must be positive, got {}",
                    ceiling
                )))
            }
            _ => Ok(()),
        }
    }

    /// Whether `point` satisfies the constraint
    pub fn is_met(&self, point: &PolicyPoint) -> bool {
        match *self {
            Self::MinCostWithAccuracyFloor { floor } => point.accuracy + EPS >= floor,
            Self::MaxAccuracyWithCostCeiling { ceiling } => point.mean_cost <= ceiling + EPS,
        }
    }

    /// True when `a` is strictly better than `b` among feasible points.
    ///
    /// Equal objective values fall back to lower mean cost, then higher accuracy.
    pub fn prefers(&self, a: &PolicyPoint, b: &PolicyPoint) -> bool {
        let (primary_a, primary_b) = match self {
            Self::MinCostWithAccuracyFloor { .. } => (-a.mean_cost, -b.mean_cost),
            Self::MaxAccuracyWithCostCeiling { .. } => (a.accuracy, b.accuracy),
        };
        if (primary_a - primary_b).abs() > EPS {
            return primary_a > primary_b;
        }
        if (a.mean_cost - b.mean_cost).abs() > EPS {
            return a.mean_cost < b.mean_cost;
        }
        a.accuracy > b.accuracy + EPS
    }

    /// True when `a` is closer to feasibility than `b` when nothing is feasible.
    ///
    /// Accuracy floor: highest accuracy, then lowest cost. Cost ceiling:
    /// lowest cost, then highest accuracy. Both pick a Pareto-optimal point.
    pub fn prefers_infeasible(&self, a: &PolicyPoint, b: &PolicyPoint) -> bool {
        match self {
            Self::MinCostWithAccuracyFloor { .. } => {
                if (a.accuracy - b.accuracy).abs() > EPS {
                    a.accuracy > b.accuracy
                } else {
                    a.mean_cost < b.mean_cost - EPS
                }
            }
            Self::MaxAccuracyWithCostCeiling { .. } => {
                if (a.mean_cost - b.mean_cost).abs() > EPS {
                    a.mean_cost < b.mean_cost
                } else {
                    a.accuracy > b.accuracy + EPS
                }
            }
        }
    }
}

impl std::fmt::Display for PolicyObjective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MinCostWithAccuracyFloor { floor } => {
                write!(f, "min cost s.t. accuracy >= {}", floor)
            }
            Self::MaxAccuracyWithCostCeiling { ceiling } => {
                write!(f, "max accuracy s.t. mean cost <= {}", ceiling)
            }
        }
    }
}

/// Accuracy and mean cost of one threshold vector on the validation set
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyPoint {
    pub accuracy: f64,
    pub mean_cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(accuracy: f64, mean_cost: f64) -> PolicyPoint {
        PolicyPoint {
            accuracy,
            mean_cost,
        }
    }

    #[test]
    fn test_validate() {
        assert!(PolicyObjective::MinCostWithAccuracyFloor { floor: 0.9 }
            .validate()
            .is_ok());
        assert!(PolicyObjective::MinCostWithAccuracyFloor { floor: 1.2 }
            .validate()
            .is_err());
        assert!(PolicyObjective::MaxAccuracyWithCostCeiling { ceiling: 0.0 }
            .validate()
            .is_err());
    }

    #[test]
    fn test_floor_prefers_cheaper_then_more_accurate() {
        let obj = PolicyObjective::MinCostWithAccuracyFloor { floor: 0.8 };
        assert!(obj.prefers(&point(0.85, 2.0), &point(0.95, 3.0)));
        assert!(obj.prefers(&point(0.95, 2.0), &point(0.85, 2.0)));
        assert!(!obj.prefers(&point(0.9, 2.0), &point(0.9, 2.0)));
    }

    #[test]
    fn test_ceiling_tie_breaks_on_cost() {
        let obj = PolicyObjective::MaxAccuracyWithCostCeiling { ceiling: 5.0 };
        assert!(obj.prefers(&point(0.9, 4.0), &point(0.8, 1.0)));
        assert!(obj.prefers(&point(0.9, 2.0), &point(0.9, 4.0)));
    }

    #[test]
    fn test_is_met() {
        let floor = PolicyObjective::MinCostWithAccuracyFloor { floor: 0.9 };
        assert!(floor.is_met(&point(0.9, 10.0)));
        assert!(!floor.is_met(&point(0.89, 1.0)));
        let ceiling = PolicyObjective::MaxAccuracyWithCostCeiling { ceiling: 3.0 };
        assert!(ceiling.is_met(&point(0.1, 3.0)));
        assert!(!ceiling.is_met(&point(1.0, 3.5)));
    }

    #[test]
    fn test_infeasible_preference() {
        let floor = PolicyObjective::MinCostWithAccuracyFloor { floor: 0.99 };
        assert!(floor.prefers_infeasible(&point(0.9, 7.0), &point(0.8, 1.0)));
        assert!(floor.prefers_infeasible(&point(0.9, 3.0), &point(0.9, 7.0)));
        let ceiling = PolicyObjective::MaxAccuracyWithCostCeiling { ceiling: 0.5 };
        assert!(ceiling.prefers_infeasible(&point(0.5, 1.0), &point(0.9, 3.0)));
    }
}
