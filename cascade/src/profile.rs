//! Exit Profile — the fixed shape of a multi-exit model
//!
//! Exit count, class count and per-exit compute cost are agreed at training
//! time. Calibration params and threshold sets remember the profile they were
//! fit against by fingerprint, and the evaluator refuses to mix profiles.

use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, CascadeResult};

/// One decision point of the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSpec {
    /// Display name (e.g. "exit1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Additional compute needed to reach this exit from the previous one
    pub cost: f64,
}

/// Ordered exits `e_0..e_{K-1}` over `num_classes` classes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitProfile {
    /// Number of classes every exit scores
    pub num_classes: usize,
    /// Exits, shallowest first
    pub exits: Vec<ExitSpec>,
}

impl ExitProfile {
    /// Build a profile from per-exit costs, validating it.
    pub fn new(num_classes: usize, costs: &[f64]) -> CascadeResult<Self> {
        let profile = Self {
            num_classes,
            exits: costs
                .iter()
                .map(|&cost| ExitSpec { name: None, cost })
                .collect(),
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Attach names to the exits. One name per exit, in order.
    pub fn with_names<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> CascadeResult<Self> {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.len() != self.exits.len() {
            return Err(CascadeError::invalid_profile(format!(
                "{} names for {} exits",
                names.len(),
                self.exits.len()
            )));
        }
        for (exit, name) in self.exits.iter_mut().zip(names) {
            exit.name = Some(name);
        }
        Ok(self)
    }

    /// Check class count, exit count and cost monotonicity.
    pub fn validate(&self) -> CascadeResult<()> {
        if self.num_classes < 2 {
            return Err(CascadeError::invalid_profile(format!(
                "need at least 2 classes, got {}",
                self.num_classes
            )));
        }
        if self.exits.is_empty() {
            return Err(CascadeError::invalid_profile("profile has no exits"));
        }
        let mut previous = 0.0_f64;
        for (i, exit) in self.exits.iter().enumerate() {
            if !exit.cost.is_finite() || exit.cost <= 0.0 {
                return Err(CascadeError::invalid_profile(format!(
                    "exit {} cost must be finite and positive, got {}",
                    i, exit.cost
                )));
            }
            if exit.cost < previous {
                return Err(CascadeError::invalid_profile(format!(
                    "exit costs must be non-decreasing: exit {} costs {} after {}",
                    i, exit.cost, previous
                )));
            }
            previous = exit.cost;
        }
        Ok(())
    }

    /// Number of exits `K`
    pub fn num_exits(&self) -> usize {
        self.exits.len()
    }

    /// Index of the deepest exit
    pub fn last_exit(&self) -> usize {
        self.exits.len().saturating_sub(1)
    }

    /// Cost of reaching exit `i` alone
    pub fn cost(&self, exit: usize) -> f64 {
        self.exits.get(exit).map(|e| e.cost).unwrap_or(0.0)
    }

    /// Sum of the costs of exits `0..=exit`
    pub fn cumulative_cost(&self, exit: usize) -> f64 {
        self.exits.iter().take(exit + 1).map(|e| e.cost).sum()
    }

    /// Cumulative cost of every exit, shallowest first
    pub fn cumulative_costs(&self) -> Vec<f64> {
        let mut total = 0.0;
        self.exits
            .iter()
            .map(|e| {
                total += e.cost;
                total
            })
            .collect()
    }

    /// Cost of always running the full network
    pub fn full_cost(&self) -> f64 {
        self.cumulative_cost(self.last_exit())
    }

    /// Label for exit `i` in reports ("exit1", "exit2", ... when unnamed)
    pub fn exit_label(&self, exit: usize) -> String {
        self.exits
            .get(exit)
            .and_then(|e| e.name.clone())
            .unwrap_or_else(|| format!("exit{}", exit + 1))
    }

    /// Stable fingerprint of the structural part of the profile.
    ///
    /// Names are cosmetic and excluded. Costs are hashed by bit pattern.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"cascade-exit-profile/v1");
        hasher.update(&(self.num_classes as u64).to_le_bytes());
        hasher.update(&(self.exits.len() as u64).to_le_bytes());
        for exit in &self.exits {
            hasher.update(&exit.cost.to_bits().to_le_bytes());
        }
        hasher.finalize().to_hex()[..16].to_string()
    }

    /// Fail with [`CascadeError::ExitProfileMismatch`] unless `fingerprint` is ours.
    pub fn ensure_fingerprint(&self, fingerprint: &str) -> CascadeResult<()> {
        let ours = self.fingerprint();
        if ours != fingerprint {
            return Err(CascadeError::profile_mismatch(ours, fingerprint));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cumulative_costs() {
        let profile = ExitProfile::new(4, &[1.0, 2.0, 4.0]).unwrap();
        assert_eq!(profile.num_exits(), 3);
        assert_eq!(profile.cumulative_cost(0), 1.0);
        assert_eq!(profile.cumulative_cost(1), 3.0);
        assert_eq!(profile.cumulative_cost(2), 7.0);
        assert_eq!(profile.cumulative_costs(), vec![1.0, 3.0, 7.0]);
        assert_eq!(profile.full_cost(), 7.0);
    }

    #[test]
    fn test_rejects_decreasing_costs() {
        let err = ExitProfile::new(3, &[2.0, 1.0]).unwrap_err();
        assert!(matches!(err, CascadeError::InvalidProfile { .. }));
    }

    #[test]
    fn test_rejects_non_positive_cost() {
        assert!(ExitProfile::new(3, &[0.0, 1.0]).is_err());
        assert!(ExitProfile::new(3, &[1.0, f64::NAN]).is_err());
        assert!(ExitProfile::new(1, &[1.0]).is_err());
        assert!(ExitProfile::new(3, &[]).is_err());
    }

    #[test]
    fn test_fingerprint_ignores_names() {
        let a = ExitProfile::new(3, &[1.0, 2.0, 4.0]).unwrap();
        let b = a.clone().with_names(["e1", "e2", "e3"]).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(b.exit_label(1), "e2");
        assert_eq!(a.exit_label(1), "exit2");

        let c = ExitProfile::new(3, &[1.0, 2.0, 5.0]).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
        let d = ExitProfile::new(4, &[1.0, 2.0, 4.0]).unwrap();
        assert_ne!(a.fingerprint(), d.fingerprint());
    }

    #[test]
    fn test_with_names_requires_one_name_per_exit() {
        let p = ExitProfile::new(3, &[1.0, 2.0, 4.0]).unwrap();
        let err = p.clone().with_names(["e1", "e2"]).unwrap_err();
        assert!(matches!(err, CascadeError::InvalidProfile { .. }));
        assert!(p.clone().with_names(["a", "b", "c", "d"]).is_err());
        assert!(p.exits.iter().all(|e| e.name.is_none()));
    }

    #[test]
    fn test_ensure_fingerprint() {
        let a = ExitProfile::new(3, &[1.0, 2.0]).unwrap();
        assert!(a.ensure_fingerprint(&a.fingerprint()).is_ok());
        let err = a.ensure_fingerprint("0000").unwrap_err();
        assert!(matches!(err, CascadeError::ExitProfileMismatch { .. }));
    }
}
