//! Temperature search for a single exit.
//!
//! The mean NLL of `softmax(z / T)` is unimodal in `log T`, so the sign of its
//! slope flips at most once inside the bracket. Bisection on that sign in log
//! space converges deterministically with no step-size tuning.

use super::metrics::{nll_slope, ExitSample};

/// Bracket and stopping rule for the temperature search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchBracket {
    /// Smallest temperature considered
    pub t_min: f64,
    /// Largest temperature considered
    pub t_max: f64,
    /// Stop when `ln(hi / lo)` drops below this
    pub tolerance: f64,
    /// Hard cap on bisection steps
    pub max_iterations: u32,
}

impl Default for SearchBracket {
    fn default() -> Self {
        Self {
            t_min: 0.05,
            t_max: 20.0,
            tolerance: 1e-6,
            max_iterations: 200,
        }
    }
}

/// Outcome of one exit's search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureFit {
    pub temperature: f64,
    pub iterations: u32,
    /// True when the optimum lies at (or beyond) a bracket end
    pub at_boundary: bool,
}

/// Find the NLL-minimizing temperature within `bracket`.
pub fn fit_temperature(samples: &[ExitSample<'_>], bracket: &SearchBracket) -> TemperatureFit {
    let mut lo = bracket.t_min.ln();
    let mut hi = bracket.t_max.ln();

    if nll_slope(samples, lo.exp()) >= 0.0 {
        return TemperatureFit {
            temperature: bracket.t_min,
            iterations: 0,
            at_boundary: true,
        };
    }
    if nll_slope(samples, hi.exp()) <= 0.0 {
        return TemperatureFit {
            temperature: bracket.t_max,
            iterations: 0,
            at_boundary: true,
        };
    }

    let mut iterations = 0;
    while hi - lo > bracket.tolerance && iterations < bracket.max_iterations {
        let mid = 0.5 * (lo + hi);
        if nll_slope(samples, mid.exp()) < 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
        iterations += 1;
    }

    TemperatureFit {
        temperature: (0.5 * (lo + hi)).exp(),
        iterations,
        at_boundary: false,
    }
}
